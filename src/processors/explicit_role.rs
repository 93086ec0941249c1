//! Conversations whose turns carry an explicit speaker tag (ShareGPT style).

use serde::Deserialize;
use serde_json::Value;

use super::{parse_record, FormatContext, PromptFormatter};
use crate::config::{DataSettings, Header};
use crate::error::Result;

/// One conversation turn: `{"from": "human" | "gpt", "value": "..."}`
#[derive(Debug, Clone, Deserialize)]
pub struct Turn {
    /// Speaker tag.
    pub from: String,
    /// Turn text.
    pub value: String,
}

#[derive(Deserialize)]
struct ConversationRecord {
    #[serde(alias = "conversations")]
    data: Vec<Turn>,
}

/// Build the prompt for a conversation with explicit roles.
///
/// `human` turns get the user header, `gpt` turns the response header plus
/// the end-of-sequence token so generation stops after an answer. Any other
/// tag is logged and rendered under `### {TAG}:\n`.
#[must_use]
pub fn format_turns(turns: &[Turn], user_header: &str, response_header: &str, eos_token: &str) -> String {
    let mut out = String::new();
    for turn in turns {
        let end_token = match turn.from.as_str() {
            "human" => {
                out.push_str(user_header);
                ""
            }
            "gpt" => {
                out.push_str(response_header);
                eos_token
            }
            other => {
                tracing::warn!(role = other, "unknown conversation role, using generic header");
                out.push_str("### ");
                out.push_str(&other.to_uppercase());
                out.push_str(":\n");
                ""
            }
        };
        out.push_str(&turn.value);
        out.push_str(end_token);
        out.push_str("\n\n");
    }
    out
}

/// Formatter for the `wvu` dataset type.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitRoleFormatter;

impl PromptFormatter for ExplicitRoleFormatter {
    fn name(&self) -> &'static str {
        "explicit-role"
    }

    fn validate(&self, data: &DataSettings) -> Result<()> {
        data.header(Header::User)?;
        data.header(Header::Response)?;
        Ok(())
    }

    fn format(&self, record: &Value, ctx: &FormatContext<'_>) -> Result<String> {
        let record: ConversationRecord = parse_record(record, self.name())?;
        Ok(format_turns(
            &record.data,
            ctx.data.header(Header::User)?,
            ctx.data.header(Header::Response)?,
            ctx.eos_token,
        ))
    }
}
