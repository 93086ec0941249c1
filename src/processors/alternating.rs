//! Conversations given as a bare list of turns, roles implied by position.

use serde::Deserialize;
use serde_json::Value;

use super::{parse_record, FormatContext, PromptFormatter};
use crate::config::{DataSettings, Header};
use crate::error::Result;

#[derive(Deserialize)]
struct AlternatingRecord {
    #[serde(alias = "conversations")]
    data: Vec<String>,
}

/// Build the prompt for a conversation whose roles follow index parity.
///
/// Even indices take the response header and the end-of-sequence token;
/// odd indices take the user header. For datasets whose first turn is the
/// human side this swaps the speakers; use the `wvu` type with explicit
/// roles when the data carries them.
#[must_use]
pub fn format_alternating<S: AsRef<str>>(
    turns: &[S],
    user_header: &str,
    response_header: &str,
    eos_token: &str,
) -> String {
    let mut out = String::new();
    for (idx, turn) in turns.iter().enumerate() {
        if idx % 2 == 0 {
            out.push_str(response_header);
            out.push_str(turn.as_ref());
            out.push_str(eos_token);
        } else {
            out.push_str(user_header);
            out.push_str(turn.as_ref());
        }
        out.push_str("\n\n");
    }
    out
}

/// Formatter for the `uc` dataset type.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlternatingFormatter;

impl PromptFormatter for AlternatingFormatter {
    fn name(&self) -> &'static str {
        "alternating"
    }

    fn validate(&self, data: &DataSettings) -> Result<()> {
        data.header(Header::User)?;
        data.header(Header::Response)?;
        Ok(())
    }

    fn format(&self, record: &Value, ctx: &FormatContext<'_>) -> Result<String> {
        let record: AlternatingRecord = parse_record(record, self.name())?;
        Ok(format_alternating(
            &record.data,
            ctx.data.header(Header::User)?,
            ctx.data.header(Header::Response)?,
            ctx.eos_token,
        ))
    }
}
