//! Single-turn instruction records (Alpaca / GPT-4-Alpaca style).

use serde::Deserialize;
use serde_json::Value;

use super::{parse_record, FormatContext, PromptFormatter};
use crate::config::{DataSettings, Header};
use crate::error::Result;

/// Alpaca format: `{"instruction": "", "input": "", "output": ""}`
#[derive(Debug, Clone, Deserialize)]
pub struct InstructionRecord {
    /// Task description.
    pub instruction: String,
    /// Optional task input.
    #[serde(default)]
    pub input: String,
    /// Expected answer.
    pub output: String,
}

/// Build the prompt for one instruction record.
///
/// No end-of-sequence token is appended; termination is left to the
/// tokenizer's truncation.
#[must_use]
pub fn format_instruction(
    record: &InstructionRecord,
    instruct_header: &str,
    input_header: &str,
    output_header: &str,
) -> String {
    format!(
        "### {instruct_header}\n{}\n\n### {input_header}\n{}\n\n### {output_header}\n\n{}",
        record.instruction, record.input, record.output
    )
}

/// Formatter for the `alpaca` dataset type.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstructionFormatter;

impl PromptFormatter for InstructionFormatter {
    fn name(&self) -> &'static str {
        "instruction"
    }

    fn validate(&self, data: &DataSettings) -> Result<()> {
        for header in [Header::Instruct, Header::Input, Header::Output] {
            data.header(header)?;
        }
        Ok(())
    }

    fn format(&self, record: &Value, ctx: &FormatContext<'_>) -> Result<String> {
        let record: InstructionRecord = parse_record(record, self.name())?;
        Ok(format_instruction(
            &record,
            ctx.data.header(Header::Instruct)?,
            ctx.data.header(Header::Input)?,
            ctx.data.header(Header::Output)?,
        ))
    }
}
