//! Dataset loading and tokenization.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TunerError};
use crate::tokenizer::TokenizerHandle;

/// One formatted example after tokenization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedPrompt {
    /// Token ids, truncated to the context window.
    pub input_ids: Vec<u32>,
    /// Attention mask matching `input_ids`.
    pub attention_mask: Vec<u32>,
}

impl TokenizedPrompt {
    /// Number of tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Check if the prompt tokenized to nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Read raw records from a local dataset file.
///
/// `.jsonl` files hold one record per line. `.json` files hold either an
/// array of records or an object with a `train` array.
///
/// # Errors
///
/// Returns [`TunerError::Dataset`] if the file is missing or a record does
/// not parse.
pub fn load_records(source: &str) -> Result<Vec<Value>> {
    let path = Path::new(source);

    if !path.is_file() {
        return Err(TunerError::Dataset(format!("Dataset not found: {source}")));
    }

    let content = std::fs::read_to_string(path)?;
    let is_json_document = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json_document {
        let document: Value = serde_json::from_str(&content)
            .map_err(|e| TunerError::Dataset(format!("Failed to parse {source}: {e}")))?;
        return match document {
            Value::Array(records) => Ok(records),
            Value::Object(mut split) => match split.remove("train") {
                Some(Value::Array(records)) => Ok(records),
                _ => Err(TunerError::Dataset(format!(
                    "{source}: expected an array or an object with a `train` array"
                ))),
            },
            _ => Err(TunerError::Dataset(format!("{source}: expected an array of records"))),
        };
    }

    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let record: Value = serde_json::from_str(line)
            .map_err(|e| TunerError::Dataset(format!("Failed to parse line {}: {e}", lineno + 1)))?;
        records.push(record);
    }

    Ok(records)
}

/// Tokenize formatted prompts against a context window.
///
/// # Errors
///
/// Returns an error if any prompt fails to encode.
pub fn tokenize_prompts(
    prompts: &[String],
    tokenizer: &TokenizerHandle,
    context_window: usize,
) -> Result<Vec<TokenizedPrompt>> {
    let tokenized = prompts
        .iter()
        .map(|text| tokenizer.encode_truncated(text, context_window))
        .collect::<Result<Vec<_>>>()?;

    let truncated = tokenized.iter().filter(|t| t.len() == context_window).count();
    if truncated > 0 {
        tracing::debug!(truncated, context_window, "prompts reached the context window");
    }
    Ok(tokenized)
}
