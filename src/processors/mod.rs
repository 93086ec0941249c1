//! Prompt formatting.
//!
//! A [`PromptFormatter`] turns one raw dataset record into the literal text
//! used as a training example. The [`ProcessorRegistry`] maps the
//! `data.type` tag of the configuration to exactly one formatter; an
//! unregistered tag is an error, never a silent default.
//!
//! Built-in tags:
//!
//! | tag      | record shape                              | formatter                 |
//! |----------|-------------------------------------------|---------------------------|
//! | `alpaca` | `{instruction, input, output}`            | [`InstructionFormatter`]  |
//! | `uc`     | `{"data": ["turn", ...]}`                 | [`AlternatingFormatter`]  |
//! | `wvu`    | `{"data": [{"from", "value"}, ...]}`      | [`ExplicitRoleFormatter`] |

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::DataSettings;
use crate::error::{Result, TunerError};

mod alternating;
mod explicit_role;
mod instruction;

pub use alternating::{format_alternating, AlternatingFormatter};
pub use explicit_role::{format_turns, ExplicitRoleFormatter, Turn};
pub use instruction::{format_instruction, InstructionFormatter, InstructionRecord};

/// Inputs every formatter receives besides the record itself.
#[derive(Debug, Clone, Copy)]
pub struct FormatContext<'a> {
    /// Dataset settings carrying the configured headers.
    pub data: &'a DataSettings,
    /// End-of-sequence token of the loaded tokenizer.
    pub eos_token: &'a str,
}

/// Converts one raw dataset record into training text.
pub trait PromptFormatter: Send + Sync {
    /// Short human-readable name used in logs.
    fn name(&self) -> &'static str;

    /// Check that the configuration carries everything this formatter needs.
    ///
    /// Called before the dataset is read so configuration mistakes surface
    /// before any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Config`] when a required header is missing.
    fn validate(&self, _data: &DataSettings) -> Result<()> {
        Ok(())
    }

    /// Format one record.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Dataset`] if the record does not have the
    /// expected shape.
    fn format(&self, record: &Value, ctx: &FormatContext<'_>) -> Result<String>;
}

/// Deserialize a raw record into the shape a formatter expects.
pub(crate) fn parse_record<T: DeserializeOwned>(record: &Value, formatter: &str) -> Result<T> {
    T::deserialize(record)
        .map_err(|e| TunerError::Dataset(format!("malformed {formatter} record: {e}")))
}

/// Registry of prompt formatters keyed by dataset-type tag.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    formatters: BTreeMap<String, Arc<dyn PromptFormatter>>,
}

impl ProcessorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in formatters.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("alpaca", InstructionFormatter);
        registry.register("uc", AlternatingFormatter);
        registry.register("wvu", ExplicitRoleFormatter);
        registry
    }

    /// Register a formatter under `tag`, replacing any previous entry.
    pub fn register<F>(&mut self, tag: impl Into<String>, formatter: F) -> &mut Self
    where
        F: PromptFormatter + 'static,
    {
        self.formatters.insert(tag.into(), Arc::new(formatter));
        self
    }

    /// Look up the formatter for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::DatasetType`] if no formatter is registered.
    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn PromptFormatter>> {
        self.formatters
            .get(tag)
            .cloned()
            .ok_or_else(|| TunerError::DatasetType(tag.to_string()))
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.formatters.keys().map(String::as_str)
    }

    /// Format every record with the formatter registered for `tag`.
    ///
    /// # Errors
    ///
    /// Fails on an unknown tag, a missing header, or the first malformed
    /// record; there is no per-record error isolation.
    pub fn transform(&self, tag: &str, records: &[Value], ctx: &FormatContext<'_>) -> Result<Vec<String>> {
        let formatter = self.resolve(tag)?;
        formatter.validate(ctx.data)?;
        format_records(&*formatter, records, ctx)
    }
}

/// Format every record with an already validated `formatter`.
///
/// # Errors
///
/// Stops at the first malformed record and names its index.
pub fn format_records(
    formatter: &dyn PromptFormatter,
    records: &[Value],
    ctx: &FormatContext<'_>,
) -> Result<Vec<String>> {
    tracing::debug!(formatter = formatter.name(), records = records.len(), "formatting dataset");
    records
        .iter()
        .enumerate()
        .map(|(idx, record)| {
            formatter.format(record, ctx).map_err(|e| match e {
                TunerError::Dataset(msg) => TunerError::Dataset(format!("record {idx}: {msg}")),
                other => other,
            })
        })
        .collect()
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("tags", &self.formatters.keys().collect::<Vec<_>>())
            .finish()
    }
}
