//! Error types for qlora-tuner.

use std::path::PathBuf;

use thiserror::Error;

use crate::trainer::Stage;

/// Result type alias for qlora-tuner operations.
pub type Result<T> = std::result::Result<T, TunerError>;

/// Errors that can occur in qlora-tuner.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TunerError {
    /// Missing or invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Base model or tokenizer could not be resolved or loaded.
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// No prompt formatter is registered for the dataset type tag.
    #[error("no prompt formatter registered for dataset type `{0}`")]
    DatasetType(String),

    /// Dataset could not be read or a record could not be formatted.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A lifecycle operation was called from the wrong stage.
    #[error("`{operation}` requires stage {required}, current stage is {current}")]
    StageOrder {
        /// Operation that was attempted.
        operation: &'static str,
        /// Stage(s) the operation accepts.
        required: &'static str,
        /// Stage the run was in.
        current: Stage,
    },

    /// An artifact the operation depends on does not exist.
    #[error("missing artifact: {}", .0.display())]
    MissingArtifact(PathBuf),

    /// Training failed.
    #[error("training error: {0}")]
    Training(String),

    /// Training was interrupted; the partial adapter was flushed.
    #[error("training interrupted, partial adapter saved to {}", checkpoint.display())]
    Interrupted {
        /// Where the partial adapter was written.
        checkpoint: PathBuf,
    },

    /// Remote publishing failed. Local artifacts are unaffected.
    #[error("publish error: {0}")]
    Publish(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),

    /// Interrupt handler could not be installed.
    #[error("signal handler error: {0}")]
    Signal(#[from] ctrlc::Error),
}
