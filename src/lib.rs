//! # qlora-tuner
//!
//! YAML-driven QLoRA fine-tuning pipeline for causal language models.
//!
//! A run loads a quantized base model, attaches a low-rank adapter, trains
//! it on a dataset rendered by a pluggable prompt formatter, then folds the
//! adapter into a full-precision copy of the base model and persists (and
//! optionally publishes) the result.
//!
//! ## Features
//!
//! - **YAML Configuration** - one file describes model, adapter, trainer and data
//! - **Prompt Formatters** - `alpaca`, `uc` and `wvu` built in, more via [`ProcessorRegistry::register`]
//! - **Staged Lifecycle** - [`FineTuner`] rejects out-of-order operations
//! - **PEFT-compatible Checkpoints** - `adapter_config.json` + `adapter_model.safetensors`
//!
//! ## Quick Start
//!
//! ```bash
//! # Train, merge and save
//! qlora-tuner config.yaml
//!
//! # Same, then publish under a repository id
//! qlora-tuner config.yaml acme/tiny-chat --publish-root /srv/hub
//!
//! # Merge an adapter trained earlier
//! qlora-tuner config.yaml --merge-only
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod model;
pub mod processors;
pub mod store;
pub mod tokenizer;
pub mod trainer;

pub use config::FineTuneConfig;
pub use error::{Result, TunerError};
pub use processors::{PromptFormatter, ProcessorRegistry};
pub use trainer::{AdapterSource, FineTuner, Stage};
