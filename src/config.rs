//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TunerError};

/// Main configuration for a fine-tuning run.
///
/// Loaded once from YAML and read-only afterwards; every stage receives it
/// through the [`FineTuner`](crate::FineTuner) that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneConfig {
    /// Base model identifier (local directory or id under the models root).
    pub base_model: String,

    /// Model family hint selecting family-specific tokenizer defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_family: Option<String>,

    /// `LoRA` adapter settings.
    #[serde(default)]
    pub lora: LoraSettings,

    /// Training hyperparameters.
    #[serde(default)]
    pub trainer: TrainerSettings,

    /// Dataset descriptor.
    pub data: DataSettings,

    /// Context window override; defaults to the tokenizer's maximum length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_context_window: Option<usize>,

    /// Directory receiving the adapter and the merged model.
    pub model_output_dir: String,

    /// Name used for the adapter and merged model directories.
    pub model_name: String,

    /// Directory for intermediate training checkpoints.
    #[serde(default = "default_trainer_output_dir")]
    pub trainer_output_dir: String,

    /// Previously trained adapter checkpoint to reuse instead of a fresh one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_path: Option<String>,
}

fn default_trainer_output_dir() -> String {
    "./outputs/checkpoints".into()
}

/// LoRA-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraSettings {
    /// Rank of low-rank decomposition.
    #[serde(default = "default_lora_r")]
    pub r: usize,

    /// Scaling factor.
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: usize,

    /// Target modules for `LoRA`.
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    /// Dropout probability.
    #[serde(default = "default_lora_dropout")]
    pub lora_dropout: f64,

    /// Which bias terms are trained alongside the adapter.
    #[serde(default)]
    pub bias: BiasMode,

    /// Task type tag written to the adapter checkpoint.
    #[serde(default)]
    pub task_type: TaskType,
}

fn default_lora_r() -> usize {
    8
}
fn default_lora_alpha() -> usize {
    16
}
fn default_lora_dropout() -> f64 {
    0.05
}
fn default_target_modules() -> Vec<String> {
    vec!["q_proj".into(), "v_proj".into()]
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            r: default_lora_r(),
            lora_alpha: default_lora_alpha(),
            target_modules: default_target_modules(),
            lora_dropout: default_lora_dropout(),
            bias: BiasMode::None,
            task_type: TaskType::CausalLm,
        }
    }
}

impl LoraSettings {
    /// Adapter output scaling, `alpha / r`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.lora_alpha as f64 / self.r as f64
    }
}

/// Bias training mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    /// No bias is trained.
    #[default]
    None,
    /// Every bias in the model is trained.
    All,
    /// Only biases of adapted modules are trained.
    LoraOnly,
}

/// Task type of the adapted model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Causal language modelling.
    #[default]
    CausalLm,
    /// Sequence-to-sequence language modelling.
    Seq2SeqLm,
    /// Sequence classification.
    SeqCls,
    /// Token classification.
    TokenCls,
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSettings {
    /// Batch size per device.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Gradient accumulation steps.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Learning-rate warmup, in optimizer steps.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,

    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub num_train_epochs: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Log every N optimizer steps.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// Save a checkpoint every N optimizer steps.
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,
}

fn default_batch_size() -> usize {
    4
}
fn default_grad_accum() -> usize {
    4
}
fn default_warmup_steps() -> usize {
    100
}
fn default_epochs() -> usize {
    3
}
fn default_lr() -> f64 {
    2e-4
}
fn default_log_steps() -> usize {
    10
}
fn default_save_steps() -> usize {
    500
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            warmup_steps: default_warmup_steps(),
            num_train_epochs: default_epochs(),
            learning_rate: default_lr(),
            logging_steps: default_log_steps(),
            save_steps: default_save_steps(),
        }
    }
}

/// Dataset descriptor.
///
/// Headers are optional at parse time; each prompt formatter checks the
/// ones it needs before the dataset is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSettings {
    /// Dataset type tag selecting the prompt formatter.
    #[serde(rename = "type", default)]
    pub dataset_type: String,

    /// Dataset source (local `.json` or `.jsonl` file).
    #[serde(default)]
    pub dataset: String,

    /// Header preceding the instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruct_header: Option<String>,

    /// Header preceding the input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_header: Option<String>,

    /// Header preceding the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_header: Option<String>,

    /// Header preceding user turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_header: Option<String>,

    /// Header preceding response turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_header: Option<String>,
}

/// Prompt headers configurable under `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// `data.instruct_header`
    Instruct,
    /// `data.input_header`
    Input,
    /// `data.output_header`
    Output,
    /// `data.user_header`
    User,
    /// `data.response_header`
    Response,
}

impl Header {
    /// Configuration key of the header.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Instruct => "instruct_header",
            Self::Input => "input_header",
            Self::Output => "output_header",
            Self::User => "user_header",
            Self::Response => "response_header",
        }
    }
}

impl DataSettings {
    /// Fetch a header, failing with a configuration error when it is unset.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Config`] if the header is missing.
    pub fn header(&self, header: Header) -> Result<&str> {
        let value = match header {
            Header::Instruct => &self.instruct_header,
            Header::Input => &self.input_header,
            Header::Output => &self.output_header,
            Header::User => &self.user_header,
            Header::Response => &self.response_header,
        };
        value.as_deref().ok_or_else(|| {
            TunerError::Config(format!(
                "data.{} is required for dataset type `{}`",
                header.key(),
                self.dataset_type
            ))
        })
    }
}

/// Model family hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelFamily {
    /// Take every tokenizer setting from the model directory.
    #[default]
    Auto,
    /// LLaMA-style tokenizers: `<s>` / `</s>` when the directory omits them.
    Llama,
}

impl ModelFamily {
    /// Parse an optional family hint.
    ///
    /// # Errors
    ///
    /// Returns an error if the hint names an unknown family.
    pub fn parse(hint: Option<&str>) -> Result<Self> {
        match hint.map(str::to_ascii_lowercase).as_deref() {
            None | Some("" | "auto") => Ok(Self::Auto),
            Some("llama") => Ok(Self::Llama),
            Some(other) => Err(TunerError::Config(format!("unknown model_family: {other}"))),
        }
    }
}

impl FineTuneConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolved model family.
    ///
    /// # Errors
    ///
    /// Returns an error if `model_family` is unknown.
    pub fn family(&self) -> Result<ModelFamily> {
        ModelFamily::parse(self.model_family.as_deref())
    }

    /// `{model_output_dir}/{model_name}_adapter`
    #[must_use]
    pub fn adapter_dir(&self) -> PathBuf {
        Path::new(&self.model_output_dir).join(format!("{}_adapter", self.model_name))
    }

    /// `{model_output_dir}/{model_name}`
    #[must_use]
    pub fn merged_model_dir(&self) -> PathBuf {
        Path::new(&self.model_output_dir).join(&self.model_name)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.base_model.is_empty() {
            return Err(TunerError::Config("base_model is required".into()));
        }
        if self.model_name.is_empty() {
            return Err(TunerError::Config("model_name is required".into()));
        }
        if self.model_output_dir.is_empty() {
            return Err(TunerError::Config("model_output_dir is required".into()));
        }
        if self.data.dataset_type.is_empty() {
            return Err(TunerError::Config("data.type is required".into()));
        }
        if self.data.dataset.is_empty() {
            return Err(TunerError::Config("data.dataset is required".into()));
        }

        if self.lora.r == 0 {
            return Err(TunerError::Config("lora.r must be > 0".into()));
        }
        if self.lora.target_modules.is_empty() {
            return Err(TunerError::Config("lora.target_modules must not be empty".into()));
        }
        if !(0.0..1.0).contains(&self.lora.lora_dropout) {
            return Err(TunerError::Config("lora.lora_dropout must be in [0, 1)".into()));
        }
        if self.lora.task_type != TaskType::CausalLm {
            return Err(TunerError::Config(format!(
                "lora.task_type {:?} is not supported, only CAUSAL_LM",
                self.lora.task_type
            )));
        }

        if self.trainer.batch_size == 0 {
            return Err(TunerError::Config("trainer.batch_size must be > 0".into()));
        }
        if self.trainer.gradient_accumulation_steps == 0 {
            return Err(TunerError::Config(
                "trainer.gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if self.trainer.num_train_epochs == 0 {
            return Err(TunerError::Config("trainer.num_train_epochs must be > 0".into()));
        }
        if self.trainer.learning_rate <= 0.0 {
            return Err(TunerError::Config("trainer.learning_rate must be > 0".into()));
        }
        if self.model_context_window == Some(0) {
            return Err(TunerError::Config("model_context_window must be > 0".into()));
        }

        self.family()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
base_model: ./models/tiny-llama
model_family: llama
lora:
  r: 16
  lora_alpha: 32
  target_modules: [q_proj, k_proj, v_proj]
  lora_dropout: 0.1
  bias: none
  task_type: CAUSAL_LM
trainer:
  batch_size: 2
  gradient_accumulation_steps: 8
  warmup_steps: 10
  num_train_epochs: 1
  learning_rate: 0.0003
  logging_steps: 5
data:
  type: alpaca
  dataset: ./data/train.jsonl
  instruct_header: Instruction
  input_header: Input
  output_header: Response
model_context_window: 1024
model_output_dir: ./models
model_name: tiny-alpaca
trainer_output_dir: ./trainer_out
"#;

    fn sample() -> FineTuneConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample_config() {
        let config = sample();
        assert_eq!(config.lora.r, 16);
        assert_eq!(config.lora.target_modules.len(), 3);
        assert_eq!(config.lora.task_type, TaskType::CausalLm);
        assert_eq!(config.trainer.gradient_accumulation_steps, 8);
        assert_eq!(config.trainer.save_steps, 500);
        assert_eq!(config.data.dataset_type, "alpaca");
        assert_eq!(config.data.instruct_header.as_deref(), Some("Instruction"));
        assert_eq!(config.model_context_window, Some(1024));
        assert_eq!(config.family().unwrap(), ModelFamily::Llama);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_output_layout() {
        let config = sample();
        assert_eq!(config.adapter_dir(), Path::new("./models/tiny-alpaca_adapter"));
        assert_eq!(config.merged_model_dir(), Path::new("./models/tiny-alpaca"));
    }

    #[test]
    fn test_missing_data_type_is_config_error() {
        let mut config = sample();
        config.data.dataset_type = String::new();
        assert!(matches!(config.validate(), Err(TunerError::Config(msg)) if msg.contains("data.type")));
    }

    #[test]
    fn test_config_validation() {
        let mut config = sample();
        config.lora.r = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.lora.lora_dropout = 1.0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.lora.task_type = TaskType::SeqCls;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.model_family = Some("gpt-j".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = sample();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let restored: FineTuneConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.base_model, restored.base_model);
        assert_eq!(restored.data.dataset_type, "alpaca");
        assert_eq!(restored.lora.bias, BiasMode::None);
    }

    #[test]
    fn test_missing_header_reports_key() {
        let config = sample();
        let err = config.data.header(Header::User).unwrap_err();
        assert!(err.to_string().contains("data.user_header"));
    }

    #[test]
    fn test_scaling() {
        let config = sample();
        assert!((config.lora.scaling() - 2.0).abs() < f64::EPSILON);
    }
}
