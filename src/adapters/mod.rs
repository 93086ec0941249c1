//! Low-rank adapter attachment, checkpointing and merging.
//!
//! Adapter parameters live in a [`VarMap`] under PEFT-compatible names
//! (`base_model.model.{module}.lora_A.weight` / `lora_B.weight`), and
//! checkpoints use the `adapter_config.json` + `adapter_model.safetensors`
//! layout, so adapters can be exchanged with the Python PEFT tooling.

use std::collections::HashSet;
use std::path::Path;

use candle_core::{DType, Device, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::config::{BiasMode, LoraSettings, TaskType};
use crate::error::{Result, TunerError};
use crate::model::{LinearModule, MergedModel, ModelHandle, Precision};

/// Adapter configuration file name.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// Adapter weights file name.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

const PARAM_PREFIX: &str = "base_model.model";

/// `adapter_config.json`, HF-PEFT compatible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfigFile {
    /// Base model the adapter was trained on.
    pub base_model_name_or_path: String,
    /// Always `LORA`.
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    /// Rank.
    pub r: usize,
    /// Scaling numerator.
    pub lora_alpha: usize,
    /// Dropout probability used during training.
    #[serde(default)]
    pub lora_dropout: f64,
    /// Adapted module names.
    pub target_modules: Vec<String>,
    /// Bias training mode.
    #[serde(default)]
    pub bias: BiasMode,
    /// Task type.
    #[serde(default)]
    pub task_type: TaskType,
    /// Set once the adapter is no longer trained.
    #[serde(default)]
    pub inference_mode: bool,
}

fn default_peft_type() -> String {
    "LORA".into()
}

impl AdapterConfigFile {
    /// Build the checkpoint configuration from run settings.
    #[must_use]
    pub fn from_settings(base_model: &str, settings: &LoraSettings) -> Self {
        Self {
            base_model_name_or_path: base_model.to_string(),
            peft_type: default_peft_type(),
            r: settings.r,
            lora_alpha: settings.lora_alpha,
            lora_dropout: settings.lora_dropout,
            target_modules: settings.target_modules.clone(),
            bias: settings.bias,
            task_type: settings.task_type,
            inference_mode: false,
        }
    }

    /// `alpha / r`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling(&self) -> f64 {
        self.lora_alpha as f64 / self.r as f64
    }
}

/// Trainable versus total parameter counts after attaching an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterStats {
    /// Parameters the optimizer updates.
    pub trainable: usize,
    /// Base parameters plus adapter matrices.
    pub total: usize,
}

impl ParameterStats {
    /// Trainable share of all parameters, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.trainable as f64 / self.total as f64 * 100.0
    }
}

impl std::fmt::Display for ParameterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} ({:.4}%) || all params: {}",
            self.trainable,
            self.percent(),
            self.total
        )
    }
}

/// A LoRA adapter attached to a model.
pub struct AdapterHandle {
    config: AdapterConfigFile,
    modules: Vec<LinearModule>,
    params: VarMap,
    lora_param_count: usize,
    device: Device,
}

impl AdapterHandle {
    /// Attach a fresh adapter to `model`.
    ///
    /// `lora_A` starts from Kaiming-normal noise and `lora_B` from zeros, so
    /// a fresh adapter leaves the model's outputs unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Config`] if no linear layer matches the target
    /// modules.
    pub fn attach(model: &ModelHandle, settings: &LoraSettings) -> Result<Self> {
        let config = AdapterConfigFile::from_settings(model.id(), settings);
        let handle = Self::build(model, config)?;
        tracing::info!(
            r = handle.config.r,
            alpha = handle.config.lora_alpha,
            modules = handle.modules.len(),
            "created LoRA adapter"
        );
        Ok(handle)
    }

    /// Load an adapter checkpoint onto `model`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::MissingArtifact`] if the checkpoint files are
    /// absent, or an error if they do not fit the model.
    pub fn load(dir: &Path, model: &ModelHandle) -> Result<Self> {
        let config_path = dir.join(ADAPTER_CONFIG_FILENAME);
        let weights_path = dir.join(ADAPTER_WEIGHTS_FILENAME);
        for path in [&config_path, &weights_path] {
            if !path.is_file() {
                return Err(TunerError::MissingArtifact(path.clone()));
            }
        }

        let config: AdapterConfigFile = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        if config.r == 0 {
            return Err(TunerError::Config(format!("{}: r must be > 0", config_path.display())));
        }
        if config.base_model_name_or_path != model.id() {
            tracing::warn!(
                adapter_base = %config.base_model_name_or_path,
                model = %model.id(),
                "adapter was trained on a different base model identifier"
            );
        }

        let mut handle = Self::build(model, config)?;
        handle.params.load(&weights_path)?;
        tracing::info!(path = %dir.display(), modules = handle.modules.len(), "loaded LoRA adapter");
        Ok(handle)
    }

    fn build(model: &ModelHandle, config: AdapterConfigFile) -> Result<Self> {
        let targets: HashSet<&str> = config.target_modules.iter().map(String::as_str).collect();
        let modules: Vec<LinearModule> = model
            .linear_modules()
            .into_iter()
            .filter(|m| targets.contains(m.name()))
            .collect();

        if modules.is_empty() {
            return Err(TunerError::Config(format!(
                "none of the target modules {:?} match a linear layer of {}",
                config.target_modules,
                model.id()
            )));
        }

        let device = model.device().clone();
        let params = VarMap::new();
        let vb = VarBuilder::from_varmap(&params, DType::F32, &device);
        let r = config.r;
        let mut lora_param_count = 0;

        for module in &modules {
            let vb = vb.pp(format!("{PARAM_PREFIX}.{}", module.path));
            vb.get_with_hints((r, module.in_features), "lora_A.weight", candle_nn::init::DEFAULT_KAIMING_NORMAL)?;
            vb.get_with_hints((module.out_features, r), "lora_B.weight", Init::Const(0.0))?;
            lora_param_count += r * (module.in_features + module.out_features);
        }

        let bias_names: Vec<String> = match config.bias {
            BiasMode::None => Vec::new(),
            BiasMode::All => model
                .weights()
                .keys()
                .filter(|name| name.ends_with(".bias"))
                .cloned()
                .collect(),
            BiasMode::LoraOnly => modules
                .iter()
                .map(|m| format!("{}.bias", m.path))
                .filter(|name| model.weights().contains_key(name))
                .collect(),
        };
        if !bias_names.is_empty() {
            let mut data = params
                .data()
                .lock()
                .map_err(|_| TunerError::Training("adapter parameter map lock poisoned".into()))?;
            for name in bias_names {
                let initial = model.weights()[&name].to_dtype(DType::F32)?;
                data.insert(format!("{PARAM_PREFIX}.{name}"), Var::from_tensor(&initial)?);
            }
        }

        Ok(Self {
            config,
            modules,
            params,
            lora_param_count,
            device,
        })
    }

    /// Write the checkpoint into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(ADAPTER_CONFIG_FILENAME),
            serde_json::to_string_pretty(&self.config)?,
        )?;
        self.params.save(dir.join(ADAPTER_WEIGHTS_FILENAME))?;
        Ok(())
    }

    /// Adapter configuration.
    #[must_use]
    pub fn config(&self) -> &AdapterConfigFile {
        &self.config
    }

    /// Mark the adapter as finished training.
    pub fn freeze(&mut self) {
        self.config.inference_mode = true;
    }

    /// Adapted layers.
    #[must_use]
    pub fn modules(&self) -> &[LinearModule] {
        &self.modules
    }

    /// Device the adapter parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The parameter map the optimizer works on.
    #[must_use]
    pub fn params(&self) -> &VarMap {
        &self.params
    }

    /// Look up a parameter by its full name.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<Var> {
        self.params.data().lock().ok()?.get(name).cloned()
    }

    /// Names of all trainable parameters, sorted.
    #[must_use]
    pub fn var_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .params
            .data()
            .lock()
            .map(|data| data.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Get the number of trainable parameters.
    #[must_use]
    pub fn trainable_param_count(&self) -> usize {
        self.params.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Trainable and total parameter counts for the adapted model.
    #[must_use]
    pub fn parameter_stats(&self, model: &ModelHandle) -> ParameterStats {
        ParameterStats {
            trainable: self.trainable_param_count(),
            total: model.parameter_count() + self.lora_param_count,
        }
    }

    /// Fold the adapter into a full-precision model.
    ///
    /// Applies `W' = W + (B · A) · alpha / r` to every adapted layer and
    /// replaces trained biases. Consumes the model so only one full copy of
    /// the weights exists.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::ModelLoad`] if `model` was loaded quantized.
    pub fn merge_into(&self, model: ModelHandle) -> Result<MergedModel> {
        if model.precision() != Precision::Full {
            return Err(TunerError::ModelLoad(
                "cannot merge an adapter into a quantized model; load a full-precision copy".into(),
            ));
        }

        let scale = self.config.scaling();
        let (base_model, mut config, mut weights) = model.into_parts();
        let data = self
            .params
            .data()
            .lock()
            .map_err(|_| TunerError::Training("adapter parameter map lock poisoned".into()))?;

        for module in &self.modules {
            let key = format!("{}.weight", module.path);
            let lookup = |suffix: &str| {
                let name = format!("{PARAM_PREFIX}.{}.{suffix}", module.path);
                data.get(&name)
                    .map(|v| v.as_tensor().clone())
                    .ok_or_else(|| TunerError::Training(format!("adapter parameter {name} missing")))
            };
            let a = lookup("lora_A.weight")?;
            let b = lookup("lora_B.weight")?;
            let base = weights
                .get(&key)
                .ok_or_else(|| TunerError::ModelLoad(format!("base weight {key} missing")))?;

            let delta = b.matmul(&a)?.affine(scale, 0.0)?;
            let merged = base.to_dtype(DType::F32)?.add(&delta)?.to_dtype(base.dtype())?;
            weights.insert(key, merged);
        }

        for (name, var) in data.iter() {
            let Some(key) = name.strip_prefix(PARAM_PREFIX).and_then(|n| n.strip_prefix('.')) else {
                continue;
            };
            if !key.ends_with(".bias") {
                continue;
            }
            let dtype = weights.get(key).map_or(DType::F32, |t| t.dtype());
            weights.insert(key.to_string(), var.as_tensor().to_dtype(dtype)?);
        }

        config.use_cache = true;
        config.gradient_checkpointing = false;
        tracing::info!(layers = self.modules.len(), scale, "merged adapter into base weights");

        Ok(MergedModel {
            base_model,
            config,
            weights,
        })
    }
}

impl std::fmt::Debug for AdapterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterHandle")
            .field("config", &self.config)
            .field("modules", &self.modules.len())
            .field("trainable", &self.trainable_param_count())
            .finish_non_exhaustive()
    }
}
