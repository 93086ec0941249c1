//! Model handles and the low-memory training preparation.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Numeric representation a model is loaded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Memory-reduced load used for training. Linear weights are kept at
    /// the bf16 compute dtype; packed 4-bit storage belongs to the kernel.
    Quantized4Bit,
    /// Weights as stored on disk. Required for merging.
    Full,
}

/// The subset of `config.json` the pipeline reads and rewrites.
///
/// Unknown keys are carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfigFile {
    /// Architecture tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,

    /// Whether the model caches attention key/values during forward passes.
    #[serde(default = "default_true")]
    pub use_cache: bool,

    /// Whether the architecture supports activation checkpointing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_gradient_checkpointing: Option<bool>,

    /// Activation checkpointing switch.
    #[serde(default)]
    pub gradient_checkpointing: bool,

    /// Everything else.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

impl Default for ModelConfigFile {
    fn default() -> Self {
        Self {
            model_type: None,
            use_cache: true,
            supports_gradient_checkpointing: None,
            gradient_checkpointing: false,
            extra: Map::new(),
        }
    }
}

/// A linear layer eligible for adaptation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearModule {
    /// Module path, e.g. `model.layers.0.self_attn.q_proj`.
    pub path: String,
    /// Output features.
    pub out_features: usize,
    /// Input features.
    pub in_features: usize,
}

impl LinearModule {
    /// Last path segment, the name target-module lists refer to.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

/// Handle to a loaded causal language model.
#[derive(Debug)]
pub struct ModelHandle {
    id: String,
    precision: Precision,
    config: ModelConfigFile,
    weights: HashMap<String, Tensor>,
    device: Device,
}

impl ModelHandle {
    /// Wrap loaded weights, converting them to the requested precision.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor cannot be converted.
    pub fn new(
        id: impl Into<String>,
        precision: Precision,
        config: ModelConfigFile,
        weights: HashMap<String, Tensor>,
        device: Device,
    ) -> Result<Self> {
        let weights = match precision {
            Precision::Full => weights,
            Precision::Quantized4Bit => weights
                .into_iter()
                .map(|(name, tensor)| {
                    let tensor = if is_linear_weight(&name, &tensor) {
                        tensor.to_dtype(DType::BF16)?
                    } else {
                        tensor
                    };
                    Ok((name, tensor))
                })
                .collect::<Result<_>>()?,
        };

        Ok(Self {
            id: id.into(),
            precision,
            config,
            weights,
            device,
        })
    }

    /// Identifier the model was loaded from.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Load precision.
    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Model configuration.
    #[must_use]
    pub fn config(&self) -> &ModelConfigFile {
        &self.config
    }

    /// Named weight tensors.
    #[must_use]
    pub fn weights(&self) -> &HashMap<String, Tensor> {
        &self.weights
    }

    /// Device the weights live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Total number of parameters.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.weights.values().map(Tensor::elem_count).sum()
    }

    /// Linear layers, sorted by path.
    #[must_use]
    pub fn linear_modules(&self) -> Vec<LinearModule> {
        let mut modules: Vec<_> = self
            .weights
            .iter()
            .filter(|(name, tensor)| is_linear_weight(name, tensor))
            .filter_map(|(name, tensor)| {
                let (out_features, in_features) = tensor.dims2().ok()?;
                Some(LinearModule {
                    path: name.strip_suffix(".weight")?.to_string(),
                    out_features,
                    in_features,
                })
            })
            .collect();
        modules.sort_by(|a, b| a.path.cmp(&b.path));
        modules
    }

    /// Apply the low-memory training transformation.
    ///
    /// Disables the output cache, turns on gradient checkpointing when the
    /// architecture supports it, and keeps normalization weights in f32.
    ///
    /// # Errors
    ///
    /// Returns an error if a normalization weight cannot be upcast.
    pub fn prepare_for_training(&mut self) -> Result<()> {
        self.config.use_cache = false;
        if self.config.supports_gradient_checkpointing.unwrap_or(true) {
            self.config.gradient_checkpointing = true;
        }

        for (name, tensor) in &mut self.weights {
            if name.contains("norm") && tensor.dtype() != DType::F32 {
                *tensor = tensor.to_dtype(DType::F32)?;
            }
        }

        tracing::debug!(
            model = %self.id,
            gradient_checkpointing = self.config.gradient_checkpointing,
            "prepared model for low-memory training"
        );
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (String, ModelConfigFile, HashMap<String, Tensor>) {
        (self.id, self.config, self.weights)
    }
}

fn is_linear_weight(name: &str, tensor: &Tensor) -> bool {
    name.ends_with(".weight") && !name.contains("norm") && tensor.rank() == 2
}

/// Full-precision model with adapter weights folded in.
///
/// Lives independently of the base and adapter handles it was built from.
#[derive(Debug)]
pub struct MergedModel {
    /// Identifier of the base model.
    pub base_model: String,
    /// Configuration to persist, with the inference cache re-enabled.
    pub config: ModelConfigFile,
    /// Merged weights.
    pub weights: HashMap<String, Tensor>,
}

impl MergedModel {
    /// Total number of parameters.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.weights.values().map(Tensor::elem_count).sum()
    }
}
