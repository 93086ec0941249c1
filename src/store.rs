//! Artifact storage: resolving models, persisting adapters and merged
//! models, and publishing to a remote.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::adapters::{AdapterHandle, ADAPTER_WEIGHTS_FILENAME};
use crate::config::ModelFamily;
use crate::error::{Result, TunerError};
use crate::model::{MergedModel, ModelConfigFile, ModelHandle, Precision};
use crate::tokenizer::TokenizerHandle;

/// Model configuration file name.
pub const MODEL_CONFIG_FILENAME: &str = "config.json";

/// Weights file written for merged models.
pub const MODEL_WEIGHTS_FILENAME: &str = "model.safetensors";

/// Loads and stores every artifact the pipeline touches.
pub trait ArtifactStore {
    /// Load the tokenizer for a model identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::ModelLoad`] if the identifier does not resolve.
    fn load_tokenizer(&self, id: &str, family: ModelFamily) -> Result<TokenizerHandle>;

    /// Load a model at the requested precision.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::ModelLoad`] if the identifier does not resolve.
    fn load_model(&self, id: &str, precision: Precision) -> Result<ModelHandle>;

    /// Write an adapter checkpoint to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be written.
    fn persist_adapter(&self, adapter: &AdapterHandle, path: &Path) -> Result<()>;

    /// Load an adapter checkpoint onto `model`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::MissingArtifact`] if no checkpoint exists at `path`.
    fn load_adapter(&self, path: &Path, model: &ModelHandle) -> Result<AdapterHandle>;

    /// Write a merged model and its tokenizer to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    fn persist_model(&self, model: &MergedModel, tokenizer: &TokenizerHandle, path: &Path) -> Result<()>;

    /// Upload a merged model and its tokenizer under `remote_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Publish`] on any failure.
    fn publish(&self, model: &MergedModel, tokenizer: &TokenizerHandle, remote_id: &str) -> Result<()>;
}

/// Transport for publishing merged models.
pub trait RemotePublisher: Send + Sync {
    /// Upload `model` and `tokenizer` as repository `remote_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Publish`] on any failure.
    fn upload(&self, model: &MergedModel, tokenizer: &TokenizerHandle, remote_id: &str) -> Result<()>;
}

/// Check an `owner/name` repository id.
///
/// # Errors
///
/// Returns [`TunerError::Publish`] if the id is malformed.
pub fn validate_repo_id(remote_id: &str) -> Result<(&str, &str)> {
    let valid_part = |part: &str| {
        !part.is_empty()
            && part != "."
            && part != ".."
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    match remote_id.split_once('/') {
        Some((owner, name)) if valid_part(owner) && valid_part(name) => Ok((owner, name)),
        _ => Err(TunerError::Publish(format!(
            "invalid repository id `{remote_id}`, expected `owner/name`"
        ))),
    }
}

/// Publisher that mirrors artifacts into `{root}/{owner}/{name}`.
///
/// Stands in for a hub upload where the destination is a shared volume or
/// a directory synced by other tooling.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    /// Publish under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Destination directory for `remote_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Publish`] if the id is malformed.
    pub fn destination(&self, remote_id: &str) -> Result<PathBuf> {
        let (owner, name) = validate_repo_id(remote_id)?;
        Ok(self.root.join(owner).join(name))
    }
}

impl RemotePublisher for DirectoryPublisher {
    fn upload(&self, model: &MergedModel, tokenizer: &TokenizerHandle, remote_id: &str) -> Result<()> {
        let dest = self.destination(remote_id)?;
        write_model_dir(model, tokenizer, &dest)
            .map_err(|e| TunerError::Publish(format!("{remote_id}: {e}")))?;
        tracing::info!("Published {} to {}", remote_id, dest.display());
        Ok(())
    }
}

/// Filesystem-backed store.
///
/// Model identifiers resolve to a directory, either directly or relative to
/// the models root, holding `config.json`, one or more `*.safetensors`
/// files and `tokenizer.json`.
pub struct LocalArtifactStore {
    device: Device,
    models_root: Option<PathBuf>,
    publisher: Option<Box<dyn RemotePublisher>>,
}

impl LocalArtifactStore {
    /// Create a store loading tensors onto `device`.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            models_root: None,
            publisher: None,
        }
    }

    /// Resolve bare identifiers under `root`.
    #[must_use]
    pub fn with_models_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.models_root = Some(root.into());
        self
    }

    /// Publish through `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: impl RemotePublisher + 'static) -> Self {
        self.publisher = Some(Box::new(publisher));
        self
    }

    /// Directory an identifier resolves to.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::ModelLoad`] if no directory matches.
    pub fn resolve(&self, id: &str) -> Result<PathBuf> {
        let direct = Path::new(id);
        if direct.is_dir() {
            return Ok(direct.to_path_buf());
        }
        if let Some(root) = &self.models_root {
            let escapes = Path::new(id)
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
            let candidate = root.join(id);
            if !escapes && candidate.is_dir() {
                return Ok(candidate);
            }
        }
        Err(TunerError::ModelLoad(format!("cannot resolve model identifier `{id}`")))
    }

    fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "safetensors")
                    && path.file_name().is_some_and(|name| name != ADAPTER_WEIGHTS_FILENAME)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

impl std::fmt::Debug for LocalArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalArtifactStore")
            .field("device", &self.device)
            .field("models_root", &self.models_root)
            .field("publisher", &self.publisher.is_some())
            .finish()
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn load_tokenizer(&self, id: &str, family: ModelFamily) -> Result<TokenizerHandle> {
        let dir = self.resolve(id)?;
        TokenizerHandle::from_dir(&dir, family)
    }

    fn load_model(&self, id: &str, precision: Precision) -> Result<ModelHandle> {
        let dir = self.resolve(id)?;

        let config_path = dir.join(MODEL_CONFIG_FILENAME);
        let config: ModelConfigFile = if config_path.is_file() {
            serde_json::from_str(&std::fs::read_to_string(&config_path)?)
                .map_err(|e| TunerError::ModelLoad(format!("{}: {e}", config_path.display())))?
        } else {
            return Err(TunerError::ModelLoad(format!("{} not found", config_path.display())));
        };

        let files = Self::weight_files(&dir)?;
        if files.is_empty() {
            return Err(TunerError::ModelLoad(format!(
                "no safetensors weights in {}",
                dir.display()
            )));
        }

        let mut weights: HashMap<String, Tensor> = HashMap::new();
        for file in &files {
            tracing::debug!(file = %file.display(), "loading weights");
            weights.extend(candle_core::safetensors::load(file, &self.device)?);
        }

        tracing::info!(model = id, ?precision, shards = files.len(), "loaded model");
        ModelHandle::new(id, precision, config, weights, self.device.clone())
    }

    fn persist_adapter(&self, adapter: &AdapterHandle, path: &Path) -> Result<()> {
        adapter.save(path)?;
        tracing::info!("Saved adapter to: {}", path.display());
        Ok(())
    }

    fn load_adapter(&self, path: &Path, model: &ModelHandle) -> Result<AdapterHandle> {
        AdapterHandle::load(path, model)
    }

    fn persist_model(&self, model: &MergedModel, tokenizer: &TokenizerHandle, path: &Path) -> Result<()> {
        write_model_dir(model, tokenizer, path)?;
        tracing::info!("Saved merged model to: {}", path.display());
        Ok(())
    }

    fn publish(&self, model: &MergedModel, tokenizer: &TokenizerHandle, remote_id: &str) -> Result<()> {
        match &self.publisher {
            Some(publisher) => publisher.upload(model, tokenizer, remote_id),
            None => Err(TunerError::Publish("no remote publisher configured".into())),
        }
    }
}

fn write_model_dir(model: &MergedModel, tokenizer: &TokenizerHandle, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    candle_core::safetensors::save(&model.weights, dir.join(MODEL_WEIGHTS_FILENAME))?;
    std::fs::write(
        dir.join(MODEL_CONFIG_FILENAME),
        serde_json::to_string_pretty(&model.config)?,
    )?;
    tokenizer.save(dir)
}
