//! Staged fine-tuning lifecycle.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::adapters::{AdapterHandle, ParameterStats, ADAPTER_CONFIG_FILENAME};
use crate::config::FineTuneConfig;
use crate::dataset::{load_records, tokenize_prompts};
use crate::engine::{TrainingArgs, TrainingEngine, TrainingReport};
use crate::error::{Result, TunerError};
use crate::model::{MergedModel, ModelHandle, Precision};
use crate::processors::{format_records, FormatContext, ProcessorRegistry};
use crate::store::ArtifactStore;
use crate::tokenizer::{PadTokenSource, TokenizerHandle};

/// Lifecycle stage of a fine-tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing loaded.
    Uninitialized,
    /// Tokenizer and quantized base model loaded and prepared.
    BaseLoaded,
    /// Adapter attached to the base model.
    AdapterAttached,
    /// Adapter trained and persisted.
    Trained,
    /// Adapter folded into a full-precision model.
    Merged,
    /// Merged model and tokenizer written to disk.
    Persisted,
    /// Merged model uploaded.
    Published,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Where the attached adapter comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSource {
    /// Build a fresh adapter from the `lora` settings.
    Fresh,
    /// Reload a previously trained checkpoint.
    Checkpoint(PathBuf),
}

impl AdapterSource {
    /// `Checkpoint` when the configuration names an `adapter_path`.
    #[must_use]
    pub fn from_config(config: &FineTuneConfig) -> Self {
        config
            .adapter_path
            .as_ref()
            .map_or(Self::Fresh, |path| Self::Checkpoint(PathBuf::from(path)))
    }
}

/// Owns every handle of a fine-tuning run and moves it through the stages
/// `load_base_model → attach_adapter → train → merge_and_save → publish`.
///
/// Operations called out of order fail with [`TunerError::StageOrder`]
/// without side effects. Not meant for concurrent use.
pub struct FineTuner {
    config: FineTuneConfig,
    registry: ProcessorRegistry,
    engine: Box<dyn TrainingEngine>,
    store: Box<dyn ArtifactStore>,
    stage: Stage,
    tokenizer: Option<TokenizerHandle>,
    base: Option<ModelHandle>,
    adapter: Option<AdapterHandle>,
    merged: Option<MergedModel>,
    stats: Option<ParameterStats>,
    interrupt: Option<Arc<AtomicBool>>,
    show_progress: bool,
}

impl FineTuner {
    /// Create a run with the built-in prompt formatters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: FineTuneConfig,
        engine: impl TrainingEngine + 'static,
        store: impl ArtifactStore + 'static,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            registry: ProcessorRegistry::with_defaults(),
            engine: Box::new(engine),
            store: Box::new(store),
            stage: Stage::Uninitialized,
            tokenizer: None,
            base: None,
            adapter: None,
            merged: None,
            stats: None,
            interrupt: None,
            show_progress: true,
        })
    }

    /// Use `registry` to resolve dataset types.
    #[must_use]
    pub fn with_registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Stop training at the next optimizer step once `flag` is raised.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Toggle the training progress bar.
    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run configuration.
    #[must_use]
    pub fn config(&self) -> &FineTuneConfig {
        &self.config
    }

    /// Parameter counts reported when the adapter was attached.
    #[must_use]
    pub fn parameter_stats(&self) -> Option<ParameterStats> {
        self.stats
    }

    /// The loaded tokenizer.
    #[must_use]
    pub fn tokenizer(&self) -> Option<&TokenizerHandle> {
        self.tokenizer.as_ref()
    }

    /// The merged model, once produced.
    #[must_use]
    pub fn merged(&self) -> Option<&MergedModel> {
        self.merged.as_ref()
    }

    fn require(&self, operation: &'static str, required: Stage) -> Result<()> {
        if self.stage == required {
            return Ok(());
        }
        Err(TunerError::StageOrder {
            operation,
            required: stage_name(required),
            current: self.stage,
        })
    }

    fn load_tokenizer(&self) -> Result<TokenizerHandle> {
        let mut tokenizer = self
            .store
            .load_tokenizer(&self.config.base_model, self.config.family()?)?;
        match tokenizer.ensure_pad_token()? {
            PadTokenSource::Existing => {}
            PadTokenSource::EndOfSequence => tracing::info!("Using eos token as pad token"),
            PadTokenSource::Added => tracing::info!("Added a dedicated pad token"),
        }
        if tokenizer.eos_token().is_none() {
            tracing::warn!("tokenizer defines no eos token, conversation turns will not be terminated");
        }
        Ok(tokenizer)
    }

    /// Load the tokenizer and the quantized base model, and prepare the
    /// model for low-memory training.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::ModelLoad`] if `base_model` cannot be resolved.
    pub fn load_base_model(&mut self) -> Result<()> {
        self.require("load_base_model", Stage::Uninitialized)?;
        tracing::info!("Loading base model: {}", self.config.base_model);

        let tokenizer = self.load_tokenizer()?;
        let mut model = self
            .store
            .load_model(&self.config.base_model, Precision::Quantized4Bit)?;
        model.prepare_for_training()?;

        self.tokenizer = Some(tokenizer);
        self.base = Some(model);
        self.stage = Stage::BaseLoaded;
        Ok(())
    }

    /// Attach a fresh or previously trained adapter to the base model.
    ///
    /// # Errors
    ///
    /// Fails if the base model is not loaded, no target module matches, or
    /// the checkpoint cannot be read.
    pub fn attach_adapter(&mut self, source: AdapterSource) -> Result<ParameterStats> {
        self.require("attach_adapter", Stage::BaseLoaded)?;
        let base = self.base.as_ref().ok_or_else(released("base model"))?;

        let adapter = match source {
            AdapterSource::Fresh => AdapterHandle::attach(base, &self.config.lora)?,
            AdapterSource::Checkpoint(path) => {
                tracing::info!("Loading adapter from {}", path.display());
                self.store.load_adapter(&path, base)?
            }
        };

        let stats = adapter.parameter_stats(base);
        tracing::info!("{stats}");

        self.stats = Some(stats);
        self.adapter = Some(adapter);
        self.stage = Stage::AdapterAttached;
        Ok(stats)
    }

    /// Format the dataset registered under `dataset_tag`, train the adapter
    /// and persist it to the adapter directory.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::DatasetType`] before any I/O if the tag is not
    /// registered, [`TunerError::Interrupted`] after flushing the adapter if
    /// training was interrupted, or any dataset or engine error.
    pub fn train(&mut self, dataset_tag: &str) -> Result<TrainingReport> {
        self.require("train", Stage::AdapterAttached)?;

        let formatter = self.registry.resolve(dataset_tag)?;
        formatter.validate(&self.config.data)?;
        tracing::info!(dataset_type = dataset_tag, formatter = formatter.name(), "resolved prompt formatter");

        let tokenizer = self.tokenizer.as_ref().ok_or_else(released("tokenizer"))?;
        let records = load_records(&self.config.data.dataset)?;
        tracing::info!("Loaded {} training examples", records.len());

        let ctx = FormatContext {
            data: &self.config.data,
            eos_token: tokenizer.eos_token().unwrap_or_default(),
        };
        let prompts = format_records(&*formatter, &records, &ctx)?;

        let context_window = self
            .config
            .model_context_window
            .unwrap_or_else(|| tokenizer.model_max_length());
        let tokenized = tokenize_prompts(&prompts, tokenizer, context_window)?;

        let mut args = TrainingArgs::from_settings(&self.config.trainer, &self.config.trainer_output_dir);
        args.interrupt.clone_from(&self.interrupt);
        args.show_progress = self.show_progress;

        let base = self.base.as_ref().ok_or_else(released("base model"))?;
        let adapter = self.adapter.as_mut().ok_or_else(released("adapter"))?;
        let report = self.engine.train(base, adapter, &tokenized, &args)?;

        let adapter_dir = self.config.adapter_dir();
        if report.interrupted {
            self.store.persist_adapter(adapter, &adapter_dir)?;
            return Err(TunerError::Interrupted {
                checkpoint: adapter_dir,
            });
        }

        adapter.freeze();
        self.store.persist_adapter(adapter, &adapter_dir)?;
        tracing::info!(steps = report.steps, epochs = report.epochs, "Training complete");

        self.stage = Stage::Trained;
        Ok(report)
    }

    /// Fold the persisted adapter into a full-precision copy of the base
    /// model and write the result with the tokenizer to the merged-model
    /// directory.
    ///
    /// Works from any stage before `Merged` as long as an adapter checkpoint
    /// exists, so an adapter trained by an earlier run can be merged on its
    /// own. The quantized base and the in-memory adapter are released before
    /// the full-precision copy is loaded; if the merge then fails the run is
    /// back at [`Stage::Uninitialized`] and can be retried.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::MissingArtifact`] if no adapter checkpoint
    /// exists, or a load or write error.
    pub fn merge_and_save(&mut self) -> Result<PathBuf> {
        if matches!(self.stage, Stage::Merged | Stage::Persisted | Stage::Published) {
            return Err(TunerError::StageOrder {
                operation: "merge_and_save",
                required: "Uninitialized, BaseLoaded, AdapterAttached or Trained",
                current: self.stage,
            });
        }

        let adapter_dir = self.config.adapter_dir();
        if !adapter_dir.join(ADAPTER_CONFIG_FILENAME).is_file() {
            return Err(TunerError::MissingArtifact(adapter_dir));
        }
        if self.stage == Stage::AdapterAttached {
            tracing::warn!("adapter was not trained in this run, merging the checkpoint on disk");
        }

        // Handles are gone from here on; a failure leaves a fresh run.
        self.adapter = None;
        self.base = None;
        self.stage = Stage::Uninitialized;

        let tokenizer = match self.tokenizer.take() {
            Some(tokenizer) => tokenizer,
            None => self.load_tokenizer()?,
        };

        tracing::info!("Merging adapter into a full-precision copy of {}", self.config.base_model);
        let output = self.config.merged_model_dir();
        let merged = self
            .store
            .load_model(&self.config.base_model, Precision::Full)
            .and_then(|full| {
                let adapter = self.store.load_adapter(&adapter_dir, &full)?;
                adapter.merge_into(full)
            })
            .and_then(|merged| {
                self.store.persist_model(&merged, &tokenizer, &output)?;
                Ok(merged)
            });
        self.tokenizer = Some(tokenizer);
        let merged = match merged {
            Ok(merged) => merged,
            Err(e) => {
                tracing::warn!(error = %e, "merge failed, run reset to {}", Stage::Uninitialized);
                return Err(e);
            }
        };

        self.merged = Some(merged);
        self.stage = Stage::Persisted;
        Ok(output)
    }

    /// Upload the merged model and tokenizer as `remote_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Publish`] on failure; the run stays `Persisted`
    /// and publishing can be retried.
    pub fn publish(&mut self, remote_id: &str) -> Result<()> {
        self.require("publish", Stage::Persisted)?;
        let merged = self.merged.as_ref().ok_or_else(released("merged model"))?;
        let tokenizer = self.tokenizer.as_ref().ok_or_else(released("tokenizer"))?;

        self.store.publish(merged, tokenizer, remote_id)?;
        tracing::info!("Published model to {remote_id}");

        self.stage = Stage::Published;
        Ok(())
    }

    /// Run every stage in order, publishing when `publish_to` is set.
    ///
    /// Returns the merged-model directory.
    ///
    /// # Errors
    ///
    /// Returns the first stage error.
    pub fn run(&mut self, publish_to: Option<&str>) -> Result<PathBuf> {
        self.load_base_model()?;
        self.attach_adapter(AdapterSource::from_config(&self.config))?;
        let dataset_type = self.config.data.dataset_type.clone();
        self.train(&dataset_type)?;
        let output = self.merge_and_save()?;
        if let Some(remote_id) = publish_to {
            self.publish(remote_id)?;
        }
        Ok(output)
    }

    /// Merge the adapter directory of an earlier run without training.
    ///
    /// # Errors
    ///
    /// Same as [`FineTuner::merge_and_save`].
    pub fn merge_only(&mut self, publish_to: Option<&str>) -> Result<PathBuf> {
        let output = self.merge_and_save()?;
        if let Some(remote_id) = publish_to {
            self.publish(remote_id)?;
        }
        Ok(output)
    }

    /// Where this run writes its adapter checkpoint.
    #[must_use]
    pub fn adapter_dir(&self) -> PathBuf {
        self.config.adapter_dir()
    }

    /// Check whether a persisted adapter checkpoint exists.
    #[must_use]
    pub fn has_adapter_checkpoint(&self) -> bool {
        checkpoint_exists(&self.config.adapter_dir())
    }
}

impl std::fmt::Debug for FineTuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FineTuner")
            .field("base_model", &self.config.base_model)
            .field("stage", &self.stage)
            .field("registry", &self.registry)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn stage_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Uninitialized => "Uninitialized",
        Stage::BaseLoaded => "BaseLoaded",
        Stage::AdapterAttached => "AdapterAttached",
        Stage::Trained => "Trained",
        Stage::Merged => "Merged",
        Stage::Persisted => "Persisted",
        Stage::Published => "Published",
    }
}

fn checkpoint_exists(dir: &Path) -> bool {
    dir.join(ADAPTER_CONFIG_FILENAME).is_file()
}

fn released(what: &'static str) -> impl FnOnce() -> TunerError {
    move || TunerError::Training(format!("{what} is no longer loaded"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSettings, LoraSettings, TrainerSettings};
    use crate::dataset::TokenizedPrompt;
    use crate::engine::{DryRunKernel, ScheduledEngine};
    use crate::store::{DirectoryPublisher, LocalArtifactStore};
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"[UNK]": 0, "</s>": 1, "hello": 2, "world": 3, "again": 4},
    "unk_token": "[UNK]"
  }
}"#;

    /// Records how often it ran and sets every `lora_B` to ones.
    #[derive(Clone, Default)]
    struct OnesEngine {
        calls: Arc<Mutex<Vec<usize>>>,
    }

    impl TrainingEngine for OnesEngine {
        fn train(
            &mut self,
            _model: &ModelHandle,
            adapter: &mut AdapterHandle,
            records: &[TokenizedPrompt],
            _args: &TrainingArgs,
        ) -> Result<TrainingReport> {
            self.calls.lock().unwrap().push(records.len());
            for name in adapter.var_names() {
                if name.ends_with("lora_B.weight") {
                    let var = adapter.var(&name).unwrap();
                    var.set(&var.ones_like()?)?;
                }
            }
            Ok(TrainingReport {
                steps: 1,
                epochs: 1,
                ..Default::default()
            })
        }
    }

    struct Fixture {
        temp: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let model_dir = temp.path().join("base");
            std::fs::create_dir_all(&model_dir).unwrap();

            let dev = Device::Cpu;
            let mut w = HashMap::new();
            for name in ["q_proj", "v_proj", "o_proj"] {
                w.insert(
                    format!("model.layers.0.self_attn.{name}.weight"),
                    Tensor::ones((4, 4), DType::F32, &dev).unwrap(),
                );
            }
            w.insert(
                "model.norm.weight".to_string(),
                Tensor::ones(4, DType::F32, &dev).unwrap(),
            );
            candle_core::safetensors::save(&w, model_dir.join("model.safetensors")).unwrap();
            std::fs::write(model_dir.join("config.json"), r#"{"model_type": "llama"}"#).unwrap();
            std::fs::write(model_dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
            std::fs::write(
                model_dir.join("tokenizer_config.json"),
                r#"{"eos_token": "</s>", "model_max_length": 16}"#,
            )
            .unwrap();

            let mut dataset = String::new();
            for i in 0..4 {
                dataset.push_str(&format!(
                    r#"{{"instruction":"hello {i}","input":"","output":"world again"}}"#
                ));
                dataset.push('\n');
            }
            std::fs::write(temp.path().join("train.jsonl"), dataset).unwrap();

            Self { temp }
        }

        fn path(&self, rel: &str) -> String {
            self.temp.path().join(rel).to_string_lossy().into_owned()
        }

        fn config(&self) -> FineTuneConfig {
            FineTuneConfig {
                base_model: self.path("base"),
                model_family: None,
                lora: LoraSettings {
                    r: 2,
                    lora_alpha: 4,
                    target_modules: vec!["q_proj".into(), "v_proj".into()],
                    ..Default::default()
                },
                trainer: TrainerSettings {
                    batch_size: 2,
                    gradient_accumulation_steps: 1,
                    warmup_steps: 0,
                    num_train_epochs: 1,
                    logging_steps: 1,
                    save_steps: 1000,
                    ..Default::default()
                },
                data: DataSettings {
                    dataset_type: "alpaca".into(),
                    dataset: self.path("train.jsonl"),
                    instruct_header: Some("Instruction".into()),
                    input_header: Some("Input".into()),
                    output_header: Some("Response".into()),
                    ..Default::default()
                },
                model_context_window: None,
                model_output_dir: self.path("out"),
                model_name: "tiny-tuned".into(),
                trainer_output_dir: self.path("checkpoints"),
                adapter_path: None,
            }
        }

        fn tuner(&self, config: FineTuneConfig, engine: impl TrainingEngine + 'static) -> FineTuner {
            FineTuner::new(config, engine, LocalArtifactStore::new(Device::Cpu))
                .unwrap()
                .with_progress(false)
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.base_model = String::new();
        assert!(FineTuner::new(config, OnesEngine::default(), LocalArtifactStore::new(Device::Cpu)).is_err());
    }

    #[test]
    fn test_attach_before_load_is_stage_error() {
        let fixture = Fixture::new();
        let mut tuner = fixture.tuner(fixture.config(), OnesEngine::default());

        match tuner.attach_adapter(AdapterSource::Fresh) {
            Err(TunerError::StageOrder {
                operation,
                required,
                current,
            }) => {
                assert_eq!(operation, "attach_adapter");
                assert_eq!(required, "BaseLoaded");
                assert_eq!(current, Stage::Uninitialized);
            }
            other => panic!("expected StageOrder error, got {other:?}"),
        }
        assert_eq!(tuner.stage(), Stage::Uninitialized);
    }

    #[test]
    fn test_load_base_model() {
        let fixture = Fixture::new();
        let mut tuner = fixture.tuner(fixture.config(), OnesEngine::default());
        tuner.load_base_model().unwrap();

        assert_eq!(tuner.stage(), Stage::BaseLoaded);
        assert_eq!(tuner.tokenizer().unwrap().pad_token(), Some("</s>"));
        assert!(tuner.load_base_model().is_err());
    }

    #[test]
    fn test_unresolvable_base_model() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.base_model = fixture.path("nowhere");
        let mut tuner = fixture.tuner(config, OnesEngine::default());

        assert!(matches!(tuner.load_base_model(), Err(TunerError::ModelLoad(_))));
        assert_eq!(tuner.stage(), Stage::Uninitialized);
    }

    #[test]
    fn test_trainable_percentage_bounds() {
        let fixture = Fixture::new();
        let mut tuner = fixture.tuner(fixture.config(), OnesEngine::default());
        tuner.load_base_model().unwrap();
        let stats = tuner.attach_adapter(AdapterSource::Fresh).unwrap();

        // two 4x4 targets at r=2: 2 * 2 * (4 + 4)
        assert_eq!(stats.trainable, 32);
        assert!(stats.percent() > 0.0 && stats.percent() < 100.0);
        assert_eq!(tuner.stage(), Stage::AdapterAttached);
    }

    #[test]
    fn test_unknown_dataset_type_has_no_side_effects() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.data.dataset_type = "unknown".into();
        let engine = OnesEngine::default();
        let calls = Arc::clone(&engine.calls);
        let mut tuner = fixture.tuner(config, engine);
        tuner.load_base_model().unwrap();
        tuner.attach_adapter(AdapterSource::Fresh).unwrap();

        match tuner.train("unknown") {
            Err(TunerError::DatasetType(tag)) => assert_eq!(tag, "unknown"),
            other => panic!("expected DatasetType error, got {other:?}"),
        }
        assert!(calls.lock().unwrap().is_empty());
        assert!(!Path::new(&fixture.path("out")).exists());
        assert!(!Path::new(&fixture.path("checkpoints")).exists());
        assert_eq!(tuner.stage(), Stage::AdapterAttached);
    }

    #[test]
    fn test_missing_header_fails_before_training() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.data.output_header = None;
        let engine = OnesEngine::default();
        let calls = Arc::clone(&engine.calls);
        let mut tuner = fixture.tuner(config, engine);
        tuner.load_base_model().unwrap();
        tuner.attach_adapter(AdapterSource::Fresh).unwrap();

        assert!(matches!(tuner.train("alpaca"), Err(TunerError::Config(_))));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_merge_without_checkpoint_is_missing_artifact() {
        let fixture = Fixture::new();
        let mut tuner = fixture.tuner(fixture.config(), OnesEngine::default());

        match tuner.merge_and_save() {
            Err(TunerError::MissingArtifact(path)) => assert!(path.ends_with("tiny-tuned_adapter")),
            other => panic!("expected MissingArtifact error, got {other:?}"),
        }
        assert!(!tuner.has_adapter_checkpoint());
    }

    #[test]
    fn test_full_pipeline_with_recording_engine() {
        let fixture = Fixture::new();
        let engine = OnesEngine::default();
        let calls = Arc::clone(&engine.calls);
        let mut tuner = fixture.tuner(fixture.config(), engine);

        let output = tuner.run(None).unwrap();
        assert_eq!(tuner.stage(), Stage::Persisted);
        assert_eq!(*calls.lock().unwrap(), vec![4]);
        assert!(tuner.has_adapter_checkpoint());
        assert!(output.join("model.safetensors").exists());
        assert!(output.join("tokenizer.json").exists());

        let merged = candle_core::safetensors::load(output.join("model.safetensors"), &Device::Cpu).unwrap();
        let ones = Tensor::ones((4, 4), DType::F32, &Device::Cpu).unwrap();
        let diff = |name: &str| -> f32 {
            merged[name]
                .sub(&ones)
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap()
        };
        assert!(diff("model.layers.0.self_attn.q_proj.weight") > 0.0);
        assert!(diff("model.layers.0.self_attn.v_proj.weight") > 0.0);
        assert!(diff("model.layers.0.self_attn.o_proj.weight").abs() < f32::EPSILON);

        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(output.join("config.json")).unwrap()).unwrap();
        assert_eq!(config["use_cache"], true);
    }

    #[test]
    fn test_merge_after_merge_is_rejected() {
        let fixture = Fixture::new();
        let mut tuner = fixture.tuner(fixture.config(), OnesEngine::default());
        tuner.run(None).unwrap();
        assert!(matches!(tuner.merge_and_save(), Err(TunerError::StageOrder { .. })));
    }

    #[test]
    fn test_standalone_merge_of_earlier_checkpoint() {
        let fixture = Fixture::new();
        let mut first = fixture.tuner(fixture.config(), OnesEngine::default());
        first.load_base_model().unwrap();
        first.attach_adapter(AdapterSource::Fresh).unwrap();
        first.train("alpaca").unwrap();
        assert_eq!(first.stage(), Stage::Trained);

        let mut second = fixture.tuner(fixture.config(), OnesEngine::default());
        let output = second.merge_only(None).unwrap();
        assert_eq!(second.stage(), Stage::Persisted);
        assert!(output.join("config.json").exists());
    }

    #[test]
    fn test_failed_merge_resets_to_uninitialized() {
        let fixture = Fixture::new();
        let mut first = fixture.tuner(fixture.config(), OnesEngine::default());
        first.load_base_model().unwrap();
        first.attach_adapter(AdapterSource::Fresh).unwrap();
        first.train("alpaca").unwrap();
        std::fs::write(
            first.adapter_dir().join("adapter_model.safetensors"),
            b"not a safetensors file at all",
        )
        .unwrap();

        let mut second = fixture.tuner(fixture.config(), OnesEngine::default());
        second.load_base_model().unwrap();
        second.attach_adapter(AdapterSource::Fresh).unwrap();
        assert!(second.merge_and_save().is_err());
        assert_eq!(second.stage(), Stage::Uninitialized);

        assert!(matches!(
            second.train("alpaca"),
            Err(TunerError::StageOrder { operation: "train", .. })
        ));
        second.load_base_model().unwrap();
        assert_eq!(second.stage(), Stage::BaseLoaded);
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let fixture = Fixture::new();
        let mut first = fixture.tuner(fixture.config(), OnesEngine::default());
        first.load_base_model().unwrap();
        first.attach_adapter(AdapterSource::Fresh).unwrap();
        first.train("alpaca").unwrap();

        let mut config = fixture.config();
        config.adapter_path = Some(first.adapter_dir().to_string_lossy().into_owned());
        let mut second = fixture.tuner(config, OnesEngine::default());
        second.load_base_model().unwrap();
        second
            .attach_adapter(AdapterSource::from_config(second.config()))
            .unwrap();

        let adapter = second.adapter.as_ref().unwrap();
        let b = adapter
            .var("base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight")
            .unwrap();
        let total: f32 = b.sum_all().unwrap().to_scalar().unwrap();
        assert!((total - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_publish_requires_persisted() {
        let fixture = Fixture::new();
        let mut tuner = fixture.tuner(fixture.config(), OnesEngine::default());
        assert!(matches!(
            tuner.publish("acme/tiny"),
            Err(TunerError::StageOrder { operation: "publish", .. })
        ));
    }

    #[test]
    fn test_publish_failure_keeps_persisted() {
        let fixture = Fixture::new();
        let mut tuner = fixture.tuner(fixture.config(), OnesEngine::default());
        tuner.run(None).unwrap();

        assert!(matches!(tuner.publish("acme/tiny"), Err(TunerError::Publish(_))));
        assert_eq!(tuner.stage(), Stage::Persisted);
        assert!(Path::new(&fixture.path("out/tiny-tuned/model.safetensors")).exists());
    }

    #[test]
    fn test_publish_to_directory() {
        let fixture = Fixture::new();
        let store = LocalArtifactStore::new(Device::Cpu).with_publisher(DirectoryPublisher::new(fixture.path("hub")));
        let mut tuner = FineTuner::new(fixture.config(), OnesEngine::default(), store)
            .unwrap()
            .with_progress(false);

        tuner.run(Some("acme/tiny-tuned")).unwrap();
        assert_eq!(tuner.stage(), Stage::Published);
        assert!(Path::new(&fixture.path("hub/acme/tiny-tuned/model.safetensors")).exists());
    }

    #[test]
    fn test_interrupt_flushes_adapter() {
        let fixture = Fixture::new();
        let mut config = fixture.config();
        config.trainer.batch_size = 1;
        let flag = Arc::new(AtomicBool::new(true));
        let mut tuner = fixture
            .tuner(config, ScheduledEngine::new(DryRunKernel::default()))
            .with_interrupt(Arc::clone(&flag));
        tuner.load_base_model().unwrap();
        tuner.attach_adapter(AdapterSource::Fresh).unwrap();

        match tuner.train("alpaca") {
            Err(TunerError::Interrupted { checkpoint }) => assert_eq!(checkpoint, tuner.adapter_dir()),
            other => panic!("expected Interrupted error, got {other:?}"),
        }
        assert_eq!(tuner.stage(), Stage::AdapterAttached);
        assert!(tuner.has_adapter_checkpoint());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::BaseLoaded.to_string(), "BaseLoaded");
        assert_eq!(stage_name(Stage::Published), "Published");
    }
}
