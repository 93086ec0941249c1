//! Command-line interface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::Device;
use clap::Parser;

use crate::config::FineTuneConfig;
use crate::engine::{DryRunKernel, ScheduledEngine};
use crate::error::Result;
use crate::store::{DirectoryPublisher, LocalArtifactStore};
use crate::trainer::FineTuner;

/// Fine-tune a quantized causal language model with a `LoRA` adapter,
/// merge the adapter and optionally publish the result.
#[derive(Parser, Debug)]
#[command(name = "qlora-tuner", version)]
#[command(about = "QLoRA fine-tuning pipeline: load, train, merge, publish", long_about = None)]
pub struct Cli {
    /// Path to the YAML run configuration
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Repository id (`owner/name`) to publish the merged model to
    #[arg(value_name = "REPO_ID")]
    pub repo_id: Option<String>,

    /// Root directory for resolving bare model identifiers
    #[arg(long, value_name = "DIR")]
    pub models_dir: Option<PathBuf>,

    /// Publish by mirroring the merged model under this directory
    #[arg(long, value_name = "DIR")]
    pub publish_root: Option<PathBuf>,

    /// Skip training and merge an existing adapter checkpoint
    #[arg(long)]
    pub merge_only: bool,

    /// Adapter checkpoint to continue from (overrides `adapter_path`)
    #[arg(long, value_name = "PATH", conflicts_with = "merge_only")]
    pub adapter: Option<PathBuf>,

    /// Hide the training progress bar
    #[arg(long)]
    pub quiet: bool,
}

impl Cli {
    /// Load the configuration file and apply command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_config(&self) -> Result<FineTuneConfig> {
        let mut config = FineTuneConfig::from_file(&self.config)?;
        if let Some(adapter) = &self.adapter {
            config.adapter_path = Some(adapter.to_string_lossy().into_owned());
        }
        Ok(config)
    }

    fn store(&self) -> Result<LocalArtifactStore> {
        let mut store = LocalArtifactStore::new(Device::cuda_if_available(0)?);
        if let Some(root) = &self.models_dir {
            store = store.with_models_root(root);
        }
        if let Some(root) = &self.publish_root {
            store = store.with_publisher(DirectoryPublisher::new(root));
        }
        Ok(store)
    }
}

/// Execute the pipeline described by `cli`.
///
/// # Errors
///
/// Returns the first error of any stage.
pub fn run(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    tracing::info!("Loaded configuration from {}", cli.config.display());

    let mut tuner = FineTuner::new(config, ScheduledEngine::new(DryRunKernel::default()), cli.store()?)?
        .with_progress(!cli.quiet);

    // Only the training loop polls the flag; merge-only keeps the default
    // Ctrl-C behavior.
    if !cli.merge_only {
        tracing::warn!("no numeric training kernel is linked, the adapter keeps its initial weights");
        let interrupt = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&interrupt);
        ctrlc::set_handler(move || {
            if record_interrupt(&handler_flag) {
                eprintln!("second interrupt, exiting without saving");
                std::process::exit(130);
            }
            eprintln!("interrupt received, saving the adapter at the next step");
        })?;
        tuner = tuner.with_interrupt(interrupt);
    }

    let output = if cli.merge_only {
        tuner.merge_only(cli.repo_id.as_deref())?
    } else {
        tuner.run(cli.repo_id.as_deref())?
    };

    println!("==============================");
    println!("Fine-tuning finished");
    println!("  adapter: {}", tuner.adapter_dir().display());
    println!("  merged model: {}", output.display());
    if let Some(repo_id) = &cli.repo_id {
        println!("  published: {repo_id}");
    }
    println!("==============================");
    Ok(())
}

/// Raise the interrupt flag. Returns whether it was already raised.
fn record_interrupt(flag: &AtomicBool) -> bool {
    flag.swap(true, Ordering::SeqCst)
}
