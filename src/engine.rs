//! Training engine contract and the step-scheduling loop.
//!
//! [`TrainingEngine`] is the seam between the lifecycle manager and the
//! optimization code. [`ScheduledEngine`] implements the bookkeeping every
//! engine needs (epochs, batching, gradient accumulation, learning-rate
//! schedule, logging, checkpoints, interruption) and hands the numeric work
//! for each batch to a [`StepKernel`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use crate::adapters::AdapterHandle;
use crate::config::TrainerSettings;
use crate::dataset::TokenizedPrompt;
use crate::error::{Result, TunerError};
use crate::model::ModelHandle;

/// Hyperparameters and run context passed to an engine.
#[derive(Debug, Clone)]
pub struct TrainingArgs {
    /// Examples per micro batch.
    pub batch_size: usize,
    /// Micro batches per optimizer step.
    pub gradient_accumulation_steps: usize,
    /// Optimizer steps of linear learning-rate warmup.
    pub warmup_steps: usize,
    /// Passes over the dataset.
    pub num_train_epochs: usize,
    /// Peak learning rate.
    pub learning_rate: f64,
    /// Log every N optimizer steps.
    pub logging_steps: usize,
    /// Checkpoint every N optimizer steps.
    pub save_steps: usize,
    /// Where intermediate checkpoints go.
    pub output_dir: PathBuf,
    /// Raised to stop training at the next optimizer step.
    pub interrupt: Option<Arc<AtomicBool>>,
    /// Draw a progress bar.
    pub show_progress: bool,
}

impl TrainingArgs {
    /// Build arguments from the `trainer` section of the configuration.
    #[must_use]
    pub fn from_settings(settings: &TrainerSettings, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            batch_size: settings.batch_size,
            gradient_accumulation_steps: settings.gradient_accumulation_steps,
            warmup_steps: settings.warmup_steps,
            num_train_epochs: settings.num_train_epochs,
            learning_rate: settings.learning_rate,
            logging_steps: settings.logging_steps,
            save_steps: settings.save_steps,
            output_dir: output_dir.into(),
            interrupt: None,
            show_progress: true,
        }
    }

    /// Optimizer steps a full run over `num_examples` takes.
    #[must_use]
    pub fn total_steps(&self, num_examples: usize) -> usize {
        let batches = num_examples.div_ceil(self.batch_size.max(1));
        batches.div_ceil(self.gradient_accumulation_steps.max(1)) * self.num_train_epochs
    }

    /// Learning rate at optimizer step `step` (0-based): linear warmup to
    /// the peak, then linear decay to zero at `total_steps`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn learning_rate_at(&self, step: usize, total_steps: usize) -> f64 {
        if step < self.warmup_steps {
            return self.learning_rate * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = total_steps.saturating_sub(step) as f64;
        self.learning_rate * (remaining / decay_steps as f64).clamp(0.0, 1.0)
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Outcome of a training call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    /// Optimizer steps taken.
    pub steps: usize,
    /// Epochs fully or partially run.
    pub epochs: usize,
    /// Tokens consumed.
    pub tokens: usize,
    /// Loss reported by the last micro batch, if any ran.
    pub final_loss: Option<f64>,
    /// Stopped early because the interrupt flag was raised.
    pub interrupted: bool,
}

/// Runs the optimization loop for an adapter.
///
/// Blocking from the caller's point of view; the engine may parallelize
/// internally. On return the adapter holds the updated weights.
pub trait TrainingEngine {
    /// Train `adapter` on `records`.
    ///
    /// # Errors
    ///
    /// Returns [`TunerError::Training`] if optimization fails.
    fn train(
        &mut self,
        model: &ModelHandle,
        adapter: &mut AdapterHandle,
        records: &[TokenizedPrompt],
        args: &TrainingArgs,
    ) -> Result<TrainingReport>;
}

/// Numeric work for one batch.
pub trait StepKernel {
    /// Forward and backward pass over a micro batch, accumulating gradients.
    /// Returns the batch loss.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass fails.
    fn accumulate(&mut self, model: &ModelHandle, adapter: &AdapterHandle, batch: &[TokenizedPrompt]) -> Result<f64>;

    /// Apply accumulated gradients and reset them.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    fn apply(&mut self, adapter: &mut AdapterHandle, learning_rate: f64) -> Result<()>;
}

/// Kernel that walks the batches without touching the weights.
///
/// Useful to validate a configuration and dataset end to end; the adapter
/// written afterwards is the freshly initialized one.
#[derive(Debug, Default)]
pub struct DryRunKernel {
    /// Micro batches seen.
    pub batches: usize,
    /// Updates requested.
    pub updates: usize,
}

impl StepKernel for DryRunKernel {
    fn accumulate(&mut self, _model: &ModelHandle, _adapter: &AdapterHandle, _batch: &[TokenizedPrompt]) -> Result<f64> {
        self.batches += 1;
        Ok(0.0)
    }

    fn apply(&mut self, _adapter: &mut AdapterHandle, _learning_rate: f64) -> Result<()> {
        self.updates += 1;
        Ok(())
    }
}

/// Training engine driving a [`StepKernel`] through a scheduled loop.
#[derive(Debug, Default)]
pub struct ScheduledEngine<K> {
    kernel: K,
}

impl<K: StepKernel> ScheduledEngine<K> {
    /// Create an engine around `kernel`.
    pub fn new(kernel: K) -> Self {
        Self { kernel }
    }

    /// The wrapped kernel.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    fn progress_bar(total_steps: usize, show: bool) -> Result<ProgressBar> {
        if !show {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }
}

impl<K: StepKernel> TrainingEngine for ScheduledEngine<K> {
    fn train(
        &mut self,
        model: &ModelHandle,
        adapter: &mut AdapterHandle,
        records: &[TokenizedPrompt],
        args: &TrainingArgs,
    ) -> Result<TrainingReport> {
        if args.batch_size == 0 || args.gradient_accumulation_steps == 0 {
            return Err(TunerError::Training(
                "batch_size and gradient_accumulation_steps must be > 0".into(),
            ));
        }

        let total_steps = args.total_steps(records.len());
        tracing::info!(
            examples = records.len(),
            epochs = args.num_train_epochs,
            total_steps,
            "starting training loop"
        );
        std::fs::create_dir_all(&args.output_dir)?;
        let pb = Self::progress_bar(total_steps, args.show_progress)?;

        let mut report = TrainingReport::default();
        'epochs: for epoch in 0..args.num_train_epochs {
            report.epochs = epoch + 1;
            tracing::debug!("Starting epoch {}/{}", epoch + 1, args.num_train_epochs);

            let batches: Vec<_> = records.chunks(args.batch_size).collect();
            let last = batches.len().saturating_sub(1);
            for (idx, batch) in batches.into_iter().enumerate() {
                let loss = self.kernel.accumulate(model, adapter, batch)?;
                report.final_loss = Some(loss);
                report.tokens += batch.iter().map(TokenizedPrompt::len).sum::<usize>();

                let boundary = (idx + 1) % args.gradient_accumulation_steps == 0 || idx == last;
                if !boundary {
                    continue;
                }

                let lr = args.learning_rate_at(report.steps, total_steps);
                self.kernel.apply(adapter, lr)?;
                report.steps += 1;
                pb.inc(1);

                if args.logging_steps > 0 && report.steps % args.logging_steps == 0 {
                    tracing::info!(step = report.steps, epoch = epoch + 1, loss, lr, "training");
                    pb.set_message(format!("loss {loss:.4}"));
                }
                if args.save_steps > 0 && report.steps % args.save_steps == 0 {
                    save_checkpoint(adapter, &args.output_dir, report.steps)?;
                }
                if args.interrupted() {
                    tracing::warn!(step = report.steps, "interrupt received, stopping training");
                    report.interrupted = true;
                    break 'epochs;
                }
            }
        }

        pb.finish_with_message("Training complete");
        Ok(report)
    }
}

/// Save an intermediate checkpoint to `{output_dir}/checkpoint-{step}`.
///
/// # Errors
///
/// Returns an error if the checkpoint cannot be written.
pub fn save_checkpoint(adapter: &AdapterHandle, output_dir: &Path, step: usize) -> Result<PathBuf> {
    let checkpoint_dir = output_dir.join(format!("checkpoint-{step}"));
    adapter.save(&checkpoint_dir)?;
    tracing::info!("Saved checkpoint to: {}", checkpoint_dir.display());
    Ok(checkpoint_dir)
}
