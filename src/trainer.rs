//! Training loop and optimization.

use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::dataset::{Sequence, TokenizedDataset};
use crate::error::{Result, Stage, TuneError};
use crate::model::{save_weights, LoadedModel, WEIGHTS_FILE};

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Training state written next to each checkpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    /// Optimizer steps taken.
    pub step: usize,
    /// Epoch the step belongs to (0-indexed).
    pub epoch: usize,
    /// `(step, loss)` for every logged step.
    pub log_history: Vec<(usize, f32)>,
}

/// Outcome of a finished training run.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// Optimizer steps taken.
    pub steps: usize,
    /// Epochs completed.
    pub epochs: usize,
    /// Loss of the last optimizer step.
    pub final_loss: f32,
    /// Loss of every optimizer step in order.
    pub losses: Vec<f32>,
}

/// Training orchestrator.
pub struct Trainer {
    /// Hyperparameters
    config: TrainingConfig,
    /// Where checkpoints go
    output_dir: PathBuf,
    /// Shuffling seed
    seed: u64,
    /// Current step
    step: usize,
    /// Current epoch
    epoch: usize,
    /// Logged losses
    log_history: Vec<(usize, f32)>,
}

impl Trainer {
    /// Create a new trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if a cadence or size in `config` is zero.
    pub fn new<P: AsRef<Path>>(config: TrainingConfig, output_dir: P, seed: u64) -> Result<Self> {
        if config.batch_size == 0
            || config.gradient_accumulation_steps == 0
            || config.save_steps == 0
            || config.logging_steps == 0
        {
            return Err(TuneError::Config(
                "batch size, accumulation, save and logging cadence must be > 0".into(),
            ));
        }
        if config.save_total_limit == Some(0) {
            return Err(TuneError::Config(
                "save_total_limit of 0 would delete every checkpoint".into(),
            ));
        }

        Ok(Self {
            config,
            output_dir: output_dir.as_ref().to_path_buf(),
            seed,
            step: 0,
            epoch: 0,
            log_history: Vec::new(),
        })
    }

    /// Optimizer steps in one epoch over `sequences` examples.
    #[must_use]
    pub fn steps_per_epoch(&self, sequences: usize) -> usize {
        let micro_batches = sequences.div_ceil(self.config.batch_size);
        micro_batches.div_ceil(self.config.gradient_accumulation_steps)
    }

    /// Run the training loop.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Training`] if any step or checkpoint fails.
    pub fn train(
        &mut self,
        model: &LoadedModel,
        dataset: &TokenizedDataset,
    ) -> Result<TrainingSummary> {
        self.run(model, dataset).map_err(|e| {
            let e = e.within(Stage::Train);
            match e {
                TuneError::Training(msg) => {
                    TuneError::Training(format!("step {}: {msg}", self.step + 1))
                }
                other => other,
            }
        })
    }

    fn run(&mut self, model: &LoadedModel, dataset: &TokenizedDataset) -> Result<TrainingSummary> {
        let cfg = self.config.clone();
        let steps_per_epoch = self.steps_per_epoch(dataset.len());
        let total_steps = steps_per_epoch * cfg.epochs;

        tracing::info!("Starting training");
        tracing::info!("  Sequences: {}", dataset.len());
        tracing::info!("  Parameters: {}", model.param_count());
        tracing::info!("  Epochs: {}", cfg.epochs);
        tracing::info!("  Total optimization steps: {}", total_steps);

        fs::create_dir_all(&self.output_dir)?;

        let params = ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: cfg.weight_decay,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(model.varmap.all_vars(), params)?;

        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(PROGRESS_TEMPLATE)?
                .progress_chars("#>-"),
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut losses = Vec::with_capacity(total_steps);

        for epoch in 0..cfg.epochs {
            self.epoch = epoch;
            tracing::info!("Starting epoch {}/{}", epoch + 1, cfg.epochs);
            order.shuffle(&mut rng);

            let micro_batches: Vec<&[usize]> = order.chunks(cfg.batch_size).collect();
            for group in micro_batches.chunks(cfg.gradient_accumulation_steps) {
                let lr = linear_decay(cfg.learning_rate, self.step, total_steps);
                optimizer.set_learning_rate(lr);

                let mut step_losses = Vec::with_capacity(group.len());
                for indices in group {
                    let batch: Vec<&Sequence> =
                        indices.iter().map(|&i| &dataset.sequences[i]).collect();
                    step_losses.push(batch_loss(model, &batch, &model.device)?);
                }
                let loss = Tensor::stack(&step_losses, 0)?.mean(0)?;
                optimizer.backward_step(&loss)?;

                let loss = loss.to_scalar::<f32>()?;
                if !loss.is_finite() {
                    return Err(TuneError::Training(format!("loss diverged to {loss}")));
                }

                self.step += 1;
                losses.push(loss);
                pb.inc(1);

                if self.step % cfg.logging_steps == 0 {
                    tracing::info!(
                        "step {} epoch {} loss {:.4} lr {:.2e}",
                        self.step,
                        epoch + 1,
                        loss,
                        optimizer.learning_rate()
                    );
                    pb.set_message(format!("loss {loss:.4}"));
                    self.log_history.push((self.step, loss));
                }

                if self.step % cfg.save_steps == 0 {
                    self.save_checkpoint(model)?;
                }
            }
        }

        pb.finish_with_message("Training complete");

        Ok(TrainingSummary {
            steps: self.step,
            epochs: cfg.epochs,
            final_loss: losses.last().copied().unwrap_or(f32::NAN),
            losses,
        })
    }

    /// Save a checkpoint and prune old ones.
    fn save_checkpoint(&self, model: &LoadedModel) -> Result<()> {
        let checkpoint_dir = self.output_dir.join(format!("checkpoint-{}", self.step));
        fs::create_dir_all(&checkpoint_dir)?;

        save_weights(&model.varmap, &checkpoint_dir.join(WEIGHTS_FILE), DType::F32)?;

        let state = TrainerState {
            step: self.step,
            epoch: self.epoch,
            log_history: self.log_history.clone(),
        };
        fs::write(
            checkpoint_dir.join("trainer_state.json"),
            serde_json::to_string_pretty(&state)?,
        )?;

        tracing::info!("Saved checkpoint to: {}", checkpoint_dir.display());

        if let Some(limit) = self.config.save_total_limit {
            prune_checkpoints(&self.output_dir, limit)?;
        }
        Ok(())
    }
}

/// Learning rate after `step` of `total` steps, falling linearly to zero.
#[allow(clippy::cast_precision_loss)]
fn linear_decay(peak: f64, step: usize, total: usize) -> f64 {
    if total == 0 {
        return peak;
    }
    peak * (1.0 - step as f64 / total as f64).max(0.0)
}

/// Mean next-token cross entropy over unmasked targets in `batch`.
fn batch_loss(model: &LoadedModel, batch: &[&Sequence], device: &Device) -> Result<Tensor> {
    let width = batch.iter().map(|s| s.ids.len()).max().unwrap_or(0);
    if width < 2 {
        return Err(TuneError::Training("batch has no prediction targets".into()));
    }
    let t = width - 1;

    let mut inputs = Vec::with_capacity(batch.len() * t);
    let mut targets = Vec::with_capacity(batch.len() * t);
    let mut mask = Vec::with_capacity(batch.len() * t);
    for seq in batch {
        for pos in 0..t {
            let input = seq.ids.get(pos).copied().unwrap_or(0);
            let target = seq.ids.get(pos + 1).copied().unwrap_or(0);
            let live = seq.mask.get(pos + 1).copied().unwrap_or(0);
            inputs.push(input);
            targets.push(target);
            mask.push(f32::from(live));
        }
    }

    let b = batch.len();
    let inputs = Tensor::from_vec(inputs, (b, t), device)?;
    let targets = Tensor::from_vec(targets, (b, t, 1), device)?;
    let mask = Tensor::from_vec(mask, (b, t), device)?;

    let logits = model.model.forward(&inputs)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&targets, D::Minus1)?.squeeze(D::Minus1)?;

    let total = (picked * &mask)?.sum_all()?;
    let count = mask.sum_all()?;
    Ok(total.neg()?.div(&count)?)
}

/// Keep the `limit` most recent `checkpoint-N` directories.
fn prune_checkpoints(output_dir: &Path, limit: usize) -> Result<()> {
    let mut checkpoints: Vec<(usize, PathBuf)> = fs::read_dir(output_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let step = name.strip_prefix("checkpoint-")?.parse().ok()?;
            entry.path().is_dir().then(|| (step, entry.path()))
        })
        .collect();

    if checkpoints.len() <= limit {
        return Ok(());
    }

    checkpoints.sort_by_key(|(step, _)| *step);
    let excess = checkpoints.len() - limit;
    for (_, path) in checkpoints.into_iter().take(excess) {
        tracing::debug!("Deleting older checkpoint {}", path.display());
        fs::remove_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SequenceMode;
    use crate::corpus::Corpus;
    use crate::testing::model_dir;
    use tempfile::TempDir;

    fn test_config() -> TrainingConfig {
        TrainingConfig {
            epochs: 1,
            batch_size: 2,
            gradient_accumulation_steps: 1,
            learning_rate: 1e-2,
            weight_decay: 0.0,
            save_steps: 1000,
            save_total_limit: None,
            logging_steps: 1,
        }
    }

    fn dataset(model: &LoadedModel, examples: usize) -> TokenizedDataset {
        let corpus = Corpus::from_examples(
            (0..examples)
                .map(|_| "User: Hi\nBot: Hello!".to_string())
                .collect(),
        );
        TokenizedDataset::build(
            &corpus,
            &model.tokenizer,
            &SequenceMode::Padded { max_length: 8 },
            model.special.pad,
        )
        .unwrap()
    }

    #[test]
    fn test_trainer_new_initializes_counters() {
        let out = TempDir::new().unwrap();
        let trainer = Trainer::new(test_config(), out.path(), 0).unwrap();
        assert_eq!(trainer.step, 0);
        assert_eq!(trainer.epoch, 0);
    }

    #[test]
    fn test_trainer_rejects_zero_batch() {
        let out = TempDir::new().unwrap();
        let mut config = test_config();
        config.batch_size = 0;
        assert!(Trainer::new(config, out.path(), 0).is_err());
    }

    #[test]
    fn test_trainer_rejects_zero_checkpoint_limit() {
        let out = TempDir::new().unwrap();
        let mut config = test_config();
        config.save_total_limit = Some(0);
        assert!(matches!(
            Trainer::new(config, out.path(), 0),
            Err(TuneError::Config(_))
        ));
    }

    #[test]
    fn test_steps_per_epoch_with_accumulation() {
        let out = TempDir::new().unwrap();
        let mut config = test_config();
        config.batch_size = 1;
        config.gradient_accumulation_steps = 4;
        let trainer = Trainer::new(config, out.path(), 0).unwrap();

        assert_eq!(trainer.steps_per_epoch(8), 2);
        assert_eq!(trainer.steps_per_epoch(9), 3);
        assert_eq!(trainer.steps_per_epoch(1), 1);
    }

    #[test]
    fn test_train_epoch_iteration() {
        let dir = model_dir();
        let model = LoadedModel::load(dir.path(), &Device::Cpu, 0).unwrap();
        let data = dataset(&model, 10);
        let out = TempDir::new().unwrap();

        let mut config = test_config();
        config.epochs = 3;
        config.batch_size = 5;
        let mut trainer = Trainer::new(config, out.path(), 0).unwrap();

        let summary = trainer.train(&model, &data).unwrap();

        // 10 sequences, batch size 5: 2 steps per epoch over 3 epochs.
        assert_eq!(summary.steps, 6);
        assert_eq!(trainer.epoch, 2);
        assert_eq!(summary.losses.len(), 6);
        assert!(summary.final_loss.is_finite());
    }

    #[test]
    fn test_loss_decreases_on_repeated_example() {
        let dir = model_dir();
        let model = LoadedModel::load(dir.path(), &Device::Cpu, 0).unwrap();
        let data = dataset(&model, 4);
        let out = TempDir::new().unwrap();

        let mut config = test_config();
        config.epochs = 30;
        config.batch_size = 4;
        let mut trainer = Trainer::new(config, out.path(), 0).unwrap();

        let summary = trainer.train(&model, &data).unwrap();
        assert!(summary.final_loss < summary.losses[0]);
    }

    #[test]
    fn test_checkpoint_cadence_and_pruning() {
        let dir = model_dir();
        let model = LoadedModel::load(dir.path(), &Device::Cpu, 0).unwrap();
        let data = dataset(&model, 4);
        let out = TempDir::new().unwrap();

        let mut config = test_config();
        config.epochs = 2;
        config.batch_size = 1;
        config.save_steps = 2;
        config.save_total_limit = Some(2);
        let mut trainer = Trainer::new(config, out.path(), 0).unwrap();
        trainer.train(&model, &data).unwrap();

        // 8 steps saving every 2 leaves the newest two of checkpoints 2, 4, 6, 8.
        assert!(!out.path().join("checkpoint-2").exists());
        assert!(!out.path().join("checkpoint-4").exists());
        assert!(out.path().join("checkpoint-6").join(WEIGHTS_FILE).exists());
        assert!(out.path().join("checkpoint-8").join(WEIGHTS_FILE).exists());

        let state_path = out.path().join("checkpoint-8").join("trainer_state.json");
        let state: TrainerState =
            serde_json::from_str(&fs::read_to_string(state_path).unwrap()).unwrap();
        assert_eq!(state.step, 8);
        assert_eq!(state.epoch, 1);
        assert_eq!(state.log_history.len(), 8);
    }

    #[test]
    fn test_no_checkpoint_without_reaching_cadence() {
        let dir = model_dir();
        let model = LoadedModel::load(dir.path(), &Device::Cpu, 0).unwrap();
        let data = dataset(&model, 2);
        let out = TempDir::new().unwrap();

        let mut trainer = Trainer::new(test_config(), out.path(), 0).unwrap();
        trainer.train(&model, &data).unwrap();

        let checkpoints = fs::read_dir(out.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("checkpoint-")
            })
            .count();
        assert_eq!(checkpoints, 0);
    }

    #[test]
    fn test_linear_decay() {
        assert!((linear_decay(1.0, 0, 4) - 1.0).abs() < f64::EPSILON);
        assert!((linear_decay(1.0, 2, 4) - 0.5).abs() < f64::EPSILON);
        assert!(linear_decay(1.0, 4, 4).abs() < f64::EPSILON);
    }
}
