//! End-to-end fine-tuning run.
//!
//! Stages run in order and each one gates the next:
//! load dataset, load model, render, materialize, tokenize, train, publish,
//! smoke test. Only the smoke test is allowed to fail without ending the run.

use std::path::PathBuf;

use candle_core::Device;

use crate::config::TuneConfig;
use crate::corpus::{Corpus, CORPUS_FILE};
use crate::dataset::{load_records, TokenizedDataset};
use crate::error::{Result, Stage, TuneError};
use crate::generate::TextGenerator;
use crate::model::LoadedModel;
use crate::prompt::{render_all, Truncation};
use crate::publish::{publish, PublishReport};
use crate::smoke::{run_smoke_tests, SmokeOutcome};
use crate::trainer::{Trainer, TrainingSummary};

/// Everything a completed run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Path of the materialized corpus.
    pub corpus_path: PathBuf,
    /// Rendered examples written to the corpus.
    pub examples: usize,
    /// Training sequences after tokenization.
    pub sequences: usize,
    /// Training outcome.
    pub training: TrainingSummary,
    /// Published artifact locations.
    pub publish: PublishReport,
    /// One outcome per smoke-test prompt.
    pub smoke: Vec<SmokeOutcome>,
}

/// A configured fine-tuning run.
pub struct Pipeline {
    config: TuneConfig,
    device: Device,
}

impl Pipeline {
    /// Validate `config` and open its device.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] if the configuration is invalid or the
    /// device is unavailable.
    pub fn new(config: TuneConfig) -> Result<Self> {
        config.validate()?;
        let device = config.device.open()?;
        Ok(Self { config, device })
    }

    /// Configuration this pipeline runs with.
    #[must_use]
    pub fn config(&self) -> &TuneConfig {
        &self.config
    }

    /// Run every stage.
    ///
    /// # Errors
    ///
    /// Returns the first fatal stage error. Smoke-test failures are reported
    /// in [`RunReport::smoke`] instead.
    pub fn run(&self) -> Result<RunReport> {
        let config = &self.config;
        let output_dir = PathBuf::from(&config.output_dir);

        tracing::info!("Loading dataset from {}", config.dataset.path);
        let records = load_records(&config.dataset.path).map_err(|e| e.within(Stage::Load))?;
        tracing::info!("Loaded {} records", records.len());

        tracing::info!("Loading model from {}", config.base_model);
        let loaded = LoadedModel::load(&config.base_model, &self.device, config.seed)
            .map_err(|e| e.within(Stage::LoadModel))?;
        self.check_context(&loaded)?;

        let truncation = config
            .dataset
            .max_length
            .map(|max_length| Truncation::new(&loaded.tokenizer, max_length));
        let examples = render_all(&records, truncation).map_err(|e| e.within(Stage::Render))?;

        let corpus_path = output_dir.join(CORPUS_FILE);
        let corpus = Corpus::materialize(examples, &corpus_path)
            .map_err(|e| e.within(Stage::Materialize))?;

        let dataset = TokenizedDataset::build(
            &corpus,
            &loaded.tokenizer,
            &config.dataset.sequence,
            loaded.special.pad,
        )
        .map_err(|e| e.within(Stage::Tokenize))?;
        tracing::info!(
            "Built {} training sequences ({} tokens)",
            dataset.len(),
            dataset.token_count()
        );

        let mut trainer = Trainer::new(config.training.clone(), &output_dir, config.seed)?;
        let training = trainer.train(&loaded, &dataset)?;
        tracing::info!(
            "Training finished after {} steps, final loss {:.4}",
            training.steps,
            training.final_loss
        );

        let publish = publish(&loaded, config)?;

        let mut generator = TextGenerator::new(&loaded, &config.generation, config.seed);
        let smoke = run_smoke_tests(&mut generator, &config.generation.prompts);

        Ok(RunReport {
            corpus_path,
            examples: corpus.len(),
            sequences: dataset.len(),
            training,
            publish,
            smoke,
        })
    }

    fn check_context(&self, loaded: &LoadedModel) -> Result<()> {
        let window = loaded.model.config().max_position_embeddings;
        let wanted = self.config.dataset.sequence.sequence_length();
        if wanted > window {
            return Err(TuneError::Config(format!(
                "sequence length {wanted} exceeds the model context of {window} positions"
            )));
        }
        Ok(())
    }
}
