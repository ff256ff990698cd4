//! Command-line interface.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::{DeviceConfig, GenerationConfig, TuneConfig};
use crate::error::{Result, Stage, TuneError};
use crate::generate::TextGenerator;
use crate::model::LoadedModel;
use crate::pipeline::Pipeline;
use crate::smoke::run_smoke_tests;

/// Prompts used by `qa-tune test` when none are given.
pub const TEST_PROMPTS: [&str; 6] = [
    "Hello",
    "How do I buy a house with crypto?",
    "What’s an As Is contract?",
    "Find a Spanish agent",
    "What’s title insurance?",
    "What’s tokenization?",
];

/// Fine-tune a causal language model on Q&A pairs.
#[derive(Parser, Debug)]
#[command(name = "qa-tune", version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full pipeline: prepare data, train, publish, smoke test
    Train {
        /// Path to the YAML run configuration
        config: PathBuf,

        /// Override the configured output directory
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },

    /// Check a configuration file without running anything
    Validate {
        /// Path to the YAML run configuration
        config: PathBuf,
    },

    /// Write a preset configuration to a file
    Init {
        /// Where to write the configuration
        path: PathBuf,

        /// Preset name
        #[arg(long, default_value = "phi-2")]
        preset: String,
    },

    /// Generate sample responses from a published model directory
    Test {
        /// Directory holding config.json, tokenizer.json and model.safetensors
        model_dir: PathBuf,

        /// Prompt to run; repeat for several
        #[arg(long = "prompt", value_name = "TEXT")]
        prompts: Vec<String>,

        /// Maximum total tokens per generation, prompt included
        #[arg(long, default_value_t = 80)]
        max_length: usize,

        /// Nucleus sampling threshold
        #[arg(long, default_value_t = 0.95)]
        top_p: f64,

        /// Sampling seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Device to run on (`cpu`, `cuda` or `cuda:N`)
        #[arg(long, default_value = "cpu")]
        device: String,
    },
}

impl Cli {
    /// Dispatch the parsed command.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of the command.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train { config, output_dir } => run_train(&config, output_dir),
            Commands::Validate { config } => run_validate(&config),
            Commands::Init { path, preset } => run_init(&path, &preset),
            Commands::Test {
                model_dir,
                prompts,
                max_length,
                top_p,
                seed,
                device,
            } => {
                let settings = test_settings(prompts, max_length, top_p);
                run_test(&model_dir, &settings, seed, &device)
            }
        }
    }
}

fn run_train(config_path: &Path, output_dir: Option<PathBuf>) -> Result<()> {
    let mut config = TuneConfig::from_file(config_path)?;
    if let Some(dir) = output_dir {
        config.output_dir = dir.to_string_lossy().into_owned();
    }

    let report = Pipeline::new(config)?.run()?;

    let failed = report.smoke.iter().filter(|o| !o.is_ok()).count();
    if failed > 0 {
        tracing::warn!("{} of {} smoke-test prompts failed", failed, report.smoke.len());
    }
    if report.publish.export_failed() {
        tracing::warn!("Model published without its export");
    }
    println!(
        "Training complete: {} steps, final loss {:.4}. Model saved to {}",
        report.training.steps,
        report.training.final_loss,
        report.publish.dir.display()
    );
    Ok(())
}

fn run_validate(config_path: &Path) -> Result<()> {
    let config = TuneConfig::from_file(config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn run_init(path: &Path, preset: &str) -> Result<()> {
    let config = TuneConfig::from_preset(preset)?;
    config.to_file(path)?;
    println!("Wrote {preset} configuration to {}", path.display());
    Ok(())
}

/// Decoding settings for `qa-tune test`, falling back to [`TEST_PROMPTS`].
fn test_settings(prompts: Vec<String>, max_length: usize, top_p: f64) -> GenerationConfig {
    GenerationConfig {
        prompts: if prompts.is_empty() {
            TEST_PROMPTS.iter().map(ToString::to_string).collect()
        } else {
            prompts
        },
        max_length,
        top_p,
        ..Default::default()
    }
}

fn run_test(model_dir: &Path, settings: &GenerationConfig, seed: u64, device: &str) -> Result<()> {
    settings.validate()?;

    let device = DeviceConfig::try_from(device.to_string())
        .map_err(TuneError::Config)?
        .open()?;
    let loaded =
        LoadedModel::load(model_dir, &device, seed).map_err(|e| e.within(Stage::LoadModel))?;

    let mut generator = TextGenerator::new(&loaded, settings, seed);
    run_smoke_tests(&mut generator, &settings.prompts);
    Ok(())
}
