//! Configuration parsing and validation.

use std::path::Path;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

/// Main configuration for a fine-tuning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Local directory holding `config.json`, `tokenizer.json` and optionally weights.
    pub base_model: String,

    /// Dataset configuration.
    pub dataset: DatasetConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Smoke-test decoding settings.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Optional secondary export of the trained weights.
    #[serde(default)]
    pub export: Option<ExportConfig>,

    /// Precision of the published weights.
    #[serde(default)]
    pub precision: Precision,

    /// Device to train on.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

/// Dataset configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Path to a JSON array of `{"user": ..., "bot": ...}` records.
    pub path: String,

    /// Truncate each rendered example to this many tokens.
    #[serde(default)]
    pub max_length: Option<usize>,

    /// How rendered examples become training sequences.
    #[serde(default)]
    pub sequence: SequenceMode,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            max_length: None,
            sequence: SequenceMode::default(),
        }
    }
}

/// Training sequence construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SequenceMode {
    /// Concatenate the corpus and cut it into fixed-size blocks.
    Blocks {
        /// Tokens per block.
        block_size: usize,
    },
    /// One sequence per example, truncated and padded to a fixed length.
    Padded {
        /// Tokens per sequence.
        max_length: usize,
    },
}

impl Default for SequenceMode {
    fn default() -> Self {
        Self::Blocks { block_size: 512 }
    }
}

impl SequenceMode {
    /// Length of the longest sequence this mode produces.
    #[must_use]
    pub fn sequence_length(&self) -> usize {
        match self {
            Self::Blocks { block_size } => *block_size,
            Self::Padded { max_length } => *max_length,
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Sequences per micro-batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Micro-batches per optimizer step.
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Peak learning rate, decayed linearly to zero.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Save checkpoint every N steps.
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,

    /// Keep at most this many checkpoints.
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: Option<usize>,

    /// Log every N steps.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,
}

fn default_epochs() -> usize {
    3
}
fn default_batch_size() -> usize {
    4
}
fn default_grad_accum() -> usize {
    1
}
fn default_lr() -> f64 {
    2e-5
}
fn default_save_steps() -> usize {
    500
}
#[allow(clippy::unnecessary_wraps)]
fn default_save_total_limit() -> Option<usize> {
    Some(1)
}
fn default_log_steps() -> usize {
    50
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            gradient_accumulation_steps: default_grad_accum(),
            learning_rate: default_lr(),
            weight_decay: 0.0,
            save_steps: default_save_steps(),
            save_total_limit: default_save_total_limit(),
            logging_steps: default_log_steps(),
        }
    }
}

/// Decoding settings for smoke-test generations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Prompts run through the trained model.
    #[serde(default = "default_prompts")]
    pub prompts: Vec<String>,

    /// Maximum total tokens, prompt included.
    #[serde(default = "default_gen_max_length")]
    pub max_length: usize,

    /// Nucleus sampling threshold.
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Softmax temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Sample instead of taking the most likely token.
    #[serde(default = "default_true")]
    pub do_sample: bool,
}

/// Prompts used after training when the config does not list any.
#[must_use]
pub fn default_prompts() -> Vec<String> {
    vec![
        "How do I buy a house with crypto?".into(),
        "What’s an As Is contract?".into(),
        "Tell me a joke".into(),
    ]
}

fn default_gen_max_length() -> usize {
    80
}
fn default_top_p() -> f64 {
    0.95
}
fn default_temperature() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}

impl GenerationConfig {
    /// Check decoding settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a setting is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(TuneError::Config(
                "generation.top_p must be in (0, 1]".into(),
            ));
        }
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(TuneError::Config(
                "generation.temperature must be positive".into(),
            ));
        }
        if self.max_length == 0 {
            return Err(TuneError::Config(
                "generation.max_length must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            prompts: default_prompts(),
            max_length: default_gen_max_length(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            do_sample: true,
        }
    }
}

/// Secondary inference-oriented export of the trained weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Element type of the exported tensors.
    #[serde(default = "default_export_dtype")]
    pub dtype: Precision,

    /// File name of the exported weights inside the output directory.
    #[serde(default = "default_export_file")]
    pub file_name: String,
}

fn default_export_dtype() -> Precision {
    Precision::F16
}
fn default_export_file() -> String {
    "model-export.safetensors".into()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dtype: default_export_dtype(),
            file_name: default_export_file(),
        }
    }
}

/// Floating point precision of stored weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float.
    #[default]
    F32,
    /// 16-bit float.
    F16,
    /// 16-bit brain float.
    Bf16,
}

impl Precision {
    /// Candle element type for this precision.
    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

/// Compute device selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceConfig {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA device by ordinal.
    Cuda(usize),
}

impl TryFrom<String> for DeviceConfig {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| format!("unknown device: {other}")),
        }
    }
}

impl From<DeviceConfig> for String {
    fn from(value: DeviceConfig) -> Self {
        match value {
            DeviceConfig::Cpu => "cpu".into(),
            DeviceConfig::Cuda(ordinal) => format!("cuda:{ordinal}"),
        }
    }
}

impl DeviceConfig {
    /// Open the configured device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is unavailable in this build or on this host.
    pub fn open(self) -> Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal)
                .map_err(|e| TuneError::Config(format!("cuda:{ordinal} unavailable: {e}"))),
        }
    }
}

impl TuneConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TuneError::NotFound(format!(
                "config file {}",
                path.display()
            )));
        }
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

    /// Names accepted by [`TuneConfig::from_preset`].
    pub const PRESETS: [&'static str; 3] = ["phi-2", "smollm2-360m", "long-context"];

    /// Create a configuration from a preset.
    ///
    /// # Errors
    ///
    /// Returns an error if the preset name is unknown.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "phi-2" => Ok(Self::phi2_preset()),
            "smollm2-360m" => Ok(Self::smollm2_preset()),
            "long-context" => Ok(Self::long_context_preset()),
            _ => Err(TuneError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    fn phi2_preset() -> Self {
        Self {
            base_model: "./models/phi-2".into(),
            dataset: DatasetConfig {
                path: "./data/qa.json".into(),
                max_length: None,
                sequence: SequenceMode::Blocks { block_size: 512 },
            },
            training: TrainingConfig {
                epochs: 3,
                batch_size: 4,
                learning_rate: 2e-5,
                save_steps: 1000,
                logging_steps: 100,
                ..Default::default()
            },
            generation: GenerationConfig::default(),
            export: Some(ExportConfig {
                dtype: Precision::F16,
                file_name: "fine_tuned_phi2.safetensors".into(),
            }),
            precision: Precision::F32,
            device: DeviceConfig::Cpu,
            output_dir: "./outputs/phi-2".into(),
            seed: 42,
        }
    }

    fn smollm2_preset() -> Self {
        Self {
            base_model: "./models/smollm2-360m-instruct".into(),
            dataset: DatasetConfig {
                path: "./data/qa_small.json".into(),
                max_length: Some(512),
                sequence: SequenceMode::Padded { max_length: 256 },
            },
            training: TrainingConfig {
                epochs: 3,
                batch_size: 1,
                gradient_accumulation_steps: 4,
                learning_rate: 2e-5,
                save_steps: 500,
                logging_steps: 50,
                ..Default::default()
            },
            generation: GenerationConfig::default(),
            export: None,
            precision: Precision::Bf16,
            device: DeviceConfig::Cpu,
            output_dir: "./outputs/smollm2-360m".into(),
            seed: 42,
        }
    }

    fn long_context_preset() -> Self {
        Self {
            base_model: "./models/base".into(),
            dataset: DatasetConfig {
                path: "./data/qa.json".into(),
                max_length: None,
                sequence: SequenceMode::Blocks { block_size: 2048 },
            },
            training: TrainingConfig {
                batch_size: 1,
                gradient_accumulation_steps: 8,
                ..Default::default()
            },
            generation: GenerationConfig::default(),
            export: None,
            precision: Precision::F32,
            device: DeviceConfig::Cpu,
            output_dir: "./outputs/long-context".into(),
            seed: 42,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.base_model.is_empty() {
            return Err(TuneError::Config("base_model is required".into()));
        }

        if self.dataset.path.is_empty() {
            return Err(TuneError::Config("dataset.path is required".into()));
        }

        if self.dataset.max_length == Some(0) {
            return Err(TuneError::Config("dataset.max_length must be > 0".into()));
        }

        if self.dataset.sequence.sequence_length() == 0 {
            return Err(TuneError::Config(
                "dataset.sequence length must be > 0".into(),
            ));
        }

        let training = &self.training;
        for (name, value) in [
            ("training.epochs", training.epochs),
            ("training.batch_size", training.batch_size),
            (
                "training.gradient_accumulation_steps",
                training.gradient_accumulation_steps,
            ),
            ("training.save_steps", training.save_steps),
            ("training.logging_steps", training.logging_steps),
        ] {
            if value == 0 {
                return Err(TuneError::Config(format!("{name} must be > 0")));
            }
        }

        if training.save_total_limit == Some(0) {
            return Err(TuneError::Config(
                "training.save_total_limit must be > 0, or null to keep every checkpoint".into(),
            ));
        }

        if training.learning_rate <= 0.0 || !training.learning_rate.is_finite() {
            return Err(TuneError::Config(
                "training.learning_rate must be positive".into(),
            ));
        }

        self.generation.validate()?;

        if let Some(export) = &self.export {
            if export.file_name.is_empty()
                || export.file_name.contains('/')
                || export.file_name.contains('\\')
            {
                return Err(TuneError::Config(
                    "export.file_name must be a plain file name".into(),
                ));
            }
        }

        Ok(())
    }
}
