//! Error types for qa-tune.

use std::fmt;

use thiserror::Error;

/// Result type alias for qa-tune operations.
pub type Result<T> = std::result::Result<T, TuneError>;

/// Errors that can occur in qa-tune.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TuneError {
    /// A dataset or model path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Input could not be parsed, or parsed to nothing.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A record is missing a required field.
    #[error("schema error: {0}")]
    Schema(String),

    /// No training examples survived corpus construction.
    #[error("empty corpus: {0}")]
    EmptyCorpus(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// The corpus file could not be written.
    #[error("corpus error: {0}")]
    Corpus(String),

    /// Model or tokenizer loading error.
    #[error("model error: {0}")]
    Model(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Saving or exporting the trained model failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// A single smoke-test generation failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(#[from] indicatif::style::TemplateError),
}

/// Pipeline stage an error surfaced in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading the dataset file.
    Load,
    /// Loading the tokenizer and model.
    LoadModel,
    /// Rendering records into training text.
    Render,
    /// Writing the corpus file.
    Materialize,
    /// Tokenizing the corpus into training sequences.
    Tokenize,
    /// Running the training loop.
    Train,
    /// Persisting and exporting artifacts.
    Publish,
    /// Smoke-test generation.
    Test,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load dataset",
            Self::LoadModel => "load model",
            Self::Render => "render",
            Self::Materialize => "materialize corpus",
            Self::Tokenize => "tokenize",
            Self::Train => "train",
            Self::Publish => "publish",
            Self::Test => "smoke test",
        };
        f.write_str(name)
    }
}

impl TuneError {
    /// Fold an untyped library error into the category owned by `stage`.
    ///
    /// Errors that already carry a pipeline category pass through untouched.
    #[must_use]
    pub fn within(self, stage: Stage) -> Self {
        let untyped = matches!(
            self,
            Self::Io(_) | Self::Json(_) | Self::Candle(_) | Self::Tokenizer(_) | Self::Template(_)
        );
        if !untyped {
            return self;
        }

        let msg = self.to_string();
        match stage {
            Stage::Load => Self::MalformedInput(msg),
            Stage::LoadModel | Stage::Render | Stage::Tokenize => Self::Model(msg),
            Stage::Materialize => Self::Corpus(msg),
            Stage::Publish => Self::Publish(msg),
            Stage::Train => Self::Training(msg),
            Stage::Test => Self::Generation(msg),
        }
    }

    /// Whether this error ends the run.
    ///
    /// Only per-prompt generation failures are recoverable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Generation(_))
    }

    /// Process exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        u8::from(self.is_fatal())
    }
}
