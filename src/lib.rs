//! # qa-tune
//!
//! YAML-driven fine-tuning of causal language models on question/answer pairs.
//!
//! A run loads a JSON array of `{user, bot}` records, renders each one as a
//! `User: …\nBot: …` example, writes the corpus to the output directory,
//! trains a causal language model on it and publishes the result. A handful
//! of sample prompts is then run through the trained model for inspection.
//!
//! ## Features
//!
//! - **YAML Configuration** - Define entire training runs in simple config files
//! - **Presets** - Ready-made settings for Phi-2, `SmolLM2`-360M and long-context runs
//! - **Two sequence modes** - Concatenated fixed-size blocks or padded per-example sequences
//! - **Checkpointing** - Periodic snapshots with a retention limit
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a starting configuration
//! qa-tune init run.yaml --preset phi-2
//!
//! # Validate configuration
//! qa-tune validate run.yaml
//!
//! # Start training
//! qa-tune train run.yaml
//!
//! # Sample from a published model
//! qa-tune test ./outputs/phi-2 --prompt "What's title insurance?"
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod cli;
pub mod config;
pub mod corpus;
pub mod dataset;
pub mod error;
pub mod generate;
pub mod model;
pub mod pipeline;
pub mod prompt;
pub mod publish;
pub mod sampling;
pub mod smoke;
pub mod trainer;

#[cfg(test)]
mod testing;

pub use config::{TrainingConfig, TuneConfig};
pub use error::{Result, TuneError};
pub use pipeline::Pipeline;
pub use trainer::Trainer;
