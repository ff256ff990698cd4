//! Post-training smoke tests: print sample completions for manual review.

use crate::error::{Result, TuneError};
use crate::prompt::render_prompt;

/// Produces a completion for a rendered prompt.
pub trait Generator {
    /// Generate text continuing `prompt`.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails for this prompt.
    fn generate(&mut self, prompt: &str) -> Result<String>;
}

/// Result of one smoke-test prompt.
#[derive(Debug)]
pub struct SmokeOutcome {
    /// The prompt as configured, before templating.
    pub prompt: String,
    /// Decoded completion, or the generation failure.
    pub response: Result<String>,
}

impl SmokeOutcome {
    /// Whether generation succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.response.is_ok()
    }
}

/// Run every prompt through `generator`, printing prompt/response pairs.
///
/// A failing prompt is logged and recorded; the remaining prompts still run.
pub fn run_smoke_tests<G: Generator + ?Sized>(
    generator: &mut G,
    prompts: &[String],
) -> Vec<SmokeOutcome> {
    tracing::info!("Running {} smoke-test prompts", prompts.len());

    prompts
        .iter()
        .map(|prompt| {
            let response = generator
                .generate(&render_prompt(prompt))
                .map_err(|e| match e {
                    TuneError::Generation(_) => e,
                    other => TuneError::Generation(other.to_string()),
                });

            match &response {
                Ok(text) => {
                    println!("Prompt: {prompt}");
                    println!("Response: {text}\n");
                }
                Err(e) => {
                    tracing::warn!("Error testing prompt '{}': {}", prompt, e);
                    println!("Error testing prompt '{prompt}': {e}\n");
                }
            }

            SmokeOutcome {
                prompt: prompt.clone(),
                response,
            }
        })
        .collect()
}
