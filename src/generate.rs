//! Autoregressive text generation with a trained model.

use candle_core::{Device, IndexOp, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokenizers::Tokenizer;

use crate::config::GenerationConfig;
use crate::error::{Result, Stage, TuneError};
use crate::model::{CausalLm, LoadedModel};
use crate::sampling::{sample_next, SamplingParams};
use crate::smoke::Generator;

/// Samples continuations from a [`CausalLm`].
pub struct TextGenerator<'a> {
    model: &'a CausalLm,
    tokenizer: &'a Tokenizer,
    eos: Option<u32>,
    device: Device,
    params: SamplingParams,
    max_length: usize,
    rng: StdRng,
}

impl<'a> TextGenerator<'a> {
    /// Generator over `loaded` using the decoding settings in `settings`.
    #[must_use]
    pub fn new(loaded: &'a LoadedModel, settings: &GenerationConfig, seed: u64) -> Self {
        Self {
            model: &loaded.model,
            tokenizer: &loaded.tokenizer,
            eos: loaded.special.eos,
            device: loaded.device.clone(),
            params: SamplingParams {
                do_sample: settings.do_sample,
                top_p: settings.top_p,
                temperature: settings.temperature,
            },
            max_length: settings.max_length,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Token ids of `prompt` followed by sampled tokens, at most `max_length` in total.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt cannot be encoded or a forward pass fails.
    pub fn generate_ids(&mut self, prompt: &str) -> Result<Vec<u32>> {
        let mut ids = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        if ids.is_empty() {
            return Err(TuneError::Generation(format!(
                "prompt {prompt:?} encodes to no tokens"
            )));
        }

        let window = self.model.config().max_position_embeddings;
        while ids.len() < self.max_length {
            let context = &ids[ids.len().saturating_sub(window)..];
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input)?;
            let last = logits.i((0, context.len() - 1))?.to_vec1::<f32>()?;

            let next = sample_next(&last, &self.params, &mut self.rng)?;
            if Some(next) == self.eos {
                break;
            }
            ids.push(next);
        }
        Ok(ids)
    }
}

impl Generator for TextGenerator<'_> {
    fn generate(&mut self, prompt: &str) -> Result<String> {
        let run = |this: &mut Self| -> Result<String> {
            let ids = this.generate_ids(prompt)?;
            Ok(this.tokenizer.decode(&ids, true)?)
        };
        run(self).map_err(|e| e.within(Stage::Test))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::model_dir;

    fn settings(max_length: usize) -> GenerationConfig {
        GenerationConfig {
            max_length,
            ..Default::default()
        }
    }

    #[test]
    fn test_generation_respects_max_length() {
        let dir = model_dir();
        let loaded = LoadedModel::load(dir.path(), &Device::Cpu, 0).unwrap();
        let mut generator = TextGenerator::new(&loaded, &settings(12), 0);

        let ids = generator.generate_ids("User: Hi\nBot:").unwrap();
        assert!(ids.len() <= 12);
        assert!(ids.len() >= 5);
        assert!(!ids[5..].contains(&loaded.special.eos.unwrap()));
    }

    #[test]
    fn test_prompt_longer_than_budget_is_returned_as_is() {
        let dir = model_dir();
        let loaded = LoadedModel::load(dir.path(), &Device::Cpu, 0).unwrap();
        let mut generator = TextGenerator::new(&loaded, &settings(2), 0);

        let ids = generator.generate_ids("User: Hi\nBot:").unwrap();
        // User, ":", Hi, Bot, ":"
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_same_seed_same_text() {
        let dir = model_dir();
        let loaded = LoadedModel::load(dir.path(), &Device::Cpu, 0).unwrap();

        let first = TextGenerator::new(&loaded, &settings(20), 5)
            .generate("User: Hi\nBot:")
            .unwrap();
        let second = TextGenerator::new(&loaded, &settings(20), 5)
            .generate("User: Hi\nBot:")
            .unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("User"));
    }

    #[test]
    fn test_empty_prompt_is_generation_error() {
        let dir = model_dir();
        let loaded = LoadedModel::load(dir.path(), &Device::Cpu, 0).unwrap();
        let mut generator = TextGenerator::new(&loaded, &settings(10), 0);

        let err = generator.generate("").unwrap_err();
        assert!(matches!(err, TuneError::Generation(_)));
    }
}
