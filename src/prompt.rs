//! Prompt templating for training examples and generation prompts.

use tokenizers::Tokenizer;

use crate::dataset::{RawRecord, TrainingRecord};
use crate::error::Result;
use crate::model::unbounded;

/// Truncation policy for rendered text.
pub trait Truncate {
    /// Return at most `max_length` tokens worth of `text`, dropping the tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be tokenized.
    fn truncate(&self, text: &str, max_length: usize) -> Result<String>;
}

impl Truncate for Tokenizer {
    fn truncate(&self, text: &str, max_length: usize) -> Result<String> {
        let encoding = unbounded(self)?.encode_char_offsets(text, false)?;
        if encoding.len() <= max_length {
            return Ok(text.to_string());
        }

        let end = encoding.get_offsets()[..max_length]
            .iter()
            .map(|&(_, end)| end)
            .max()
            .unwrap_or(0);
        Ok(text.chars().take(end).collect())
    }
}

/// Token budget applied while rendering.
#[derive(Clone, Copy)]
pub struct Truncation<'a> {
    policy: &'a dyn Truncate,
    max_length: usize,
}

impl<'a> Truncation<'a> {
    /// Truncate with `policy` to `max_length` tokens.
    #[must_use]
    pub fn new(policy: &'a dyn Truncate, max_length: usize) -> Self {
        Self {
            policy,
            max_length: max_length.max(1),
        }
    }
}

/// Render a record as `User: {user}\nBot: {bot}`.
///
/// # Errors
///
/// Returns an error if truncation fails to tokenize the text.
pub fn render_record(
    record: &TrainingRecord,
    truncation: Option<Truncation<'_>>,
) -> Result<String> {
    let text = format!("User: {}\nBot: {}", record.user, record.bot);
    match truncation {
        Some(t) => t.policy.truncate(&text, t.max_length),
        None => Ok(text),
    }
}

/// Render a generation prompt, leaving the response open.
#[must_use]
pub fn render_prompt(utterance: &str) -> String {
    format!("User: {utterance}\nBot:")
}

/// Render every record in order.
///
/// # Errors
///
/// Returns the first [`crate::TuneError::Schema`] error; no partial result is produced.
pub fn render_all(
    records: &[RawRecord],
    truncation: Option<Truncation<'_>>,
) -> Result<Vec<String>> {
    // Validate the whole batch first so a late bad record cannot leave work half done.
    let validated = records
        .iter()
        .enumerate()
        .map(|(index, raw)| raw.validate(index))
        .collect::<Result<Vec<_>>>()?;

    validated
        .iter()
        .map(|record| render_record(record, truncation))
        .collect()
}
