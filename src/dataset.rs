//! Dataset loading and training sequence construction.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::config::SequenceMode;
use crate::corpus::Corpus;
use crate::error::{Result, TuneError};
use crate::model::unbounded;

/// One record as it appears in the dataset file.
///
/// Both fields are optional here so that a missing field is reported
/// by the renderer with the record's position instead of failing the parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// User utterance.
    #[serde(default)]
    pub user: Option<String>,
    /// Bot response.
    #[serde(default)]
    pub bot: Option<String>,
}

/// A user/bot pair with both fields present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    /// User utterance.
    pub user: String,
    /// Bot response.
    pub bot: String,
}

impl RawRecord {
    /// Check that both fields are present.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Schema`] naming the record index and the missing field.
    pub fn validate(&self, index: usize) -> Result<TrainingRecord> {
        match (&self.user, &self.bot) {
            (Some(user), Some(bot)) => Ok(TrainingRecord {
                user: user.clone(),
                bot: bot.clone(),
            }),
            (None, _) => Err(TuneError::Schema(format!(
                "record {index} is missing `user`"
            ))),
            (_, None) => Err(TuneError::Schema(format!(
                "record {index} is missing `bot`"
            ))),
        }
    }
}

/// Load the ordered records from a JSON array file.
///
/// # Errors
///
/// Returns [`TuneError::NotFound`] if the path does not exist and
/// [`TuneError::MalformedInput`] if the content is not a non-empty JSON array of objects.
pub fn load_records<P: AsRef<Path>>(path: P) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(TuneError::NotFound(format!(
            "Dataset not found: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
        TuneError::MalformedInput(format!("Invalid JSON in {}: {e}", path.display()))
    })?;

    let serde_json::Value::Array(items) = value else {
        return Err(TuneError::MalformedInput(format!(
            "{} must contain a JSON array of records",
            path.display()
        )));
    };

    if items.is_empty() {
        return Err(TuneError::MalformedInput(format!(
            "Dataset at {} is empty",
            path.display()
        )));
    }

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value(item).map_err(|e| {
                TuneError::MalformedInput(format!("record {index} is not a valid record: {e}"))
            })
        })
        .collect()
}

/// A token sequence ready for training.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    /// Token ids, padding included.
    pub ids: Vec<u32>,
    /// `1` for real tokens, `0` for padding.
    pub mask: Vec<u8>,
}

impl Sequence {
    fn unpadded(ids: Vec<u32>) -> Self {
        let mask = vec![1; ids.len()];
        Self { ids, mask }
    }

    /// Number of non-padding tokens.
    #[must_use]
    pub fn real_len(&self) -> usize {
        self.mask.iter().filter(|&&m| m == 1).count()
    }
}

/// Tokenized training set built from a corpus.
#[derive(Debug, Clone)]
pub struct TokenizedDataset {
    /// Training sequences in corpus order.
    pub sequences: Vec<Sequence>,
}

impl TokenizedDataset {
    /// Tokenize the corpus according to `mode`.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization fails, or [`TuneError::EmptyCorpus`]
    /// if no sequence has at least one prediction target.
    pub fn build(
        corpus: &Corpus,
        tokenizer: &Tokenizer,
        mode: &SequenceMode,
        pad_id: u32,
    ) -> Result<Self> {
        let tokenizer = unbounded(tokenizer)?;
        let sequences = match mode {
            SequenceMode::Blocks { block_size } => blocks(corpus, &tokenizer, *block_size)?,
            SequenceMode::Padded { max_length } => {
                padded(corpus, &tokenizer, *max_length, pad_id)?
            }
        };

        // A sequence needs two real tokens to provide one next-token target.
        let sequences: Vec<Sequence> = sequences
            .into_iter()
            .filter(|s| s.real_len() >= 2)
            .collect();

        if sequences.is_empty() {
            return Err(TuneError::EmptyCorpus(
                "tokenized dataset has no trainable sequences".into(),
            ));
        }

        Ok(Self { sequences })
    }

    /// Number of training sequences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// Check if dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Total real tokens across all sequences.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.sequences.iter().map(Sequence::real_len).sum()
    }
}

fn blocks(corpus: &Corpus, tokenizer: &Tokenizer, block_size: usize) -> Result<Vec<Sequence>> {
    let encoding = tokenizer.encode(corpus.text(), false)?;
    let ids = encoding.get_ids();

    let mut chunks: Vec<&[u32]> = ids.chunks(block_size).collect();
    if chunks.len() > 1 && chunks.last().is_some_and(|c| c.len() < block_size) {
        chunks.pop();
    }

    Ok(chunks
        .into_iter()
        .map(|chunk| Sequence::unpadded(chunk.to_vec()))
        .collect())
}

fn padded(
    corpus: &Corpus,
    tokenizer: &Tokenizer,
    max_length: usize,
    pad_id: u32,
) -> Result<Vec<Sequence>> {
    corpus
        .examples()
        .iter()
        .map(|example| {
            let encoding = tokenizer.encode(example.as_str(), true)?;
            let mut ids: Vec<u32> = encoding.get_ids().iter().copied().take(max_length).collect();
            let mut mask = vec![1u8; ids.len()];
            ids.resize(max_length, pad_id);
            mask.resize(max_length, 0);
            Ok(Sequence { ids, mask })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bounded_word_tokenizer, word_tokenizer};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_dataset(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    #[test]
    fn test_load_records_preserves_order() {
        let file = write_dataset(
            r#"[{"user": "Hi", "bot": "Hello!"}, {"user": "Bye", "bot": "See you"}]"#,
        );

        let records = load_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].user.as_deref(), Some("Hi"));
        assert_eq!(records[1].bot.as_deref(), Some("See you"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_records("/nonexistent/qa.json");
        assert!(matches!(result, Err(TuneError::NotFound(_))));
    }

    #[test]
    fn test_load_empty_array() {
        let file = write_dataset("[]");
        assert!(matches!(
            load_records(file.path()),
            Err(TuneError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_load_invalid_json() {
        let file = write_dataset(r#"[{"user": "Hi""#);
        assert!(matches!(
            load_records(file.path()),
            Err(TuneError::MalformedInput(_))
        ));

        let file = write_dataset("");
        assert!(matches!(
            load_records(file.path()),
            Err(TuneError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_load_non_array() {
        let file = write_dataset(r#"{"user": "Hi", "bot": "Hello!"}"#);
        assert!(matches!(
            load_records(file.path()),
            Err(TuneError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_missing_field_parses_then_fails_validation() {
        let file = write_dataset(r#"[{"bot": "hi"}]"#);
        let records = load_records(file.path()).unwrap();

        let err = records[0].validate(0).unwrap_err();
        assert!(matches!(err, TuneError::Schema(_)));
        assert!(err.to_string().contains("`user`"));
    }

    #[test]
    fn test_blocks_drop_trailing_partial_block() {
        let tokenizer = word_tokenizer();
        // "User : Hi Bot : Hello !" is seven tokens per example.
        let corpus = Corpus::from_examples(vec![
            "User: Hi\nBot: Hello!".to_string(),
            "User: Hi\nBot: Hello!".to_string(),
        ]);

        let dataset = TokenizedDataset::build(
            &corpus,
            &tokenizer,
            &SequenceMode::Blocks { block_size: 4 },
            0,
        )
        .unwrap();

        assert_eq!(dataset.len(), 3);
        assert!(dataset.sequences.iter().all(|s| s.ids.len() == 4));
    }

    #[test]
    fn test_blocks_keep_single_short_block() {
        let tokenizer = word_tokenizer();
        let corpus = Corpus::from_examples(vec!["User: Hi\nBot: Hello!".to_string()]);

        let dataset = TokenizedDataset::build(
            &corpus,
            &tokenizer,
            &SequenceMode::Blocks { block_size: 512 },
            0,
        )
        .unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.sequences[0].ids.len(), 7);
    }

    #[test]
    fn test_padded_sequences_mask_padding() {
        let tokenizer = word_tokenizer();
        let corpus = Corpus::from_examples(vec![
            "User: Hi\nBot: Hello!".to_string(),
            "User: Hi\nBot: Hello! Hello! Hello!".to_string(),
        ]);

        let dataset = TokenizedDataset::build(
            &corpus,
            &tokenizer,
            &SequenceMode::Padded { max_length: 9 },
            1,
        )
        .unwrap();

        assert_eq!(dataset.len(), 2);
        let first = &dataset.sequences[0];
        assert_eq!(first.ids.len(), 9);
        assert_eq!(first.real_len(), 7);
        assert_eq!(&first.ids[7..], &[1, 1]);

        // The second example is longer than the bound and is truncated.
        assert_eq!(dataset.sequences[1].real_len(), 9);
        assert_eq!(dataset.token_count(), 16);
    }

    #[test]
    fn test_tokenizer_padding_is_not_counted_as_real() {
        let tokenizer = bounded_word_tokenizer();
        let corpus = Corpus::from_examples(vec!["User: Hi\nBot: Hello!".to_string()]);

        let dataset = TokenizedDataset::build(
            &corpus,
            &tokenizer,
            &SequenceMode::Padded { max_length: 9 },
            1,
        )
        .unwrap();

        let sequence = &dataset.sequences[0];
        assert_eq!(sequence.ids.len(), 9);
        assert_eq!(sequence.real_len(), 7);
    }

    #[test]
    fn test_untrainable_dataset_is_empty_corpus() {
        let tokenizer = word_tokenizer();
        let corpus = Corpus::from_examples(vec!["Hi".to_string()]);

        let result = TokenizedDataset::build(
            &corpus,
            &tokenizer,
            &SequenceMode::Padded { max_length: 8 },
            0,
        );
        assert!(matches!(result, Err(TuneError::EmptyCorpus(_))));
    }
}
