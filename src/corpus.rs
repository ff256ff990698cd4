//! Training corpus materialization.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{Result, TuneError};

/// File name of the corpus inside the output directory.
pub const CORPUS_FILE: &str = "train.txt";

/// Ordered rendered examples for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corpus {
    examples: Vec<String>,
}

impl Corpus {
    /// Wrap already-rendered examples without touching the filesystem.
    #[must_use]
    pub fn from_examples(examples: Vec<String>) -> Self {
        Self { examples }
    }

    /// Write the examples to `path` and keep them in memory.
    ///
    /// Each example is followed by a newline. The file is created or overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::EmptyCorpus`] before any write when `examples` is empty,
    /// or an IO error if the file cannot be written.
    pub fn materialize<P: AsRef<Path>>(examples: Vec<String>, path: P) -> Result<Self> {
        if examples.is_empty() {
            return Err(TuneError::EmptyCorpus(
                "no valid prompts generated from dataset".into(),
            ));
        }

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::new(fs::File::create(path)?);
        for example in &examples {
            writer.write_all(example.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;

        tracing::info!("Saved {} prompts to {}", examples.len(), path.display());
        Ok(Self { examples })
    }

    /// Rendered examples in input order.
    #[must_use]
    pub fn examples(&self) -> &[String] {
        &self.examples
    }

    /// Corpus as it appears on disk.
    #[must_use]
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(self.examples.iter().map(|e| e.len() + 1).sum());
        for example in &self.examples {
            text.push_str(example);
            text.push('\n');
        }
        text
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Check if corpus is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}
