//! Shared fixtures for unit tests.

use serde_json::{json, Map, Value};
use tempfile::TempDir;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

use crate::model::{ModelConfig, CONFIG_FILE, TOKENIZER_FILE};

const WORDS: &[&str] = &[
    "User", ":", "Bot", "Hi", "Hello", "!", "Bye", "See", "you", "?", "How", "do", "I", "buy",
    "a", "house", "with", "crypto", "What", "’", "s", "an", "As", "Is", "contract", "Tell", "me",
    "joke", "Carefully", ".",
];

/// Whitespace word-level tokenizer. `[UNK]` is id 0, `<|endoftext|>` is id 1.
pub(crate) fn word_tokenizer() -> Tokenizer {
    let mut vocab = Map::new();
    vocab.insert("[UNK]".into(), Value::from(0));
    vocab.insert("<|endoftext|>".into(), Value::from(1));
    for (i, word) in WORDS.iter().enumerate() {
        vocab.insert((*word).into(), Value::from(i + 2));
    }

    let definition = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": 1,
            "content": "<|endoftext|>",
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "[UNK]"
        }
    });

    Tokenizer::from_bytes(definition.to_string().as_bytes()).unwrap()
}

/// [`word_tokenizer`] configured to truncate at 2 tokens and pad to 12.
pub(crate) fn bounded_word_tokenizer() -> Tokenizer {
    let mut tokenizer = word_tokenizer();
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: 2,
            ..Default::default()
        }))
        .unwrap();
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(12),
        pad_id: 1,
        pad_token: "<|endoftext|>".into(),
        ..Default::default()
    }));
    tokenizer
}

/// Model directory holding [`word_tokenizer`] and a tiny architecture, without weights.
pub(crate) fn model_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let tokenizer = word_tokenizer();
    tokenizer.save(dir.path().join(TOKENIZER_FILE), false).unwrap();

    let config = ModelConfig {
        hidden_size: 8,
        num_layers: 1,
        num_heads: 2,
        max_position_embeddings: 64,
        ..ModelConfig::with_vocab(tokenizer.get_vocab_size(true))
    };
    std::fs::write(
        dir.path().join(CONFIG_FILE),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();
    dir
}
