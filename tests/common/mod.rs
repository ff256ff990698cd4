//! Fixtures shared by integration tests.

use std::fs;
use std::path::Path;

const WORDS: &[&str] = &[
    "User", ":", "Bot", "Hi", "Hello", "!", "Bye", "See", "you", "?", "How", "do", "I", "buy",
    "a", "house", "with", "crypto", "What", "’", "s", "an", "As", "Is", "contract", "Tell", "me",
    "joke", "Carefully", ".",
];

/// Write a word-level tokenizer and a tiny model config into `dir`.
pub fn create_model_dir(dir: &Path) {
    fs::create_dir_all(dir).unwrap();

    let mut vocab = serde_json::Map::new();
    vocab.insert("[UNK]".into(), 0.into());
    vocab.insert("<|endoftext|>".into(), 1.into());
    for (i, word) in WORDS.iter().enumerate() {
        vocab.insert((*word).into(), (i + 2).into());
    }
    let vocab_size = vocab.len();

    let tokenizer = serde_json::json!({
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
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
    });
    fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();

    let config = serde_json::json!({
        "vocab_size": vocab_size,
        "hidden_size": 16,
        "num_layers": 1,
        "num_heads": 2,
        "max_position_embeddings": 64
    });
    fs::write(dir.join("config.json"), config.to_string()).unwrap();
}

/// Write a small Q&A dataset with `num_samples` records.
pub fn create_test_dataset(path: &Path, num_samples: usize) {
    let pairs = [
        ("Hi", "Hello!"),
        ("Bye", "See you"),
        ("How do I buy a house with crypto?", "Carefully."),
        ("What’s an As Is contract?", "a contract"),
    ];
    let records: Vec<_> = (0..num_samples)
        .map(|i| {
            let (user, bot) = pairs[i % pairs.len()];
            serde_json::json!({ "user": user, "bot": bot })
        })
        .collect();
    fs::write(path, serde_json::to_string_pretty(&records).unwrap()).unwrap();
}

/// Minimal YAML run configuration.
pub fn create_config(model_dir: &Path, dataset_path: &Path, output_dir: &Path) -> String {
    format!(
        r#"
base_model: "{}"
output_dir: "{}"

dataset:
  path: "{}"
  sequence:
    mode: blocks
    block_size: 16

training:
  epochs: 2
  batch_size: 2
  learning_rate: 0.001
  logging_steps: 1
  save_steps: 2
  save_total_limit: 1

generation:
  prompts:
    - Hi
    - Tell me a joke
  max_length: 16

export:
  dtype: f16
  file_name: exported.safetensors

seed: 7
"#,
        model_dir.display(),
        output_dir.display(),
        dataset_path.display()
    )
}
