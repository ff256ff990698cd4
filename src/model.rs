//! Causal language model and model directory loading.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{Result, TuneError};

/// Model architecture file inside a model directory.
pub const CONFIG_FILE: &str = "config.json";
/// Tokenizer file inside a model directory.
pub const TOKENIZER_FILE: &str = "tokenizer.json";
/// Weights file inside a model directory.
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Architecture hyperparameters, read from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Embedding rows; must cover the tokenizer vocabulary.
    pub vocab_size: usize,
    /// Width of the residual stream.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Transformer blocks.
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Attention heads per block.
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Longest context the position table supports.
    #[serde(default = "default_max_positions")]
    pub max_position_embeddings: usize,
    /// Layer norm epsilon.
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
}

fn default_hidden_size() -> usize {
    64
}
fn default_num_layers() -> usize {
    2
}
fn default_num_heads() -> usize {
    4
}
fn default_max_positions() -> usize {
    512
}
fn default_eps() -> f64 {
    1e-5
}

impl ModelConfig {
    /// Small architecture over `vocab_size` tokens with default dimensions.
    #[must_use]
    pub fn with_vocab(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            num_heads: default_num_heads(),
            max_position_embeddings: default_max_positions(),
            layer_norm_eps: default_eps(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_heads == 0 {
            return Err(TuneError::Model(
                "vocab_size, hidden_size and num_heads must be > 0".into(),
            ));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(TuneError::Model(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.max_position_embeddings == 0 {
            return Err(TuneError::Model(
                "max_position_embeddings must be > 0".into(),
            ));
        }
        Ok(())
    }
}

struct Attention {
    q: Linear,
    k: Linear,
    v: Linear,
    out: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            q: linear(h, h, vb.pp("q_proj"))?,
            k: linear(h, h, vb.pp("k_proj"))?,
            v: linear(h, h, vb.pp("v_proj"))?,
            out: linear(h, h, vb.pp("o_proj"))?,
            num_heads: cfg.num_heads,
            head_dim: h / cfg.num_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor, b: usize, t: usize) -> candle_core::Result<Tensor> {
        xs.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, h) = xs.dims3()?;
        let q = self.split_heads(&self.q.forward(xs)?, b, t)?;
        let k = self.split_heads(&self.k.forward(xs)?, b, t)?;
        let v = self.split_heads(&self.v.forward(xs)?, b, t)?;

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;

        let mask = causal_mask(t, xs.device())?.broadcast_as(scores.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, xs.device())?.broadcast_as(scores.shape())?;
        let scores = mask.where_cond(&neg_inf, &scores)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let ys = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, h))?;
        self.out.forward(&ys)
    }
}

/// `1` where position `j` lies in the future of position `i`.
fn causal_mask(t: usize, device: &Device) -> candle_core::Result<Tensor> {
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_slice(&mask, (t, t), device)
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    fc: Linear,
    proj: Linear,
}

impl Block {
    fn new(cfg: &ModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            ln_1: layer_norm(h, cfg.layer_norm_eps, vb.pp("ln_1"))?,
            attn: Attention::new(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(h, cfg.layer_norm_eps, vb.pp("ln_2"))?,
            fc: linear(h, 4 * h, vb.pp("mlp.fc"))?,
            proj: linear(4 * h, h, vb.pp("mlp.proj"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.ln_1.forward(xs)?)?)?;
        let mlp = self.proj.forward(&self.fc.forward(&self.ln_2.forward(&xs)?)?.gelu()?)?;
        xs + mlp
    }
}

/// Decoder-only transformer predicting the next token.
pub struct CausalLm {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: ModelConfig,
}

impl CausalLm {
    /// Build the model, creating or fetching its variables through `vb`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be created.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let blocks = (0..config.num_layers)
            .map(|i| Block::new(config, vb.pp(format!("blocks.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            wte: embedding(config.vocab_size, h, vb.pp("wte"))?,
            wpe: embedding(config.max_position_embeddings, h, vb.pp("wpe"))?,
            blocks,
            ln_f: layer_norm(h, config.layer_norm_eps, vb.pp("ln_f"))?,
            lm_head: linear(h, config.vocab_size, vb.pp("lm_head"))?,
            config: config.clone(),
        })
    }

    /// Architecture of this model.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Logits of shape `(batch, seq, vocab)` for `(batch, seq)` token ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence exceeds the position table or a tensor op fails.
    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let (_, t) = ids.dims2()?;
        if t > self.config.max_position_embeddings {
            return Err(TuneError::Model(format!(
                "sequence of {t} tokens exceeds max_position_embeddings {}",
                self.config.max_position_embeddings
            )));
        }

        let positions = Tensor::arange(0u32, u32::try_from(t).unwrap_or(u32::MAX), ids.device())?;
        let mut xs = self
            .wte
            .forward(ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        Ok(self.lm_head.forward(&self.ln_f.forward(&xs)?)?)
    }
}

/// Token ids with special meaning during training and generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    /// End-of-text token, if the tokenizer has one.
    pub eos: Option<u32>,
    /// Id used to pad sequences.
    pub pad: u32,
}

impl SpecialTokens {
    const EOS_CANDIDATES: [&'static str; 5] =
        ["<|endoftext|>", "</s>", "<eos>", "<|im_end|>", "[SEP]"];

    /// Find the end-of-text token; it doubles as the pad token.
    #[must_use]
    pub fn detect(tokenizer: &Tokenizer) -> Self {
        let eos = Self::EOS_CANDIDATES
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));
        Self {
            eos,
            pad: eos.unwrap_or(0),
        }
    }
}

/// A model with its tokenizer and trainable variables.
pub struct LoadedModel {
    /// The network.
    pub model: CausalLm,
    /// Variables backing the network.
    pub varmap: VarMap,
    /// Tokenizer read from the model directory.
    pub tokenizer: Tokenizer,
    /// End-of-text and padding ids.
    pub special: SpecialTokens,
    /// Device the variables live on.
    pub device: Device,
    /// Directory the model was loaded from.
    pub source: PathBuf,
}

impl LoadedModel {
    /// Load tokenizer, architecture and (if present) weights from `dir`.
    ///
    /// Without a weights file the model is freshly initialized.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::NotFound`] for a missing directory, tokenizer or config,
    /// and [`TuneError::Model`] if any of them cannot be parsed or do not fit together.
    pub fn load<P: AsRef<Path>>(dir: P, device: &Device, seed: u64) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(TuneError::NotFound(format!(
                "model directory {}",
                dir.display()
            )));
        }

        let tokenizer_path = dir.join(TOKENIZER_FILE);
        if !tokenizer_path.exists() {
            return Err(TuneError::NotFound(format!(
                "tokenizer {}",
                tokenizer_path.display()
            )));
        }
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| TuneError::Model(format!("Error loading tokenizer: {e}")))?;
        clear_length_limits(&mut tokenizer)?;

        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(TuneError::NotFound(format!(
                "model config {}",
                config_path.display()
            )));
        }
        let config: ModelConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)
            .map_err(|e| TuneError::Model(format!("Invalid {}: {e}", config_path.display())))?;
        config.validate()?;

        let vocab = tokenizer.get_vocab_size(true);
        if vocab > config.vocab_size {
            return Err(TuneError::Model(format!(
                "tokenizer has {vocab} tokens but model vocab_size is {}",
                config.vocab_size
            )));
        }

        if let Err(e) = device.set_seed(seed) {
            tracing::debug!("Device does not accept a seed: {}", e);
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = CausalLm::new(&config, vb)?;

        let weights_path = dir.join(WEIGHTS_FILE);
        if weights_path.exists() {
            load_weights(&varmap, &weights_path, device)?;
            tracing::info!("Loaded weights from {}", weights_path.display());
        } else {
            tracing::warn!(
                "No {} in {}, starting from freshly initialized weights",
                WEIGHTS_FILE,
                dir.display()
            );
        }

        let special = SpecialTokens::detect(&tokenizer);
        Ok(Self {
            model,
            varmap,
            tokenizer,
            special,
            device: device.clone(),
            source: dir.to_path_buf(),
        })
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}

/// Disable the truncation and padding a `tokenizer.json` may carry.
///
/// Sequence lengths are decided by the dataset and render settings.
///
/// # Errors
///
/// Returns an error if the tokenizer rejects the change.
pub fn clear_length_limits(tokenizer: &mut Tokenizer) -> Result<()> {
    tokenizer.with_truncation(None)?;
    tokenizer.with_padding(None);
    Ok(())
}

/// `tokenizer` itself when it has no length limits, otherwise a copy without them.
pub(crate) fn unbounded(tokenizer: &Tokenizer) -> Result<Cow<'_, Tokenizer>> {
    if tokenizer.get_truncation().is_none() && tokenizer.get_padding().is_none() {
        return Ok(Cow::Borrowed(tokenizer));
    }
    let mut plain = tokenizer.clone();
    clear_length_limits(&mut plain)?;
    Ok(Cow::Owned(plain))
}

fn load_weights(varmap: &VarMap, path: &Path, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| TuneError::Model("variable map lock poisoned".into()))?;

    for (name, var) in vars.iter() {
        let tensor = tensors.get(name).ok_or_else(|| {
            TuneError::Model(format!("{} has no tensor `{name}`", path.display()))
        })?;
        var.set(&tensor.to_dtype(DType::F32)?)
            .map_err(|e| TuneError::Model(format!("tensor `{name}`: {e}")))?;
    }
    Ok(())
}

/// Write every variable to a safetensors file as `dtype`.
///
/// # Errors
///
/// Returns an error if a conversion or the write fails.
pub fn save_weights(varmap: &VarMap, path: &Path, dtype: DType) -> Result<()> {
    let tensors = {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| TuneError::Model("variable map lock poisoned".into()))?;
        vars.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_dtype(dtype)?)))
            .collect::<Result<HashMap<String, Tensor>>>()?
    };
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}
