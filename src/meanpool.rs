// SPDX-License-Identifier: MIT OR Apache-2.0

//! Causal mean-pooling language model.
//!
//! [`MeanPoolLm`] is the smallest model that satisfies the full
//! [`ScoringOracle`] contract: the hidden state at position `i` is the mean
//! of the token embeddings at real (non-padding) positions `0..=i`, and the
//! logits are that hidden state projected through an LM head (tied to the
//! embedding table unless configured otherwise).  Every op is
//! differentiable, so gradients with respect to input embeddings flow
//! through candle's autograd.
//!
//! It is useful as a fast, fully deterministic scorer for testing attack
//! pipelines and as a reference implementation of the oracle trait.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::backend::{ScoringOracle, create_var_builder, default_dtype};
use crate::config::MeanPoolLmConfig;
use crate::error::{AttackError, Result};
use crate::util::masks;

/// Mean-pooling causal LM with an (optionally tied) vocabulary head.
pub struct MeanPoolLm {
    /// Token embedding matrix.
    embed_tokens: Embedding,
    /// LM head (vocabulary projection).  `None` when tied to `embed_tokens`.
    lm_head: Option<Linear>,
    /// Model configuration.
    config: MeanPoolLmConfig,
    /// Device the weights live on.
    device: Device,
    /// Activation dtype.
    dtype: DType,
}

impl MeanPoolLm {
    /// Load from a [`VarBuilder`] providing `embed_tokens.weight` and,
    /// when embeddings are untied, `lm_head.weight`.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: MeanPoolLmConfig, device: &Device, vb: VarBuilder<'_>) -> Result<Self> {
        let dtype = vb.dtype();
        let embed_tokens =
            candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(candle_nn::linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };
        Ok(Self {
            embed_tokens,
            lm_head,
            config,
            device: device.clone(),
            dtype,
        })
    }

    /// Build directly from weight tensors.
    ///
    /// # Shapes
    /// - `embeddings`: `[vocab_size, hidden_size]`
    /// - `lm_head`: `[vocab_size, hidden_size]` (`None` ties the head)
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Config`] if the shapes disagree.
    pub fn from_tensors(embeddings: Tensor, lm_head: Option<Tensor>) -> Result<Self> {
        let (vocab_size, hidden_size) = embeddings.dims2()?;
        if let Some(head) = &lm_head {
            if head.dims2()? != (vocab_size, hidden_size) {
                return Err(AttackError::Config(format!(
                    "lm_head shape {:?} does not match embeddings [{vocab_size}, {hidden_size}]",
                    head.dims()
                )));
            }
        }
        let config = MeanPoolLmConfig {
            vocab_size,
            hidden_size,
            tie_word_embeddings: lm_head.is_none(),
        };
        let device = embeddings.device().clone();
        let dtype = embeddings.dtype();
        Ok(Self {
            embed_tokens: Embedding::new(embeddings, hidden_size),
            lm_head: lm_head.map(|w| Linear::new(w, None)),
            config,
            device,
            dtype,
        })
    }

    /// Load `config.json` and `model.safetensors` from a directory.
    ///
    /// Picks the best available device and its default dtype.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Io`] if a file cannot be read,
    /// [`AttackError::Config`] if the config is invalid, and
    /// [`AttackError::Model`] if weight loading fails.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config_str = std::fs::read_to_string(dir.join("config.json"))?;
        let json: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| AttackError::Config(format!("parse config.json: {e}")))?;
        let config = MeanPoolLmConfig::from_json(&json)?;

        let device = crate::backend::select_device()?;
        let dtype = default_dtype(&device);
        let vb = create_var_builder(&[dir.join("model.safetensors")], dtype, &device)?;
        Self::load(config, &device, vb)
    }

    /// Access the model configuration.
    #[must_use]
    pub const fn config(&self) -> &MeanPoolLmConfig {
        &self.config
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, vocab_size]`
    fn project_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        if let Some(head) = &self.lm_head {
            Ok(head.forward(hidden)?)
        } else {
            // Tied embeddings: logits = hidden @ embed_tokens^T
            let embed_weight = self.embed_tokens.embeddings();
            Ok(hidden.broadcast_matmul(&embed_weight.t()?)?)
        }
    }
}

impl ScoringOracle for MeanPoolLm {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn embedding_table(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embed_tokens.forward(input_ids)?)
    }

    fn forward_embeds(&self, embeds: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq_len, _) = embeds.dims3()?;
        let weights = masks::create_causal_mean_weights(
            attention_mask,
            batch,
            seq_len,
            embeds.device(),
            embeds.dtype(),
        )?;
        // [batch, seq, seq] @ [batch, seq, hidden] → [batch, seq, hidden]
        let hidden = weights.matmul(&embeds.contiguous()?)?;
        self.project_logits(&hidden)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
