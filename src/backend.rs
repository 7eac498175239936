// SPDX-License-Identifier: MIT OR Apache-2.0

//! Differentiable scoring oracle.
//!
//! [`ScoringOracle`] is the contract the optimizers consume: an embedding
//! table, a forward pass from embeddings to next-token logits, and
//! gradients of a scalar loss with respect to the input embeddings (the
//! latter come for free from candle's autograd as long as the forward pass
//! is built from differentiable tensor ops).
//!
//! The optimizers never mutate the oracle: gradients are taken with
//! respect to a detached copy of the embeddings, never the table itself.

use candle_core::{DType, Device, Tensor};

use crate::error::{AttackError, Result};

// ---------------------------------------------------------------------------
// ScoringOracle trait
// ---------------------------------------------------------------------------

/// A causal language model the optimizers can query for logits and gradients.
///
/// Implementors provide the embedding table and a forward pass that starts
/// from embeddings.  [`embed`](Self::embed) and [`forward`](Self::forward)
/// have default implementations built on those two.
///
/// # Attention masks
///
/// Masks are `[batch, seq]` `u32` tensors with `1` for real tokens and `0`
/// for left-padding.  `None` means every position is real.
pub trait ScoringOracle: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Vocabulary size (rows of the embedding table).
    fn vocab_size(&self) -> usize;

    /// Embedding dimension.
    fn hidden_size(&self) -> usize;

    /// Device the model's tensors live on.
    fn device(&self) -> &Device;

    /// Dtype of the model's activations.
    fn dtype(&self) -> DType;

    // --- Embeddings ------------------------------------------------------

    /// The token embedding table.
    ///
    /// # Shapes
    /// - returns: `[vocab_size, hidden_size]`
    fn embedding_table(&self) -> &Tensor;

    /// Look up embeddings for a batch of token ids.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Model`] on shape mismatch or out-of-range ids.
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let flat = input_ids.flatten_all()?;
        let rows = self.embedding_table().index_select(&flat, 0)?;
        Ok(rows.reshape((batch, seq_len, self.hidden_size()))?)
    }

    // --- Forward ---------------------------------------------------------

    /// Forward pass from input embeddings to next-token logits.
    ///
    /// Must be differentiable with respect to `embeds`.
    ///
    /// # Shapes
    /// - `embeds`: `[batch, seq, hidden_size]`
    /// - `attention_mask`: `[batch, seq]`
    /// - returns: `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Model`] on tensor operation failures.
    fn forward_embeds(&self, embeds: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor>;

    /// Forward pass from token ids.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]`
    /// - `attention_mask`: `[batch, seq]`
    /// - returns: `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from [`embed`](Self::embed) and
    /// [`forward_embeds`](Self::forward_embeds).
    fn forward(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let embeds = self.embed(input_ids)?;
        self.forward_embeds(&embeds, attention_mask)
    }
}

// ---------------------------------------------------------------------------
// Tensor construction helpers
// ---------------------------------------------------------------------------

/// Stack equal-length token rows into a `[batch, seq]` `u32` tensor.
///
/// # Errors
///
/// Returns [`AttackError::Config`] if the rows differ in length, or
/// [`AttackError::Model`] on tensor construction failure.
pub fn ids_to_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let seq_len = rows.first().map_or(0, Vec::len);
    if let Some((row, ids)) = rows.iter().enumerate().find(|(_, r)| r.len() != seq_len) {
        return Err(AttackError::Config(format!(
            "row {row} has {} tokens, expected {seq_len}",
            ids.len()
        )));
    }
    let data: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(data, (rows.len(), seq_len), device)?)
}

/// Select the best available device (CUDA GPU 0, or CPU fallback).
///
/// # Errors
///
/// Returns [`AttackError::Model`] on device detection failure.
pub fn select_device() -> Result<Device> {
    Ok(Device::cuda_if_available(0)?)
}

/// Activation dtype for a device: `BF16` on CUDA, `F32` elsewhere.
#[must_use]
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    }
}

// ---------------------------------------------------------------------------
// Weight loading helpers
// ---------------------------------------------------------------------------

/// Create a `VarBuilder` from safetensors file paths.
///
/// Uses buffered (safe) loading by default. With the `mmap` feature,
/// uses memory-mapped loading for reduced memory overhead on large models.
///
/// # Errors
///
/// Returns [`AttackError::Config`] if no path is given (or, without `mmap`,
/// more than one), and [`AttackError::Model`] if the weights cannot be read.
pub fn create_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(paths, dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(paths, dtype, device)
    }
}

/// Load weights via buffered (safe) reading; reads all data into RAM.
///
/// Only supports single-file weights. For sharded weights, enable the
/// `mmap` feature.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    if paths.len() > 1 {
        return Err(AttackError::Config(
            "sharded weights require the `mmap` feature: \
             candle-attack = { features = [\"mmap\"] }"
                .into(),
        ));
    }
    let path = paths
        .first()
        .ok_or_else(|| AttackError::Config("no safetensors files".into()))?;
    let data = std::fs::read(path)?;
    let vb = candle_nn::VarBuilder::from_buffered_safetensors(data, dtype, device)?;
    Ok(vb)
}

/// Load weights via memory-mapped files, with minimal RAM overhead for large models.
///
/// # Safety
///
/// The safetensors files must not be modified while the model is loaded.
/// This is the standard invariant for memory-mapped files.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<candle_nn::VarBuilder<'static>> {
    if paths.is_empty() {
        return Err(AttackError::Config("no safetensors files".into()));
    }
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { candle_nn::VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
