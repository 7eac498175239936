// SPDX-License-Identifier: MIT OR Apache-2.0

//! Padding and causal masks.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// Padding mask for a left-padded batch.
///
/// Row `b` has `pad_lengths[b]` zeros followed by ones.
///
/// # Shapes
/// - returns: `[batch, seq_len]` (`u32`; 1 = real token, 0 = padding)
///
/// # Errors
///
/// Returns [`AttackError::Model`](crate::AttackError::Model) on tensor
/// construction failure.
pub fn create_padding_mask(
    pad_lengths: &[usize],
    seq_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut data = Vec::with_capacity(pad_lengths.len() * seq_len);
    for &pad in pad_lengths {
        let pad = pad.min(seq_len);
        data.extend(std::iter::repeat_n(0_u32, pad));
        data.extend(std::iter::repeat_n(1_u32, seq_len - pad));
    }
    Ok(Tensor::from_vec(data, (pad_lengths.len(), seq_len), device)?)
}

/// Causal averaging weights that skip padding.
///
/// `weights[b][i][j] = 1 / n` when `j <= i` and position `j` of row `b` is
/// a real token, where `n` counts such positions; `0` otherwise.  A query
/// position that sees no real token gets an all-zero row.
///
/// # Shapes
/// - `attention_mask`: `[batch, seq_len]` (`None` = no padding)
/// - returns: `[batch, seq_len, seq_len]`
///
/// # Errors
///
/// Returns [`AttackError::Model`](crate::AttackError::Model) if the mask
/// has the wrong shape or tensor construction fails.
pub fn create_causal_mean_weights(
    attention_mask: Option<&Tensor>,
    batch: usize,
    seq_len: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let rows: Vec<Vec<u32>> = match attention_mask {
        Some(mask) => mask.to_dtype(DType::U32)?.to_vec2()?,
        None => vec![vec![1; seq_len]; batch],
    };

    let mut data = vec![0.0_f32; batch * seq_len * seq_len];
    for (b, row) in rows.iter().enumerate().take(batch) {
        let mut seen: Vec<usize> = Vec::with_capacity(seq_len);
        for i in 0..seq_len {
            if row.get(i).copied().unwrap_or(0) != 0 {
                seen.push(i);
            }
            if seen.is_empty() {
                continue;
            }
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            // PROMOTE: position counts are far below f32's exact-integer range
            let w = 1.0 / seen.len() as f32;
            let base = (b * seq_len + i) * seq_len;
            for &j in &seen {
                if let Some(cell) = data.get_mut(base + j) {
                    *cell = w;
                }
            }
        }
    }
    Ok(Tensor::from_vec(data, (batch, seq_len, seq_len), device)?.to_dtype(dtype)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
