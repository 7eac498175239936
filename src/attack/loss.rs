// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cross-entropy restricted to target spans.
//!
//! Logits at position `i` predict the token at `i + 1`, so logits are
//! shifted left by one and labels right by one.  For a target span
//! `[start, end)` the scored shifted positions are `[start - 1, end - 1)`,
//! clipped to the valid range.  Every other position gets the
//! [`IGNORE_INDEX`] sentinel and contributes nothing.
//!
//! A span that clips to nothing contributes zero scored positions; it is
//! never an error.

use candle_core::{D, DType, Tensor, Var};

use crate::backend::ScoringOracle;
use crate::error::{AttackError, Result};
use crate::util::span::Span;

/// Label sentinel for positions excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// How per-position losses are combined into a scalar.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Sum over every scored position (absolute loss of one row).
    Sum,
    /// Mean over every scored position across the batch.
    Mean,
}

/// Shifted labels and the scored-position mask for a batch.
///
/// Built once per batch layout; all vectors are flattened `[batch * (seq - 1)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMask {
    /// Shifted labels with [`IGNORE_INDEX`] at unscored positions.
    pub labels: Vec<i64>,
    /// Number of scored positions per row.
    pub scored_per_row: Vec<usize>,
    /// Sequence length minus one (columns per row).
    pub shifted_len: usize,
}

impl TargetMask {
    /// Build shifted labels for `rows` of token ids and one target span per row.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Config`] if `rows` and `spans` differ in length
    /// or the rows differ in length.
    pub fn new(rows: &[Vec<u32>], spans: &[Span]) -> Result<Self> {
        if rows.len() != spans.len() {
            return Err(AttackError::Config(format!(
                "{} rows but {} target spans",
                rows.len(),
                spans.len()
            )));
        }
        let seq_len = rows.first().map_or(0, Vec::len);
        let shifted_len = seq_len.saturating_sub(1);

        let mut labels = Vec::with_capacity(rows.len() * shifted_len);
        let mut scored_per_row = Vec::with_capacity(rows.len());
        for (row, span) in rows.iter().zip(spans) {
            if row.len() != seq_len {
                return Err(AttackError::Config(format!(
                    "ragged batch: row of {} tokens, expected {seq_len}",
                    row.len()
                )));
            }
            let scored = scored_range(*span, shifted_len);
            scored_per_row.push(scored.len());
            for j in 0..shifted_len {
                let label = if scored.contains(j) {
                    row.get(j + 1).map_or(IGNORE_INDEX, |&id| i64::from(id))
                } else {
                    IGNORE_INDEX
                };
                labels.push(label);
            }
        }
        Ok(Self {
            labels,
            scored_per_row,
            shifted_len,
        })
    }

    /// Total number of scored positions.
    #[must_use]
    pub fn scored(&self) -> usize {
        self.scored_per_row.iter().sum()
    }
}

/// Shifted positions scored for a target span: `[start - 1, end - 1)` clipped
/// to `[0, shifted_len)`.
#[must_use]
pub fn scored_range(span: Span, shifted_len: usize) -> Span {
    let start = span.start.saturating_sub(1).min(shifted_len);
    let end = span.end.saturating_sub(1).min(shifted_len);
    Span::new(start, end)
}

/// Per-position negative log-likelihood, zero at unscored positions.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - returns: `[batch, seq - 1]` (`F32`)
fn masked_nll(logits: &Tensor, mask: &TargetMask) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    if seq_len != mask.shifted_len + 1 || batch != mask.scored_per_row.len() {
        return Err(AttackError::Config(format!(
            "logits [{batch}, {seq_len}, {vocab}] do not match target mask for {} rows of {} tokens",
            mask.scored_per_row.len(),
            mask.shifted_len + 1
        )));
    }
    let device = logits.device();
    let n = batch * mask.shifted_len;

    // PROMOTE: log-softmax over the vocabulary needs F32 for numerical stability
    let shifted = logits
        .narrow(1, 0, mask.shifted_len)?
        .to_dtype(DType::F32)?
        .reshape((n, vocab))?;
    let log_probs = candle_nn::ops::log_softmax(&shifted, D::Minus1)?;

    let safe_labels: Vec<u32> = mask
        .labels
        .iter()
        .map(|&l| u32::try_from(l).unwrap_or(0))
        .collect();
    let weights: Vec<f32> = mask
        .labels
        .iter()
        .map(|&l| if l == IGNORE_INDEX { 0.0 } else { 1.0 })
        .collect();
    let labels = Tensor::from_vec(safe_labels, (n, 1), device)?;
    let weights = Tensor::from_vec(weights, n, device)?;

    let picked = log_probs.gather(&labels, 1)?.squeeze(1)?;
    let nll = (picked.neg()? * weights)?;
    Ok(nll.reshape((batch, mask.shifted_len))?)
}

/// Scalar masked cross-entropy over the target spans.
///
/// With [`Reduction::Mean`] and no scored positions the loss is `0.0`.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`
/// - returns: scalar (`F32`)
///
/// # Errors
///
/// Returns [`AttackError::Config`] if the logits do not match the mask,
/// or [`AttackError::Model`] on tensor failures.
pub fn masked_target_loss(logits: &Tensor, mask: &TargetMask, reduction: Reduction) -> Result<Tensor> {
    let total = masked_nll(logits, mask)?.sum_all()?;
    match reduction {
        Reduction::Sum => Ok(total),
        Reduction::Mean => {
            let scored = mask.scored().max(1);
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            // PROMOTE: scored-position counts are far below f64's exact-integer range
            let denom = scored as f64;
            Ok((total / denom)?)
        }
    }
}

/// Exact mean loss of every row, each over its own scored positions.
///
/// Rows with no scored positions report `0.0`.
///
/// # Errors
///
/// Returns [`AttackError::Config`] if the logits do not match the mask,
/// or [`AttackError::Model`] on tensor failures.
pub fn per_row_target_loss(logits: &Tensor, mask: &TargetMask) -> Result<Vec<f32>> {
    let sums: Vec<f32> = masked_nll(logits, mask)?.sum(1)?.to_vec1()?;
    Ok(sums
        .into_iter()
        .zip(&mask.scored_per_row)
        .map(|(sum, &count)| {
            #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
            let count = count.max(1) as f32;
            sum / count
        })
        .collect())
}

/// Output of a forward + backward pass over input embeddings.
#[derive(Debug)]
pub struct EmbeddingGradients {
    /// Scalar loss value.
    pub loss: f32,
    /// Logits from the forward pass `[batch, seq, vocab]`.
    pub logits: Tensor,
    /// Gradient of the loss w.r.t. the input embeddings `[batch, seq, hidden]`,
    /// or `None` if no position is scored.  A scored loss that does not
    /// depend on the embeddings gets an all-zero gradient.
    pub grad: Option<Tensor>,
}

/// Forward and backward pass with gradients taken on a detached copy of
/// the input embeddings.
///
/// The oracle's own parameters are never modified.
///
/// # Shapes
/// - `input_ids`: `[batch, seq]`
/// - `attention_mask`: `[batch, seq]`
///
/// # Errors
///
/// Propagates oracle and loss errors.
pub fn embedding_gradients(
    oracle: &dyn ScoringOracle,
    input_ids: &Tensor,
    attention_mask: Option<&Tensor>,
    mask: &TargetMask,
    reduction: Reduction,
) -> Result<EmbeddingGradients> {
    let embeds = Var::from_tensor(&oracle.embed(input_ids)?.detach())?;
    let logits = oracle.forward_embeds(embeds.as_tensor(), attention_mask)?;
    let loss = masked_target_loss(&logits, mask, reduction)?;
    let loss_value = loss.to_scalar::<f32>()?;

    // Backprop prunes zero-multiplier paths, so a scored loss that does not
    // reach the embeddings yields no entry: that is a zero gradient.
    let grad = if mask.scored() == 0 {
        None
    } else {
        let grads = loss.backward()?;
        match grads.get(embeds.as_tensor()) {
            Some(grad) => Some(grad.clone()),
            None => Some(embeds.as_tensor().zeros_like()?),
        }
    };

    Ok(EmbeddingGradients {
        loss: loss_value,
        logits: logits.detach(),
        grad,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use candle_core::Device;

    use super::*;

    /// Logits `[1, 3, 3]` with known log-softmax values at each position.
    fn sample_logits() -> Tensor {
        Tensor::new(
            &[[[2.0_f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 3.0]]],
            &Device::Cpu,
        )
        .unwrap()
    }

    fn log_softmax_at(row: &[f32], k: usize) -> f32 {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let lse = row.iter().map(|x| (x - max).exp()).sum::<f32>().ln() + max;
        row[k] - lse
    }

    #[test]
    fn scored_range_shifts_and_clips() {
        assert_eq!(scored_range(Span::new(2, 4), 5), Span::new(1, 3));
        assert_eq!(scored_range(Span::new(0, 1), 5), Span::new(0, 0));
        assert_eq!(scored_range(Span::new(3, 10), 4), Span::new(2, 4));
        assert_eq!(scored_range(Span::new(7, 9), 4), Span::new(4, 4));
    }

    #[test]
    fn target_mask_labels_only_target_tokens() {
        let mask = TargetMask::new(&[vec![5, 6, 7, 8]], &[Span::new(2, 4)]).unwrap();
        assert_eq!(mask.labels, vec![IGNORE_INDEX, 7, 8]);
        assert_eq!(mask.scored(), 2);
    }

    #[test]
    fn sum_matches_manual_cross_entropy() {
        // ids [0, 1, 2]; target span covers ids 1 and 2 (positions 1..3).
        let mask = TargetMask::new(&[vec![0, 1, 2]], &[Span::new(1, 3)]).unwrap();
        let loss = masked_target_loss(&sample_logits(), &mask, Reduction::Sum)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected =
            -log_softmax_at(&[2.0, 0.0, 0.0], 1) - log_softmax_at(&[0.0, 1.0, 0.0], 2);
        assert!((loss - expected).abs() < 1e-5, "{loss} vs {expected}");
    }

    #[test]
    fn mean_divides_by_scored_positions() {
        let mask = TargetMask::new(&[vec![0, 1, 2]], &[Span::new(1, 3)]).unwrap();
        let sum = masked_target_loss(&sample_logits(), &mask, Reduction::Sum)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let mean = masked_target_loss(&sample_logits(), &mask, Reduction::Mean)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((mean - sum / 2.0).abs() < 1e-6);
    }

    #[test]
    fn zero_width_span_scores_nothing_without_error() {
        let mask = TargetMask::new(&[vec![0, 1, 2]], &[Span::new(2, 2)]).unwrap();
        assert_eq!(mask.scored(), 0);
        for reduction in [Reduction::Sum, Reduction::Mean] {
            let loss = masked_target_loss(&sample_logits(), &mask, reduction)
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert_eq!(loss, 0.0);
        }
        let rows = per_row_target_loss(&sample_logits(), &mask).unwrap();
        assert_eq!(rows, vec![0.0]);
    }

    #[test]
    fn per_row_losses_are_independent() {
        let logits = Tensor::cat(&[sample_logits(), sample_logits()], 0).unwrap();
        let rows = vec![vec![0, 1, 2], vec![0, 1, 2]];
        let mask = TargetMask::new(&rows, &[Span::new(1, 3), Span::new(2, 3)]).unwrap();
        let losses = per_row_target_loss(&logits, &mask).unwrap();
        let expected_second = -log_softmax_at(&[0.0, 1.0, 0.0], 2);
        let expected_first = (-log_softmax_at(&[2.0, 0.0, 0.0], 1) + expected_second) / 2.0;
        assert!((losses[0] - expected_first).abs() < 1e-5);
        assert!((losses[1] - expected_second).abs() < 1e-5);
    }

    /// Identity-table oracle whose logits are `scale * embeds`.
    struct ScaledIdentity {
        table: Tensor,
        scale: f64,
    }

    impl ScaledIdentity {
        fn new(scale: f64) -> Self {
            let table = Tensor::eye(3, DType::F32, &Device::Cpu).unwrap();
            Self { table, scale }
        }
    }

    impl ScoringOracle for ScaledIdentity {
        fn vocab_size(&self) -> usize {
            3
        }

        fn hidden_size(&self) -> usize {
            3
        }

        fn device(&self) -> &Device {
            self.table.device()
        }

        fn dtype(&self) -> DType {
            DType::F32
        }

        fn embedding_table(&self) -> &Tensor {
            &self.table
        }

        fn forward_embeds(&self, embeds: &Tensor, _attention_mask: Option<&Tensor>) -> Result<Tensor> {
            Ok(embeds.affine(self.scale, 0.0)?)
        }
    }

    #[test]
    fn embeddings_get_a_gradient_when_the_loss_depends_on_them() {
        let oracle = ScaledIdentity::new(2.0);
        let ids = Tensor::new(&[[0_u32, 1, 2]], &Device::Cpu).unwrap();
        let mask = TargetMask::new(&[vec![0, 1, 2]], &[Span::new(1, 3)]).unwrap();
        let out = embedding_gradients(&oracle, &ids, None, &mask, Reduction::Sum).unwrap();
        let grad = out.grad.unwrap();
        assert_eq!(grad.dims(), &[1, 3, 3]);
        let total: f32 = grad.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(total > 0.0);
    }

    #[test]
    fn disconnected_scored_loss_has_zero_gradient() {
        let oracle = ScaledIdentity::new(0.0);
        let ids = Tensor::new(&[[0_u32, 1, 2]], &Device::Cpu).unwrap();
        let mask = TargetMask::new(&[vec![0, 1, 2]], &[Span::new(1, 3)]).unwrap();
        let out = embedding_gradients(&oracle, &ids, None, &mask, Reduction::Mean).unwrap();
        let grad = out.grad.expect("scored loss must report a gradient");
        assert_eq!(grad.dims(), &[1, 3, 3]);
        let values: Vec<f32> = grad.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&g| g == 0.0));
        assert!((out.loss - 3.0_f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn unscored_loss_has_no_gradient() {
        let oracle = ScaledIdentity::new(2.0);
        let ids = Tensor::new(&[[0_u32, 1, 2]], &Device::Cpu).unwrap();
        let mask = TargetMask::new(&[vec![0, 1, 2]], &[Span::new(2, 2)]).unwrap();
        let out = embedding_gradients(&oracle, &ids, None, &mask, Reduction::Mean).unwrap();
        assert!(out.grad.is_none());
        assert_eq!(out.loss, 0.0);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let mask = TargetMask::new(&[vec![0, 1, 2, 3]], &[Span::new(1, 3)]).unwrap();
        assert!(masked_target_loss(&sample_logits(), &mask, Reduction::Sum).is_err());
        assert!(TargetMask::new(&[vec![0, 1]], &[]).is_err());
    }
}
