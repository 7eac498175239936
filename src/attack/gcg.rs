// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batched greedy coordinate gradient (GCG) descent.
//!
//! Each step runs one forward + backward pass over the whole batch.  Then,
//! for every row independently, a uniformly random position inside the
//! row's mutable span is chosen, the top-K clean ids by linear
//! approximation score are materialized as candidate sequences, and each
//! candidate is re-scored exactly with a forward pass.  The lowest exact
//! loss wins (first seen on ties) and is committed subject to the
//! [`CommitPolicy`].
//!
//! The loop always runs `num_steps` steps.

use candle_core::{DType, IndexOp};
use rand::Rng;
use serde::Serialize;

use crate::attack::batch::{GcgBatch, SpanMismatch};
use crate::attack::loss::{self, Reduction, TargetMask};
use crate::attack::prefix::SearchStatus;
use crate::backend::{ScoringOracle, ids_to_tensor};
use crate::config::{CommitPolicy, GcgConfig};
use crate::error::{AttackError, Result};
use crate::tokenizer::TokenCodec;
use crate::util::masks::create_padding_mask;
use crate::util::span::Span;
use crate::util::vocab::{self, VocabularyMasks};

/// A token replacement committed to one row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CommittedSwap {
    /// Batch row.
    pub row: usize,
    /// Absolute (padded) position that was replaced.
    pub position: usize,
    /// Id before the swap.
    pub old_id: u32,
    /// Id after the swap.
    pub new_id: u32,
    /// Exact mean target loss of the row with the new id.
    pub candidate_loss: f32,
    /// Exact mean target loss of the row before the step.
    pub row_loss_before: f32,
}

/// Record of one coordinate-descent step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GcgStep {
    /// Zero-based step index.
    pub step: usize,
    /// Batch mean target loss before any substitution this step.
    pub loss: f32,
    /// Swaps committed this step (at most one per row).
    pub swaps: Vec<CommittedSwap>,
}

/// Result of a batched run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GcgOutcome {
    /// Always [`SearchStatus::Completed`]: the loop has no early exit.
    pub status: SearchStatus,
    /// Steps run (the configured `num_steps`).
    pub num_steps: usize,
    /// Final token ids per row (left-padded, same layout as the batch).
    pub input_ids: Vec<Vec<u32>>,
    /// Decoded mutable span of each row.
    pub mutable_texts: Vec<String>,
    /// Batch loss before each step.
    pub losses: Vec<f32>,
    /// Per-step swap records.
    pub steps: Vec<GcgStep>,
    /// Span mismatches found when the batch was assembled.
    pub warnings: Vec<SpanMismatch>,
}

/// Best candidate for one row.
struct Winner {
    id: u32,
    loss: f32,
}

/// Exact re-scoring of every candidate id at `position`.
///
/// Candidates are forwarded in chunks of `chunk_size`.  Returns the first
/// candidate with the strictly lowest loss, or the current id with an
/// infinite loss if no candidate scored finitely.
fn rescore_candidates(
    oracle: &dyn ScoringOracle,
    row_ids: &[u32],
    position: usize,
    candidates: &[u32],
    target: Span,
    pad_length: usize,
    chunk_size: usize,
) -> Result<Winner> {
    let current = row_ids.get(position).copied().unwrap_or_default();
    let mut winner = Winner {
        id: current,
        loss: f32::INFINITY,
    };
    let seq_len = row_ids.len();

    for chunk in candidates.chunks(chunk_size.max(1)) {
        let rows: Vec<Vec<u32>> = chunk
            .iter()
            .map(|&id| {
                let mut row = row_ids.to_vec();
                if let Some(slot) = row.get_mut(position) {
                    *slot = id;
                }
                row
            })
            .collect();
        let ids = ids_to_tensor(&rows, oracle.device())?;
        let attention = create_padding_mask(&vec![pad_length; rows.len()], seq_len, oracle.device())?;
        let mask = TargetMask::new(&rows, &vec![target; rows.len()])?;
        let logits = oracle.forward(&ids, Some(&attention))?;
        let losses = loss::per_row_target_loss(&logits, &mask)?;

        for (&id, &candidate_loss) in chunk.iter().zip(&losses) {
            if candidate_loss < winner.loss {
                winner = Winner {
                    id,
                    loss: candidate_loss,
                };
            }
        }
    }
    Ok(winner)
}

/// Run coordinate descent on an assembled batch.
///
/// # Errors
///
/// Returns [`AttackError::Config`] if the config is invalid,
/// [`AttackError::EmptyMutableSpan`] if a row has nothing to mutate,
/// [`AttackError::GradientUnavailable`] if no target position is scored
/// (every target span clips away), [`AttackError::VocabularyExhausted`] if no
/// clean id has a finite score, and propagates oracle errors.
pub fn run_gcg(
    oracle: &dyn ScoringOracle,
    tokenizer: &dyn TokenCodec,
    masks: &VocabularyMasks,
    batch: &GcgBatch,
    config: &GcgConfig,
    rng: &mut impl Rng,
) -> Result<GcgOutcome> {
    config.validate()?;
    if batch.is_empty() {
        return Err(AttackError::Config("batch has no rows".into()));
    }
    if let Some(row) = batch.update_spans.iter().position(Span::is_empty) {
        return Err(AttackError::EmptyMutableSpan { row });
    }

    let device = oracle.device();
    let table = oracle.embedding_table();
    let attention = batch.attention_mask(device)?;
    let chunk_size = config.chunk_size();
    let mut input_ids = batch.input_ids.clone();
    let mut losses = Vec::with_capacity(config.num_steps);
    let mut steps = Vec::with_capacity(config.num_steps);

    tracing::info!(
        rows = batch.len(),
        seq_len = batch.seq_len(),
        num_steps = config.num_steps,
        top_k = config.top_k,
        commit_policy = %config.commit_policy,
        "starting coordinate descent"
    );

    for step in 0..config.num_steps {
        let ids = ids_to_tensor(&input_ids, device)?;
        let mask = TargetMask::new(&input_ids, &batch.target_spans)?;
        let out = loss::embedding_gradients(oracle, &ids, Some(&attention), &mask, Reduction::Mean)?;
        let grad = out
            .grad
            .ok_or_else(|| {
                AttackError::GradientUnavailable(format!(
                    "no scored target positions at step {step}"
                ))
            })?
            .to_dtype(DType::F32)?;
        let row_losses = loss::per_row_target_loss(&out.logits, &mask)?;

        let mut next_ids = input_ids.clone();
        let mut swaps = Vec::new();

        for (row, (row_ids, next_row)) in input_ids.iter().zip(next_ids.iter_mut()).enumerate() {
            let (Some(&span), Some(&target), Some(&pad_length)) = (
                batch.update_spans.get(row),
                batch.target_spans.get(row),
                batch.pad_lengths.get(row),
            ) else {
                continue;
            };
            let position = span.start + rng.gen_range(0..span.len());
            let scores = vocab::linear_scores(table, &grad.i((row, position))?)?;
            let candidates = vocab::top_k_masked(&scores, masks.clean(), config.top_k)?;
            let winner = rescore_candidates(
                oracle,
                row_ids,
                position,
                &candidates,
                target,
                pad_length,
                chunk_size,
            )?;

            let row_loss_before = row_losses.get(row).copied().unwrap_or(f32::INFINITY);
            let commit = match config.commit_policy {
                CommitPolicy::AlwaysBestCandidate => true,
                CommitPolicy::OnlyIfNoWorse => winner.loss <= row_loss_before,
            };
            let old_id = row_ids.get(position).copied().unwrap_or_default();
            tracing::debug!(
                step,
                row,
                position,
                from = old_id,
                to = winner.id,
                candidate_loss = winner.loss,
                row_loss_before,
                commit,
                "row candidate"
            );
            if !commit {
                continue;
            }
            if let Some(slot) = next_row.get_mut(position) {
                *slot = winner.id;
            }
            swaps.push(CommittedSwap {
                row,
                position,
                old_id,
                new_id: winner.id,
                candidate_loss: winner.loss,
                row_loss_before,
            });
        }

        input_ids = next_ids;
        losses.push(out.loss);
        steps.push(GcgStep {
            step,
            loss: out.loss,
            swaps,
        });
    }

    let mutable_texts = input_ids
        .iter()
        .zip(&batch.update_spans)
        .map(|(ids, span)| tokenizer.decode(span.slice(ids).unwrap_or_default()))
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(
        first_loss = ?losses.first(),
        last_loss = ?losses.last(),
        "coordinate descent finished"
    );

    Ok(GcgOutcome {
        status: SearchStatus::Completed,
        num_steps: steps.len(),
        input_ids,
        mutable_texts,
        losses,
        steps,
        warnings: batch.warnings.clone(),
    })
}
