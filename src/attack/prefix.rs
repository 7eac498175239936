// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-position greedy prefix search.
//!
//! A short mutable prefix is prepended to the prompt and the target is
//! appended after it.  Each iteration backpropagates the summed target loss
//! to the input embeddings, picks the prefix position with the largest
//! gradient norm, and swaps in the allowed id with the best linear
//! approximation score at that position.
//!
//! The best prefix seen (by exact loss) is returned, not the last one.

use candle_core::{DType, IndexOp};
use rand::Rng;
use serde::Serialize;

use crate::attack::loss::{self, Reduction, TargetMask};
use crate::backend::{ScoringOracle, ids_to_tensor};
use crate::config::PrefixSearchConfig;
use crate::error::{AttackError, Result};
use crate::tokenizer::TokenCodec;
use crate::util::span::Span;
use crate::util::vocab::{self, VocabularyMasks};

// ---------------------------------------------------------------------------
// Request / result records
// ---------------------------------------------------------------------------

/// Input of a single-position prefix search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSearchRequest {
    /// Prompt placed between the prefix and the target (trimmed; encoded
    /// with special tokens).
    pub input_string: String,
    /// Text the model should be steered to produce (trimmed; encoded raw).
    pub target_text: String,
    /// Seed ids for the prefix; ids outside the vocabulary are dropped.
    pub initial_prefix_ids: Vec<u32>,
    /// Seed text for the prefix, encoded raw and appended after the seed ids.
    pub initial_prefix_text: Option<String>,
}

impl PrefixSearchRequest {
    /// Request with no seed prefix.
    #[must_use]
    pub fn new(input_string: impl Into<String>, target_text: impl Into<String>) -> Self {
        Self {
            input_string: input_string.into(),
            target_text: target_text.into(),
            ..Self::default()
        }
    }

    /// Seed the prefix with explicit token ids.
    #[must_use]
    pub fn with_initial_prefix_ids(mut self, ids: Vec<u32>) -> Self {
        self.initial_prefix_ids = ids;
        self
    }

    /// Seed the prefix with text.
    #[must_use]
    pub fn with_initial_prefix_text(mut self, text: impl Into<String>) -> Self {
        self.initial_prefix_text = Some(text.into());
        self
    }
}

/// Why a search stopped before its iteration budget.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The gradient at the chosen prefix position was zero.
    ZeroGradient,
    /// The loss had no gradient with respect to the input embeddings.
    GradientUnavailable,
}

/// Outcome of a search run.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Every iteration ran.
    Completed,
    /// The loop terminated early; the best state so far is returned.
    EarlyStopped {
        /// Cause of the early stop.
        reason: StopReason,
    },
}

/// Output of a single-position prefix search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefixSearchResult {
    /// Completed or early-stopped.
    pub status: SearchStatus,
    /// Trimmed prompt.
    pub input_string: String,
    /// Trimmed target text.
    pub target_text: String,
    /// Best prefix found.
    pub prefix_ids: Vec<u32>,
    /// Vocabulary strings of `prefix_ids`.
    pub prefix_tokens: Vec<String>,
    /// Decoded `prefix_ids` with special tokens stripped.
    pub prefix_text: String,
    /// Best finite summed target loss, `None` if none was observed.
    pub loss: Option<f32>,
    /// Clamped iteration budget.
    pub iterations: usize,
    /// Iterations actually run.
    pub iterations_run: usize,
    /// Raw loss of every scored prefix, in order.
    pub loss_history: Vec<f32>,
    /// Best loss so far after each entry of `loss_history`.
    pub best_loss_history: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Bookkeeping for the best prefix seen.
struct BestTracker {
    loss: f32,
    prefix: Option<Vec<u32>>,
    history: Vec<f32>,
    best_history: Vec<f32>,
}

impl BestTracker {
    const fn new() -> Self {
        Self {
            loss: f32::INFINITY,
            prefix: None,
            history: Vec::new(),
            best_history: Vec::new(),
        }
    }

    fn record(&mut self, loss: f32, prefix: &[u32]) {
        self.history.push(loss);
        if loss.is_finite() && loss < self.loss {
            self.loss = loss;
            self.prefix = Some(prefix.to_vec());
        }
        self.best_history.push(self.loss);
    }
}

/// Assemble the starting prefix: valid seed ids first, then uniform random
/// ids from the full vocabulary.
///
/// # Errors
///
/// Returns [`AttackError::Config`] if the vocabulary is empty.
pub fn initial_prefix(
    seed_ids: &[u32],
    prefix_length: usize,
    vocab_size: usize,
    rng: &mut impl Rng,
) -> Result<Vec<u32>> {
    let vocab = u32::try_from(vocab_size)
        .map_err(|_| AttackError::Config(format!("vocabulary of {vocab_size} ids is too large")))?;
    if vocab == 0 {
        return Err(AttackError::Config("vocabulary is empty".into()));
    }
    let mut prefix: Vec<u32> = seed_ids
        .iter()
        .copied()
        .filter(|&id| id < vocab)
        .take(prefix_length)
        .collect();
    while prefix.len() < prefix_length {
        prefix.push(rng.gen_range(0..vocab));
    }
    Ok(prefix)
}

/// Run the single-position greedy search.
///
/// # Errors
///
/// Returns [`AttackError::InvalidTarget`] if the target is empty after
/// trimming or encodes to no tokens, [`AttackError::VocabularyExhausted`]
/// if every id is masked at the chosen position, and propagates tokenizer
/// and oracle errors.
pub fn search_prefix(
    oracle: &dyn ScoringOracle,
    tokenizer: &dyn TokenCodec,
    masks: &VocabularyMasks,
    request: &PrefixSearchRequest,
    config: &PrefixSearchConfig,
    rng: &mut impl Rng,
) -> Result<PrefixSearchResult> {
    let config = PrefixSearchConfig::new(config.prefix_length, config.iterations);
    let input_string = request.input_string.trim().to_owned();
    let target_text = request.target_text.trim().to_owned();
    if target_text.is_empty() {
        return Err(AttackError::InvalidTarget("target text is empty".into()));
    }

    let prompt_ids = tokenizer.encode(&input_string)?;
    let target_ids = tokenizer.encode_raw(&target_text)?;
    if target_ids.is_empty() {
        return Err(AttackError::InvalidTarget(format!(
            "{target_text:?} encodes to no tokens"
        )));
    }

    let mut seeds = request.initial_prefix_ids.clone();
    if let Some(text) = request.initial_prefix_text.as_deref().filter(|t| !t.is_empty()) {
        seeds.extend(tokenizer.encode_raw(text)?);
    }
    let mut prefix = initial_prefix(&seeds, config.prefix_length, oracle.vocab_size(), rng)?;

    let prefix_len = prefix.len();
    let target_start = prefix_len + prompt_ids.len();
    let target_span = Span::new(target_start, target_start + target_ids.len());
    let allowed = masks.allowed();
    let device = oracle.device();

    tracing::info!(
        prefix_len,
        prompt_tokens = prompt_ids.len(),
        target_tokens = target_ids.len(),
        iterations = config.iterations,
        "starting prefix search"
    );

    let assemble = |prefix: &[u32]| -> Vec<u32> {
        prefix
            .iter()
            .chain(&prompt_ids)
            .chain(&target_ids)
            .copied()
            .collect()
    };

    let mut tracker = BestTracker::new();
    let mut status = SearchStatus::Completed;
    let mut iterations_run = 0;

    for iteration in 0..config.iterations {
        let full = assemble(&prefix);
        let mask = TargetMask::new(std::slice::from_ref(&full), &[target_span])?;
        let ids = ids_to_tensor(&[full], device)?;
        let out = loss::embedding_gradients(oracle, &ids, None, &mask, Reduction::Sum)?;
        iterations_run += 1;
        tracker.record(out.loss, &prefix);

        let Some(grad) = out.grad else {
            status = SearchStatus::EarlyStopped {
                reason: StopReason::GradientUnavailable,
            };
            break;
        };

        // [prefix_len, hidden] gradients at the mutable positions
        let prefix_grad = grad.i(0)?.narrow(0, 0, prefix_len)?.to_dtype(DType::F32)?;
        let norms: Vec<f32> = prefix_grad.sqr()?.sum(1)?.sqrt()?.to_vec1()?;
        let position = vocab::masked_argmax(&norms, &vec![true; norms.len()])
            .and_then(|p| usize::try_from(p).ok())
            .filter(|&p| norms.get(p).is_some_and(|n| *n > 0.0));
        let Some(position) = position else {
            status = SearchStatus::EarlyStopped {
                reason: StopReason::ZeroGradient,
            };
            break;
        };

        let scores = vocab::linear_scores(oracle.embedding_table(), &prefix_grad.i(position)?)?;
        let current = prefix.get(position).copied().unwrap_or_default();
        let mut allowed_here = allowed.clone();
        if let Some(slot) = usize::try_from(current).ok().and_then(|i| allowed_here.get_mut(i)) {
            *slot = false;
        }
        let next = vocab::masked_argmax(&scores, &allowed_here).ok_or_else(|| {
            AttackError::VocabularyExhausted(format!(
                "no replacement for prefix position {position}"
            ))
        })?;

        tracing::debug!(iteration, loss = out.loss, position, from = current, to = next, "prefix swap");
        if let Some(slot) = prefix.get_mut(position) {
            *slot = next;
        }
    }

    // The last swap has not been scored yet.
    if status == SearchStatus::Completed {
        let final_loss = sequence_loss(oracle, &assemble(&prefix), target_span)?;
        tracing::debug!(loss = final_loss, "scored final prefix");
        tracker.record(final_loss, &prefix);
    }

    let best_loss = tracker.loss.is_finite().then_some(tracker.loss);
    let prefix_ids = tracker.prefix.take().unwrap_or(prefix);
    let prefix_tokens = tokenizer.convert_ids_to_tokens(&prefix_ids);
    let prefix_text = tokenizer.decode_skip_special(&prefix_ids)?;

    tracing::info!(?status, iterations_run, loss = ?best_loss, "prefix search finished");

    Ok(PrefixSearchResult {
        status,
        input_string,
        target_text,
        prefix_ids,
        prefix_tokens,
        prefix_text,
        loss: best_loss,
        iterations: config.iterations,
        iterations_run,
        loss_history: tracker.history,
        best_loss_history: tracker.best_history,
    })
}

/// Summed target loss of one assembled sequence (forward only).
///
/// # Errors
///
/// Propagates oracle and loss errors.
pub fn sequence_loss(oracle: &dyn ScoringOracle, sequence: &[u32], target: Span) -> Result<f32> {
    let rows = [sequence.to_vec()];
    let mask = TargetMask::new(&rows, &[target])?;
    let ids = ids_to_tensor(&rows, oracle.device())?;
    let logits = oracle.forward(&ids, None)?;
    Ok(loss::masked_target_loss(&logits, &mask, Reduction::Sum)?.to_scalar::<f32>()?)
}

// ---------------------------------------------------------------------------
// Multi-row driver
// ---------------------------------------------------------------------------

/// One row of a multi-row prefix search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSearchRow {
    /// Caller-chosen identifier; `row_{index}` when absent.
    pub row_id: Option<String>,
    /// The search to run for this row.
    pub request: PrefixSearchRequest,
}

impl PrefixSearchRow {
    /// Row without an explicit id.
    #[must_use]
    pub const fn new(request: PrefixSearchRequest) -> Self {
        Self {
            row_id: None,
            request,
        }
    }

    /// Set the row identifier.
    #[must_use]
    pub fn with_row_id(mut self, row_id: impl Into<String>) -> Self {
        self.row_id = Some(row_id.into());
        self
    }
}

/// Outcome of one row: a result, or the error that ended that row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrefixRowOutcome {
    /// Identifier of the row.
    pub row_id: String,
    /// Position of the row in the input.
    pub row_index: usize,
    /// Search result when the row succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PrefixSearchResult>,
    /// Error message when the row failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run [`search_prefix`] on every row, isolating failures per row.
///
/// Rows share the config and the random number generator, in input order.
/// A failing row records its error and the remaining rows still run.
pub fn search_prefix_rows(
    oracle: &dyn ScoringOracle,
    tokenizer: &dyn TokenCodec,
    masks: &VocabularyMasks,
    rows: &[PrefixSearchRow],
    config: &PrefixSearchConfig,
    rng: &mut impl Rng,
) -> Vec<PrefixRowOutcome> {
    rows.iter()
        .enumerate()
        .map(|(row_index, row)| {
            let row_id = row
                .row_id
                .clone()
                .unwrap_or_else(|| format!("row_{row_index}"));
            match search_prefix(oracle, tokenizer, masks, &row.request, config, &mut *rng) {
                Ok(result) => PrefixRowOutcome {
                    row_id,
                    row_index,
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(row_id = %row_id, row_index, error = %e, "prefix search row failed");
                    PrefixRowOutcome {
                        row_id,
                        row_index,
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn seeds_come_first_and_invalid_ids_are_dropped() {
        let mut rng = StdRng::seed_from_u64(0);
        let prefix = initial_prefix(&[3, 99, 4, 5, 6], 3, 10, &mut rng).unwrap();
        assert_eq!(prefix, vec![3, 4, 5]);
    }

    #[test]
    fn missing_seeds_are_filled_from_vocabulary() {
        let mut rng = StdRng::seed_from_u64(7);
        let prefix = initial_prefix(&[2], 5, 10, &mut rng).unwrap();
        assert_eq!(prefix.len(), 5);
        assert_eq!(prefix.first(), Some(&2));
        assert!(prefix.iter().all(|&id| id < 10));
    }

    #[test]
    fn empty_vocabulary_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(initial_prefix(&[], 2, 0, &mut rng).is_err());
    }

    #[test]
    fn best_tracker_is_monotone() {
        let mut tracker = BestTracker::new();
        for (loss, id) in [(3.0, 1), (2.0, 2), (2.5, 3), (f32::NAN, 4), (1.0, 5)] {
            tracker.record(loss, &[id]);
        }
        assert_eq!(tracker.best_history, vec![3.0, 2.0, 2.0, 2.0, 1.0]);
        assert_eq!(tracker.prefix, Some(vec![5]));
    }

    #[test]
    fn status_serializes_with_reason() {
        let status = SearchStatus::EarlyStopped {
            reason: StopReason::ZeroGradient,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json, serde_json::json!({"early_stopped": {"reason": "zero_gradient"}}));
    }
}
