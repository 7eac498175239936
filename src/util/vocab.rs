// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vocabulary masks and candidate ranking.
//!
//! [`VocabularyMasks`] holds the two per-model id subsets the optimizers
//! filter replacements with: the **forbidden** set (special, pad, eos, unk)
//! and the **clean** set (ids whose decoded text is human-readable).  Both
//! are computed once per session.
//!
//! The free functions rank vocabulary ids by the first-order estimate of
//! the loss change from swapping one embedding for another.

use candle_core::{DType, Tensor};

use crate::error::{AttackError, Result};
use crate::tokenizer::TokenCodec;

/// Punctuation that makes a decoded token count as clean on its own.
const CLEAN_PUNCTUATION: [char; 4] = ['.', ',', '!', '?'];

/// Forbidden and clean subsets of a `[0, V)` vocabulary.
///
/// Invariant: a forbidden id is never clean.
#[derive(Debug, Clone)]
pub struct VocabularyMasks {
    /// `forbidden[id]`: special/pad/eos/unk ids, never used as replacements.
    forbidden: Vec<bool>,
    /// `clean[id]`: human-readable ids, the batched optimizer's candidate pool.
    clean: Vec<bool>,
}

impl VocabularyMasks {
    /// Build masks for a vocabulary of `vocab_size` ids.
    ///
    /// Every id is decoded once to classify it; ids the tokenizer does not
    /// know (the model's embedding table may be larger than the tokenizer
    /// vocabulary) decode to nothing and are not clean.
    ///
    /// # Errors
    ///
    /// Currently infallible; decode failures mark the id as not clean.
    pub fn build(tokenizer: &dyn TokenCodec, vocab_size: usize) -> Result<Self> {
        let forbidden = forbidden_mask(tokenizer, vocab_size);
        let mut clean = vec![false; vocab_size];
        for (id, (slot, &is_forbidden)) in clean.iter_mut().zip(&forbidden).enumerate() {
            if is_forbidden {
                continue;
            }
            let Ok(id) = u32::try_from(id) else { break };
            if let Ok(text) = tokenizer.decode(&[id]) {
                *slot = is_clean_text(&text);
            }
        }
        let masks = Self { forbidden, clean };
        tracing::debug!(
            vocab_size,
            forbidden = masks.forbidden_count(),
            clean = masks.clean_count(),
            "built vocabulary masks"
        );
        Ok(masks)
    }

    /// Build masks from explicit vectors (clean entries that are forbidden are cleared).
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Config`] if the two masks differ in length.
    pub fn from_parts(forbidden: Vec<bool>, mut clean: Vec<bool>) -> Result<Self> {
        if forbidden.len() != clean.len() {
            return Err(AttackError::Config(format!(
                "forbidden mask has {} entries but clean mask has {}",
                forbidden.len(),
                clean.len()
            )));
        }
        for (c, &f) in clean.iter_mut().zip(&forbidden) {
            *c &= !f;
        }
        Ok(Self { forbidden, clean })
    }

    /// Vocabulary size the masks were built for.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.forbidden.len()
    }

    /// Whether `id` is forbidden.  Out-of-range ids are forbidden.
    #[must_use]
    pub fn is_forbidden(&self, id: u32) -> bool {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.forbidden.get(i).copied())
            .unwrap_or(true)
    }

    /// Whether `id` is clean.  Out-of-range ids are not.
    #[must_use]
    pub fn is_clean(&self, id: u32) -> bool {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.clean.get(i).copied())
            .unwrap_or(false)
    }

    /// Allowed-replacement mask: everything not forbidden.
    #[must_use]
    pub fn allowed(&self) -> Vec<bool> {
        self.forbidden.iter().map(|f| !f).collect()
    }

    /// The clean mask (candidate pool of the batched optimizer).
    #[must_use]
    pub fn clean(&self) -> &[bool] {
        &self.clean
    }

    /// Ids that may be used as replacements.
    #[must_use]
    pub fn allowed_ids(&self) -> Vec<u32> {
        mask_to_ids(&self.allowed())
    }

    /// Number of forbidden ids.
    #[must_use]
    pub fn forbidden_count(&self) -> usize {
        self.forbidden.iter().filter(|f| **f).count()
    }

    /// Number of clean ids.
    #[must_use]
    pub fn clean_count(&self) -> usize {
        self.clean.iter().filter(|c| **c).count()
    }
}

/// Forbidden mask: special ids plus pad, eos and unk, clipped to `vocab_size`.
fn forbidden_mask(tokenizer: &dyn TokenCodec, vocab_size: usize) -> Vec<bool> {
    let mut mask = vec![false; vocab_size];
    let named = [tokenizer.pad_id(), tokenizer.eos_id(), tokenizer.unk_id()];
    for id in tokenizer
        .special_ids()
        .into_iter()
        .chain(named.into_iter().flatten())
    {
        if let Some(slot) = usize::try_from(id).ok().and_then(|i| mask.get_mut(i)) {
            *slot = true;
        }
    }
    mask
}

/// Ids whose mask entry is set.
fn mask_to_ids(mask: &[bool]) -> Vec<u32> {
    mask.iter()
        .enumerate()
        .filter(|(_, keep)| **keep)
        .filter_map(|(i, _)| u32::try_from(i).ok())
        .collect()
}

/// Whether a decoded token reads as text: all alphanumeric, all whitespace,
/// or containing basic punctuation.
#[must_use]
pub fn is_clean_text(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    text.chars().all(char::is_alphanumeric)
        || text.chars().all(char::is_whitespace)
        || text.contains(CLEAN_PUNCTUATION)
}

/// First-order loss-change estimate for every vocabulary id.
///
/// `score[k] = table[k] · (-grad)`: how much the loss is expected to drop
/// if the embedding at the inspected position were replaced by id `k`'s
/// embedding.
///
/// # Shapes
/// - `table`: `[vocab_size, hidden_size]`
/// - `grad`: `[hidden_size]` -- loss gradient at one input position
/// - returns: `vocab_size` scores
///
/// # Errors
///
/// Returns [`AttackError::Model`] on shape mismatch.
pub fn linear_scores(table: &Tensor, grad: &Tensor) -> Result<Vec<f32>> {
    // PROMOTE: scores are compared across the whole vocabulary; rank in F32
    let table = table.to_dtype(DType::F32)?;
    let direction = grad.to_dtype(DType::F32)?.neg()?.unsqueeze(1)?;
    let scores = table.matmul(&direction)?.squeeze(1)?;
    Ok(scores.to_vec1()?)
}

/// Index of the highest finite score among allowed ids.
///
/// Returns `None` when every allowed score is `-inf`/NaN or nothing is allowed.
#[must_use]
pub fn masked_argmax(scores: &[f32], allowed: &[bool]) -> Option<u32> {
    scores
        .iter()
        .zip(allowed)
        .enumerate()
        .filter(|(_, (s, keep))| **keep && s.is_finite())
        // Strict comparison keeps the lowest id among ties.
        .fold(None, |best: Option<(usize, f32)>, (i, (&s, _))| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
        .and_then(|(i, _)| u32::try_from(i).ok())
}

/// The `k` highest-scoring allowed ids, best first.
///
/// Ties are ordered by lower id.  Returns fewer than `k` ids when fewer
/// allowed ids have finite scores.
///
/// # Errors
///
/// Returns [`AttackError::VocabularyExhausted`] when no allowed id has a
/// finite score.
pub fn top_k_masked(scores: &[f32], allowed: &[bool], k: usize) -> Result<Vec<u32>> {
    let mut ranked: Vec<(u32, f32)> = scores
        .iter()
        .zip(allowed)
        .enumerate()
        .filter(|(_, (s, keep))| **keep && s.is_finite())
        .filter_map(|(i, (&s, _))| u32::try_from(i).ok().map(|id| (id, s)))
        .collect();
    if ranked.is_empty() {
        return Err(AttackError::VocabularyExhausted(
            "no candidate id has a finite score".into(),
        ));
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(k);
    Ok(ranked.into_iter().map(|(id, _)| id).collect())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
