// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gradient input attribution.
//!
//! Scores each prompt token by how strongly the response's log-likelihood
//! reacts to its embedding: `|d loss / d embedding|` summed over the hidden
//! dimension, then min-max normalized to `[0, 1]` over the prompt.
//! The response is appended to the prompt as given; nothing is generated.

use std::collections::HashSet;

use candle_core::{DType, IndexOp};
use serde::Serialize;

use crate::attack::loss::{self, Reduction, TargetMask};
use crate::backend::{ScoringOracle, ids_to_tensor};
use crate::error::Result;
use crate::template::PromptTemplate;
use crate::tokenizer::TokenCodec;
use crate::util::span::Span;

/// Per-token attribution of a response to its prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputAttribution {
    /// Trimmed user prompt.
    pub input_string: String,
    /// Response the scores explain.
    pub response: String,
    /// Prompt token ids after template rendering.
    pub input_ids: Vec<u32>,
    /// Vocabulary strings of `input_ids`.
    pub input_tokens: Vec<String>,
    /// Normalized importance of each prompt token, in `[0, 1]`.
    pub token_scores: Vec<f32>,
    /// `token_scores` with special tokens lowered to the minimum score.
    pub token_scores_drop_special: Vec<f32>,
    /// Summed negative log-likelihood of the response, `None` if the
    /// response is empty.
    pub response_nll: Option<f32>,
}

/// Min-max normalize to `[0, 1]`; a constant input maps to all zeros.
fn normalize_min_max(values: &[f32]) -> Vec<f32> {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > min {
        values.iter().map(|v| (v - min) / (max - min)).collect()
    } else {
        vec![0.0; values.len()]
    }
}

/// Replace the score of every special id with the minimum score.
fn drop_special(ids: &[u32], scores: &[f32], special: &HashSet<u32>) -> Vec<f32> {
    let min = scores.iter().copied().reduce(f32::min).unwrap_or(0.0);
    ids.iter()
        .zip(scores)
        .map(|(id, &score)| if special.contains(id) { min } else { score })
        .collect()
}

/// Attribute `response` to the tokens of `prompt` rendered through `template`.
///
/// The prompt is rendered with a generation header and encoded with special
/// tokens; the response is encoded raw and appended.  An empty response,
/// or a loss that does not reach the prompt, scores every token `0.0`.
///
/// # Errors
///
/// Propagates tokenizer and oracle errors.
pub fn attribute_input(
    oracle: &dyn ScoringOracle,
    tokenizer: &dyn TokenCodec,
    template: &PromptTemplate,
    prompt: &str,
    response: &str,
) -> Result<InputAttribution> {
    let input_string = prompt.trim().to_owned();
    let input_ids = tokenizer.encode(&template.render(&input_string, None, true))?;
    let response_ids = tokenizer.encode_raw(response)?;
    let input_tokens = tokenizer.convert_ids_to_tokens(&input_ids);
    let prompt_len = input_ids.len();

    let mut attribution = InputAttribution {
        input_string,
        response: response.to_owned(),
        token_scores: vec![0.0; prompt_len],
        token_scores_drop_special: vec![0.0; prompt_len],
        input_ids,
        input_tokens,
        response_nll: None,
    };
    if response_ids.is_empty() || prompt_len == 0 {
        return Ok(attribution);
    }

    let mut sequence = attribution.input_ids.clone();
    sequence.extend_from_slice(&response_ids);
    let target = Span::new(prompt_len, sequence.len());
    let mask = TargetMask::new(std::slice::from_ref(&sequence), &[target])?;
    let ids = ids_to_tensor(std::slice::from_ref(&sequence), oracle.device())?;
    let out = loss::embedding_gradients(oracle, &ids, None, &mask, Reduction::Sum)?;
    attribution.response_nll = Some(out.loss);

    let Some(grad) = out.grad else {
        return Ok(attribution);
    };
    // PROMOTE: per-token magnitudes are summed in F32
    let importance: Vec<f32> = grad
        .i(0)?
        .narrow(0, 0, prompt_len)?
        .to_dtype(DType::F32)?
        .abs()?
        .sum(1)?
        .to_vec1()?;

    let special: HashSet<u32> = tokenizer.special_ids().into_iter().collect();
    attribution.token_scores = normalize_min_max(&importance);
    attribution.token_scores_drop_special =
        drop_special(&attribution.input_ids, &attribution.token_scores, &special);

    tracing::debug!(
        prompt_tokens = prompt_len,
        response_tokens = response_ids.len(),
        response_nll = out.loss,
        "input attribution"
    );
    Ok(attribution)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn normalization_spans_unit_interval() {
        assert_eq!(normalize_min_max(&[2.0, 4.0, 3.0]), vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn constant_importance_normalizes_to_zero() {
        assert_eq!(normalize_min_max(&[0.7, 0.7]), vec![0.0, 0.0]);
        assert!(normalize_min_max(&[]).is_empty());
    }

    #[test]
    fn special_tokens_drop_to_minimum() {
        let special: HashSet<u32> = [0, 1].into_iter().collect();
        let scores = drop_special(&[1, 5, 6, 0], &[1.0, 0.25, 0.5, 0.75], &special);
        assert_eq!(scores, vec![0.25, 0.25, 0.5, 0.25]);
    }
}
