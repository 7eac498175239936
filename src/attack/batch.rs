// SPDX-License-Identifier: MIT OR Apache-2.0

//! Batch assembly for coordinate descent.
//!
//! Every row is rendered twice through the chat template:
//!
//! - the **full** sequence (user turn, target response, generation prompt)
//!   scored by the loss, and
//! - the **generation** sequence (user turn only) used to check where the
//!   mutable span lands under the model's native formatting.
//!
//! Mutable and target spans are located by token subsequence, both variants
//! are left-padded to their own batch maximum, and every span is shifted by
//! its own row's pad amount.  Spans that do not decode back to the intended
//! text are reported as [`SpanMismatch`] warnings, never as errors.

use candle_core::{Device, Tensor};
use serde::Serialize;

use crate::error::{AttackError, Result};
use crate::template::PromptTemplate;
use crate::tokenizer::TokenCodec;
use crate::util::masks::create_padding_mask;
use crate::util::span::{Span, left_pad, locate};

/// One row of a batched search.
///
/// The user turn is `prefix_prompt + mutable + postfix_prompt + context`
/// and the assistant turn is `target`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcgRow {
    /// Fixed text before the mutable region.
    pub prefix_prompt: String,
    /// Text the optimizer may rewrite.
    pub mutable: String,
    /// Fixed text between the mutable region and the context.
    pub postfix_prompt: String,
    /// Fixed context closing the user turn.
    pub context: String,
    /// Response the optimizer steers toward.
    pub target: String,
}

impl GcgRow {
    /// Row with empty prefix and postfix prompts.
    #[must_use]
    pub fn new(
        mutable: impl Into<String>,
        context: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            mutable: mutable.into(),
            context: context.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    /// Set the text placed before the mutable region.
    #[must_use]
    pub fn with_prefix_prompt(mut self, text: impl Into<String>) -> Self {
        self.prefix_prompt = text.into();
        self
    }

    /// Set the text placed after the mutable region.
    #[must_use]
    pub fn with_postfix_prompt(mut self, text: impl Into<String>) -> Self {
        self.postfix_prompt = text.into();
        self
    }

    /// The assembled user turn.
    #[must_use]
    pub fn user_prompt(&self) -> String {
        format!(
            "{}{}{}{}",
            self.prefix_prompt, self.mutable, self.postfix_prompt, self.context
        )
    }
}

/// Which located span a [`SpanMismatch`] refers to.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanSegment {
    /// Mutable span in the full sequence.
    Mutable,
    /// Target span in the full sequence.
    Target,
    /// Mutable span in the generation sequence.
    GenerationMutable,
}

/// A located span that does not decode back to its source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanMismatch {
    /// Batch row.
    pub row: usize,
    /// Which span.
    pub segment: SpanSegment,
    /// Text the span should reproduce.
    pub expected: String,
    /// Text the span actually decodes to.
    pub decoded: String,
}

/// A left-padded, span-annotated batch ready for [`run_gcg`](crate::attack::gcg::run_gcg).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcgBatch {
    /// Full sequences `[batch][seq]`, left-padded.
    pub input_ids: Vec<Vec<u32>>,
    /// Generation sequences `[batch][gen_seq]`, left-padded independently.
    pub generation_ids: Vec<Vec<u32>>,
    /// Mutable span of each row in `input_ids`.
    pub update_spans: Vec<Span>,
    /// Target span of each row in `input_ids`.
    pub target_spans: Vec<Span>,
    /// Mutable span of each row in `generation_ids`.
    pub generation_update_spans: Vec<Span>,
    /// Pad tokens inserted at the front of each full row.
    pub pad_lengths: Vec<usize>,
    /// Pad tokens inserted at the front of each generation row.
    pub generation_pad_lengths: Vec<usize>,
    /// Decode mismatches found during assembly.
    pub warnings: Vec<SpanMismatch>,
}

/// Unpadded encoding of one row.
struct EncodedRow {
    full: Vec<u32>,
    generation: Vec<u32>,
    update: Span,
    target: Span,
    generation_update: Span,
}

fn encode_row(tokenizer: &dyn TokenCodec, template: &PromptTemplate, row: &GcgRow) -> Result<EncodedRow> {
    let user = row.user_prompt();
    let full_text = template.render(&user, Some(&row.target), true);
    let generation_text = template.render(&user, None, false);

    let full = tokenizer.encode(&full_text)?;
    let generation = tokenizer.encode(&generation_text)?;
    let update_ids = tokenizer.encode_raw(&row.mutable)?;
    let target_ids = tokenizer.encode_raw(&row.target)?;

    Ok(EncodedRow {
        update: locate(&full, &update_ids)?,
        target: locate(&full, &target_ids)?,
        generation_update: locate(&generation, &update_ids)?,
        full,
        generation,
    })
}

impl GcgBatch {
    /// Render, tokenize, locate and left-pad `rows`.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Config`] for an empty batch,
    /// [`AttackError::Tokenizer`] if the tokenizer has neither a pad nor an
    /// eos id, and [`AttackError::SpanNotFound`] if a mutable or target
    /// span cannot be located.
    pub fn prepare(
        tokenizer: &dyn TokenCodec,
        template: &PromptTemplate,
        rows: &[GcgRow],
    ) -> Result<Self> {
        if rows.is_empty() {
            return Err(AttackError::Config("batch has no rows".into()));
        }
        let pad_id = tokenizer.padding_id()?;
        let encoded = rows
            .iter()
            .map(|row| encode_row(tokenizer, template, row))
            .collect::<Result<Vec<_>>>()?;

        let max_len = encoded.iter().map(|e| e.full.len()).max().unwrap_or(0);
        let max_gen_len = encoded.iter().map(|e| e.generation.len()).max().unwrap_or(0);

        let mut batch = Self {
            input_ids: Vec::with_capacity(rows.len()),
            generation_ids: Vec::with_capacity(rows.len()),
            update_spans: Vec::with_capacity(rows.len()),
            target_spans: Vec::with_capacity(rows.len()),
            generation_update_spans: Vec::with_capacity(rows.len()),
            pad_lengths: Vec::with_capacity(rows.len()),
            generation_pad_lengths: Vec::with_capacity(rows.len()),
            warnings: Vec::new(),
        };

        for (index, (row, enc)) in rows.iter().zip(encoded).enumerate() {
            let (full, pad) = left_pad(&enc.full, max_len, pad_id);
            let (generation, gen_pad) = left_pad(&enc.generation, max_gen_len, pad_id);
            let update = enc.update.shift(pad);
            let target = enc.target.shift(pad);
            let generation_update = enc.generation_update.shift(gen_pad);

            let checks = [
                (SpanSegment::Mutable, &full, update, &row.mutable),
                (SpanSegment::Target, &full, target, &row.target),
                (SpanSegment::GenerationMutable, &generation, generation_update, &row.mutable),
            ];
            for (segment, ids, span, expected) in checks {
                let decoded = tokenizer.decode(span.slice(ids).unwrap_or_default())?;
                if decoded != *expected {
                    tracing::warn!(
                        row = index,
                        ?segment,
                        expected = %expected,
                        decoded = %decoded,
                        "span does not decode to its source text"
                    );
                    batch.warnings.push(SpanMismatch {
                        row: index,
                        segment,
                        expected: expected.clone(),
                        decoded,
                    });
                }
            }

            batch.input_ids.push(full);
            batch.generation_ids.push(generation);
            batch.update_spans.push(update);
            batch.target_spans.push(target);
            batch.generation_update_spans.push(generation_update);
            batch.pad_lengths.push(pad);
            batch.generation_pad_lengths.push(gen_pad);
        }

        tracing::debug!(
            rows = batch.len(),
            seq_len = max_len,
            generation_seq_len = max_gen_len,
            warnings = batch.warnings.len(),
            "assembled batch"
        );
        Ok(batch)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the batch has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Padded length of the full sequences.
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.input_ids.first().map_or(0, Vec::len)
    }

    /// Attention mask for the full sequences.
    ///
    /// # Shapes
    /// - returns: `[batch, seq_len]` (`u32`)
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Model`] on tensor construction failure.
    pub fn attention_mask(&self, device: &Device) -> Result<Tensor> {
        create_padding_mask(&self.pad_lengths, self.seq_len(), device)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
