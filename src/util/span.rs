// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token span bookkeeping.
//!
//! A [`Span`] is a half-open `[start, end)` range of token positions inside
//! one sequence.  Spans are found with [`locate`], which matches a token
//! subsequence exactly and falls back to the subsequence with its first and
//! last token stripped.  The fallback covers tokenizers that add boundary
//! tokens (leading spaces, formatting markers) when a fragment is encoded in
//! isolation but not when the same text occurs inline.
//!
//! Spans are absolute: left-padding a sequence by `p` tokens invalidates
//! them, and each one must be moved with [`Span::shift`] by that row's own
//! pad amount.

use std::ops::Range;

use serde::Serialize;

use crate::error::{AttackError, Result};

/// Half-open range of token positions `[start, end)`.
///
/// # Example
///
/// ```
/// use candle_attack::Span;
///
/// let span = Span::new(2, 5);
/// assert_eq!(span.len(), 3);
/// assert_eq!(span.shift(4), Span::new(6, 9));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Span {
    /// First position (inclusive).
    pub start: usize,
    /// One past the last position (exclusive).
    pub end: usize,
}

impl Span {
    /// Create a span.  `end` is clamped up to `start` so the span is never inverted.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        let end = if end < start { start } else { end };
        Self { start, end }
    }

    /// Number of positions covered.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the span covers no positions.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Move both bounds right by `offset` (left-padding compensation).
    #[must_use]
    pub const fn shift(self, offset: usize) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
        }
    }

    /// Whether `pos` falls inside the span.
    #[must_use]
    pub const fn contains(&self, pos: usize) -> bool {
        pos >= self.start && pos < self.end
    }

    /// The span as a `Range`, for slicing.
    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Tokens covered by the span, or `None` if it runs past `sequence`.
    #[must_use]
    pub fn slice<'a>(&self, sequence: &'a [u32]) -> Option<&'a [u32]> {
        sequence.get(self.range())
    }
}

/// Find the first exact occurrence of `needle` in `haystack`.
///
/// An empty needle matches at offset 0.
fn find_exact(haystack: &[u32], needle: &[u32]) -> Option<Span> {
    if needle.is_empty() {
        return Some(Span::new(0, 0));
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|start| Span::new(start, start + needle.len()))
}

/// Locate `needle` inside `haystack`.
///
/// Scans every start offset for an exact contiguous match.  If none is
/// found, retries with the first and last token of `needle` removed and
/// returns the span of the stripped subsequence.  The stripped retry is
/// skipped when stripping would leave nothing to match.
///
/// # Errors
///
/// Returns [`AttackError::SpanNotFound`] naming both sequences when neither
/// search succeeds.
///
/// # Example
///
/// ```
/// use candle_attack::{Span, locate};
///
/// // Exact match.
/// assert_eq!(locate(&[5, 6, 7, 8], &[6, 7]).unwrap(), Span::new(1, 3));
/// // Boundary tokens 1 and 2 only appear when the fragment is encoded alone.
/// assert_eq!(locate(&[5, 6, 7, 8], &[1, 6, 7, 2]).unwrap(), Span::new(1, 3));
/// ```
pub fn locate(haystack: &[u32], needle: &[u32]) -> Result<Span> {
    if let Some(span) = find_exact(haystack, needle) {
        return Ok(span);
    }

    if needle.len() > 2 {
        let stripped = needle.get(1..needle.len() - 1).unwrap_or_default();
        if let Some(span) = find_exact(haystack, stripped) {
            return Ok(span);
        }
    }

    Err(AttackError::SpanNotFound {
        needle: needle.to_vec(),
        haystack: haystack.to_vec(),
    })
}

/// Left-pad `ids` with `pad_id` up to `target_len`.
///
/// Returns the padded sequence and the number of pad tokens inserted.
/// Sequences already at or beyond `target_len` are returned unchanged.
#[must_use]
pub fn left_pad(ids: &[u32], target_len: usize, pad_id: u32) -> (Vec<u32>, usize) {
    let pad = target_len.saturating_sub(ids.len());
    let mut padded = Vec::with_capacity(ids.len() + pad);
    padded.resize(pad, pad_id);
    padded.extend_from_slice(ids);
    (padded, pad)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn locate_exact_returns_matching_span() {
        let seq = [10, 11, 12, 13, 14, 12, 13];
        let span = locate(&seq, &[12, 13]).unwrap();
        // First occurrence wins.
        assert_eq!(span, Span::new(2, 4));
        assert_eq!(span.slice(&seq).unwrap(), &[12, 13]);
    }

    #[test]
    fn locate_every_verbatim_subsequence() {
        let seq: Vec<u32> = vec![3, 1, 4, 1, 5, 9, 2, 6];
        for start in 0..seq.len() {
            for end in start + 1..=seq.len() {
                let needle = &seq[start..end];
                let span = locate(&seq, needle).unwrap();
                assert_eq!(&seq[span.range()], needle);
            }
        }
    }

    #[test]
    fn locate_falls_back_to_stripped_needle() {
        let seq = [7, 20, 21, 22, 8];
        // 99 and 98 are boundary tokens that never occur inline.
        let span = locate(&seq, &[99, 20, 21, 22, 98]).unwrap();
        assert_eq!(span, Span::new(1, 4));
    }

    #[test]
    fn locate_fails_when_both_searches_fail() {
        let err = locate(&[1, 2, 3], &[4, 5, 6]).unwrap_err();
        match err {
            AttackError::SpanNotFound { needle, haystack } => {
                assert_eq!(needle, vec![4, 5, 6]);
                assert_eq!(haystack, vec![1, 2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn locate_short_needle_does_not_strip_to_empty() {
        // Stripping a two-token needle would leave nothing; that must not
        // degenerate into a zero-width match at offset 0.
        assert!(locate(&[1, 2, 3], &[9, 8]).is_err());
        assert!(locate(&[1, 2, 3], &[9]).is_err());
    }

    #[test]
    fn locate_empty_needle_is_zero_width() {
        assert_eq!(locate(&[1, 2], &[]).unwrap(), Span::new(0, 0));
    }

    #[test]
    fn shift_preserves_content_after_left_padding() {
        let unpadded = [4, 5, 6, 7];
        let span = Span::new(1, 3);
        for pad in 0..4 {
            let (padded, inserted) = left_pad(&unpadded, unpadded.len() + pad, 0);
            assert_eq!(inserted, pad);
            let shifted = span.shift(inserted);
            assert_eq!(shifted, Span::new(1 + pad, 3 + pad));
            assert_eq!(&padded[shifted.range()], &unpadded[span.range()]);
        }
    }

    #[test]
    fn left_pad_never_truncates() {
        let (padded, pad) = left_pad(&[1, 2, 3], 2, 0);
        assert_eq!(padded, vec![1, 2, 3]);
        assert_eq!(pad, 0);
    }

    #[test]
    fn span_new_never_inverts() {
        let span = Span::new(5, 3);
        assert!(span.is_empty());
        assert_eq!(span.len(), 0);
        assert!(!span.contains(5));
    }
}
