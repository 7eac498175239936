// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-attack.

/// Errors that can occur during prompt optimization.
///
/// Recoverable conditions (span text mismatches after assembly, a zero
/// gradient that ends a single-position search early) are not errors: they
/// are reported in the result records instead.
#[derive(Debug, thiserror::Error)]
pub enum AttackError {
    /// Forward/backward pass or tensor error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Hyperparameter or model configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// The target text tokenizes to zero tokens.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// A batch row has an empty mutable span, so no position can be perturbed.
    #[error("row {row} has an empty mutable span")]
    EmptyMutableSpan {
        /// Index of the offending row.
        row: usize,
    },

    /// Neither the exact nor the edge-stripped subsequence occurs in the haystack.
    #[error("span not found: {needle:?} does not occur in {haystack:?}")]
    SpanNotFound {
        /// Token ids that were searched for.
        needle: Vec<u32>,
        /// Token ids that were searched.
        haystack: Vec<u32>,
    },

    /// The backward pass produced no gradient for the input embeddings.
    #[error("gradient unavailable: {0}")]
    GradientUnavailable(String),

    /// Every vocabulary entry was masked out, so no replacement can be chosen.
    #[error("vocabulary exhausted: {0}")]
    VocabularyExhausted(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-attack operations.
pub type Result<T> = std::result::Result<T, AttackError>;
