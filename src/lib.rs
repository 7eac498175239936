// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-attack
//!
//! Gradient-guided discrete prompt optimization for language models in
//! Rust, built on [candle](https://github.com/huggingface/candle).
//!
//! Given a differentiable scoring model, candle-attack searches for token
//! sequences that make a chosen target continuation more likely.  Gradients
//! of a masked target loss with respect to the input embeddings rank
//! replacement tokens by a first-order estimate, and the optimizers commit
//! replacements one coordinate at a time.
//!
//! ## Optimizers
//!
//! - **Single-position greedy prefix search**: a short prefix is rewritten
//!   one token per iteration at the position with the largest gradient norm
//!   ([`AttackSession::find_adversarial_prefix`]).
//! - **Batched coordinate descent (GCG)**: many chat-formatted rows are
//!   optimized together; each step picks a random position per row and
//!   re-scores the top-K candidates exactly ([`AttackSession::batch_gcg`]).
//!
//! ## Building blocks
//!
//! - [`ScoringOracle`]: the model contract (embedding table, forward from
//!   embeddings, autograd).  [`MeanPoolLm`] is a small loadable implementation.
//! - [`TokenCodec`]: tokenizer contract, implemented for `HuggingFace`
//!   tokenizers by [`HfTokenizer`].
//! - [`Span`] / [`locate`]: token span bookkeeping with left-padding shifts.
//! - [`VocabularyMasks`]: forbidden and clean id subsets.
//! - [`attribute_input`]: gradient attribution of a response to its prompt
//!   tokens.
//!
//! Logging goes through `tracing`; install a subscriber to see it.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod attack;
pub mod backend;
pub mod config;
pub mod error;
pub mod meanpool;
pub mod template;
pub mod tokenizer;
pub mod util;

// --- Public re-exports ---------------------------------------------------

// Session and optimizers
pub use attack::AttackSession;
pub use attack::attribution::{InputAttribution, attribute_input};
pub use attack::batch::{GcgBatch, GcgRow, SpanMismatch, SpanSegment};
pub use attack::gcg::{CommittedSwap, GcgOutcome, GcgStep, run_gcg};
pub use attack::loss::{
    EmbeddingGradients, IGNORE_INDEX, Reduction, TargetMask, embedding_gradients,
    masked_target_loss, per_row_target_loss,
};
pub use attack::prefix::{
    PrefixRowOutcome, PrefixSearchRequest, PrefixSearchResult, PrefixSearchRow, SearchStatus,
    StopReason, search_prefix, search_prefix_rows,
};

// Oracle
pub use backend::{ScoringOracle, ids_to_tensor};
pub use meanpool::MeanPoolLm;

// Config
pub use config::{
    CommitPolicy, DEFAULT_ITERATIONS, DEFAULT_NUM_STEPS, DEFAULT_PREFIX_LEN, DEFAULT_TOP_K,
    GcgConfig, MAX_ITERATIONS, MAX_PREFIX_LEN, MeanPoolLmConfig, PrefixSearchConfig,
};

// Error
pub use error::{AttackError, Result};

// Tokenizer and template
pub use template::{CustomTemplate, PromptTemplate};
pub use tokenizer::{HfTokenizer, TokenCodec};

// Utilities
pub use util::masks::create_padding_mask;
pub use util::span::{Span, left_pad, locate};
pub use util::vocab::VocabularyMasks;
