// SPDX-License-Identifier: MIT OR Apache-2.0

//! Optimizer hyperparameters and model configuration.
//!
//! - [`PrefixSearchConfig`]: single-position greedy prefix search.
//! - [`GcgConfig`]: batched coordinate descent (GCG).
//! - [`MeanPoolLmConfig`]: dimensions of the built-in [`MeanPoolLm`](crate::MeanPoolLm) oracle.
//!
//! Each config has a `Default`, builder-style setters, and a `from_json`
//! parser that reads the same keys from a JSON object (missing keys take
//! the default).
//!
//! # Usage
//!
//! ```
//! use candle_attack::GcgConfig;
//!
//! let json = serde_json::json!({"num_steps": 10, "top_k": 8});
//! let config = GcgConfig::from_json(&json).unwrap();
//! assert_eq!(config.num_steps, 10);
//! assert_eq!(config.top_k, 8);
//! ```

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::{AttackError, Result};

/// Default number of prefix tokens for the single-position search.
pub const DEFAULT_PREFIX_LEN: usize = 3;
/// Default iteration budget for the single-position search.
pub const DEFAULT_ITERATIONS: usize = 6;
/// Upper bound on the prefix length.
pub const MAX_PREFIX_LEN: usize = 32;
/// Upper bound on the iteration budget.
pub const MAX_ITERATIONS: usize = 64;

/// Default number of coordinate-descent steps for the batched optimizer.
pub const DEFAULT_NUM_STEPS: usize = 40;
/// Default number of candidates re-scored per row per step.
pub const DEFAULT_TOP_K: usize = 32;

// ---------------------------------------------------------------------------
// PrefixSearchConfig
// ---------------------------------------------------------------------------

/// Hyperparameters for the single-position greedy prefix search.
///
/// Both fields are clamped on construction: `prefix_length` to
/// `[1, MAX_PREFIX_LEN]` and `iterations` to `[1, MAX_ITERATIONS]`.
///
/// # Example
///
/// ```
/// use candle_attack::{PrefixSearchConfig, MAX_ITERATIONS};
///
/// let config = PrefixSearchConfig::new(0, 1000);
/// assert_eq!(config.prefix_length, 1);
/// assert_eq!(config.iterations, MAX_ITERATIONS);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefixSearchConfig {
    /// Number of mutable tokens prepended to the prompt.
    pub prefix_length: usize,
    /// Iteration budget (one replacement per iteration).
    pub iterations: usize,
}

impl PrefixSearchConfig {
    /// Create a config, clamping both values to their allowed ranges.
    #[must_use]
    pub fn new(prefix_length: usize, iterations: usize) -> Self {
        Self {
            prefix_length: prefix_length.clamp(1, MAX_PREFIX_LEN),
            iterations: iterations.clamp(1, MAX_ITERATIONS),
        }
    }

    /// Set the prefix length (clamped).
    #[must_use]
    pub fn with_prefix_length(self, prefix_length: usize) -> Self {
        Self::new(prefix_length, self.iterations)
    }

    /// Set the iteration budget (clamped).
    #[must_use]
    pub fn with_iterations(self, iterations: usize) -> Self {
        Self::new(self.prefix_length, iterations)
    }

    /// Parse from a JSON object with optional `prefix_length` and `iterations`.
    ///
    /// Values out of range are clamped rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Config`] if `config` is not a JSON object.
    pub fn from_json(config: &Value) -> Result<Self> {
        require_object(config)?;
        Ok(Self::new(
            get_usize_or(config, "prefix_length", DEFAULT_PREFIX_LEN),
            get_usize_or(config, "iterations", DEFAULT_ITERATIONS),
        ))
    }
}

impl Default for PrefixSearchConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX_LEN, DEFAULT_ITERATIONS)
    }
}

// ---------------------------------------------------------------------------
// GcgConfig
// ---------------------------------------------------------------------------

/// What to do when the best re-scored candidate is worse than the current row.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CommitPolicy {
    /// Always commit the best of the `top_k` candidates, even if it raises
    /// the row's loss.
    #[default]
    AlwaysBestCandidate,
    /// Keep the current token when no candidate is at least as good as the
    /// row's loss before the step.
    OnlyIfNoWorse,
}

impl fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysBestCandidate => write!(f, "always_best_candidate"),
            Self::OnlyIfNoWorse => write!(f, "only_if_no_worse"),
        }
    }
}

impl std::str::FromStr for CommitPolicy {
    type Err = AttackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always_best_candidate" => Ok(Self::AlwaysBestCandidate),
            "only_if_no_worse" => Ok(Self::OnlyIfNoWorse),
            other => Err(AttackError::Config(format!(
                "unknown commit policy '{other}'"
            ))),
        }
    }
}

/// Hyperparameters for batched greedy coordinate gradient (GCG) descent.
///
/// `top_k` is the main memory knob: every step materializes `top_k`
/// candidate sequences per row and runs a full forward pass over them, in
/// chunks of `candidate_chunk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GcgConfig {
    /// Number of coordinate-descent steps (no early stopping).
    pub num_steps: usize,
    /// Candidates proposed and exactly re-scored per row per step.
    pub top_k: usize,
    /// Guard applied when committing the winning candidate.
    pub commit_policy: CommitPolicy,
    /// Maximum candidates per forward pass; `None` scores all `top_k` at once.
    pub candidate_chunk_size: Option<usize>,
}

impl GcgConfig {
    /// Create a config with the given step budget and candidate count.
    #[must_use]
    pub fn new(num_steps: usize, top_k: usize) -> Self {
        Self {
            num_steps,
            top_k,
            ..Self::default()
        }
    }

    /// Set the commit policy.
    #[must_use]
    pub const fn with_commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    /// Score candidates in chunks of at most `size` sequences.
    #[must_use]
    pub const fn with_candidate_chunk_size(mut self, size: usize) -> Self {
        self.candidate_chunk_size = Some(size);
        self
    }

    /// Effective number of candidates per forward pass.
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.candidate_chunk_size
            .unwrap_or(self.top_k)
            .clamp(1, self.top_k.max(1))
    }

    /// Check that the step budget and candidate counts are usable.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Config`] if `num_steps`, `top_k` or
    /// `candidate_chunk_size` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.num_steps == 0 {
            return Err(AttackError::Config("num_steps must be at least 1".into()));
        }
        if self.top_k == 0 {
            return Err(AttackError::Config("top_k must be at least 1".into()));
        }
        if self.candidate_chunk_size == Some(0) {
            return Err(AttackError::Config(
                "candidate_chunk_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Parse from a JSON object with optional `num_steps`, `top_k`,
    /// `commit_policy` and `candidate_chunk_size`.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Config`] if `config` is not an object, the
    /// commit policy is unknown, or [`validate`](Self::validate) fails.
    pub fn from_json(config: &Value) -> Result<Self> {
        require_object(config)?;
        let commit_policy = match config.get("commit_policy").and_then(Value::as_str) {
            Some(s) => s.parse()?,
            None => CommitPolicy::default(),
        };
        let parsed = Self {
            num_steps: get_usize_or(config, "num_steps", DEFAULT_NUM_STEPS),
            top_k: get_usize_or(config, "top_k", DEFAULT_TOP_K),
            commit_policy,
            candidate_chunk_size: get_optional_usize(config, "candidate_chunk_size"),
        };
        parsed.validate()?;
        Ok(parsed)
    }
}

impl Default for GcgConfig {
    fn default() -> Self {
        Self {
            num_steps: DEFAULT_NUM_STEPS,
            top_k: DEFAULT_TOP_K,
            commit_policy: CommitPolicy::default(),
            candidate_chunk_size: None,
        }
    }
}

// ---------------------------------------------------------------------------
// MeanPoolLmConfig
// ---------------------------------------------------------------------------

/// Dimensions of a [`MeanPoolLm`](crate::MeanPoolLm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MeanPoolLmConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Embedding dimension.
    pub hidden_size: usize,
    /// Whether the LM head shares weights with the token embedding.
    pub tie_word_embeddings: bool,
}

impl MeanPoolLmConfig {
    /// Parse from a `config.json`-style object.
    ///
    /// `vocab_size` and `hidden_size` are required; `tie_word_embeddings`
    /// defaults to `true`.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Config`] if a required field is missing or zero.
    pub fn from_json(config: &Value) -> Result<Self> {
        let parsed = Self {
            vocab_size: get_usize(config, "vocab_size")?,
            hidden_size: get_usize(config, "hidden_size")?,
            tie_word_embeddings: get_bool_or(config, "tie_word_embeddings", true),
        };
        if parsed.vocab_size == 0 || parsed.hidden_size == 0 {
            return Err(AttackError::Config(
                "vocab_size and hidden_size must be non-zero".into(),
            ));
        }
        Ok(parsed)
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Reject anything that is not a JSON object.
fn require_object(config: &Value) -> Result<()> {
    if config.is_object() {
        Ok(())
    } else {
        Err(AttackError::Config("expected a JSON object".into()))
    }
}

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| AttackError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| AttackError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    get_optional_usize(config, key).unwrap_or(default)
}

/// Extract an optional `usize` field, returning `None` if absent.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract a `bool` field, returning a default if absent.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn prefix_defaults() {
        let config = PrefixSearchConfig::default();
        assert_eq!(config.prefix_length, DEFAULT_PREFIX_LEN);
        assert_eq!(config.iterations, DEFAULT_ITERATIONS);
    }

    #[test]
    fn prefix_clamps_out_of_range() {
        let json = serde_json::json!({"prefix_length": 500, "iterations": 0});
        let config = PrefixSearchConfig::from_json(&json).unwrap();
        assert_eq!(config.prefix_length, MAX_PREFIX_LEN);
        assert_eq!(config.iterations, 1);

        let config = PrefixSearchConfig::default().with_iterations(65);
        assert_eq!(config.iterations, MAX_ITERATIONS);
    }

    #[test]
    fn prefix_rejects_non_object() {
        assert!(PrefixSearchConfig::from_json(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn gcg_defaults() {
        let config = GcgConfig::from_json(&serde_json::json!({})).unwrap();
        assert_eq!(config.num_steps, DEFAULT_NUM_STEPS);
        assert_eq!(config.top_k, DEFAULT_TOP_K);
        assert_eq!(config.commit_policy, CommitPolicy::AlwaysBestCandidate);
        assert_eq!(config.chunk_size(), DEFAULT_TOP_K);
    }

    #[test]
    fn gcg_parses_policy_and_chunking() {
        let json = serde_json::json!({
            "num_steps": 3,
            "top_k": 16,
            "commit_policy": "only_if_no_worse",
            "candidate_chunk_size": 4
        });
        let config = GcgConfig::from_json(&json).unwrap();
        assert_eq!(config.commit_policy, CommitPolicy::OnlyIfNoWorse);
        assert_eq!(config.chunk_size(), 4);
    }

    #[test]
    fn gcg_rejects_zero_budgets() {
        assert!(GcgConfig::from_json(&serde_json::json!({"num_steps": 0})).is_err());
        assert!(GcgConfig::from_json(&serde_json::json!({"top_k": 0})).is_err());
        assert!(GcgConfig::from_json(&serde_json::json!({"candidate_chunk_size": 0})).is_err());
        assert!(GcgConfig::from_json(&serde_json::json!({"commit_policy": "sometimes"})).is_err());
    }

    #[test]
    fn chunk_size_never_exceeds_top_k() {
        let config = GcgConfig::new(1, 4).with_candidate_chunk_size(100);
        assert_eq!(config.chunk_size(), 4);
    }

    #[test]
    fn commit_policy_round_trips_through_display() {
        for policy in [CommitPolicy::AlwaysBestCandidate, CommitPolicy::OnlyIfNoWorse] {
            let parsed: CommitPolicy = policy.to_string().parse().unwrap();
            assert_eq!(parsed, policy);
        }
    }

    #[test]
    fn mean_pool_config_requires_dimensions() {
        let json = serde_json::json!({"vocab_size": 10, "hidden_size": 4});
        let config = MeanPoolLmConfig::from_json(&json).unwrap();
        assert!(config.tie_word_embeddings);
        assert!(MeanPoolLmConfig::from_json(&serde_json::json!({"vocab_size": 10})).is_err());
        assert!(
            MeanPoolLmConfig::from_json(&serde_json::json!({"vocab_size": 0, "hidden_size": 4}))
                .is_err()
        );
    }
}
