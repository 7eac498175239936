// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gradient-guided discrete prompt optimization.
//!
//! Two optimizers share the masked target loss in [`loss`]:
//!
//! - [`prefix`]: deterministic single-position greedy search over a short
//!   prefix (largest gradient norm picks the position).
//! - [`gcg`]: batched coordinate descent with random positions and exact
//!   re-scoring of the top-K candidates, over rows assembled by [`batch`].
//!
//! [`attribution`] reuses the same gradient pass to score prompt tokens
//! against a given response.
//!
//! [`AttackSession`] bundles the oracle and tokenizer with the vocabulary
//! masks, which are built on first use and reused by every call.

pub mod attribution;
pub mod batch;
pub mod gcg;
pub mod loss;
pub mod prefix;

use std::sync::OnceLock;

use rand::Rng;

use crate::backend::ScoringOracle;
use crate::config::{GcgConfig, PrefixSearchConfig};
use crate::error::Result;
use crate::template::PromptTemplate;
use crate::tokenizer::TokenCodec;
use crate::util::vocab::VocabularyMasks;

use self::attribution::InputAttribution;
use self::batch::{GcgBatch, GcgRow};
use self::gcg::GcgOutcome;
use self::prefix::{PrefixRowOutcome, PrefixSearchRequest, PrefixSearchResult, PrefixSearchRow};

/// An oracle and tokenizer pair with lazily built vocabulary masks.
///
/// # Example
///
/// ```no_run
/// use candle_attack::{AttackSession, HfTokenizer, MeanPoolLm, PrefixSearchConfig, PrefixSearchRequest};
/// use rand::SeedableRng;
///
/// # fn main() -> candle_attack::Result<()> {
/// let model = MeanPoolLm::from_dir("path/to/model")?;
/// let tokenizer = HfTokenizer::from_file("path/to/tokenizer.json")?;
/// let session = AttackSession::new(&model, &tokenizer);
///
/// let request = PrefixSearchRequest::new("Tell me a story.", "Once upon a time");
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let result = session.find_adversarial_prefix(&request, &PrefixSearchConfig::default(), &mut rng)?;
/// println!("{} -> {:?}", result.prefix_text, result.loss);
/// # Ok(())
/// # }
/// ```
pub struct AttackSession<'a> {
    // TRAIT_OBJECT: any model backend can serve as the scoring oracle
    oracle: &'a dyn ScoringOracle,
    // TRAIT_OBJECT: tokenizer implementations differ per model family
    tokenizer: &'a dyn TokenCodec,
    masks: OnceLock<VocabularyMasks>,
}

impl<'a> AttackSession<'a> {
    /// Create a session.  Masks are built on the first optimizer call.
    #[must_use]
    pub fn new(oracle: &'a dyn ScoringOracle, tokenizer: &'a dyn TokenCodec) -> Self {
        Self {
            oracle,
            tokenizer,
            masks: OnceLock::new(),
        }
    }

    /// Create a session with precomputed masks.
    #[must_use]
    pub fn with_masks(
        oracle: &'a dyn ScoringOracle,
        tokenizer: &'a dyn TokenCodec,
        masks: VocabularyMasks,
    ) -> Self {
        Self {
            oracle,
            tokenizer,
            masks: OnceLock::from(masks),
        }
    }

    /// The scoring oracle.
    #[must_use]
    pub fn oracle(&self) -> &'a dyn ScoringOracle {
        self.oracle
    }

    /// The tokenizer.
    #[must_use]
    pub fn tokenizer(&self) -> &'a dyn TokenCodec {
        self.tokenizer
    }

    /// Vocabulary masks over the oracle's vocabulary, built once.
    ///
    /// # Errors
    ///
    /// Propagates mask construction errors.
    pub fn masks(&self) -> Result<&VocabularyMasks> {
        if let Some(masks) = self.masks.get() {
            return Ok(masks);
        }
        let built = VocabularyMasks::build(self.tokenizer, self.oracle.vocab_size())?;
        Ok(self.masks.get_or_init(|| built))
    }

    /// Single-position greedy search for a prefix that steers the oracle
    /// toward `request.target_text`.
    ///
    /// # Errors
    ///
    /// See [`prefix::search_prefix`].
    pub fn find_adversarial_prefix(
        &self,
        request: &PrefixSearchRequest,
        config: &PrefixSearchConfig,
        rng: &mut impl Rng,
    ) -> Result<PrefixSearchResult> {
        prefix::search_prefix(
            self.oracle,
            self.tokenizer,
            self.masks()?,
            request,
            config,
            rng,
        )
    }

    /// Prefix search over several rows; a failing row records its error
    /// instead of aborting the others.
    ///
    /// # Errors
    ///
    /// Only mask construction errors; per-row errors are in the outcomes.
    pub fn find_adversarial_prefixes(
        &self,
        rows: &[PrefixSearchRow],
        config: &PrefixSearchConfig,
        rng: &mut impl Rng,
    ) -> Result<Vec<PrefixRowOutcome>> {
        Ok(prefix::search_prefix_rows(
            self.oracle,
            self.tokenizer,
            self.masks()?,
            rows,
            config,
            rng,
        ))
    }

    /// Gradient attribution of `response` to the tokens of `prompt`.
    ///
    /// # Errors
    ///
    /// See [`attribution::attribute_input`].
    pub fn attribute_input(
        &self,
        template: &PromptTemplate,
        prompt: &str,
        response: &str,
    ) -> Result<InputAttribution> {
        attribution::attribute_input(self.oracle, self.tokenizer, template, prompt, response)
    }

    /// Assemble rows into a padded batch without optimizing.
    ///
    /// # Errors
    ///
    /// See [`GcgBatch::prepare`].
    pub fn prepare_batch(&self, rows: &[GcgRow], template: &PromptTemplate) -> Result<GcgBatch> {
        GcgBatch::prepare(self.tokenizer, template, rows)
    }

    /// Coordinate descent on an already assembled batch.
    ///
    /// # Errors
    ///
    /// See [`gcg::run_gcg`].
    pub fn run_gcg(
        &self,
        batch: &GcgBatch,
        config: &GcgConfig,
        rng: &mut impl Rng,
    ) -> Result<GcgOutcome> {
        gcg::run_gcg(self.oracle, self.tokenizer, self.masks()?, batch, config, rng)
    }

    /// Assemble `rows` and run coordinate descent on them.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`prepare_batch`](Self::prepare_batch) and
    /// [`run_gcg`](Self::run_gcg).
    pub fn batch_gcg(
        &self,
        rows: &[GcgRow],
        template: &PromptTemplate,
        config: &GcgConfig,
        rng: &mut impl Rng,
    ) -> Result<GcgOutcome> {
        let batch = self.prepare_batch(rows, template)?;
        self.run_gcg(&batch, config, rng)
    }
}

impl std::fmt::Debug for AttackSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttackSession")
            .field("vocab_size", &self.oracle.vocab_size())
            .field("hidden_size", &self.oracle.hidden_size())
            .field("masks_built", &self.masks.get().is_some())
            .finish_non_exhaustive()
    }
}
