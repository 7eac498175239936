// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tokenizer abstraction.
//!
//! [`TokenCodec`] is the text ⇄ token-id contract the optimizers consume.
//! [`HfTokenizer`] implements it over the `HuggingFace` `tokenizers` crate;
//! any other tokenizer (including small in-memory ones used in tests) can
//! implement the trait directly.

use crate::error::{AttackError, Result};

/// Token strings conventionally used as end-of-sequence markers.
const EOS_CANDIDATES: [&str; 6] = [
    "</s>",
    "<|endoftext|>",
    "<eos>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<|im_end|>",
];

/// Token strings conventionally used as unknown-token markers.
const UNK_CANDIDATES: [&str; 2] = ["<unk>", "[UNK]"];

/// Text ⇄ token-id conversion plus the special-token inventory.
pub trait TokenCodec {
    /// Encode text, adding the tokenizer's special tokens (e.g. BOS).
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Tokenizer`] if encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Encode text **without** special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Tokenizer`] if encoding fails.
    fn encode_raw(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids to text, keeping special tokens.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Tokenizer`] if decoding fails.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Decode ids to text with special tokens stripped.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Tokenizer`] if decoding fails.
    fn decode_skip_special(&self, ids: &[u32]) -> Result<String>;

    /// Raw token string for one id, if the id is in the vocabulary.
    fn id_to_token(&self, id: u32) -> Option<String>;

    /// Vocabulary size, including added tokens.
    fn vocab_size(&self) -> usize;

    /// Ids of all special tokens (BOS, EOS, chat markers, ...).
    fn special_ids(&self) -> Vec<u32>;

    /// Padding id, if the tokenizer defines one.
    fn pad_id(&self) -> Option<u32>;

    /// End-of-sequence id, if the tokenizer defines one.
    fn eos_id(&self) -> Option<u32>;

    /// Unknown-token id, if the tokenizer defines one.
    fn unk_id(&self) -> Option<u32>;

    /// Token strings for a sequence of ids; unknown ids map to an empty string.
    fn convert_ids_to_tokens(&self, ids: &[u32]) -> Vec<String> {
        ids.iter()
            .map(|&id| self.id_to_token(id).unwrap_or_default())
            .collect()
    }

    /// Id used to left-pad batches: the pad id, else the EOS id.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Tokenizer`] if neither is defined.
    fn padding_id(&self) -> Result<u32> {
        self.pad_id().or_else(|| self.eos_id()).ok_or_else(|| {
            AttackError::Tokenizer("tokenizer defines neither a pad nor an eos token".into())
        })
    }
}

/// `HuggingFace` tokenizer with an explicit special-token inventory.
///
/// `tokenizer.json` does not say which added token plays the EOS or UNK
/// role, so those are probed from conventional token strings and can be
/// overridden with [`with_eos_id`](Self::with_eos_id) and friends.
///
/// # Example
///
/// ```no_run
/// use candle_attack::{HfTokenizer, TokenCodec};
///
/// # fn main() -> candle_attack::Result<()> {
/// let tok = HfTokenizer::from_file("tokenizer.json")?;
/// let ids = tok.encode_raw("fn main()")?;
/// assert_eq!(tok.decode(&ids)?, "fn main()");
/// # Ok(())
/// # }
/// ```
pub struct HfTokenizer {
    /// The wrapped tokenizer.
    inner: Box<tokenizers::Tokenizer>,
    /// Padding id (from padding params or an override).
    pad_id: Option<u32>,
    /// End-of-sequence id.
    eos_id: Option<u32>,
    /// Unknown-token id.
    unk_id: Option<u32>,
}

impl HfTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`AttackError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            AttackError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::new(tok))
    }

    /// Wrap an already-loaded tokenizer, probing its special tokens.
    #[must_use]
    pub fn new(tokenizer: tokenizers::Tokenizer) -> Self {
        let pad_id = tokenizer.get_padding().map(|p| p.pad_id);
        let eos_id = probe(&tokenizer, &EOS_CANDIDATES);
        let unk_id = probe(&tokenizer, &UNK_CANDIDATES);
        Self {
            inner: Box::new(tokenizer),
            pad_id,
            eos_id,
            unk_id,
        }
    }

    /// Override the padding id.
    #[must_use]
    pub fn with_pad_id(mut self, id: u32) -> Self {
        self.pad_id = Some(id);
        self
    }

    /// Override the end-of-sequence id.
    #[must_use]
    pub fn with_eos_id(mut self, id: u32) -> Self {
        self.eos_id = Some(id);
        self
    }

    /// Override the unknown-token id.
    #[must_use]
    pub fn with_unk_id(mut self, id: u32) -> Self {
        self.unk_id = Some(id);
        self
    }

    /// Access the wrapped tokenizer.
    #[must_use]
    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }

    /// Shared encode path.
    fn encode_with(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| AttackError::Tokenizer(format!("HF encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Shared decode path.
    fn decode_with(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| AttackError::Tokenizer(format!("HF decode failed: {e}")))
    }
}

/// First candidate token string present in the vocabulary.
fn probe(tokenizer: &tokenizers::Tokenizer, candidates: &[&str]) -> Option<u32> {
    candidates.iter().find_map(|tok| tokenizer.token_to_id(tok))
}

impl TokenCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, true)
    }

    fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        self.encode_with(text, false)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.decode_with(ids, false)
    }

    fn decode_skip_special(&self, ids: &[u32]) -> Result<String> {
        self.decode_with(ids, true)
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn special_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .inner
            .get_added_tokens_decoder()
            .iter()
            .filter(|(_, token)| token.special)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn pad_id(&self) -> Option<u32> {
        self.pad_id
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }

    fn unk_id(&self) -> Option<u32> {
        self.unk_id
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.inner.get_vocab_size(true))
            .field("pad_id", &self.pad_id)
            .field("eos_id", &self.eos_id)
            .field("unk_id", &self.unk_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Minimal codec exercising the provided trait methods.
    struct Fixed;

    impl TokenCodec for Fixed {
        fn encode(&self, _text: &str) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }
        fn encode_raw(&self, _text: &str) -> Result<Vec<u32>> {
            Ok(Vec::new())
        }
        fn decode(&self, _ids: &[u32]) -> Result<String> {
            Ok(String::new())
        }
        fn decode_skip_special(&self, _ids: &[u32]) -> Result<String> {
            Ok(String::new())
        }
        fn id_to_token(&self, id: u32) -> Option<String> {
            (id < 3).then(|| format!("t{id}"))
        }
        fn vocab_size(&self) -> usize {
            3
        }
        fn special_ids(&self) -> Vec<u32> {
            Vec::new()
        }
        fn pad_id(&self) -> Option<u32> {
            None
        }
        fn eos_id(&self) -> Option<u32> {
            Some(2)
        }
        fn unk_id(&self) -> Option<u32> {
            None
        }
    }

    #[test]
    fn convert_ids_to_tokens_maps_unknown_to_empty() {
        let tokens = Fixed.convert_ids_to_tokens(&[0, 2, 9]);
        assert_eq!(tokens, vec!["t0", "t2", ""]);
    }

    #[test]
    fn padding_id_falls_back_to_eos() {
        assert_eq!(Fixed.padding_id().unwrap(), 2);
    }

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<unk>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "</s>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "</s>": 1, "hello": 2, "world": 3},
            "unk_token": "<unk>"
        }
    }"#;

    fn word_level() -> HfTokenizer {
        let tok: tokenizers::Tokenizer = WORD_LEVEL.parse().unwrap();
        HfTokenizer::new(tok)
    }

    #[test]
    fn hf_special_tokens_are_probed() {
        let tok = word_level();
        assert_eq!(tok.vocab_size(), 4);
        assert_eq!(tok.special_ids(), vec![0, 1]);
        assert_eq!(tok.eos_id(), Some(1));
        assert_eq!(tok.unk_id(), Some(0));
        assert_eq!(tok.pad_id(), None);
        assert_eq!(tok.padding_id().unwrap(), 1);
        assert_eq!(tok.with_pad_id(3).padding_id().unwrap(), 3);
    }

    #[test]
    fn hf_encode_and_decode() {
        let tok = word_level();
        assert_eq!(tok.encode_raw("hello world").unwrap(), vec![2, 3]);
        assert_eq!(tok.id_to_token(3).as_deref(), Some("world"));
        assert_eq!(tok.decode_skip_special(&[2, 3, 1]).unwrap(), "hello world");
    }
}
