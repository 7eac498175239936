// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat formatting for batched optimizer rows.
//!
//! Supported formats:
//! - **Raw**: plain concatenation, no markup
//! - **ChatML**: `<|im_start|>user\n...<|im_end|>\n`
//! - **LLaMA 2**: `<s>[INST] ... [/INST] ...</s>`
//! - **Custom**: caller-supplied role prefixes and suffixes
//!
//! A template renders exactly one user turn, optionally followed by the
//! assistant response and the generation prompt.

use std::str::FromStr;

use crate::error::{AttackError, Result};

/// Role markers for a [`PromptTemplate::Custom`] format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomTemplate {
    /// Text before the user content.
    pub user_prefix: String,
    /// Text after the user content.
    pub user_suffix: String,
    /// Text before the assistant content; also the generation prompt.
    pub assistant_prefix: String,
    /// Text after the assistant content.
    pub assistant_suffix: String,
}

/// How a user turn (and optional response) is laid out as text.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PromptTemplate {
    /// `user` followed directly by `response`.
    #[default]
    Raw,
    /// ChatML (Qwen, `OpenHermes`, Yi).
    ChatMl,
    /// LLaMA 2 / Vicuna instruction format.
    Llama2,
    /// Explicit role markers.
    Custom(CustomTemplate),
}

impl PromptTemplate {
    /// Render one user turn.
    ///
    /// `response` appends a completed assistant turn; `add_generation_prompt`
    /// appends the header that opens a new assistant turn.
    #[must_use]
    pub fn render(&self, user: &str, response: Option<&str>, add_generation_prompt: bool) -> String {
        match self {
            Self::Raw => format!("{user}{}", response.unwrap_or_default()),
            Self::ChatMl => {
                let mut out = format!("<|im_start|>user\n{user}<|im_end|>\n");
                if let Some(response) = response {
                    out.push_str("<|im_start|>assistant\n");
                    out.push_str(response);
                    out.push_str("<|im_end|>\n");
                }
                if add_generation_prompt {
                    out.push_str("<|im_start|>assistant\n");
                }
                out
            }
            // LLaMA 2 has no generation header: the model continues after [/INST].
            Self::Llama2 => {
                let mut out = format!("<s>[INST] {user} [/INST]");
                if let Some(response) = response {
                    out.push(' ');
                    out.push_str(response);
                    out.push_str("</s>");
                }
                out
            }
            Self::Custom(t) => {
                let mut out = format!("{}{user}{}", t.user_prefix, t.user_suffix);
                if let Some(response) = response {
                    out.push_str(&t.assistant_prefix);
                    out.push_str(response);
                    out.push_str(&t.assistant_suffix);
                }
                if add_generation_prompt {
                    out.push_str(&t.assistant_prefix);
                }
                out
            }
        }
    }
}

impl FromStr for PromptTemplate {
    type Err = AttackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "chatml" => Ok(Self::ChatMl),
            "llama2" => Ok(Self::Llama2),
            other => Err(AttackError::Config(format!(
                "unknown prompt template {other:?} (expected raw, chatml or llama2)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn raw_concatenates() {
        let t = PromptTemplate::Raw;
        assert_eq!(t.render("ab", Some("cd"), true), "abcd");
        assert_eq!(t.render("ab", None, false), "ab");
    }

    #[test]
    fn chatml_full_and_generation_forms() {
        let t = PromptTemplate::ChatMl;
        assert_eq!(
            t.render("Hi", Some("Yo"), true),
            "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\nYo<|im_end|>\n<|im_start|>assistant\n"
        );
        assert_eq!(t.render("Hi", None, false), "<|im_start|>user\nHi<|im_end|>\n");
    }

    #[test]
    fn llama2_wraps_instruction() {
        let t = PromptTemplate::Llama2;
        assert_eq!(t.render("Hi", Some("Yo"), true), "<s>[INST] Hi [/INST] Yo</s>");
        assert_eq!(t.render("Hi", None, false), "<s>[INST] Hi [/INST]");
    }

    #[test]
    fn custom_markers() {
        let t = PromptTemplate::Custom(CustomTemplate {
            user_prefix: "U:".into(),
            user_suffix: "\n".into(),
            assistant_prefix: "A:".into(),
            assistant_suffix: "|".into(),
        });
        assert_eq!(t.render("x", Some("y"), true), "U:x\nA:y|A:");
        assert_eq!(t.render("x", None, false), "U:x\n");
    }

    #[test]
    fn parse_names() {
        assert_eq!("ChatML".parse::<PromptTemplate>().unwrap(), PromptTemplate::ChatMl);
        assert_eq!("raw".parse::<PromptTemplate>().unwrap(), PromptTemplate::Raw);
        assert!("alpaca".parse::<PromptTemplate>().is_err());
    }
}
