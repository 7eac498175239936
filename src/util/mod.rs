// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: masks, token spans, vocabulary filtering.

pub mod masks;
pub mod span;
pub mod vocab;
