// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures: a character tokenizer and small deterministic oracles.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]

use candle_attack::{AttackError, MeanPoolLm, Result, ScoringOracle, TokenCodec};
use candle_core::{DType, Device, Tensor};

/// Special tokens occupying the first ids: `<pad>` = 0, `<s>` = 1.
pub const SPECIALS: [&str; 2] = ["<pad>", "<s>"];

/// Characters after the specials: a=2 b=3 c=4 d=5 X=6 y=7 z=8 ' '=9.
pub const CHARS: &str = "abcdXyz ";

/// Id of `y`, the usual target.
pub const TARGET_ID: u32 = 7;

/// One token per character, BOS prepended by `encode`.
pub struct CharCodec {
    chars: Vec<char>,
}

impl CharCodec {
    pub fn new() -> Self {
        Self {
            chars: CHARS.chars().collect(),
        }
    }

    fn special_count() -> u32 {
        u32::try_from(SPECIALS.len()).unwrap()
    }

    fn char_of(&self, id: u32) -> Option<char> {
        let index = usize::try_from(id.checked_sub(Self::special_count())?).ok()?;
        self.chars.get(index).copied()
    }
}

impl TokenCodec for CharCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![1];
        ids.extend(self.encode_raw(text)?);
        Ok(ids)
    }

    fn encode_raw(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|c| {
                self.chars
                    .iter()
                    .position(|&k| k == c)
                    .map(|i| u32::try_from(i).unwrap() + Self::special_count())
                    .ok_or_else(|| AttackError::Tokenizer(format!("unknown character {c:?}")))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids.iter().filter_map(|&id| self.id_to_token(id)).collect())
    }

    fn decode_skip_special(&self, ids: &[u32]) -> Result<String> {
        Ok(ids.iter().filter_map(|&id| self.char_of(id)).collect())
    }

    fn id_to_token(&self, id: u32) -> Option<String> {
        usize::try_from(id)
            .ok()
            .and_then(|i| SPECIALS.get(i))
            .map(|s| (*s).to_owned())
            .or_else(|| self.char_of(id).map(String::from))
    }

    fn vocab_size(&self) -> usize {
        SPECIALS.len() + self.chars.len()
    }

    fn special_ids(&self) -> Vec<u32> {
        vec![0, 1]
    }

    fn pad_id(&self) -> Option<u32> {
        Some(0)
    }

    fn eos_id(&self) -> Option<u32> {
        None
    }

    fn unk_id(&self) -> Option<u32> {
        None
    }
}

/// Oracle whose logits at every position are `scale` times the embedding at
/// position 0, projected through a one-hot (identity) table.
///
/// With `scale > 0` the gradient at position 0 always points toward the
/// target id's embedding; with `scale == 0` every gradient is zero.
pub struct PositionZeroOracle {
    table: Tensor,
    scale: f64,
    device: Device,
}

impl PositionZeroOracle {
    pub fn new(vocab_size: usize, scale: f64) -> Self {
        let device = Device::Cpu;
        let mut data = vec![0.0_f32; vocab_size * vocab_size];
        for i in 0..vocab_size {
            data[i * vocab_size + i] = 1.0;
        }
        let table = Tensor::from_vec(data, (vocab_size, vocab_size), &device).unwrap();
        Self {
            table,
            scale,
            device,
        }
    }
}

impl ScoringOracle for PositionZeroOracle {
    fn vocab_size(&self) -> usize {
        self.table.dims()[0]
    }

    fn hidden_size(&self) -> usize {
        self.table.dims()[1]
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn embedding_table(&self) -> &Tensor {
        &self.table
    }

    fn forward_embeds(&self, embeds: &Tensor, _attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq_len, hidden) = embeds.dims3()?;
        let first = embeds
            .narrow(1, 0, 1)?
            .broadcast_as((batch, seq_len, hidden))?
            .affine(self.scale, 0.0)?
            .contiguous()?;
        Ok(first.broadcast_matmul(&self.table.t()?)?)
    }
}

/// Mean-pooling model over the [`CharCodec`] vocabulary with a fixed,
/// non-degenerate embedding table.
pub fn mean_pool_model() -> MeanPoolLm {
    let vocab = SPECIALS.len() + CHARS.len();
    let hidden = 4;
    let data: Vec<f32> = (0..vocab * hidden)
        .map(|k| {
            let (i, j) = (k / hidden, k % hidden);
            let v = ((i * 7 + j * 3 + i * j) % 11) as f32;
            v / 5.0 - 1.0
        })
        .collect();
    let table = Tensor::from_vec(data, (vocab, hidden), &Device::Cpu).unwrap();
    MeanPoolLm::from_tensors(table, None).unwrap()
}
