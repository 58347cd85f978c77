use tch::{
    Device,
    Kind::{Float, Int64},
    Tensor,
    nn::{Embedding, Init, Linear, Path, embedding, linear},
};

use crate::{constants::NORM_EPS, error::ModelError};

/// Token embedding lookup table of shape `[vocab_size, d_model]`.
pub struct Embedder {
    embed: Embedding,
    vocab_size: i64,
}

impl Embedder {
    pub fn new(vs: &Path, vocab_size: i64, d_model: i64) -> Self {
        let embed = embedding(vs / "embed", vocab_size, d_model, Default::default());
        Embedder { embed, vocab_size }
    }

    /// Takes token ids shaped `[batch, seq_len]` and returns `[batch, seq_len, d_model]`.
    /// Ids outside `[0, vocab_size)` are rejected before the lookup.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, ModelError> {
        if input.numel() > 0 {
            let min = i64::try_from(&input.min())?;
            let max = i64::try_from(&input.max())?;
            for id in [min, max] {
                if id < 0 || id >= self.vocab_size {
                    return Err(ModelError::TokenOutOfRange {
                        id,
                        vocab_size: self.vocab_size,
                    });
                }
            }
        }
        Ok(input.to_kind(Int64).apply(&self.embed))
    }
}

/// Fixed sinusoidal position signal, precomputed once for `max_seq_len` positions.
pub struct PositionalEncoder {
    pe: Tensor, // [max_seq_len, d_model], never trained
    d_model: i64,
    max_seq_len: i64,
    dropout: f64,
}

impl PositionalEncoder {
    pub fn new(d_model: i64, max_seq_len: i64, dropout: f64, device: Device) -> Self {
        let mut table = vec![0f32; (max_seq_len * d_model) as usize];
        for pos in 0..max_seq_len {
            // Columns come in (sin, cos) pairs sharing the frequency 1 / 10000^(2i / d_model).
            for col in (0..d_model).step_by(2) {
                let angle = pos as f64 / 10000f64.powf(col as f64 / d_model as f64);
                let row = (pos * d_model) as usize;
                table[row + col as usize] = angle.sin() as f32;
                table[row + col as usize + 1] = angle.cos() as f32;
            }
        }
        let pe = Tensor::from_slice(&table)
            .view([max_seq_len, d_model])
            .to_device(device);
        PositionalEncoder {
            pe,
            d_model,
            max_seq_len,
            dropout,
        }
    }

    /// Scales embeddings `[batch, seq_len, d_model]` by sqrt(d_model), adds the position
    /// table for the first `seq_len` positions, then applies dropout when training.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, ModelError> {
        let seq_len = xs.size()[1];
        if seq_len > self.max_seq_len {
            return Err(ModelError::SequenceTooLong {
                len: seq_len,
                max: self.max_seq_len,
            });
        }
        let scaled = xs * (self.d_model as f64).sqrt();
        let positioned = scaled + self.pe.narrow(0, 0, seq_len);
        Ok(positioned.dropout(self.dropout, train))
    }

    #[cfg(test)]
    pub fn table(&self) -> &Tensor {
        &self.pe
    }
}

/// Layer normalization over the feature dimension of each token, with a learnable
/// scale (`alpha`) and shift (`bias`).
pub struct Norm {
    alpha: Tensor,
    bias: Tensor,
    size: i64,
    eps: f64,
}

impl Norm {
    pub fn new(vs: &Path, d_model: i64) -> Self {
        Norm {
            alpha: vs.var("alpha", &[d_model], Init::Const(1.0)),
            bias: vs.var("bias", &[d_model], Init::Const(0.0)),
            size: d_model,
            eps: NORM_EPS,
        }
    }

    /// `alpha * (x - mean) / (std + eps) + bias`, where std is the unbiased standard
    /// deviation over the last dimension.
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let mean = xs.mean_dim(&[-1_i64][..], true, Float);
        let centered = xs - mean;
        let variance = centered
            .square()
            .sum_dim_intlist(&[-1_i64][..], true, Float)
            / (self.size - 1) as f64;
        let std = variance.sqrt();
        &self.alpha * centered / (std + self.eps) + &self.bias
    }
}

/// Position-wise two-layer MLP: linear -> relu -> dropout -> linear.
pub struct FeedForward {
    linear_1: Linear,
    linear_2: Linear,
    dropout: f64,
}

impl FeedForward {
    pub fn new(vs: &Path, d_model: i64, d_ff: i64, dropout: f64) -> Self {
        FeedForward {
            linear_1: linear(vs / "linear_1", d_model, d_ff, Default::default()),
            linear_2: linear(vs / "linear_2", d_ff, d_model, Default::default()),
            dropout,
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.linear_1)
            .relu()
            .dropout(self.dropout, train)
            .apply(&self.linear_2)
    }
}
