use tch::{
    Device,
    Kind::Float,
    Tensor,
    nn::{Linear, Path, linear},
};

use crate::{config::MaskMode, constants::MASK_FILL_VALUE};

/// Builds the `[size, size]` causal mask: -inf strictly above the diagonal, 0 elsewhere.
pub fn causal_mask(size: i64, device: Device) -> Tensor {
    Tensor::full([size, size], f64::NEG_INFINITY, (Float, device)).triu(1)
}

/// Scaled dot-product attention over tensors shaped `[batch, heads, seq_len, d_k]`.
///
/// A `[seq_len, seq_len]` mask is broadcast across batch and heads and applied
/// according to `mode` before the softmax.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    d_k: i64,
    mask: Option<&Tensor>,
    mode: MaskMode,
    dropout: f64,
    train: bool,
) -> Tensor {
    // [batch, heads, seq_len, seq_len]
    let mut scores = q.matmul(&k.transpose(-2, -1)) / (d_k as f64).sqrt();
    if let Some(mask) = mask {
        let size = q.size();
        // [seq_len, seq_len] -> [batch, heads, seq_len, seq_len]
        let mask = mask.expand([size[0], size[1], -1, -1], false);
        scores = match mode {
            MaskMode::NearZeroFill => scores.masked_fill(&mask.eq(0.0), MASK_FILL_VALUE),
            MaskMode::Additive => scores + mask,
        };
    }
    // [batch, heads, seq_len, d_k]
    scores
        .softmax(-1, Float)
        .dropout(dropout, train)
        .matmul(v)
}

/// Multi-head attention: project Q/K/V, split `d_model` into `heads` slices of
/// width `d_k`, attend per head, concatenate, and project back to `d_model`.
pub struct MultiHeadAttention {
    q_linear: Linear,
    k_linear: Linear,
    v_linear: Linear,
    out: Linear,
    heads: i64,
    d_k: i64,
    d_model: i64,
    dropout: f64,
    mask_mode: MaskMode,
}

impl MultiHeadAttention {
    /// `d_model` must be divisible by `heads`; `ModelConfig::validate` enforces this
    /// before any layer is built.
    pub fn new(vs: &Path, heads: i64, d_model: i64, dropout: f64, mask_mode: MaskMode) -> Self {
        MultiHeadAttention {
            q_linear: linear(vs / "q_linear", d_model, d_model, Default::default()),
            k_linear: linear(vs / "k_linear", d_model, d_model, Default::default()),
            v_linear: linear(vs / "v_linear", d_model, d_model, Default::default()),
            out: linear(vs / "out", d_model, d_model, Default::default()),
            heads,
            d_k: d_model / heads,
            d_model,
            dropout,
            mask_mode,
        }
    }

    /// Inputs are `[batch, seq_len, d_model]`; so is the output.
    pub fn forward_t(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Tensor {
        let bs = q.size()[0];
        // [batch, seq_len, d_model] -> [batch, heads, seq_len, d_k]
        let split = |xs: &Tensor, projection: &Linear| {
            xs.apply(projection)
                .view([bs, -1, self.heads, self.d_k])
                .transpose(1, 2)
        };
        let q = split(q, &self.q_linear);
        let k = split(k, &self.k_linear);
        let v = split(v, &self.v_linear);
        // [batch, heads, seq_len, d_k]
        let scores = attention(
            &q,
            &k,
            &v,
            self.d_k,
            mask,
            self.mask_mode,
            self.dropout,
            train,
        );
        // [batch, heads, seq_len, d_k] -> [batch, seq_len, d_model]
        scores
            .transpose(1, 2)
            .contiguous()
            .view([bs, -1, self.d_model])
            .apply(&self.out)
    }
}
