use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::{
    constants::{DROPOUT, D_MODEL, FFN_HIDDEN_DIM, HEADS, LAYERS, MAX_SEQUENCE_LENGTH},
    error::ModelError,
};

/// How the causal mask is applied to attention scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum MaskMode {
    /// Scores at positions where the mask is zero are overwritten with `MASK_FILL_VALUE`
    /// (1e-9); positions above the diagonal keep their raw score.
    #[default]
    NearZeroFill,
    /// The mask is added to the scores, so positions above the diagonal become -inf.
    Additive,
}

/// Sublayer wiring of a decoder layer.
///
/// The default reproduces the reduced layer: no skip connections, and the self-attention
/// sublayer applied a second time where a canonical block would run its feed-forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecoderVariant {
    /// Add each sublayer's output back onto its input.
    pub residual: bool,
    /// Use the position-wise feed-forward block as the second sublayer.
    pub feed_forward: bool,
}

/// Architecture of the decoder-only transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: i64,
    pub d_model: i64,
    pub n_layers: usize,
    pub heads: i64,
    pub dropout: f64,
    pub d_ff: i64,
    pub max_seq_len: i64,
    pub variant: DecoderVariant,
    pub mask_mode: MaskMode,
}

impl ModelConfig {
    pub fn new(vocab_size: i64) -> Self {
        ModelConfig {
            vocab_size,
            d_model: D_MODEL,
            n_layers: LAYERS,
            heads: HEADS,
            dropout: DROPOUT,
            d_ff: FFN_HIDDEN_DIM,
            max_seq_len: MAX_SEQUENCE_LENGTH,
            variant: DecoderVariant::default(),
            mask_mode: MaskMode::default(),
        }
    }

    /// Per-head width.
    pub fn d_k(&self) -> i64 {
        self.d_model / self.heads
    }

    /// Rejects configurations the model cannot be built from.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.heads <= 0 || self.d_model % self.heads != 0 {
            return Err(ModelError::IndivisibleHeads {
                d_model: self.d_model,
                heads: self.heads,
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::InvalidDropout(self.dropout));
        }
        // The sinusoidal table fills columns in (sin, cos) pairs.
        if self.d_model < 2 || self.d_model % 2 != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "d_model must be even and at least 2, got {}",
                self.d_model
            )));
        }
        if self.vocab_size <= 0 {
            return Err(ModelError::InvalidConfig("vocab_size must be positive".into()));
        }
        if self.n_layers == 0 {
            return Err(ModelError::InvalidConfig("n_layers must be positive".into()));
        }
        if self.d_ff <= 0 || self.max_seq_len <= 0 {
            return Err(ModelError::InvalidConfig(
                "d_ff and max_seq_len must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub sequence_length: usize,
    pub use_cosine_restarts: bool,
    /// Steps in the first restart cycle; `None` means one epoch's worth of batches.
    pub t_max: Option<usize>,
    pub eta_min: f64,
    pub factor: f64,
    pub device: String,
    pub checkpoint_dir: PathBuf,
    pub load_path: Option<PathBuf>,
    pub seed: u64,
    pub shuffle: bool,
}

/// Resolves a device name (`cpu`, `cuda`, `cuda:N`, `mps`).
pub fn parse_device(name: &str) -> anyhow::Result<Device> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "mps" => Ok(Device::Mps),
        "cuda" => Ok(Device::Cuda(0)),
        other => match other.strip_prefix("cuda:") {
            Some(index) => Ok(Device::Cuda(index.parse()?)),
            None => Err(anyhow::anyhow!("unknown device: {}", other)),
        },
    }
}

/// Inverse of `parse_device`, used when recording the resolved configuration.
pub fn device_name(device: Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(index) => format!("cuda:{}", index),
        Device::Mps => "mps".to_string(),
        other => format!("{:?}", other).to_lowercase(),
    }
}
