use std::{collections::HashMap, path::Path as FsPath};

use tch::{
    Device, Tensor,
    nn::{Linear, Path, VarStore, linear},
};
use tracing::info;

use crate::{
    attention::MultiHeadAttention,
    config::{DecoderVariant, ModelConfig},
    error::ModelError,
    layers::{Embedder, FeedForward, Norm, PositionalEncoder},
};

/// One decoder layer: norm -> masked self-attention -> dropout, followed by a second
/// sublayer chosen by `DecoderVariant`.
///
/// With the default variant the second sublayer re-applies the same self-attention
/// through `norm_2`, and no sublayer adds its input back. `norm_3` and `ff` are always
/// registered so every variant shares one checkpoint layout and parameter count.
struct DecoderLayer {
    norm_1: Norm,
    norm_2: Norm,
    attn_1: MultiHeadAttention,
    ff: FeedForward,
    dropout: f64,
    variant: DecoderVariant,
}

impl DecoderLayer {
    fn new(vs: &Path, config: &ModelConfig) -> Self {
        // Registered but never read by either wiring.
        let _norm_3 = Norm::new(&(vs / "norm_3"), config.d_model);
        DecoderLayer {
            norm_1: Norm::new(&(vs / "norm_1"), config.d_model),
            norm_2: Norm::new(&(vs / "norm_2"), config.d_model),
            attn_1: MultiHeadAttention::new(
                &(vs / "attn_1"),
                config.heads,
                config.d_model,
                config.dropout,
                config.mask_mode,
            ),
            ff: FeedForward::new(&(vs / "ff"), config.d_model, config.d_ff, config.dropout),
            dropout: config.dropout,
            variant: config.variant,
        }
    }

    fn self_attend(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        self.attn_1
            .forward_t(xs, xs, xs, Some(mask), train)
            .dropout(self.dropout, train)
    }

    fn add_residual(&self, input: &Tensor, sublayer: Tensor) -> Tensor {
        if self.variant.residual {
            input + sublayer
        } else {
            sublayer
        }
    }

    fn forward_t(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Tensor {
        let x2 = self.norm_1.forward(xs);
        let xs = self.add_residual(xs, self.self_attend(&x2, mask, train));
        let x2 = self.norm_2.forward(&xs);
        let second = if self.variant.feed_forward {
            self.ff.forward_t(&x2, train).dropout(self.dropout, train)
        } else {
            self.self_attend(&x2, mask, train)
        };
        self.add_residual(&xs, second)
    }
}

/// Embedding, positional encoding, `n_layers` independently parameterized decoder
/// layers, and a final norm.
struct Decoder {
    embed: Embedder,
    pe: PositionalEncoder,
    layers: Vec<DecoderLayer>,
    norm: Norm,
}

impl Decoder {
    fn new(vs: &Path, config: &ModelConfig) -> Self {
        let layers_path = vs / "layers";
        let layers = (0..config.n_layers)
            .map(|i| DecoderLayer::new(&(&layers_path / i), config))
            .collect();
        Decoder {
            embed: Embedder::new(vs, config.vocab_size, config.d_model),
            pe: PositionalEncoder::new(
                config.d_model,
                config.max_seq_len,
                config.dropout,
                vs.device(),
            ),
            layers,
            norm: Norm::new(&(vs / "norm"), config.d_model),
        }
    }

    fn forward_t(&self, trg: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor, ModelError> {
        // [batch, seq_len] -> [batch, seq_len, d_model]
        let embedded = self.embed.forward(trg)?;
        let mut xs = self.pe.forward_t(&embedded, train)?;
        for layer in &self.layers {
            xs = layer.forward_t(&xs, mask, train);
        }
        Ok(self.norm.forward(&xs))
    }
}

/// Decoder-only transformer language model producing per-token vocabulary logits.
pub struct Transformer {
    decoder: Decoder,
    out: Linear,
}

impl Transformer {
    pub fn new(vs: &Path, config: &ModelConfig) -> Result<Self, ModelError> {
        config.validate()?;
        Ok(Transformer {
            decoder: Decoder::new(&(vs / "decoder"), config),
            out: linear(vs / "out", config.d_model, config.vocab_size, Default::default()),
        })
    }

    /// Takes token ids `[batch, seq_len]` and a `[seq_len, seq_len]` causal mask and
    /// returns logits `[batch, seq_len, vocab_size]`.
    pub fn forward_t(&self, trg: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor, ModelError> {
        // [batch, seq_len, d_model] -> [batch, seq_len, vocab_size]
        Ok(self.decoder.forward_t(trg, mask, train)?.apply(&self.out))
    }

    /// Most likely next token at every position, `[batch, seq_len]`.
    #[cfg(test)]
    pub fn predict(&self, trg: &Tensor) -> Result<Tensor, ModelError> {
        let _no_grad = tch::no_grad_guard();
        let mask = crate::attention::causal_mask(trg.size()[1], trg.device());
        Ok(self.forward_t(trg, &mask, false)?.argmax(-1, false))
    }
}

/// Builds a model on `device`, either loading `load_path` or Xavier-initializing it.
pub fn build_model(
    config: &ModelConfig,
    device: Device,
    load_path: Option<&FsPath>,
) -> Result<(VarStore, Transformer), ModelError> {
    let mut var_store = VarStore::new(device);
    let model = Transformer::new(&var_store.root(), config)?;
    match load_path {
        Some(path) => {
            info!("loading pretrained weights from {}", path.display());
            load_checkpoint(&mut var_store, path)?;
        }
        None => xavier_uniform_init(&var_store),
    }
    Ok((var_store, model))
}

/// Re-initializes every parameter with more than one dimension from
/// U(-a, a), a = sqrt(6 / (fan_in + fan_out)). 1-D parameters keep their defaults.
pub fn xavier_uniform_init(var_store: &VarStore) {
    let mut variables: Vec<(String, Tensor)> = var_store.variables().into_iter().collect();
    // Fixed order so a seeded run draws the same values for the same parameter.
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    tch::no_grad(|| {
        for (_, mut var) in variables {
            let size = var.size();
            if size.len() < 2 {
                continue;
            }
            let receptive: i64 = size[2..].iter().product();
            let fan_in = size[1] * receptive;
            let fan_out = size[0] * receptive;
            let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
            let _ = var.uniform_(-bound, bound);
        }
    });
}

/// Loads a checkpoint written by `VarStore::save`. Every model parameter must be
/// present with the same shape and the file must hold nothing else; otherwise
/// nothing is loaded.
pub fn load_checkpoint(var_store: &mut VarStore, path: &FsPath) -> Result<(), ModelError> {
    let saved: HashMap<String, Tensor> = Tensor::load_multi(path)?.into_iter().collect();
    let variables = var_store.variables();
    for (name, var) in &variables {
        match saved.get(name) {
            None => {
                return Err(ModelError::CheckpointMismatch(format!(
                    "missing parameter {}",
                    name
                )));
            }
            Some(tensor) if tensor.size() != var.size() => {
                return Err(ModelError::CheckpointMismatch(format!(
                    "{} has shape {:?}, expected {:?}",
                    name,
                    tensor.size(),
                    var.size()
                )));
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = saved.keys().find(|name| !variables.contains_key(*name)) {
        return Err(ModelError::CheckpointMismatch(format!(
            "unexpected parameter {}",
            extra
        )));
    }
    var_store.load(path)?;
    Ok(())
}

/// Number of trainable scalars.
pub fn parameter_count(var_store: &VarStore) -> usize {
    var_store.trainable_variables().iter().map(Tensor::numel).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{attention::causal_mask, config::MaskMode};
    use tch::{Kind, nn};

    const VOCAB: i64 = 11;

    fn small_config() -> ModelConfig {
        ModelConfig {
            d_model: 8,
            n_layers: 2,
            heads: 2,
            dropout: 0.0,
            d_ff: 16,
            max_seq_len: 32,
            ..ModelConfig::new(VOCAB)
        }
    }

    fn sample_input() -> Tensor {
        Tensor::from_slice2(&[&[1i64, 2, 3, 4, 5], &[10, 9, 8, 7, 0]])
    }

    fn logits(model: &Transformer, input: &Tensor) -> Tensor {
        let mask = causal_mask(input.size()[1], Device::Cpu);
        model.forward_t(input, &mask, false).unwrap()
    }

    #[test]
    fn test_output_shape_and_predictions() {
        let (_vs, model) = build_model(&small_config(), Device::Cpu, None).unwrap();
        let input = sample_input();
        assert_eq!(logits(&model, &input).size(), &[2, 5, VOCAB]);

        let predicted = model.predict(&input).unwrap();
        assert_eq!(predicted.size(), &[2, 5]);
        let max = i64::try_from(&predicted.max()).unwrap();
        let min = i64::try_from(&predicted.min()).unwrap();
        assert!(min >= 0 && max < VOCAB);
    }

    #[test]
    fn test_every_variant_keeps_shape() {
        for residual in [false, true] {
            for feed_forward in [false, true] {
                for mask_mode in [MaskMode::NearZeroFill, MaskMode::Additive] {
                    let config = ModelConfig {
                        variant: DecoderVariant { residual, feed_forward },
                        mask_mode,
                        ..small_config()
                    };
                    let (_vs, model) = build_model(&config, Device::Cpu, None).unwrap();
                    assert_eq!(logits(&model, &sample_input()).size(), &[2, 5, VOCAB]);
                }
            }
        }
    }

    #[test]
    fn test_every_variant_has_the_same_parameters() {
        let (vs, _model) = build_model(&small_config(), Device::Cpu, None).unwrap();
        let default_names = vs.variables();
        for suffix in ["ff.linear_1.weight", "ff.linear_2.bias", "norm_3.alpha", "norm_3.bias"] {
            for layer in 0..2 {
                let name = format!("decoder.layers.{}.{}", layer, suffix);
                assert!(default_names.contains_key(&name), "missing {}", name);
            }
        }

        let config = ModelConfig {
            variant: DecoderVariant { residual: true, feed_forward: true },
            ..small_config()
        };
        let (canonical_vs, _model) = build_model(&config, Device::Cpu, None).unwrap();
        let mut names: Vec<String> = default_names.into_keys().collect();
        let mut canonical_names: Vec<String> = canonical_vs.variables().into_keys().collect();
        names.sort();
        canonical_names.sort();
        assert_eq!(names, canonical_names);
        assert_eq!(parameter_count(&vs), parameter_count(&canonical_vs));
    }

    #[test]
    fn test_layers_are_independent() {
        let (vs, _model) = build_model(&small_config(), Device::Cpu, None).unwrap();
        let variables = vs.variables();
        let layer_weight = |layer: usize| {
            variables
                .iter()
                .find(|(name, _)| {
                    name.contains(&format!("layers.{}.", layer)) && name.ends_with("q_linear.weight")
                })
                .map(|(_, tensor)| tensor.shallow_clone())
                .unwrap()
        };
        let first = layer_weight(0);
        let second = layer_weight(1);
        assert!(!first.allclose(&second, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_invalid_config_is_rejected_at_construction() {
        let config = ModelConfig {
            heads: 3,
            ..small_config()
        };
        assert!(matches!(
            build_model(&config, Device::Cpu, None),
            Err(ModelError::IndivisibleHeads { .. })
        ));
    }

    #[test]
    fn test_out_of_range_token_is_an_error() {
        let (_vs, model) = build_model(&small_config(), Device::Cpu, None).unwrap();
        let input = Tensor::from_slice2(&[&[1i64, VOCAB]]);
        let mask = causal_mask(2, Device::Cpu);
        assert!(matches!(
            model.forward_t(&input, &mask, false),
            Err(ModelError::TokenOutOfRange { .. })
        ));
    }

    #[test]
    fn test_sequence_longer_than_encoder_is_an_error() {
        let config = ModelConfig {
            max_seq_len: 4,
            ..small_config()
        };
        let (_vs, model) = build_model(&config, Device::Cpu, None).unwrap();
        assert!(matches!(
            model.predict(&sample_input()),
            Err(ModelError::SequenceTooLong { len: 5, max: 4 })
        ));
    }

    #[test]
    fn test_xavier_bounds_and_variance() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _layer = linear(vs.root() / "probe", 256, 256, Default::default());
        xavier_uniform_init(&vs);
        let variables = vs.variables();
        let weight = &variables["probe.weight"];
        let bound = (6.0f64 / 512.0).sqrt();
        let max = f64::try_from(&weight.abs().max()).unwrap();
        assert!(max <= bound + 1e-6);
        // U(-a, a) has variance a^2 / 3 = 2 / (fan_in + fan_out).
        let expected = 2.0 / 512.0;
        let variance = f64::try_from(&weight.var(true)).unwrap();
        assert!((variance - expected).abs() < 0.1 * expected, "variance {}", variance);
    }

    #[test]
    fn test_xavier_leaves_one_dimensional_parameters() {
        let (vs, _model) = build_model(&small_config(), Device::Cpu, None).unwrap();
        for (name, tensor) in vs.variables() {
            if name.ends_with("alpha") {
                let ones = tensor.ones_like();
                assert!(tensor.allclose(&ones, 0.0, 0.0, false), "{} changed", name);
            } else if name.ends_with("norm_1.bias") || name.ends_with("norm.bias") {
                assert_eq!(f64::try_from(&tensor.abs().sum(Kind::Float)).unwrap(), 0.0);
            }
        }
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ot");
        let (vs, model) = build_model(&small_config(), Device::Cpu, None).unwrap();
        vs.save(&path).unwrap();

        let (_loaded_vs, loaded) = build_model(&small_config(), Device::Cpu, Some(path.as_path())).unwrap();
        let input = sample_input();
        assert!(logits(&model, &input).allclose(&logits(&loaded, &input), 1e-6, 1e-6, false));
    }

    #[test]
    fn test_checkpoint_shape_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ot");
        let (vs, _model) = build_model(&small_config(), Device::Cpu, None).unwrap();
        vs.save(&path).unwrap();

        let wider = ModelConfig {
            d_model: 16,
            ..small_config()
        };
        assert!(matches!(
            build_model(&wider, Device::Cpu, Some(path.as_path())),
            Err(ModelError::CheckpointMismatch(_))
        ));
        let deeper = ModelConfig {
            n_layers: 3,
            ..small_config()
        };
        assert!(matches!(
            build_model(&deeper, Device::Cpu, Some(path.as_path())),
            Err(ModelError::CheckpointMismatch(_))
        ));
    }
}
