use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use serde_json::json;
use tch::Device;
use tracing::info;

use crate::{
    config::{DecoderVariant, MaskMode, ModelConfig, TrainConfig, device_name, parse_device},
    constants::{DROPOUT, D_MODEL, FFN_HIDDEN_DIM, HEADS, LAYERS, MAX_SEQUENCE_LENGTH, SEQUENCE_LENGTH},
    dataset::{BlockDataset, DataLoader},
    metrics::write_json,
    tokenizer::{LineEncoder, Tokenizer, load_pretrained, read_corpus},
    train::Trainer,
};

/// Train a decoder-only transformer language model on a word-level corpus and report
/// loss and perplexity.
#[derive(Parser, Debug)]
#[command(name = "wikigpt", version)]
pub struct Cli {
    /// Training corpus, one passage per line.
    #[arg(long, default_value = "wiki2.train.txt")]
    pub train: PathBuf,
    #[arg(long, default_value = "wiki2.valid.txt")]
    pub valid: PathBuf,
    #[arg(long, default_value = "wiki2.test.txt")]
    pub test: PathBuf,
    /// Pretrained `tokenizer.json` (e.g. GPT-2 BPE). Without it a word vocabulary is
    /// fitted on the training corpus.
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// Run on the CPU even if `--device` names an accelerator.
    #[arg(long)]
    pub no_cuda: bool,
    #[arg(long, default_value = "cuda")]
    pub device: String,

    /// Step a cosine-with-restarts learning rate schedule after every update.
    #[arg(long)]
    pub sgdr: bool,
    /// Steps in the first restart cycle (defaults to one epoch of batches).
    #[arg(long)]
    pub t_max: Option<usize>,
    #[arg(long, default_value_t = 0.0)]
    pub eta_min: f64,
    /// Cycle length multiplier applied at every restart.
    #[arg(long, default_value_t = 1.0)]
    pub factor: f64,

    #[arg(long, default_value_t = 20)]
    pub epochs: usize,
    #[arg(long, default_value_t = D_MODEL)]
    pub d_model: i64,
    #[arg(long, default_value_t = LAYERS)]
    pub n_layers: usize,
    #[arg(long, default_value_t = HEADS)]
    pub heads: i64,
    #[arg(long, default_value_t = DROPOUT)]
    pub dropout: f64,
    #[arg(long, default_value_t = FFN_HIDDEN_DIM)]
    pub d_ff: i64,
    #[arg(long, default_value_t = MAX_SEQUENCE_LENGTH)]
    pub max_seq_len: i64,
    #[arg(long, default_value_t = 16)]
    pub batchsize: usize,
    #[arg(long, default_value_t = 1e-5)]
    pub lr: f64,
    /// Tokens per training example.
    #[arg(long, default_value_t = SEQUENCE_LENGTH)]
    pub seqlen: usize,

    /// Add skip connections around each decoder sublayer.
    #[arg(long)]
    pub residual: bool,
    /// Use the feed-forward block as each decoder layer's second sublayer.
    #[arg(long)]
    pub feed_forward: bool,
    #[arg(long, value_enum, default_value_t = MaskMode::NearZeroFill)]
    pub mask_mode: MaskMode,

    /// Checkpoint to initialize the model from instead of Xavier initialization.
    #[arg(long)]
    pub loadname: Option<PathBuf>,
    /// Run directory name under `saved/`.
    #[arg(long, default_value = "model")]
    pub dir_name: String,
    #[arg(long, default_value_t = 10)]
    pub seed: u64,
    #[arg(long)]
    pub no_shuffle: bool,
}

impl Cli {
    fn resolve_device(&self) -> Result<Device> {
        if self.no_cuda {
            return Ok(Device::Cpu);
        }
        let device = parse_device(&self.device)?;
        if matches!(device, Device::Cuda(_)) && !tch::Cuda::is_available() {
            bail!("CUDA was requested but is not available (pass --no-cuda to run on the CPU)");
        }
        Ok(device)
    }

    fn model_config(&self, vocab_size: i64) -> ModelConfig {
        ModelConfig {
            vocab_size,
            d_model: self.d_model,
            n_layers: self.n_layers,
            heads: self.heads,
            dropout: self.dropout,
            d_ff: self.d_ff,
            max_seq_len: self.max_seq_len,
            variant: DecoderVariant {
                residual: self.residual,
                feed_forward: self.feed_forward,
            },
            mask_mode: self.mask_mode,
        }
    }

    fn train_config(&self, run_dir: &std::path::Path, device: Device) -> TrainConfig {
        TrainConfig {
            epochs: self.epochs,
            batch_size: self.batchsize,
            learning_rate: self.lr,
            sequence_length: self.seqlen,
            use_cosine_restarts: self.sgdr,
            t_max: self.t_max,
            eta_min: self.eta_min,
            factor: self.factor,
            device: device_name(device),
            checkpoint_dir: run_dir.join("checkpoints"),
            load_path: self.loadname.clone(),
            seed: self.seed,
            shuffle: !self.no_shuffle,
        }
    }

    pub fn run(self) -> Result<()> {
        let device = self.resolve_device()?;
        let run_dir = PathBuf::from("saved").join(&self.dir_name);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;

        let tokenizer: Box<dyn LineEncoder> = match &self.tokenizer {
            Some(path) => Box::new(load_pretrained(path)?),
            None => {
                let train_text = fs::read_to_string(&self.train)
                    .with_context(|| format!("failed to read corpus {}", self.train.display()))?;
                Box::new(Tokenizer::fit(&train_text))
            }
        };
        let train_ids = read_corpus(&self.train, &*tokenizer)?;
        let valid_ids = read_corpus(&self.valid, &*tokenizer)?;
        let test_ids = read_corpus(&self.test, &*tokenizer)?;
        info!(
            vocab_size = tokenizer.vocab_size(),
            train = train_ids.len(),
            valid = valid_ids.len(),
            test = test_ids.len(),
            "corpus loaded"
        );

        let model_config = self.model_config(tokenizer.vocab_size());
        model_config.validate()?;
        let train_config = self.train_config(&run_dir, device);
        write_json(
            &run_dir.join("config.json"),
            &json!({ "model": model_config, "train": train_config }),
        )?;

        let loader = |ids: &[i64], seed: u64| {
            DataLoader::new(
                BlockDataset::new(ids, train_config.sequence_length),
                train_config.batch_size,
                train_config.shuffle,
                seed,
            )
        };
        let mut train_data = loader(&train_ids, self.seed);
        let mut valid_data = loader(&valid_ids, self.seed.wrapping_add(1));
        let mut test_data = loader(&test_ids, self.seed.wrapping_add(2));
        for (split, data) in [("train", &train_data), ("valid", &valid_data), ("test", &test_data)] {
            ensure!(!data.is_empty(), "the {} split is too short to form an example", split);
        }

        let mut trainer = Trainer::new(&model_config, train_config, device, train_data.len())?;
        let history = trainer.train(&mut train_data, &mut valid_data)?;
        if let (Some(train), Some(valid)) = (
            history.train_perplexities().last().copied(),
            history.valid_perplexities().into_iter().reduce(f64::min),
        ) {
            info!(
                final_train_perplexity = train,
                best_valid_perplexity = valid,
                "training finished"
            );
        }
        history.write_csv(&run_dir.join("metrics.csv"))?;
        write_json(&run_dir.join("history.json"), &history)?;

        let test = trainer.test(&mut test_data)?;
        write_json(&run_dir.join("test_metrics.json"), &test)?;
        Ok(())
    }
}
