use std::{fs, path::PathBuf};

use tch::{
    Device, Reduction, Tensor,
    nn::{Adam, Optimizer, OptimizerConfig, VarStore},
};
use tracing::{debug, info};

use crate::{
    attention::causal_mask,
    config::{ModelConfig, TrainConfig},
    constants::{ADAM_BETA1, ADAM_BETA2, ADAM_EPS, CHECKPOINT_EVERY, IGNORE_INDEX},
    dataset::{Batch, DataLoader},
    error::TrainError,
    metrics::{EvalResult, TrainingHistory},
    model::{Transformer, build_model, parameter_count},
    scheduler::CosineWithRestarts,
};

/// Mean cross-entropy of logits `[batch, seq_len, vocab]` against targets
/// `[batch, seq_len]`, skipping positions whose target is `IGNORE_INDEX`.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor) -> Tensor {
    let vocab_size = logits.size()[2];
    logits.reshape([-1, vocab_size]).cross_entropy_loss::<Tensor>(
        &targets.reshape([-1]),
        None,
        Reduction::Mean,
        IGNORE_INDEX,
        0.0,
    )
}

/// Owns the model parameters, optimizer, and optional LR scheduler for one run.
pub struct Trainer {
    var_store: VarStore,
    model: Transformer,
    optimizer: Optimizer,
    scheduler: Option<CosineWithRestarts>,
    config: TrainConfig,
    device: Device,
}

impl Trainer {
    /// `steps_per_epoch` sizes the first restart cycle when `config.t_max` is unset.
    pub fn new(
        model_config: &ModelConfig,
        config: TrainConfig,
        device: Device,
        steps_per_epoch: usize,
    ) -> Result<Trainer, TrainError> {
        tch::manual_seed(config.seed as i64);
        let (var_store, model) = build_model(model_config, device, config.load_path.as_deref())?;
        info!("total params: {}", parameter_count(&var_store));

        let mut optimizer = Adam {
            beta1: ADAM_BETA1,
            beta2: ADAM_BETA2,
            eps: ADAM_EPS,
            ..Default::default()
        }
        .build(&var_store, config.learning_rate)?;

        let scheduler = if config.use_cosine_restarts {
            let t_max = config.t_max.unwrap_or(steps_per_epoch);
            let mut scheduler = CosineWithRestarts::new(
                vec![config.learning_rate],
                t_max,
                config.eta_min,
                config.factor,
            );
            // The first query hands back the base rate.
            optimizer.set_lr(scheduler.step()[0]);
            info!(t_max, "cosine annealing with warm restarts enabled");
            Some(scheduler)
        } else {
            None
        };

        Ok(Trainer {
            var_store,
            model,
            optimizer,
            scheduler,
            config,
            device,
        })
    }

    /// Trains for `config.epochs`, validating after each epoch and saving a checkpoint
    /// every `CHECKPOINT_EVERY` epochs.
    pub fn train(
        &mut self,
        train_data: &mut DataLoader,
        valid_data: &mut DataLoader,
    ) -> Result<TrainingHistory, TrainError> {
        info!("training model...");
        fs::create_dir_all(&self.config.checkpoint_dir)?;
        let mut history = TrainingHistory::default();
        for epoch in 0..self.config.epochs {
            let train = self.train_epoch(epoch, train_data.epoch())?;
            let valid = self.evaluate(valid_data, "valid", epoch)?;
            info!(
                "Epoch {}: Train Loss {:.4}, Train Perplexity {:.4}",
                epoch, train.loss, train.perplexity
            );
            info!(
                "Epoch {}: Valid Loss {:.4}, Valid Perplexity {:.4}",
                epoch, valid.loss, valid.perplexity
            );
            history.push(train, valid);
            if let Some(scheduler) = &self.scheduler {
                debug!(
                    restarts = scheduler.restarts(),
                    last_restart = scheduler.last_restart(),
                    cycle_len = scheduler.cycle_len(),
                    "scheduler state"
                );
            }

            if (epoch + 1) % CHECKPOINT_EVERY == 0 {
                let path = self.save_checkpoint(epoch + 1)?;
                info!("Model saved to {} at epoch {}", path.display(), epoch + 1);
            }
        }
        Ok(history)
    }

    /// One pass over the training batches, returning the average batch loss.
    fn train_epoch(
        &mut self,
        epoch: usize,
        data: impl Iterator<Item = Batch>,
    ) -> Result<EvalResult, TrainError> {
        let mut total_loss = 0.0;
        let mut batches = 0;
        for batch in data {
            let loss = self.train_step(&batch.to_device(self.device))?;
            if !loss.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    phase: "train",
                    epoch,
                    batch: batches,
                    loss,
                });
            }
            total_loss += loss;
            batches += 1;
        }
        if batches == 0 {
            return Err(TrainError::EmptySplit("train"));
        }
        Ok(EvalResult::from_average_loss(total_loss / batches as f64))
    }

    /// Forward, loss, backward, and one optimizer (and scheduler) step. A non-finite
    /// loss is returned without touching the parameters.
    fn train_step(&mut self, batch: &Batch) -> Result<f64, TrainError> {
        let mask = causal_mask(batch.seq_len(), self.device);
        let logits = self.model.forward_t(&batch.inputs, &mask, true)?;
        let loss = masked_cross_entropy(&logits, &batch.targets);
        let loss_value = f64::try_from(&loss)?;
        if !loss_value.is_finite() {
            return Ok(loss_value);
        }
        self.optimizer.zero_grad();
        loss.backward();
        self.optimizer.step();
        if let Some(scheduler) = &mut self.scheduler {
            let lr = scheduler.step()[0];
            self.optimizer.set_lr(lr);
            debug!(lr, "scheduler step");
        }
        Ok(loss_value)
    }

    /// Average loss and perplexity over `data` with gradients disabled and dropout off.
    pub fn evaluate(
        &self,
        data: &mut DataLoader,
        phase: &'static str,
        epoch: usize,
    ) -> Result<EvalResult, TrainError> {
        let _no_grad = tch::no_grad_guard();
        let mut total_loss = 0.0;
        let mut batches = 0;
        for batch in data.epoch() {
            let batch = batch.to_device(self.device);
            let mask = causal_mask(batch.seq_len(), self.device);
            let logits = self.model.forward_t(&batch.inputs, &mask, false)?;
            let loss = f64::try_from(&masked_cross_entropy(&logits, &batch.targets))?;
            if !loss.is_finite() {
                return Err(TrainError::NonFiniteLoss {
                    phase,
                    epoch,
                    batch: batches,
                    loss,
                });
            }
            total_loss += loss;
            batches += 1;
        }
        if batches == 0 {
            return Err(TrainError::EmptySplit(phase));
        }
        Ok(EvalResult::from_average_loss(total_loss / batches as f64))
    }

    /// Single evaluation pass over the held-out test split.
    pub fn test(&self, data: &mut DataLoader) -> Result<EvalResult, TrainError> {
        info!("testing model...");
        let result = self.evaluate(data, "test", self.config.epochs)?;
        info!(
            "Test Loss {:.4}, Test Perplexity {:.4}",
            result.loss, result.perplexity
        );
        Ok(result)
    }

    fn save_checkpoint(&self, epoch: usize) -> Result<PathBuf, TrainError> {
        let path = self
            .config
            .checkpoint_dir
            .join(format!("model_epoch_{}.ot", epoch));
        self.var_store.save(&path)?;
        Ok(path)
    }
}
