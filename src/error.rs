use thiserror::Error;

/// Errors raised while building, loading, or running the model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("d_model ({d_model}) must be divisible by the number of heads ({heads})")]
    IndivisibleHeads { d_model: i64, heads: i64 },
    #[error("dropout must be in [0, 1), got {0}")]
    InvalidDropout(f64),
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),
    #[error("token id {id} is outside the vocabulary [0, {vocab_size})")]
    TokenOutOfRange { id: i64, vocab_size: i64 },
    #[error("sequence length {len} exceeds the positional encoder maximum of {max}")]
    SequenceTooLong { len: i64, max: i64 },
    #[error("checkpoint does not match the model: {0}")]
    CheckpointMismatch(String),
    #[error(transparent)]
    Tch(#[from] tch::TchError),
}

/// Errors that abort a training or evaluation run.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("non-finite {phase} loss ({loss}) at epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        phase: &'static str,
        epoch: usize,
        batch: usize,
        loss: f64,
    },
    #[error("the {0} split produced no batches")]
    EmptySplit(&'static str),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Tch(#[from] tch::TchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
