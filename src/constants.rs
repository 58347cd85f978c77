/// The width of the model's embedding space.
pub const D_MODEL: i64 = 512;
/// The number of "heads" (attention passes) per attention layer.
pub const HEADS: i64 = 8;
/// Number of stacked decoder layers.
pub const LAYERS: usize = 6;
/// The "hidden" dimension for the feed-forward network.
pub const FFN_HIDDEN_DIM: i64 = 2048;
/// Longest sequence the positional encoder precomputes.
pub const MAX_SEQUENCE_LENGTH: i64 = 4096;
/// Default training block size.
pub const SEQUENCE_LENGTH: usize = 512;
pub const DROPOUT: f64 = 0.1;

/// Epsilon added to the standard deviation in layer normalization.
pub const NORM_EPS: f64 = 1e-6;
/// Score written into attention positions selected by the mask (see `MaskMode::NearZeroFill`).
pub const MASK_FILL_VALUE: f64 = 1e-9;

/// Target value for padded positions; excluded from the loss and from gradients.
pub const IGNORE_INDEX: i64 = -100;
/// Input value for padded positions.
pub const INPUT_PAD: i64 = 0;

/// Adam hyperparameters.
pub const ADAM_BETA1: f64 = 0.9;
pub const ADAM_BETA2: f64 = 0.98;
pub const ADAM_EPS: f64 = 1e-9;

/// Checkpoints are written every this many epochs.
pub const CHECKPOINT_EVERY: usize = 5;
