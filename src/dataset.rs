use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use tch::{Device, Tensor};

use crate::constants::{IGNORE_INDEX, INPUT_PAD};

/// A token stream cut into next-token prediction examples.
///
/// Block `i` covers `tokens[i * block_size .. i * block_size + block_size + 1]`, so
/// neighbouring blocks share one token and the final block may be shorter.
#[derive(Debug, Clone)]
pub struct BlockDataset {
    blocks: Vec<Vec<i64>>,
}

impl BlockDataset {
    pub fn new(tokens: &[i64], block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let blocks = (0..tokens.len())
            .step_by(block_size)
            .map(|start| tokens[start..(start + block_size + 1).min(tokens.len())].to_vec())
            // A single trailing token has no target to predict.
            .filter(|block| block.len() >= 2)
            .collect();
        BlockDataset { blocks }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns `(input, target)`: the block without its last token, and without its first.
    pub fn get(&self, index: usize) -> (&[i64], &[i64]) {
        let block = &self.blocks[index];
        (&block[..block.len() - 1], &block[1..])
    }
}

/// Right-padded input ids and targets, both `[batch, seq_len]`.
#[derive(Debug)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

impl Batch {
    pub fn seq_len(&self) -> i64 {
        self.inputs.size()[1]
    }

    pub fn to_device(&self, device: Device) -> Batch {
        Batch {
            inputs: self.inputs.to_device(device),
            targets: self.targets.to_device(device),
        }
    }
}

/// Stacks examples into a batch padded to the longest one. Inputs are padded with
/// `INPUT_PAD`, targets with `IGNORE_INDEX` so the padding never reaches the loss.
pub fn collate(examples: &[(&[i64], &[i64])]) -> Batch {
    let max_len = examples
        .iter()
        .map(|(input, _)| input.len())
        .max()
        .unwrap_or(0);
    let mut inputs = Vec::with_capacity(examples.len() * max_len);
    let mut targets = Vec::with_capacity(examples.len() * max_len);
    for (input, target) in examples {
        inputs.extend_from_slice(input);
        inputs.resize(inputs.len() + max_len - input.len(), INPUT_PAD);
        targets.extend_from_slice(target);
        targets.resize(targets.len() + max_len - target.len(), IGNORE_INDEX);
    }
    let shape = [examples.len() as i64, max_len as i64];
    Batch {
        inputs: Tensor::from_slice(&inputs).view(shape),
        targets: Tensor::from_slice(&targets).view(shape),
    }
}

/// Yields collated batches over a `BlockDataset`, reshuffled every epoch when enabled.
pub struct DataLoader {
    dataset: BlockDataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(dataset: BlockDataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        DataLoader {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Starts a new pass over the dataset.
    pub fn epoch(&mut self) -> Batches<'_> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        Batches {
            dataset: &self.dataset,
            order,
            batch_size: self.batch_size,
            cursor: 0,
        }
    }
}

pub struct Batches<'a> {
    dataset: &'a BlockDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let examples: Vec<(&[i64], &[i64])> = self.order[self.cursor..end]
            .iter()
            .map(|&index| self.dataset.get(index))
            .collect();
        self.cursor = end;
        Some(collate(&examples))
    }
}
