use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Average loss over a pass and its perplexity, `exp(loss)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub loss: f64,
    pub perplexity: f64,
}

impl EvalResult {
    pub fn from_average_loss(loss: f64) -> Self {
        EvalResult {
            loss,
            perplexity: loss.exp(),
        }
    }
}

/// One row of the training history. Epochs are numbered from 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: EvalResult,
    pub valid: EvalResult,
}

/// Per-epoch training and validation metrics for the plotting collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn push(&mut self, train: EvalResult, valid: EvalResult) {
        let epoch = self.epochs.len() + 1;
        self.epochs.push(EpochMetrics { epoch, train, valid });
    }

    pub fn train_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.train.loss).collect()
    }

    pub fn train_perplexities(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.train.perplexity).collect()
    }

    pub fn valid_losses(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.valid.loss).collect()
    }

    pub fn valid_perplexities(&self) -> Vec<f64> {
        self.epochs.iter().map(|m| m.valid.perplexity).collect()
    }

    /// Writes `epoch,train_loss,train_perplexity,valid_loss,valid_perplexity` rows.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut file = fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        writeln!(file, "epoch,train_loss,train_perplexity,valid_loss,valid_perplexity")?;
        for m in &self.epochs {
            writeln!(
                file,
                "{},{:.6},{:.6},{:.6},{:.6}",
                m.epoch, m.train.loss, m.train.perplexity, m.valid.loss, m.valid.perplexity
            )?;
        }
        Ok(())
    }
}

/// Pretty-prints any serializable value as JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perplexity_is_exp_of_loss() {
        let result = EvalResult::from_average_loss(2.0);
        assert!((result.perplexity - 2f64.exp()).abs() < 1e-12);
        assert_eq!(EvalResult::from_average_loss(0.0).perplexity, 1.0);
    }

    #[test]
    fn test_history_series() {
        let mut history = TrainingHistory::default();
        history.push(
            EvalResult::from_average_loss(3.0),
            EvalResult::from_average_loss(3.5),
        );
        history.push(
            EvalResult::from_average_loss(2.0),
            EvalResult::from_average_loss(2.5),
        );
        assert_eq!(history.train_losses(), vec![3.0, 2.0]);
        assert_eq!(history.valid_losses(), vec![3.5, 2.5]);
        assert_eq!(history.epochs[1].epoch, 2);
        assert!((history.valid_perplexities()[0] - 3.5f64.exp()).abs() < 1e-9);
    }

    #[test]
    fn test_write_csv() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("metrics.csv");
        let mut history = TrainingHistory::default();
        history.push(
            EvalResult::from_average_loss(1.0),
            EvalResult::from_average_loss(1.5),
        );
        history.write_csv(&path)?;
        let contents = fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("1,1.000000,2.718282,1.500000,"));
        Ok(())
    }
}
