use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Metrics gathered at the end of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub lr: f64,
}

/// Append-only per-epoch series, stored column-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    epoch: Vec<usize>,
    loss: Vec<f64>,
    accuracy: Vec<f64>,
    val_loss: Vec<f64>,
    val_accuracy: Vec<f64>,
    lr: Vec<f64>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, epoch: usize, m: EpochMetrics) {
        self.epoch.push(epoch);
        self.loss.push(m.loss);
        self.accuracy.push(m.accuracy);
        self.val_loss.push(m.val_loss);
        self.val_accuracy.push(m.val_accuracy);
        self.lr.push(m.lr);
    }

    pub fn len(&self) -> usize {
        self.epoch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epoch.is_empty()
    }

    pub fn epochs(&self) -> &[usize] {
        &self.epoch
    }

    pub fn loss(&self) -> &[f64] {
        &self.loss
    }

    pub fn accuracy(&self) -> &[f64] {
        &self.accuracy
    }

    pub fn val_loss(&self) -> &[f64] {
        &self.val_loss
    }

    pub fn val_accuracy(&self) -> &[f64] {
        &self.val_accuracy
    }

    pub fn lr(&self) -> &[f64] {
        &self.lr
    }

    pub fn last(&self) -> Option<(usize, EpochMetrics)> {
        let i = self.len().checked_sub(1)?;
        Some((
            self.epoch[i],
            EpochMetrics {
                loss: self.loss[i],
                accuracy: self.accuracy[i],
                val_loss: self.val_loss[i],
                val_accuracy: self.val_accuracy[i],
                lr: self.lr[i],
            },
        ))
    }

    /// Epoch and value of the lowest finite validation loss.
    pub fn best_val_loss(&self) -> Option<(usize, f64)> {
        self.epoch
            .iter()
            .zip(self.val_loss.iter())
            .filter(|(_, v)| v.is_finite())
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(e, v)| (*e, *v))
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write history to {}", path.display()))
    }

    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read history from {}", path.display()))?;
        let history: Self = serde_json::from_str(&raw)?;
        let n = history.epoch.len();
        let lens = [
            history.loss.len(),
            history.accuracy.len(),
            history.val_loss.len(),
            history.val_accuracy.len(),
            history.lr.len(),
        ];
        if lens.iter().any(|l| *l != n) {
            anyhow::bail!("history series in {} have unequal lengths", path.display());
        }
        Ok(history)
    }
}
