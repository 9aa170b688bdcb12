//! Epoch-end callbacks monitoring validation loss.
//!
//! Each callback only tracks state and returns a decision; the training loop owns the
//! model and acts on what it is told (snapshot weights, write a checkpoint, change the
//! learning rate, stop).

use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of [`EarlyStopping::on_epoch_end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// New best value; the caller should remember the current weights.
    Improved,
    /// No improvement for this many consecutive epochs (still below patience).
    Wait(usize),
    /// Patience exhausted.
    Stop,
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    restore_best_weights: bool,
    best: Option<f64>,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64, restore_best_weights: bool) -> Self {
        Self {
            patience,
            min_delta: min_delta.abs(),
            restore_best_weights,
            best: None,
            best_epoch: 0,
            wait: 0,
        }
    }

    pub fn restore_best_weights(&self) -> bool {
        self.restore_best_weights
    }

    pub fn best(&self) -> Option<(usize, f64)> {
        self.best.map(|b| (self.best_epoch, b))
    }

    fn is_improvement(&self, current: f64) -> bool {
        match self.best {
            None => current.is_finite(),
            Some(best) => current < best - self.min_delta,
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, val_loss: f64) -> StopDecision {
        if self.is_improvement(val_loss) {
            debug!(
                "early stopping: val_loss improved from {:?} to {val_loss:.5} at epoch {epoch}",
                self.best
            );
            self.best = Some(val_loss);
            self.best_epoch = epoch;
            self.wait = 0;
            return StopDecision::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            info!(
                "early stopping at epoch {epoch} (no improvement since epoch {})",
                self.best_epoch
            );
            StopDecision::Stop
        } else {
            StopDecision::Wait(self.wait)
        }
    }
}

/// Tracks the best validation loss and says when to write the checkpoint.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    path: PathBuf,
    best: f64,
}

impl ModelCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            best: f64::INFINITY,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// True when `val_loss` is a strict new minimum.
    pub fn should_save(&mut self, epoch: usize, val_loss: f64) -> bool {
        if val_loss < self.best {
            info!(
                "epoch {epoch}: val_loss improved from {:.5} to {val_loss:.5}, saving {}",
                self.best,
                self.path.display()
            );
            self.best = val_loss;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    cooldown: usize,
    cooldown_counter: usize,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta: 1e-4,
            cooldown: 0,
            cooldown_counter: 0,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta.abs();
        self
    }

    pub fn with_cooldown(mut self, cooldown: usize) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Returns the reduced learning rate when the plateau patience runs out.
    pub fn on_epoch_end(&mut self, epoch: usize, val_loss: f64, lr: f64) -> Option<f64> {
        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.wait = 0;
        }
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }
        if self.cooldown_counter > 0 {
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }
        if lr <= self.min_lr {
            return None;
        }
        let new_lr = (lr * self.factor).max(self.min_lr);
        self.wait = 0;
        self.cooldown_counter = self.cooldown;
        info!("epoch {epoch}: reducing learning rate to {new_lr:.3e}");
        Some(new_lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_stopping_fires_after_patience_flat_epochs() {
        let mut es = EarlyStopping::new(3, 0.0, true);
        assert_eq!(es.on_epoch_end(1, 1.0), StopDecision::Improved);
        assert_eq!(es.on_epoch_end(2, 0.5), StopDecision::Improved);
        assert_eq!(es.on_epoch_end(3, 0.5), StopDecision::Wait(1));
        assert_eq!(es.on_epoch_end(4, 0.7), StopDecision::Wait(2));
        assert_eq!(es.on_epoch_end(5, 0.6), StopDecision::Stop);
        assert_eq!(es.best(), Some((2, 0.5)));
    }

    #[test]
    fn early_stopping_wait_resets_on_improvement() {
        let mut es = EarlyStopping::new(2, 0.0, false);
        es.on_epoch_end(1, 1.0);
        assert_eq!(es.on_epoch_end(2, 1.1), StopDecision::Wait(1));
        assert_eq!(es.on_epoch_end(3, 0.9), StopDecision::Improved);
        assert_eq!(es.on_epoch_end(4, 0.95), StopDecision::Wait(1));
    }

    #[test]
    fn nan_loss_never_counts_as_improvement() {
        let mut es = EarlyStopping::new(1, 0.0, true);
        assert_eq!(es.on_epoch_end(1, f64::NAN), StopDecision::Stop);
    }

    #[test]
    fn checkpoint_saves_only_on_new_minimum() {
        let mut ckpt = ModelCheckpoint::new("out/model_best");
        assert!(ckpt.should_save(1, 0.8));
        assert!(!ckpt.should_save(2, 0.8));
        assert!(!ckpt.should_save(3, 0.9));
        assert!(ckpt.should_save(4, 0.7));
        assert_eq!(ckpt.best(), 0.7);
    }

    #[test]
    fn plateau_reduces_after_patience_and_respects_floor() {
        let mut plateau = ReduceLrOnPlateau::new(0.3, 2, 1e-6);
        let mut lr = 1e-3;
        assert_eq!(plateau.on_epoch_end(1, 1.0, lr), None);
        assert_eq!(plateau.on_epoch_end(2, 1.0, lr), None);
        let reduced = plateau.on_epoch_end(3, 1.0, lr).unwrap();
        assert!((reduced - 3e-4).abs() < 1e-12);
        lr = reduced;
        // Improvements smaller than min_delta do not reset the counter.
        assert_eq!(plateau.on_epoch_end(4, 1.0 - 5e-5, lr), None);
        assert!(plateau.on_epoch_end(5, 1.0, lr).is_some());

        let mut floor = ReduceLrOnPlateau::new(0.3, 1, 1e-6);
        floor.on_epoch_end(1, 1.0, 2e-6);
        assert_eq!(floor.on_epoch_end(2, 1.0, 2e-6), Some(1e-6));
        assert_eq!(floor.on_epoch_end(3, 1.0, 1e-6), None);
    }

    #[test]
    fn plateau_keeps_waiting_while_lr_sits_at_floor() {
        let mut plateau = ReduceLrOnPlateau::new(0.5, 3, 1e-4);
        for epoch in 1..=4 {
            assert_eq!(plateau.on_epoch_end(epoch, 1.0, 1e-4), None);
        }
        // The exhausted patience carries over, so a higher rate is cut at once.
        assert_eq!(plateau.on_epoch_end(5, 1.0, 1e-2), Some(5e-3));
        // After a real reduction the counter starts again.
        assert_eq!(plateau.on_epoch_end(6, 1.0, 5e-3), None);
    }
}
