use std::path::{Path, PathBuf};

use anyhow::Context;
use crowd_dataset::{AugmentConfig, DEFAULT_CLASSES};
use models::{BackboneConfig, CrowdClassifierConfig, HyperParams, NUM_CLASSES};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_NAME: &str = "crowd-density.toml";
pub const CONFIG_ENV: &str = "CROWD_DENSITY_CONFIG";
pub const DEFAULT_SNAPSHOT_EPOCHS: [usize; 6] = [500, 1000, 1500, 2000, 2500, 3000];

/// Resolved settings for one training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub classes: Vec<String>,
    pub seed: u64,
    pub test_ratio: f32,
    pub val_ratio: f32,
    pub epochs: usize,
    pub batch_size: usize,
    pub hyper: HyperParams,
    pub backbone: BackboneConfig,
    /// Keep the last `trainable_tail` backbone blocks trainable; otherwise freeze it all.
    pub fine_tune: bool,
    pub trainable_tail: usize,
    pub pretrained: Option<PathBuf>,
    pub augment: AugmentConfig,
    pub early_stopping_patience: usize,
    /// Smallest val_loss decrease that counts as an improvement for early stopping.
    pub early_stopping_min_delta: f64,
    pub restore_best_weights: bool,
    pub lr_factor: f64,
    pub lr_patience: usize,
    pub min_lr: f64,
    /// Epochs (1-based) at which a test-set confusion matrix is captured.
    pub snapshot_epochs: Vec<usize>,
    pub checkpoint_name: String,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("dataset"),
            output_dir: PathBuf::from("output"),
            classes: DEFAULT_CLASSES.iter().map(|c| c.to_string()).collect(),
            seed: 42,
            test_ratio: 0.2,
            val_ratio: 0.2,
            epochs: 3000,
            batch_size: 64,
            hyper: HyperParams::default(),
            backbone: BackboneConfig::default(),
            fine_tune: true,
            trainable_tail: 1,
            pretrained: None,
            augment: AugmentConfig {
                seed: Some(42),
                ..AugmentConfig::default()
            },
            early_stopping_patience: 15,
            early_stopping_min_delta: 0.0,
            restore_best_weights: true,
            lr_factor: 0.3,
            lr_patience: 5,
            min_lr: 1e-6,
            snapshot_epochs: DEFAULT_SNAPSHOT_EPOCHS.to_vec(),
            checkpoint_name: "model_best".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainConfigFile {
    data_dir: Option<String>,
    output_dir: Option<String>,
    classes: Option<Vec<String>>,
    seed: Option<u64>,
    training: Option<TrainingSection>,
    model: Option<ModelSection>,
    callbacks: Option<CallbackSection>,
    augment: Option<AugmentSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct TrainingSection {
    epochs: Option<usize>,
    batch_size: Option<usize>,
    test_ratio: Option<f32>,
    val_ratio: Option<f32>,
    snapshot_epochs: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ModelSection {
    hyper: Option<HyperParams>,
    backbone: Option<BackboneConfig>,
    fine_tune: Option<bool>,
    trainable_tail: Option<usize>,
    pretrained: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CallbackSection {
    early_stopping_patience: Option<usize>,
    early_stopping_min_delta: Option<f64>,
    restore_best_weights: Option<bool>,
    lr_factor: Option<f64>,
    lr_patience: Option<usize>,
    min_lr: Option<f64>,
    checkpoint_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AugmentSection {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(flatten)]
    params: AugmentConfig,
}

fn enabled_by_default() -> bool {
    true
}

impl TrainConfig {
    /// Read `$CROWD_DENSITY_CONFIG`, else `crowd-density.toml` in the working directory.
    /// A missing default file yields the built-in defaults.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_path(&expand_path(&path));
        }
        let default_path = Path::new(DEFAULT_CONFIG_NAME);
        if default_path.exists() {
            Self::from_path(default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: TrainConfigFile = toml::from_str(raw)?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrainConfigFile) -> Self {
        let defaults = Self::default();
        let seed = file.seed.unwrap_or(defaults.seed);
        let training = file.training.unwrap_or_default();
        let model = file.model.unwrap_or_default();
        let callbacks = file.callbacks.unwrap_or_default();
        let augment = match file.augment {
            Some(AugmentSection { enabled: false, .. }) => AugmentConfig::disabled(),
            Some(AugmentSection { params, .. }) => AugmentConfig {
                seed: params.seed.or(Some(seed)),
                ..params
            },
            None => AugmentConfig {
                seed: Some(seed),
                ..defaults.augment.clone()
            },
        };

        TrainConfig {
            data_dir: file
                .data_dir
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.data_dir),
            output_dir: file
                .output_dir
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.output_dir),
            classes: file.classes.unwrap_or(defaults.classes),
            seed,
            test_ratio: training.test_ratio.unwrap_or(defaults.test_ratio),
            val_ratio: training.val_ratio.unwrap_or(defaults.val_ratio),
            epochs: training.epochs.unwrap_or(defaults.epochs),
            batch_size: training.batch_size.unwrap_or(defaults.batch_size),
            hyper: model.hyper.unwrap_or(defaults.hyper),
            backbone: model.backbone.unwrap_or(defaults.backbone),
            fine_tune: model.fine_tune.unwrap_or(defaults.fine_tune),
            trainable_tail: model.trainable_tail.unwrap_or(defaults.trainable_tail),
            pretrained: model.pretrained.map(|v| expand_path(&v)),
            augment,
            early_stopping_patience: callbacks
                .early_stopping_patience
                .unwrap_or(defaults.early_stopping_patience),
            early_stopping_min_delta: callbacks
                .early_stopping_min_delta
                .unwrap_or(defaults.early_stopping_min_delta),
            restore_best_weights: callbacks
                .restore_best_weights
                .unwrap_or(defaults.restore_best_weights),
            lr_factor: callbacks.lr_factor.unwrap_or(defaults.lr_factor),
            lr_patience: callbacks.lr_patience.unwrap_or(defaults.lr_patience),
            min_lr: callbacks.min_lr.unwrap_or(defaults.min_lr),
            snapshot_epochs: training
                .snapshot_epochs
                .unwrap_or(defaults.snapshot_epochs),
            checkpoint_name: callbacks
                .checkpoint_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(defaults.checkpoint_name),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.classes.len() != NUM_CLASSES {
            anyhow::bail!(
                "expected {NUM_CLASSES} classes, config lists {}",
                self.classes.len()
            );
        }
        for (name, ratio) in [("test_ratio", self.test_ratio), ("val_ratio", self.val_ratio)] {
            if !(ratio > 0.0 && ratio < 1.0) {
                anyhow::bail!("{name} must be in (0, 1), got {ratio}");
            }
        }
        if self.epochs == 0 {
            anyhow::bail!("epochs must be positive");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            anyhow::bail!("lr_factor must be in (0, 1), got {}", self.lr_factor);
        }
        if !(self.early_stopping_min_delta >= 0.0) {
            anyhow::bail!(
                "early_stopping_min_delta must be non-negative, got {}",
                self.early_stopping_min_delta
            );
        }
        if self.hyper.learning_rate <= 0.0 {
            anyhow::bail!("learning_rate must be positive");
        }
        Ok(())
    }

    /// Checkpoint file stem; the recorder appends `.bin`.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.output_dir.join(&self.checkpoint_name)
    }

    pub fn model_config(&self) -> CrowdClassifierConfig {
        CrowdClassifierConfig {
            backbone: self.backbone.clone(),
            hyper: self.hyper,
            num_classes: self.classes.len(),
            fine_tune: self.fine_tune,
            trainable_tail: self.trainable_tail,
            ..CrowdClassifierConfig::default()
        }
    }
}

/// Expand a leading `~` and `${VAR}` references. Unknown variables are left as-is.
pub fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

fn expand_env(input: &str) -> String {
    let mut out = String::new();
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&rest[start..start + end + 3]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = TrainConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.epochs, 3000);
        assert_eq!(cfg.batch_size, 64);
        assert_eq!(cfg.hyper, HyperParams::default());
        assert_eq!(cfg.snapshot_epochs, DEFAULT_SNAPSHOT_EPOCHS.to_vec());
        assert_eq!(cfg.augment.seed, Some(42));
    }

    #[test]
    fn unknown_variables_are_kept_verbatim() {
        assert_eq!(
            expand_env("a/${CROWD_DENSITY_SURELY_UNSET_VAR}/b"),
            "a/${CROWD_DENSITY_SURELY_UNSET_VAR}/b"
        );
        assert_eq!(expand_env("plain/${unterminated"), "plain/${unterminated");
    }

    #[test]
    fn known_variables_are_substituted() {
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env("${HOME}/data"), format!("{home}/data"));
    }

    #[test]
    fn disabled_augment_section_is_identity() {
        let cfg = TrainConfig::from_toml_str("[augment]\nenabled = false\n").unwrap();
        assert!(cfg.augment.is_identity());
    }

    #[test]
    fn invalid_ratio_is_rejected() {
        let err = TrainConfig::from_toml_str("[training]\ntest_ratio = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("test_ratio"));
    }

    #[test]
    fn negative_min_delta_is_rejected() {
        let err = TrainConfig::from_toml_str("[callbacks]\nearly_stopping_min_delta = -0.1\n")
            .unwrap_err();
        assert!(err.to_string().contains("early_stopping_min_delta"));
    }
}
