use anyhow::Context;
use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use crowd_dataset::{load_dataset, train_test_split, BatchIter, LabelEncoder, LabeledDataset, Split};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::callbacks::{EarlyStopping, ModelCheckpoint, ReduceLrOnPlateau, StopDecision};
use crate::config::TrainConfig;
use crate::history::{EpochMetrics, History};
use crate::metrics::{classification_report, confusion_matrix, per_class_curves};
use crate::metrics::{ClassificationReport, ConfusionMatrix};
use crate::plot;
use crate::{CrowdClassifier, CrowdClassifierConfig, TrainBackend};

pub type ADBackend = Autodiff<TrainBackend>;
pub type Device = <TrainBackend as Backend>::Device;

/// Install the `fmt` subscriber; `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init();
}

pub fn load_classifier_from_checkpoint<P: AsRef<Path>>(
    path: P,
    cfg: &CrowdClassifierConfig,
    device: &Device,
) -> anyhow::Result<CrowdClassifier<TrainBackend>> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = cfg.init::<TrainBackend>(device)?;
    model
        .load_file(path.as_ref(), &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", path.as_ref().display()))
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the crowd-density classifier")]
pub struct TrainArgs {
    /// TOML config file (defaults to $CROWD_DENSITY_CONFIG or ./crowd-density.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Dataset root with one subdirectory per class.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Directory for checkpoint, history, report and plots.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub lr: Option<f64>,
    #[arg(long)]
    pub seed: Option<u64>,
    /// Leave the last backbone blocks trainable (the default).
    #[arg(long, conflicts_with = "freeze_backbone")]
    pub fine_tune: bool,
    /// Freeze the whole backbone and train only the head.
    #[arg(long)]
    pub freeze_backbone: bool,
    /// Backbone blocks kept trainable when fine-tuning.
    #[arg(long)]
    pub trainable_tail: Option<usize>,
    /// Backbone weights (Burn record file) to start from.
    #[arg(long)]
    pub pretrained: Option<PathBuf>,
    /// Disable training-time augmentation.
    #[arg(long)]
    pub no_augment: bool,
}

impl TrainArgs {
    /// File (or default) config with command-line values layered on top.
    pub fn resolve(&self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::from_path(path)?,
            None => TrainConfig::load()?,
        };
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            cfg.output_dir = dir.clone();
        }
        if let Some(epochs) = self.epochs {
            cfg.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            cfg.hyper.learning_rate = lr;
        }
        if let Some(seed) = self.seed {
            cfg.seed = seed;
            if cfg.augment.seed.is_some() {
                cfg.augment.seed = Some(seed);
            }
        }
        if self.fine_tune {
            cfg.fine_tune = true;
        }
        if self.freeze_backbone {
            cfg.fine_tune = false;
        }
        if let Some(tail) = self.trainable_tail {
            cfg.trainable_tail = tail;
        }
        if let Some(path) = &self.pretrained {
            cfg.pretrained = Some(path.clone());
        }
        if self.no_augment {
            cfg.augment = crowd_dataset::AugmentConfig::disabled();
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Index partitions into the loaded dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl DataSplit {
    /// Hold out the test set first, then carve validation out of the remainder.
    pub fn new(n: usize, test_ratio: f32, val_ratio: f32, seed: u64) -> Self {
        let outer = train_test_split(n, test_ratio, seed);
        let inner = Split::within(&outer.train, val_ratio, seed);
        Self {
            train: inner.train,
            val: inner.test,
            test: outer.test,
        }
    }
}

pub struct PreparedData {
    pub dataset: LabeledDataset,
    pub encoder: LabelEncoder,
    pub targets: Vec<usize>,
    pub split: DataSplit,
}

impl PreparedData {
    pub fn class_names(&self) -> &[String] {
        self.encoder.classes()
    }
}

/// Load, encode and split. The encoder is fitted on the configured class names so the
/// mapping does not depend on which directories happened to contain readable images.
pub fn prepare_data(cfg: &TrainConfig) -> anyhow::Result<PreparedData> {
    let dataset = load_dataset(&cfg.data_dir, &cfg.classes)
        .with_context(|| format!("failed to load dataset from {}", cfg.data_dir.display()))?;
    let encoder = LabelEncoder::fit(&cfg.classes);
    prepare_with_encoder(cfg, dataset, encoder)
}

pub fn prepare_with_encoder(
    cfg: &TrainConfig,
    dataset: LabeledDataset,
    encoder: LabelEncoder,
) -> anyhow::Result<PreparedData> {
    let targets = encoder.transform_all(&dataset.labels)?;
    let split = DataSplit::new(dataset.len(), cfg.test_ratio, cfg.val_ratio, cfg.seed);
    if split.train.is_empty() || split.val.is_empty() || split.test.is_empty() {
        anyhow::bail!(
            "{} usable images are not enough for train/val/test partitions",
            dataset.len()
        );
    }
    info!(
        "split {} samples: train={} val={} test={}",
        dataset.len(),
        split.train.len(),
        split.val.len(),
        split.test.len()
    );
    Ok(PreparedData {
        dataset,
        encoder,
        targets,
        split,
    })
}

/// Predictions of one pass over an index list (no augmentation, no dropout).
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub targets: Vec<usize>,
    pub predictions: Vec<usize>,
    /// Row-major `[n, classes]` softmax outputs.
    pub probabilities: Vec<f32>,
}

fn argmax_rows(values: &[f32], width: usize) -> Vec<usize> {
    values
        .chunks(width.max(1))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (i, v)| {
                    if *v > best.1 {
                        (i, *v)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

pub fn evaluate<B: Backend>(
    model: &CrowdClassifier<B>,
    data: &PreparedData,
    indices: &[usize],
    batch_size: usize,
    device: &B::Device,
) -> anyhow::Result<Evaluation> {
    if indices.is_empty() {
        anyhow::bail!("cannot evaluate an empty index list");
    }
    let mut iter = BatchIter::new(
        &data.dataset.samples,
        &data.targets,
        indices.to_vec(),
        batch_size,
    )?;
    let loss_fn = CrossEntropyLossConfig::new().init::<B>(device);
    let mut loss_sum = 0.0f64;
    let mut probabilities = Vec::with_capacity(indices.len() * data.encoder.len());
    let mut width = 0;
    while let Some(batch) = iter.next_batch::<B>(device)? {
        let n = batch.targets.dims()[0];
        let logits = model.forward(batch.images);
        width = logits.dims()[1];
        let loss = loss_fn.forward(logits.clone(), batch.targets);
        loss_sum += scalar(loss.into_data())? * n as f64;
        let probs = softmax(logits, 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("failed to read probabilities: {e:?}"))?;
        probabilities.extend(probs);
    }
    let targets: Vec<usize> = indices.iter().map(|&i| data.targets[i]).collect();
    let predictions = argmax_rows(&probabilities, width);
    let correct = predictions
        .iter()
        .zip(&targets)
        .filter(|(p, t)| p == t)
        .count();
    Ok(Evaluation {
        loss: loss_sum / indices.len() as f64,
        accuracy: correct as f64 / indices.len() as f64,
        targets,
        predictions,
        probabilities,
    })
}

fn scalar(data: burn::tensor::TensorData) -> anyhow::Result<f64> {
    data.convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read scalar: {e:?}"))?
        .first()
        .map(|v| *v as f64)
        .ok_or_else(|| anyhow::anyhow!("empty scalar tensor"))
}

pub struct TrainOutcome {
    pub model: CrowdClassifier<ADBackend>,
    pub history: History,
    /// Test-set confusion matrices captured at the configured epochs.
    pub snapshots: Vec<(usize, ConfusionMatrix)>,
    /// Epoch at which early stopping fired, if it did.
    pub stopped_epoch: Option<usize>,
}

pub fn train_model(
    mut model: CrowdClassifier<ADBackend>,
    data: &PreparedData,
    cfg: &TrainConfig,
    device: &Device,
) -> anyhow::Result<TrainOutcome> {
    let mut optim = AdamConfig::new().init();
    let loss_fn = CrossEntropyLossConfig::new().init::<ADBackend>(device);
    let classes = data.encoder.len();
    let mut lr = cfg.hyper.learning_rate;

    let mut early = EarlyStopping::new(
        cfg.early_stopping_patience,
        cfg.early_stopping_min_delta,
        cfg.restore_best_weights,
    );
    let mut checkpoint = ModelCheckpoint::new(cfg.checkpoint_path());
    let mut plateau = ReduceLrOnPlateau::new(cfg.lr_factor, cfg.lr_patience, cfg.min_lr);
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();

    let mut history = History::new();
    let mut snapshots = Vec::new();
    let mut best_model: Option<CrowdClassifier<ADBackend>> = None;
    let mut stopped_epoch = None;

    info!(
        "training for up to {} epochs (batch {}, lr {:.1e}, augment: {})",
        cfg.epochs,
        cfg.batch_size,
        lr,
        cfg.augment.describe()
    );
    for epoch in 1..=cfg.epochs {
        let mut iter = BatchIter::for_training(
            &data.dataset.samples,
            &data.targets,
            data.split.train.clone(),
            cfg.batch_size,
            epoch as u64,
            cfg.seed,
            &cfg.augment,
        )?;
        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut seen = 0usize;
        while let Some(batch) = iter.next_batch::<ADBackend>(device)? {
            let n = batch.targets.dims()[0];
            let logits = model.forward(batch.images);
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());

            let probs = logits
                .detach()
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| anyhow::anyhow!("failed to read logits: {e:?}"))?;
            let truth = batch
                .targets
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .map_err(|e| anyhow::anyhow!("failed to read targets: {e:?}"))?;
            correct += argmax_rows(&probs, classes)
                .iter()
                .zip(&truth)
                .filter(|(p, t)| **p as i64 == **t)
                .count();
            loss_sum += scalar(loss.clone().detach().into_data())? * n as f64;
            seen += n;

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);
        }
        let seen_f = seen.max(1) as f64;

        let val = evaluate(&model.valid(), data, &data.split.val, cfg.batch_size, device)?;
        let metrics = EpochMetrics {
            loss: loss_sum / seen_f,
            accuracy: correct as f64 / seen_f,
            val_loss: val.loss,
            val_accuracy: val.accuracy,
            lr,
        };
        history.record(epoch, metrics);
        info!(
            "epoch {epoch}/{}: loss {:.4} acc {:.4} val_loss {:.4} val_acc {:.4} lr {:.2e}",
            cfg.epochs, metrics.loss, metrics.accuracy, val.loss, val.accuracy, lr
        );

        if checkpoint.should_save(epoch, val.loss) {
            model
                .clone()
                .save_file(checkpoint.path(), &recorder)
                .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
        }
        let decision = early.on_epoch_end(epoch, val.loss);
        if decision == StopDecision::Improved && early.restore_best_weights() {
            best_model = Some(model.clone());
        }
        if let Some(new_lr) = plateau.on_epoch_end(epoch, val.loss, lr) {
            lr = new_lr;
        }
        if cfg.snapshot_epochs.contains(&epoch) {
            let test = evaluate(&model.valid(), data, &data.split.test, cfg.batch_size, device)?;
            let cm = confusion_matrix(&test.targets, &test.predictions, classes)?;
            info!("epoch {epoch}: test accuracy {:.4} (confusion snapshot)", test.accuracy);
            snapshots.push((epoch, cm));
        }
        if decision == StopDecision::Stop {
            stopped_epoch = Some(epoch);
            break;
        }
    }

    let last_epoch = history.last().map(|(e, _)| e).unwrap_or(0);
    for &epoch in &cfg.snapshot_epochs {
        if epoch > last_epoch {
            info!("confusion snapshot for epoch {epoch} skipped: training ended at epoch {last_epoch}");
        }
    }
    if stopped_epoch.is_some() {
        if let Some(best) = best_model {
            if let Some((epoch, val_loss)) = early.best() {
                info!("restoring weights from epoch {epoch} (val_loss {val_loss:.4})");
            }
            model = best;
        }
    }
    Ok(TrainOutcome {
        model,
        history,
        snapshots,
        stopped_epoch,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassAuc {
    pub name: String,
    pub pr_auc: f64,
    pub roc_auc: f64,
}

/// Contents of `report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub samples: usize,
    pub loss: f64,
    pub report: ClassificationReport,
    pub confusion: Vec<Vec<usize>>,
    pub auc: Vec<ClassAuc>,
}

/// Evaluate on `indices`, then write `report.json`, the final confusion matrix and the
/// PR/ROC plot into `out_dir`.
pub fn evaluate_and_report<B: Backend>(
    model: &CrowdClassifier<B>,
    data: &PreparedData,
    indices: &[usize],
    batch_size: usize,
    device: &B::Device,
    out_dir: &Path,
) -> anyhow::Result<EvalReport> {
    let names = data.class_names();
    let eval = evaluate(model, data, indices, batch_size, device)?;
    let report = classification_report(&eval.targets, &eval.predictions, names)?;
    let cm = confusion_matrix(&eval.targets, &eval.predictions, names.len())?;
    let curves = per_class_curves(&eval.targets, &eval.probabilities, names)?;

    for class in &report.classes {
        info!(
            "{:>14}: precision {:.3} recall {:.3} f1 {:.3} support {}",
            class.name, class.precision, class.recall, class.f1, class.support
        );
    }
    info!(
        "accuracy {:.4}, macro f1 {:.4}, weighted f1 {:.4}",
        report.accuracy, report.macro_avg.f1, report.weighted_avg.f1
    );
    let auc: Vec<ClassAuc> = curves
        .iter()
        .map(|c| {
            if c.roc_auc.is_nan() {
                warn!("{}: ROC AUC undefined (class missing from evaluation set)", c.name);
            }
            ClassAuc {
                name: c.name.clone(),
                pr_auc: c.pr_auc,
                roc_auc: c.roc_auc,
            }
        })
        .collect();

    plot::plot_confusion_matrix(
        &cm,
        names,
        "Confusion matrix (final model)",
        &out_dir.join("confusion_final.png"),
    )?;
    plot::plot_pr_roc(&curves, &out_dir.join("pr_roc_curves.png"))?;

    let out = EvalReport {
        samples: indices.len(),
        loss: eval.loss,
        report,
        confusion: cm.rows(),
        auc,
    };
    let path = out_dir.join("report.json");
    fs::write(&path, serde_json::to_string_pretty(&out)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(out)
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    validate_backend_choice(args.backend)?;
    let cfg = args.resolve()?;
    fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("failed to create {}", cfg.output_dir.display()))?;
    fs::write(
        cfg.output_dir.join("config.json"),
        serde_json::to_string_pretty(&cfg)?,
    )?;

    let data = prepare_data(&cfg)?;
    data.encoder.save(&cfg.output_dir.join("labels.json"))?;

    let device = Device::default();
    let model = cfg
        .model_config()
        .init_with_pretrained::<ADBackend>(&device, cfg.pretrained.as_deref())?;
    let outcome = train_model(model, &data, &cfg, &device)?;

    outcome
        .history
        .save_json(&cfg.output_dir.join("history.json"))?;
    plot::plot_history(&outcome.history, &cfg.output_dir.join("training_metrics.png"))?;
    for (epoch, cm) in &outcome.snapshots {
        plot::plot_confusion_matrix(
            cm,
            data.class_names(),
            &format!("Confusion matrix (epoch {epoch})"),
            &cfg.output_dir.join(format!("confusion_epoch_{epoch}.png")),
        )?;
    }

    let model = outcome.model.valid();
    evaluate_and_report(
        &model,
        &data,
        &data.split.test,
        cfg.batch_size,
        &device,
        &cfg.output_dir,
    )?;
    plot::plot_technique_comparison(&cfg.output_dir.join("technique_comparison.png"))?;
    info!(
        "best checkpoint at {}.bin; outputs in {}",
        cfg.checkpoint_path().display(),
        cfg.output_dir.display()
    );
    Ok(())
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            warn!("built with backend-wgpu; training will still use the WGPU backend despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn argmax_picks_first_maximum() {
        let rows = [0.1, 0.7, 0.7, 0.5, 0.2, 0.3];
        assert_eq!(argmax_rows(&rows, 3), vec![1, 0]);
    }

    #[test]
    fn data_split_partitions_are_disjoint_and_complete() {
        let split = DataSplit::new(100, 0.2, 0.2, 42);
        assert_eq!(split.test.len(), 20);
        assert_eq!(split.val.len(), 16);
        assert_eq!(split.train.len(), 64);
        let all: BTreeSet<usize> = split
            .train
            .iter()
            .chain(&split.val)
            .chain(&split.test)
            .copied()
            .collect();
        assert_eq!(all.len(), 100);
        assert_eq!(DataSplit::new(100, 0.2, 0.2, 42), split);
    }

    #[test]
    fn cli_values_override_file_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.toml");
        fs::write(&path, "seed = 9\n[training]\nepochs = 5\nbatch_size = 8\n").unwrap();
        let path_arg = path.display().to_string();
        let args = TrainArgs::parse_from([
            "train",
            "--config",
            path_arg.as_str(),
            "--epochs",
            "7",
            "--lr",
            "0.01",
            "--no-augment",
        ]);
        let cfg = args.resolve().unwrap();
        assert_eq!(cfg.epochs, 7);
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.seed, 9);
        assert_eq!(cfg.hyper.learning_rate, 0.01);
        assert!(cfg.augment.is_identity());
        assert!(cfg.fine_tune);
    }

    #[test]
    fn freeze_flag_overrides_fine_tuning() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.toml");
        fs::write(&path, "[model]\nfine_tune = true\ntrainable_tail = 2\n").unwrap();
        let path_arg = path.display().to_string();
        let args = TrainArgs::parse_from([
            "train",
            "--config",
            path_arg.as_str(),
            "--freeze-backbone",
        ]);
        let cfg = args.resolve().unwrap();
        assert!(!cfg.fine_tune);
        assert_eq!(cfg.model_config().trainable_tail, 2);

        let clash = TrainArgs::try_parse_from(["train", "--fine-tune", "--freeze-backbone"]);
        assert!(clash.is_err());
    }
}
