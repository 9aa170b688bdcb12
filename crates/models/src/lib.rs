//! Burn models for crowd-density classification.
//!
//! `CrowdClassifier` stacks an Inception-style convolutional backbone with a small
//! recurrent head:
//! backbone → global average pool → dense + ReLU → batch norm → dropout →
//! single-step sequence → GRU → GRU (last step) → class logits.
//!
//! The backbone can be initialised from a Burn record file and frozen fully or partially
//! before training.

pub mod backbone;

pub use backbone::{Backbone, BackboneConfig, ConvBn, InceptionBlock};

use burn::module::Module;
use burn::nn;
use burn::nn::gru::{Gru, GruConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const NUM_CLASSES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("failed to load weights from {path}: {msg}")]
    Load { path: PathBuf, msg: String },
    #[error("invalid model configuration: {0}")]
    Config(String),
}

/// Tunable widths and step size of the classifier head.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperParams {
    pub dense_units: usize,
    pub gru1_units: usize,
    pub gru2_units: usize,
    pub learning_rate: f64,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self {
            dense_units: 256,
            gru1_units: 128,
            gru2_units: 64,
            learning_rate: 1e-3,
        }
    }
}

impl HyperParams {
    /// Unit counts clamped to at least one.
    pub fn sanitized(self) -> Self {
        Self {
            dense_units: self.dense_units.max(1),
            gru1_units: self.gru1_units.max(1),
            gru2_units: self.gru2_units.max(1),
            learning_rate: self.learning_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrowdClassifierConfig {
    pub backbone: BackboneConfig,
    pub hyper: HyperParams,
    pub num_classes: usize,
    pub dropout: f64,
    /// When false the whole backbone is frozen.
    pub fine_tune: bool,
    /// Number of trailing backbone blocks left trainable when `fine_tune` is set.
    pub trainable_tail: usize,
}

impl Default for CrowdClassifierConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneConfig::default(),
            hyper: HyperParams::default(),
            num_classes: NUM_CLASSES,
            dropout: 0.5,
            fine_tune: false,
            trainable_tail: 1,
        }
    }
}

impl CrowdClassifierConfig {
    /// Build with random weights, then apply the freeze policy.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CrowdClassifier<B>, ModelError> {
        self.init_with_pretrained(device, None)
    }

    /// Build, optionally load backbone weights, then apply the freeze policy.
    pub fn init_with_pretrained<B: Backend>(
        &self,
        device: &B::Device,
        pretrained: Option<&Path>,
    ) -> Result<CrowdClassifier<B>, ModelError> {
        if self.num_classes == 0 {
            return Err(ModelError::Config("num_classes must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        let mut backbone = self.backbone.init::<B>(device);
        if let Some(path) = pretrained {
            backbone = backbone.load_pretrained(path, device)?;
            tracing::info!("loaded backbone weights from {}", path.display());
        }
        let tail = if self.fine_tune { self.trainable_tail } else { 0 };
        let backbone = backbone.freeze(tail);
        tracing::debug!(
            "backbone: {} blocks, {} trainable",
            backbone.num_blocks(),
            backbone.trainable_blocks()
        );
        Ok(CrowdClassifier::from_parts(self, backbone, device))
    }
}

#[derive(Debug, Module)]
pub struct CrowdClassifier<B: Backend> {
    backbone: Backbone<B>,
    pool: AdaptiveAvgPool2d,
    dense: nn::Linear<B>,
    norm: nn::BatchNorm<B, 1>,
    dropout: nn::Dropout,
    gru1: Gru<B>,
    gru2: Gru<B>,
    head: nn::Linear<B>,
}

impl<B: Backend> CrowdClassifier<B> {
    fn from_parts(cfg: &CrowdClassifierConfig, backbone: Backbone<B>, device: &B::Device) -> Self {
        let hp = cfg.hyper.sanitized();
        let features = cfg.backbone.out_channels();
        Self {
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dense: nn::LinearConfig::new(features, hp.dense_units).init(device),
            norm: nn::BatchNormConfig::new(hp.dense_units).init(device),
            dropout: nn::DropoutConfig::new(cfg.dropout).init(),
            gru1: GruConfig::new(hp.dense_units, hp.gru1_units, true).init(device),
            gru2: GruConfig::new(hp.gru1_units, hp.gru2_units, true).init(device),
            head: nn::LinearConfig::new(hp.gru2_units, cfg.num_classes).init(device),
        }
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    /// Class logits with shape `[B, num_classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let [batch, channels, _, _] = features.dims();
        let x = self.pool.forward(features).reshape([batch, channels]);

        let x = relu(self.dense.forward(x));
        let units = x.dims()[1];
        let x = self
            .norm
            .forward(x.reshape([batch, units, 1]))
            .reshape([batch, units]);
        let x = self.dropout.forward(x);

        let seq = x.reshape([batch, 1, units]);
        let seq = self.gru1.forward(seq, None);
        let seq = self.gru2.forward(seq, None);
        let [_, steps, hidden] = seq.dims();
        let last = seq
            .slice([0..batch, steps - 1..steps, 0..hidden])
            .reshape([batch, hidden]);
        self.head.forward(last)
    }

    /// Class probabilities (softmax over logits).
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }
}

pub mod prelude {
    pub use super::{
        Backbone, BackboneConfig, CrowdClassifier, CrowdClassifierConfig, HyperParams,
        ModelError, NUM_CLASSES,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArray, Autodiff};
    use burn::module::AutodiffModule;
    use burn::optim::{AdamConfig, GradientsParams, Optimizer};
    use burn::record::{BinFileRecorder, FullPrecisionSettings};
    use burn::tensor::TensorData;

    type Inner = NdArray<f32>;
    type Ad = Autodiff<Inner>;

    fn tiny() -> CrowdClassifierConfig {
        CrowdClassifierConfig {
            backbone: BackboneConfig {
                stem_channels: 4,
                branch_width: 2,
                blocks: 2,
            },
            hyper: HyperParams {
                dense_units: 8,
                gru1_units: 6,
                gru2_units: 4,
                learning_rate: 1e-2,
            },
            ..CrowdClassifierConfig::default()
        }
    }

    fn images<B: Backend>(batch: usize, device: &B::Device) -> Tensor<B, 4> {
        let len = batch * 3 * 32 * 32;
        let data: Vec<f32> = (0..len).map(|i| (i % 97) as f32 / 97.0).collect();
        Tensor::from_data(TensorData::new(data, [batch, 3, 32, 32]), device)
    }

    #[test]
    fn forward_emits_one_logit_per_class() {
        let device = Default::default();
        let model = tiny().init::<Inner>(&device).unwrap();
        let logits = model.forward(images::<Inner>(3, &device));
        assert_eq!(logits.dims(), [3, NUM_CLASSES]);
    }

    #[test]
    fn probabilities_sum_to_one() {
        let device = Default::default();
        let model = tiny().init::<Inner>(&device).unwrap();
        let probs = model
            .predict_proba(images::<Inner>(2, &device))
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for row in probs.chunks(NUM_CLASSES) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            assert!(row.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn zero_width_hyperparams_are_clamped() {
        let hp = HyperParams {
            dense_units: 0,
            gru1_units: 0,
            gru2_units: 0,
            learning_rate: 1e-3,
        }
        .sanitized();
        assert_eq!((hp.dense_units, hp.gru1_units, hp.gru2_units), (1, 1, 1));
    }

    fn train_step(model: CrowdClassifier<Ad>, device: &<Ad as Backend>::Device) -> CrowdClassifier<Ad> {
        let mut optim = AdamConfig::new().init();
        let logits = model.forward(images::<Ad>(2, device));
        let targets = Tensor::<Ad, 1, burn::tensor::Int>::from_data(
            TensorData::new(vec![0i64, 3], [2]).convert::<<Ad as Backend>::IntElem>(),
            device,
        );
        let loss = nn::loss::CrossEntropyLossConfig::new()
            .init(device)
            .forward(logits, targets);
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        optim.step(1e-2, model, grads)
    }

    #[test]
    fn frozen_backbone_is_untouched_by_an_optimizer_step() {
        let device = Default::default();
        let model = tiny().init::<Ad>(&device).unwrap();
        assert_eq!(model.backbone().trainable_blocks(), 0);
        let fixed_input = images::<Inner>(2, &device);
        let features_before = model
            .backbone()
            .clone()
            .valid()
            .forward(fixed_input.clone())
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let head_before = model.clone().valid().head.weight.val();

        let model = train_step(model, &device);

        let features_after = model
            .backbone()
            .clone()
            .valid()
            .forward(fixed_input)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(features_before, features_after);

        let head_after = model.valid().head.weight.val();
        let diff: f32 = (head_after - head_before).abs().sum().into_scalar();
        assert!(diff > 0.0);
    }

    #[test]
    fn frozen_backbone_ignores_batch_statistics_in_training_forward() {
        let device = Default::default();
        let model = tiny().init::<Ad>(&device).unwrap();
        let x = images::<Ad>(2, &device);
        let train_out = model
            .backbone()
            .forward(x.clone())
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let eval_out = model
            .backbone()
            .clone()
            .valid()
            .forward(x.inner())
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(train_out, eval_out);
    }

    #[test]
    fn pretrained_backbone_weights_are_loaded() {
        let device = Default::default();
        let cfg = tiny();
        let source = cfg.backbone.init::<Inner>(&device);
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("backbone");
        source
            .clone()
            .save_file(&path, &BinFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();

        let model = cfg
            .init_with_pretrained::<Inner>(&device, Some(&path.with_extension("bin")))
            .unwrap();
        let expected = source.stem_a_weight().into_data().to_vec::<f32>().unwrap();
        let loaded = model
            .backbone()
            .stem_a_weight()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(expected, loaded);
    }

    #[test]
    fn missing_pretrained_file_is_an_error() {
        let device = Default::default();
        let err = tiny()
            .init_with_pretrained::<Inner>(&device, Some(Path::new("/nonexistent/weights.bin")))
            .unwrap_err();
        assert!(matches!(err, ModelError::Load { .. }));
    }
}
