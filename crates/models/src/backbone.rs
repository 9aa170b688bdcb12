//! Inception-style convolutional feature extractor.
//!
//! Shapes:
//! - Input images: `[B, 3, H, W]`
//! - Output features: `[B, out_channels, H/4 >> (blocks - 1), ...]`

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::ModelError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub stem_channels: usize,
    /// Branch width of the first Inception block; doubles with every block.
    pub branch_width: usize,
    pub blocks: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            stem_channels: 32,
            branch_width: 32,
            blocks: 3,
        }
    }
}

impl BackboneConfig {
    fn block_width(&self, idx: usize) -> usize {
        self.branch_width.max(1) << idx
    }

    /// Channel count of the final feature map.
    pub fn out_channels(&self) -> usize {
        4 * self.block_width(self.blocks.max(1) - 1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Backbone<B> {
        let stem_channels = self.stem_channels.max(1);
        let stem_a = ConvBn::new(3, stem_channels / 2 + 1, 3, 2, device);
        let stem_b = ConvBn::new(stem_channels / 2 + 1, stem_channels, 3, 1, device);
        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        for idx in 0..self.blocks.max(1) {
            let width = self.block_width(idx);
            blocks.push(InceptionBlock::new(in_channels, width, device));
            in_channels = 4 * width;
        }
        Backbone {
            stem_a,
            stem_b,
            blocks,
            reduce: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
        }
    }
}

/// Convolution, batch norm, ReLU.
///
/// A frozen unit normalizes with its stored running statistics on every backend, so
/// training steps never move them.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    frozen: Ignored<bool>,
}

impl<B: Backend> ConvBn<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let pad = kernel / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_bias(false)
            .init(device);
        let norm = BatchNormConfig::new(out_channels).init(device);
        Self {
            conv,
            norm,
            frozen: Ignored(false),
        }
    }

    /// Stop gradients and pin the batch norm to inference mode.
    pub fn frozen(self) -> Self {
        Self {
            frozen: Ignored(true),
            ..self.no_grad()
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.0
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = if self.frozen.0 {
            self.normalize_with_running_stats(x)
        } else {
            self.norm.forward(x)
        };
        relu(x)
    }

    fn normalize_with_running_stats(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = x.dims()[1];
        let shape = [1, channels, 1, 1];
        let mean = self.norm.running_mean.value().reshape(shape);
        let std = self
            .norm
            .running_var
            .value()
            .add_scalar(self.norm.epsilon)
            .sqrt()
            .reshape(shape);
        let gamma = self.norm.gamma.val().reshape(shape);
        let beta = self.norm.beta.val().reshape(shape);
        (x - mean) / std * gamma + beta
    }
}

/// Four parallel branches (1x1, 3x3, double 3x3, pool + 1x1) concatenated on channels.
#[derive(Module, Debug)]
pub struct InceptionBlock<B: Backend> {
    branch1: ConvBn<B>,
    branch3_reduce: ConvBn<B>,
    branch3: ConvBn<B>,
    branch5_reduce: ConvBn<B>,
    branch5_a: ConvBn<B>,
    branch5_b: ConvBn<B>,
    pool: AvgPool2d,
    pool_proj: ConvBn<B>,
}

impl<B: Backend> InceptionBlock<B> {
    pub fn new(in_channels: usize, width: usize, device: &B::Device) -> Self {
        let reduced = (width / 2).max(1);
        Self {
            branch1: ConvBn::new(in_channels, width, 1, 1, device),
            branch3_reduce: ConvBn::new(in_channels, reduced, 1, 1, device),
            branch3: ConvBn::new(reduced, width, 3, 1, device),
            branch5_reduce: ConvBn::new(in_channels, reduced, 1, 1, device),
            branch5_a: ConvBn::new(reduced, width, 3, 1, device),
            branch5_b: ConvBn::new(width, width, 3, 1, device),
            pool: AvgPool2dConfig::new([3, 3])
                .with_strides([1, 1])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            pool_proj: ConvBn::new(in_channels, width, 1, 1, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let b1 = self.branch1.forward(input.clone());
        let b3 = self
            .branch3
            .forward(self.branch3_reduce.forward(input.clone()));
        let b5 = self.branch5_b.forward(
            self.branch5_a
                .forward(self.branch5_reduce.forward(input.clone())),
        );
        let bp = self.pool_proj.forward(self.pool.forward(input));
        Tensor::cat(vec![b1, b3, b5, bp], 1)
    }

    fn frozen(self) -> Self {
        Self {
            branch1: self.branch1.frozen(),
            branch3_reduce: self.branch3_reduce.frozen(),
            branch3: self.branch3.frozen(),
            branch5_reduce: self.branch5_reduce.frozen(),
            branch5_a: self.branch5_a.frozen(),
            branch5_b: self.branch5_b.frozen(),
            pool: self.pool,
            pool_proj: self.pool_proj.frozen(),
        }
    }
}

#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem_a: ConvBn<B>,
    stem_b: ConvBn<B>,
    blocks: Vec<InceptionBlock<B>>,
    reduce: MaxPool2d,
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.stem_a.forward(images);
        let mut x = self.reduce.forward(self.stem_b.forward(x));
        let last = self.blocks.len().saturating_sub(1);
        for (idx, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if idx < last {
                x = self.reduce.forward(x);
            }
        }
        x
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of trailing blocks whose batch norms still train.
    pub fn trainable_blocks(&self) -> usize {
        self.blocks
            .iter()
            .rev()
            .take_while(|block| !block.branch1.is_frozen())
            .count()
    }

    /// Kernel of the first stem convolution.
    pub fn stem_a_weight(&self) -> Tensor<B, 4> {
        self.stem_a.conv.weight.val()
    }

    /// Freeze everything except the last `trainable_tail` Inception blocks: no gradients
    /// and batch norm in inference mode. The stem thaws only when the tail covers every
    /// block.
    pub fn freeze(self, trainable_tail: usize) -> Self {
        let total = self.blocks.len();
        let frozen = total.saturating_sub(trainable_tail);
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(idx, block)| if idx < frozen { block.frozen() } else { block })
            .collect();
        let (stem_a, stem_b) = if trainable_tail > total {
            (self.stem_a, self.stem_b)
        } else {
            (self.stem_a.frozen(), self.stem_b.frozen())
        };
        Self {
            stem_a,
            stem_b,
            blocks,
            reduce: self.reduce,
        }
    }

    /// Load weights previously written with `save_file` (full precision).
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self, ModelError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path, &recorder, device)
            .map_err(|e| ModelError::Load {
                path: path.to_path_buf(),
                msg: e.to_string(),
            })
    }
}
