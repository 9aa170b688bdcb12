//! Mini-batch iteration over preprocessed samples.

use crate::aug::{AugmentConfig, Augmenter};
use crate::preprocess::{IMAGE_CHANNELS, IMAGE_SIZE, SAMPLE_LEN};
use crate::types::{DatasetError, DatasetResult, Sample};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

pub struct ClassificationBatch<B: Backend> {
    /// `[batch, 3, 224, 224]`
    pub images: Tensor<B, 4>,
    /// `[batch]` encoded class indices.
    pub targets: Tensor<B, 1, Int>,
}

pub struct BatchIter<'a> {
    samples: &'a [Sample],
    targets: &'a [usize],
    indices: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    epoch: u64,
    augmenter: Option<Augmenter>,
}

impl<'a> BatchIter<'a> {
    /// Iterate `indices` of `samples`/`targets` in order, without augmentation.
    pub fn new(
        samples: &'a [Sample],
        targets: &'a [usize],
        indices: Vec<usize>,
        batch_size: usize,
    ) -> DatasetResult<Self> {
        if samples.len() != targets.len() {
            return Err(DatasetError::Other(format!(
                "sample/target length mismatch: {} vs {}",
                samples.len(),
                targets.len()
            )));
        }
        if let Some(bad) = indices.iter().find(|i| **i >= samples.len()) {
            return Err(DatasetError::Other(format!(
                "index {bad} out of range for {} samples",
                samples.len()
            )));
        }
        Ok(Self {
            samples,
            targets,
            indices,
            cursor: 0,
            batch_size: batch_size.max(1),
            epoch: 0,
            augmenter: None,
        })
    }

    /// Training iterator: shuffled with `seed ^ epoch` and augmented per sample.
    pub fn for_training(
        samples: &'a [Sample],
        targets: &'a [usize],
        mut indices: Vec<usize>,
        batch_size: usize,
        epoch: u64,
        seed: u64,
        aug: &AugmentConfig,
    ) -> DatasetResult<Self> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed ^ epoch);
        indices.shuffle(&mut rng);
        let mut iter = Self::new(samples, targets, indices, batch_size)?;
        iter.epoch = epoch;
        if !aug.is_identity() {
            iter.augmenter = Some(Augmenter::new(aug.clone()));
        }
        Ok(iter)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<ClassificationBatch<B>>> {
        if self.cursor >= self.indices.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let slice = &self.indices[self.cursor..end];
        self.cursor = end;

        let epoch = self.epoch;
        let augmenter = self.augmenter.as_ref();
        let samples = self.samples;
        let planes: Vec<Vec<f32>> = slice
            .par_iter()
            .map(|&idx| {
                let chw = &samples[idx].image_chw;
                match augmenter {
                    Some(aug) => aug.apply(
                        chw,
                        IMAGE_SIZE as usize,
                        IMAGE_SIZE as usize,
                        (epoch << 32) ^ idx as u64,
                    ),
                    None => chw.clone(),
                }
            })
            .collect();

        let batch_len = slice.len();
        let mut images_buf = Vec::with_capacity(batch_len * SAMPLE_LEN);
        for plane in &planes {
            if plane.len() != SAMPLE_LEN {
                return Err(DatasetError::Other(format!(
                    "sample has {} values, expected {SAMPLE_LEN}",
                    plane.len()
                )));
            }
            images_buf.extend_from_slice(plane);
        }
        let targets_buf: Vec<i64> = slice.iter().map(|&i| self.targets[i] as i64).collect();

        let size = IMAGE_SIZE as usize;
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(images_buf, [batch_len, IMAGE_CHANNELS, size, size]),
            device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets_buf, [batch_len]).convert::<B::IntElem>(),
            device,
        );
        Ok(Some(ClassificationBatch { images, targets }))
    }
}
