//! Fixed preprocessing: resize, BT.601 grayscale, CLAHE, channel replication, [0,1] scaling.

use crate::clahe::Clahe;
use crate::types::{DatasetError, DatasetResult, Sample};
use image::imageops::FilterType;
use image::{GrayImage, RgbImage};
use std::path::Path;

pub const IMAGE_SIZE: u32 = 224;
pub const IMAGE_CHANNELS: usize = 3;
pub const SAMPLE_LEN: usize = IMAGE_CHANNELS * (IMAGE_SIZE * IMAGE_SIZE) as usize;

/// Decode and preprocess one image file.
pub fn preprocess_image(path: &Path) -> DatasetResult<Sample> {
    let img = image::open(path).map_err(|e| DatasetError::Image {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Sample {
        image_chw: preprocess_rgb(&img.to_rgb8()),
        source: path.to_path_buf(),
    })
}

/// Preprocess an already-decoded RGB image into a CHW buffer of `SAMPLE_LEN` values.
pub fn preprocess_rgb(img: &RgbImage) -> Vec<f32> {
    let resized = image::imageops::resize(img, IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle);
    let gray = to_gray_bt601(&resized);
    let equalized = Clahe::default().apply(&gray);
    replicate_channels(&equalized)
}

/// Luma with 0.299/0.587/0.114 weights (`image`'s own grayscale uses Rec. 709).
pub fn to_gray_bt601(img: &RgbImage) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        let luma = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        image::Luma([luma.round().clamp(0.0, 255.0) as u8])
    })
}

fn replicate_channels(gray: &GrayImage) -> Vec<f32> {
    let plane: Vec<f32> = gray.pixels().map(|p| p[0] as f32 / 255.0).collect();
    let mut chw = Vec::with_capacity(plane.len() * IMAGE_CHANNELS);
    for _ in 0..IMAGE_CHANNELS {
        chw.extend_from_slice(&plane);
    }
    chw
}
