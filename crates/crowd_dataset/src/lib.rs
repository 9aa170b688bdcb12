//! Dataset loading, preprocessing, splitting, and Burn-compatible batching for crowd-density
//! classification.
//!
//! This crate provides utilities for:
//! - CLAHE-based grayscale preprocessing into fixed-size 224x224x3 samples
//! - Loading a class-per-directory image tree
//! - Fit-once label encoding
//! - Seeded train/test splitting
//! - Geometric augmentation and Burn batch iteration

pub mod aug;
pub mod clahe;
pub mod labels;
pub mod loader;
pub mod preprocess;
pub mod splits;
pub mod types;

#[cfg(feature = "burn-runtime")]
pub mod batch;

pub use aug::{AugmentConfig, Augmenter};
pub use clahe::Clahe;
pub use labels::LabelEncoder;
pub use loader::{load_dataset, LabeledDataset};
pub use preprocess::{preprocess_image, preprocess_rgb, IMAGE_CHANNELS, IMAGE_SIZE, SAMPLE_LEN};
pub use splits::{train_test_split, Split};
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::{BatchIter, ClassificationBatch};
