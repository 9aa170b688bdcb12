//! Core types, error definitions, and data structures for crowd_dataset.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Class directories expected under the dataset root, in load order.
pub const DEFAULT_CLASSES: [&str; 4] = ["Dense", "Medium_Dense", "Sparse", "None"];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("unknown label {label:?}; encoder was fitted on {known:?}")]
    UnknownLabel { label: String, known: Vec<String> },
    #[error("label index {index} out of range for {classes} classes")]
    IndexOutOfRange { index: usize, classes: usize },
    #[error("label encoder is not fitted")]
    NotFitted,
    #[error("{0}")]
    Other(String),
}

/// One preprocessed image.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Image in CHW layout, normalized to [0, 1]; always `SAMPLE_LEN` values.
    pub image_chw: Vec<f32>,
    pub source: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassSummary {
    pub loaded: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSummary {
    pub per_class: BTreeMap<String, ClassSummary>,
    pub loaded: usize,
    pub skipped: usize,
}

impl LoadSummary {
    pub(crate) fn record(&mut self, class: &str, loaded: bool) {
        let entry = self.per_class.entry(class.to_string()).or_default();
        if loaded {
            entry.loaded += 1;
            self.loaded += 1;
        } else {
            entry.skipped += 1;
            self.skipped += 1;
        }
    }
}
