//! Loading a class-per-directory image tree into preprocessed samples.

use crate::preprocess::preprocess_image;
use crate::types::{DatasetError, DatasetResult, LoadSummary, Sample};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Preprocessed samples with their string labels; `samples[i]` is labelled `labels[i]`.
#[derive(Debug, Clone, Default)]
pub struct LabeledDataset {
    pub samples: Vec<Sample>,
    pub labels: Vec<String>,
    pub summary: LoadSummary,
}

impl LabeledDataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Sorted regular files of one class directory, plus the number of entries that could
/// not be read or are not files.
fn list_class_files(class_dir: &Path) -> DatasetResult<(Vec<PathBuf>, usize)> {
    let entries = fs::read_dir(class_dir).map_err(|e| DatasetError::Io {
        path: class_dir.to_path_buf(),
        source: e,
    })?;
    let mut files = Vec::new();
    let mut dropped = 0usize;
    for entry in entries {
        match entry {
            Ok(entry) => {
                let path = entry.path();
                if path.is_file() {
                    files.push(path);
                } else {
                    warn!("skipping non-file entry {}", path.display());
                    dropped += 1;
                }
            }
            Err(e) => {
                warn!("skipping unreadable entry in {}: {e}", class_dir.display());
                dropped += 1;
            }
        }
    }
    files.sort();
    Ok((files, dropped))
}

/// Walk `base_dir/<class>` for each class and preprocess every file.
///
/// Files that fail to decode, and entries that are not files, are skipped with a warning
/// and counted in the summary; no label is recorded for them.
/// A missing class directory is an error.
pub fn load_dataset<S: AsRef<str>>(base_dir: &Path, classes: &[S]) -> DatasetResult<LabeledDataset> {
    let mut dataset = LabeledDataset::default();
    for class in classes {
        let class = class.as_ref();
        let class_dir = base_dir.join(class);
        let (files, dropped) = list_class_files(&class_dir)?;
        debug!(class, files = files.len(), dropped, dir = %class_dir.display(), "indexing class");
        for _ in 0..dropped {
            dataset.summary.record(class, false);
        }

        let loaded: Vec<DatasetResult<Sample>> =
            files.par_iter().map(|path| preprocess_image(path)).collect();

        for res in loaded {
            match res {
                Ok(sample) => {
                    dataset.samples.push(sample);
                    dataset.labels.push(class.to_string());
                    dataset.summary.record(class, true);
                }
                Err(e) => {
                    warn!("skipping unreadable image: {e}");
                    dataset.summary.record(class, false);
                }
            }
        }
    }
    info!(
        loaded = dataset.summary.loaded,
        skipped = dataset.summary.skipped,
        root = %base_dir.display(),
        "dataset loaded"
    );
    Ok(dataset)
}
