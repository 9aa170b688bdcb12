//! Fit-once string label encoder.

use crate::types::{DatasetError, DatasetResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maps class names to dense indices in sorted-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    /// Fit on observed labels; classes are the sorted unique names.
    pub fn fit<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut classes: Vec<String> = labels.iter().map(|l| l.as_ref().to_string()).collect();
        classes.sort();
        classes.dedup();
        Self { classes }
    }

    pub fn fit_transform<S: AsRef<str>>(labels: &[S]) -> DatasetResult<(Self, Vec<usize>)> {
        let encoder = Self::fit(labels);
        let encoded = encoder.transform_all(labels)?;
        Ok((encoder, encoded))
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn transform(&self, label: &str) -> DatasetResult<usize> {
        if self.classes.is_empty() {
            return Err(DatasetError::NotFitted);
        }
        self.classes
            .binary_search_by(|c| c.as_str().cmp(label))
            .map_err(|_| DatasetError::UnknownLabel {
                label: label.to_string(),
                known: self.classes.clone(),
            })
    }

    pub fn transform_all<S: AsRef<str>>(&self, labels: &[S]) -> DatasetResult<Vec<usize>> {
        labels.iter().map(|l| self.transform(l.as_ref())).collect()
    }

    pub fn inverse_transform(&self, index: usize) -> DatasetResult<&str> {
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or(DatasetError::IndexOutOfRange {
                index,
                classes: self.classes.len(),
            })
    }

    pub fn save(&self, path: &Path) -> DatasetResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| DatasetError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, json).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn load(path: &Path) -> DatasetResult<Self> {
        let raw = std::fs::read(path).map_err(|e| DatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_slice(&raw).map_err(|e| DatasetError::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_label_is_rejected() {
        let enc = LabelEncoder::fit(&["Dense", "Sparse"]);
        assert!(matches!(
            enc.transform("Medium_Dense"),
            Err(DatasetError::UnknownLabel { .. })
        ));
    }

    #[test]
    fn unfitted_encoder_errors() {
        assert!(matches!(
            LabelEncoder::default().transform("Dense"),
            Err(DatasetError::NotFitted)
        ));
    }
}
