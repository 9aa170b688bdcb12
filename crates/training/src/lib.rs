#![recursion_limit = "256"]

pub mod callbacks;
pub mod config;
pub mod history;
pub mod metrics;
pub mod plot;
pub mod util;

pub use callbacks::{EarlyStopping, ModelCheckpoint, ReduceLrOnPlateau, StopDecision};
pub use config::TrainConfig;
pub use history::{EpochMetrics, History};
pub use metrics::{
    auc, classification_report, confusion_matrix, precision_recall_curve, roc_curve,
    ClassificationReport, ConfusionMatrix, MetricsError, PrCurve, RocCurve,
};
pub use models::{CrowdClassifier, CrowdClassifierConfig, HyperParams};
pub use util::{run_train, TrainArgs};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
