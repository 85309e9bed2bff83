//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use warden::prelude::*;
//! ```

pub use crate::activations::{extract, ActivationBatch};
pub use crate::config::{
    DetectorConfig, FinetuningTrainConfig, MahalanobisTrainConfig, SpectralTrainConfig,
    VersionedConfig,
};
pub use crate::data::Dataset;
pub use crate::detectors::{
    AnomalyDetector, DataSource, DetectorKind, FinetuningDetector, LayerScores,
    MahalanobisDetector, SpectralSignatureDetector,
};
pub use crate::error::{Result, WardenError};
pub use crate::eval::{evaluate, EvalReport};
pub use crate::nn::optim::{Adam, Optimizer, OptimizerFactory, Sgd};
pub use crate::nn::{normal, Classifier, Mlp};
pub use crate::primitives::Matrix;
pub use crate::train::Trainer;
