//! Warden: backdoor and anomaly detection for neural-network classifiers.
//!
//! Detectors are fitted on the activations or outputs of a trained model
//! over trusted (or untrusted) data and then assign every new input an
//! anomaly score. Higher scores mean "more anomalous".
//!
//! # Quick Start
//!
//! ```
//! use warden::prelude::*;
//!
//! // A small classifier and some clean data
//! let model = Mlp::new(&[4, 16, 3], Some(42)).expect("valid sizes");
//! let clean = Dataset::unlabeled(normal(500, 4, 0.0, 1.0, Some(1)));
//!
//! // Fit Mahalanobis statistics on the hidden layer
//! let mut detector = MahalanobisDetector::new(
//!     model,
//!     vec!["layer0".into()],
//!     MahalanobisTrainConfig::default(),
//! )
//! .expect("known layer");
//! detector.train(Some(&clean), None).expect("trusted data supplied");
//!
//! // Far-away inputs score higher than typical ones
//! let typical = detector.scores(&normal(1, 4, 0.0, 1.0, Some(2))).expect("trained");
//! let outlier = detector.scores(&normal(1, 4, 8.0, 1.0, Some(3))).expect("trained");
//! assert!(outlier[0] > typical[0]);
//! ```
//!
//! # Modules
//!
//! - [`primitives`]: Dense row-major `Matrix`
//! - [`nn`]: `Classifier` trait, `Mlp`, optimizers, state dicts
//! - [`data`]: Datasets and mini-batching
//! - [`train`]: Supervised training loop
//! - [`activations`]: Named activation batches and chunked extraction
//! - [`stats`]: Streaming covariance, pseudo-inverse, eigenvectors
//! - [`detectors`]: Mahalanobis, spectral-signature and finetuning detectors
//! - [`config`]: Versioned, validated detector configuration
//! - [`serialization`]: `SafeTensors` detector files
//! - [`eval`]: AUROC / average precision reports

pub mod activations;
pub mod config;
pub mod data;
pub mod detectors;
pub mod error;
pub mod eval;
pub mod nn;
pub mod prelude;
pub mod primitives;
pub mod serialization;
pub mod stats;
pub mod train;

pub use error::{Result, WardenError};
pub use primitives::Matrix;
