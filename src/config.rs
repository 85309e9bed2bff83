//! Training configuration for the detectors.
//!
//! Every config has defaults for all fields, rejects unknown fields when
//! parsed, and is checked by `setup_and_validate` before training. Debug
//! mode shrinks the run to a couple of tiny batches for smoke tests.
//!
//! Persisted configs are wrapped in a [`VersionedConfig`]:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "detector": { "kind": "mahalanobis", "config": { "relative": true } }
//! }
//! ```

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::detectors::DetectorKind;
use crate::error::{Result, WardenError};
use crate::nn::optim::OptimizerFactory;

/// Schema version written to and accepted from [`VersionedConfig`].
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

const DEBUG_BATCHES: usize = 2;
const DEBUG_BATCH_SIZE: usize = 2;
const DEBUG_STEPS: usize = 2;

fn check_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(WardenError::InvalidHyperparameter {
            param: "batch_size".into(),
            value: "0".into(),
            constraint: "> 0".into(),
        });
    }
    Ok(())
}

/// Settings of [`crate::detectors::MahalanobisDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MahalanobisTrainConfig {
    /// Stop accumulating after this many batches (0 = all).
    pub max_batches: usize,
    /// Divide scores by the diagonal-normalized distance.
    pub relative: bool,
    /// Relative eigenvalue cutoff of the pseudo-inverse.
    pub rcond: f64,
    /// Samples per activation batch.
    pub batch_size: usize,
    /// Tiny run for smoke tests.
    pub debug: bool,
}

impl Default for MahalanobisTrainConfig {
    fn default() -> Self {
        Self {
            max_batches: 0,
            relative: false,
            rcond: 1e-5,
            batch_size: 4096,
            debug: false,
        }
    }
}

impl MahalanobisTrainConfig {
    /// Applies debug overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidHyperparameter`] if `rcond` is not a
    /// positive finite number or `batch_size` is zero.
    pub fn setup_and_validate(mut self) -> Result<Self> {
        if self.debug {
            info!("Debug mode: max_batches={DEBUG_BATCHES}, batch_size={DEBUG_BATCH_SIZE}");
            self.max_batches = DEBUG_BATCHES;
            self.batch_size = DEBUG_BATCH_SIZE;
        }
        if !(self.rcond.is_finite() && self.rcond > 0.0) {
            return Err(WardenError::InvalidHyperparameter {
                param: "rcond".into(),
                value: self.rcond.to_string(),
                constraint: "> 0 and finite".into(),
            });
        }
        check_batch_size(self.batch_size)?;
        Ok(self)
    }
}

/// Settings of [`crate::detectors::SpectralSignatureDetector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpectralTrainConfig {
    /// Stop accumulating after this many batches (0 = all).
    pub max_batches: usize,
    /// Samples per activation batch.
    pub batch_size: usize,
    /// Tiny run for smoke tests.
    pub debug: bool,
}

impl Default for SpectralTrainConfig {
    fn default() -> Self {
        Self {
            max_batches: 0,
            batch_size: 4096,
            debug: false,
        }
    }
}

impl SpectralTrainConfig {
    /// Applies debug overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidHyperparameter`] if `batch_size` is zero.
    pub fn setup_and_validate(mut self) -> Result<Self> {
        if self.debug {
            info!("Debug mode: max_batches={DEBUG_BATCHES}, batch_size={DEBUG_BATCH_SIZE}");
            self.max_batches = DEBUG_BATCHES;
            self.batch_size = DEBUG_BATCH_SIZE;
        }
        check_batch_size(self.batch_size)?;
        Ok(self)
    }
}

/// Settings of [`crate::detectors::FinetuningDetector`].
///
/// The optimizer is chosen in code through [`OptimizerFactory`] and is not
/// part of the serialized form; a parsed config always uses Adam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FinetuningTrainConfig {
    /// Learning rate handed to the optimizer factory.
    pub lr: f32,
    /// Samples per training batch.
    pub batch_size: usize,
    /// Passes over the trusted data.
    pub epochs: usize,
    /// Optional cap on optimizer steps.
    pub max_steps: Option<usize>,
    /// Shuffle seed.
    pub seed: u64,
    /// Log every optimizer step at info level.
    pub verbose: bool,
    /// Tiny run for smoke tests.
    pub debug: bool,
    #[serde(skip)]
    pub optimizer: OptimizerFactory,
}

impl Default for FinetuningTrainConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            batch_size: 64,
            epochs: 1,
            max_steps: None,
            seed: 0,
            verbose: false,
            debug: false,
            optimizer: OptimizerFactory::default(),
        }
    }
}

impl FinetuningTrainConfig {
    /// Applies debug overrides and validates.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidHyperparameter`] if `lr` is not a
    /// positive finite number, or `batch_size` or `epochs` is zero.
    pub fn setup_and_validate(mut self) -> Result<Self> {
        if self.debug {
            info!("Debug mode: max_steps={DEBUG_STEPS}, batch_size={DEBUG_BATCH_SIZE}");
            self.max_steps = Some(DEBUG_STEPS);
            self.batch_size = DEBUG_BATCH_SIZE;
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(WardenError::InvalidHyperparameter {
                param: "lr".into(),
                value: self.lr.to_string(),
                constraint: "> 0 and finite".into(),
            });
        }
        check_batch_size(self.batch_size)?;
        if self.epochs == 0 {
            return Err(WardenError::InvalidHyperparameter {
                param: "epochs".into(),
                value: "0".into(),
                constraint: "> 0".into(),
            });
        }
        Ok(self)
    }
}

/// Configuration of any known detector kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum DetectorConfig {
    /// Mahalanobis distance over activation statistics.
    Mahalanobis(MahalanobisTrainConfig),
    /// Projection onto the top covariance direction.
    SpectralSignature(SpectralTrainConfig),
    /// KL divergence to a finetuned copy.
    Finetuning(FinetuningTrainConfig),
}

impl DetectorConfig {
    /// Kind of detector this config belongs to.
    #[must_use]
    pub fn kind(&self) -> DetectorKind {
        match self {
            Self::Mahalanobis(_) => DetectorKind::Mahalanobis,
            Self::SpectralSignature(_) => DetectorKind::SpectralSignature,
            Self::Finetuning(_) => DetectorKind::Finetuning,
        }
    }
}

/// A [`DetectorConfig`] tagged with the schema version it was written in.
///
/// # Examples
///
/// ```
/// use warden::config::{DetectorConfig, MahalanobisTrainConfig, VersionedConfig};
///
/// let config = VersionedConfig::new(DetectorConfig::Mahalanobis(MahalanobisTrainConfig {
///     relative: true,
///     ..Default::default()
/// }));
/// let json = config.to_json().expect("serializable");
/// assert_eq!(VersionedConfig::from_json(&json).expect("valid"), config);
///
/// // Unknown fields are rejected rather than ignored
/// let typo = r#"{"schema_version":1,"detector":{"kind":"mahalanobis","config":{"rcnd":1e-3}}}"#;
/// assert!(VersionedConfig::from_json(typo).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionedConfig {
    /// Always [`CONFIG_SCHEMA_VERSION`] when written by this crate.
    pub schema_version: u32,
    /// The wrapped configuration.
    pub detector: DetectorConfig,
}

impl VersionedConfig {
    /// Wraps `detector` with the current schema version.
    #[must_use]
    pub fn new(detector: DetectorConfig) -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            detector,
        }
    }

    /// Parses JSON and checks the schema version.
    ///
    /// # Errors
    ///
    /// - [`WardenError::Serialization`] for malformed JSON, unknown kinds or
    ///   unknown fields.
    /// - [`WardenError::UnsupportedVersion`] for another schema version.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        if config.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(WardenError::UnsupportedVersion {
                found: config.schema_version.to_string(),
                supported: CONFIG_SCHEMA_VERSION.to_string(),
            });
        }
        Ok(config)
    }

    /// Serializes to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reads a config file.
    ///
    /// # Errors
    ///
    /// See [`Self::from_json`]; I/O failures are [`WardenError::Io`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Writes a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
