//! Anomaly detectors.
//!
//! Every detector implements [`AnomalyDetector`]: per-sample scores,
//! optionally broken down per layer, and persistence through
//! [`DetectorFile`]. Higher scores mean "more anomalous".
//!
//! - [`MahalanobisDetector`]: squared Mahalanobis distance to the trusted
//!   activation distribution.
//! - [`SpectralSignatureDetector`]: squared projection onto the top
//!   covariance direction (Tran et al., 2018).
//! - [`FinetuningDetector`]: KL divergence between the model and a copy
//!   finetuned on trusted data.
//!
//! The two statistical detectors share [`ActivationCovarianceDetector`],
//! which streams activations through a
//! [`CovarianceAccumulator`](crate::stats::CovarianceAccumulator) and hands
//! the finished statistics to a [`StatisticalMethod`].

mod covariance;
mod finetuning;
mod mahalanobis;
mod spectral;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WardenError};
use crate::primitives::Matrix;
use crate::serialization::DetectorFile;

pub use covariance::{ActivationCovarianceDetector, StatisticalMethod};
pub use finetuning::FinetuningDetector;
pub use mahalanobis::{Mahalanobis, MahalanobisDetector, MahalanobisParams};
pub use spectral::{SpectralParams, SpectralSignature, SpectralSignatureDetector};

#[cfg(test)]
mod tests;

/// Layer name -> one score per sample.
pub type LayerScores = BTreeMap<String, Vec<f32>>;

/// The detector families this crate knows how to build and load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Mahalanobis,
    SpectralSignature,
    Finetuning,
}

impl DetectorKind {
    /// Name used in detector files and configs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mahalanobis => "mahalanobis",
            Self::SpectralSignature => "spectral_signature",
            Self::Finetuning => "finetuning",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mahalanobis" => Ok(Self::Mahalanobis),
            "spectral_signature" => Ok(Self::SpectralSignature),
            "finetuning" => Ok(Self::Finetuning),
            other => Err(WardenError::Format(format!("unknown detector kind '{other}'"))),
        }
    }
}

/// Which dataset a statistical detector fits its statistics on.
///
/// Has no default. Spectral signatures are usually fitted on the untrusted
/// (possibly poisoned) data and Mahalanobis on trusted data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Trusted,
    Untrusted,
}

impl DataSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Untrusted => "untrusted",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trusted" => Ok(Self::Trusted),
            "untrusted" => Ok(Self::Untrusted),
            other => Err(WardenError::Format(format!("unknown data source '{other}'"))),
        }
    }
}

/// Common interface of trained detectors.
pub trait AnomalyDetector {
    /// Detector family, as written to saved files.
    fn kind(&self) -> DetectorKind;

    /// True once trained or loaded.
    fn is_trained(&self) -> bool;

    /// Scores broken down per layer.
    ///
    /// # Errors
    ///
    /// [`WardenError::Unsupported`] for detectors without a per-layer notion,
    /// [`WardenError::State`] before training, and
    /// [`WardenError::NonFiniteScore`] if any score is not finite.
    fn layerwise_scores(&self, inputs: &Matrix<f32>) -> Result<LayerScores>;

    /// One score per input row.
    ///
    /// The default averages [`Self::layerwise_scores`] over layers.
    ///
    /// # Errors
    ///
    /// See [`Self::layerwise_scores`].
    fn scores(&self, inputs: &Matrix<f32>) -> Result<Vec<f32>> {
        aggregate_layer_scores(&self.layerwise_scores(inputs)?)
    }

    /// Snapshot of the learned state.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::State`] before training.
    fn to_file(&self) -> Result<DetectorFile>;

    /// Replaces the learned state with the contents of `file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is for another detector kind or misses
    /// required tensors.
    fn load_file(&mut self, file: &DetectorFile) -> Result<()>;

    /// Writes the learned state to `path`.
    ///
    /// # Errors
    ///
    /// See [`Self::to_file`] and [`DetectorFile::save`].
    fn save(&self, path: &Path) -> Result<()> {
        self.to_file()?.save(path)
    }

    /// Reads the learned state from `path`.
    ///
    /// # Errors
    ///
    /// See [`DetectorFile::load`] and [`Self::load_file`].
    fn load(&mut self, path: &Path) -> Result<()> {
        let file = DetectorFile::load(path)?;
        self.load_file(&file)
    }
}

/// Averages per-layer scores into one score per sample.
///
/// # Errors
///
/// - [`WardenError::EmptyInput`] if there are no layers.
/// - [`WardenError::DimensionMismatch`] if layers disagree on sample count.
pub fn aggregate_layer_scores(scores: &LayerScores) -> Result<Vec<f32>> {
    let mut layers = scores.iter();
    let (first_name, first) = layers
        .next()
        .ok_or_else(|| WardenError::EmptyInput("no layer scores to aggregate".into()))?;
    let mut total: Vec<f64> = first.iter().map(|&s| f64::from(s)).collect();
    for (name, layer) in layers {
        if layer.len() != total.len() {
            return Err(WardenError::dimension_mismatch(
                &format!("scores of '{name}' (vs '{first_name}')"),
                total.len(),
                layer.len(),
            ));
        }
        for (acc, &s) in total.iter_mut().zip(layer) {
            *acc += f64::from(s);
        }
    }
    let n_layers = scores.len() as f64;
    Ok(total.into_iter().map(|s| (s / n_layers) as f32).collect())
}

/// Narrows scores to `f32`, failing on the first non-finite value.
pub(crate) fn finite_scores(context: &str, scores: Vec<f64>) -> Result<Vec<f32>> {
    scores
        .into_iter()
        .map(|s| {
            let narrowed = s as f32;
            if narrowed.is_finite() {
                Ok(narrowed)
            } else {
                Err(WardenError::non_finite(context, s))
            }
        })
        .collect()
}

/// Rounds every entry to the nearest `f32` so parameters survive a
/// save/load cycle bit for bit.
pub(crate) fn quantize_matrix(m: &DMatrix<f64>) -> DMatrix<f64> {
    m.map(|x| f64::from(x as f32))
}

pub(crate) fn quantize_vector(v: &DVector<f64>) -> DVector<f64> {
    v.map(|x| f64::from(x as f32))
}
