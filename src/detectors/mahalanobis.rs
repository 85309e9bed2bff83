//! Mahalanobis-distance detector.
//!
//! Scores a sample by its squared Mahalanobis distance
//! `d² = (x - μ)ᵀ C⁺ (x - μ)` to the training activations of each layer,
//! where `C⁺` is the pseudo-inverse of the layer covariance.
//!
//! In relative mode the distance is divided by its diagonal counterpart
//! `Σ (xᵢ - μᵢ)² / Cᵢᵢ`, so a sample that is far away only along directions
//! that are already high-variance per feature is not flagged. Features with
//! `Cᵢᵢ <= rcond` are masked out of the denominator.
//!
//! # References
//!
//! - Lee, K., Lee, K., Lee, H., & Shin, J. (2018). A simple unified framework
//!   for detecting out-of-distribution samples and adversarial attacks.
//!   NeurIPS.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use super::covariance::{centered, check_len};
use super::{
    quantize_matrix, quantize_vector, ActivationCovarianceDetector, DataSource, DetectorKind,
    StatisticalMethod,
};
use crate::config::{DetectorConfig, MahalanobisTrainConfig};
use crate::error::{Result, WardenError};
use crate::nn::Classifier;
use crate::primitives::Matrix;
use crate::serialization::DetectorFile;
use crate::stats::{pinv_hermitian, LayerStatistics};

const MEANS: &str = "means";
const INV_COVARIANCES: &str = "inv_covariances";
const INV_DIAG_COVARIANCES: &str = "inv_diag_covariances";
const RELATIVE_FLAG: &str = "relative";

/// Learned state of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MahalanobisParams {
    /// Mean activation.
    pub mean: DVector<f64>,
    /// Pseudo-inverse of the activation covariance.
    pub inv_covariance: DMatrix<f64>,
    /// `1 / Cᵢᵢ` (0 where `Cᵢᵢ <= rcond`); only in relative mode.
    pub inv_diag_covariance: Option<DVector<f64>>,
}

/// The Mahalanobis [`StatisticalMethod`]. Always fits on trusted data.
#[derive(Debug, Clone, PartialEq)]
pub struct Mahalanobis {
    config: MahalanobisTrainConfig,
}

impl Mahalanobis {
    /// Validates `config` and wraps it.
    ///
    /// # Errors
    ///
    /// See [`MahalanobisTrainConfig::setup_and_validate`].
    pub fn new(config: MahalanobisTrainConfig) -> Result<Self> {
        Ok(Self {
            config: config.setup_and_validate()?,
        })
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &MahalanobisTrainConfig {
        &self.config
    }
}

/// Mahalanobis detector over the activations of a [`Classifier`].
///
/// # Example
///
/// ```
/// use warden::config::MahalanobisTrainConfig;
/// use warden::data::Dataset;
/// use warden::detectors::{AnomalyDetector, MahalanobisDetector};
/// use warden::nn::{normal, Mlp};
///
/// let model = Mlp::new(&[4, 8, 3], Some(0)).expect("valid sizes");
/// let trusted = Dataset::unlabeled(normal(200, 4, 0.0, 1.0, Some(1)));
///
/// let mut detector =
///     MahalanobisDetector::new(model, vec!["layer0".into()], MahalanobisTrainConfig::default())
///         .expect("known layer");
/// detector.train(Some(&trusted), None).expect("trusted data supplied");
///
/// let scores = detector.scores(&normal(5, 4, 0.0, 1.0, Some(2))).expect("trained");
/// assert_eq!(scores.len(), 5);
/// ```
pub type MahalanobisDetector<C> = ActivationCovarianceDetector<Mahalanobis, C>;

impl<C: Classifier> ActivationCovarianceDetector<Mahalanobis, C> {
    /// Creates an untrained Mahalanobis detector.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid config or unknown layers.
    pub fn new(model: C, layers: Vec<String>, config: MahalanobisTrainConfig) -> Result<Self> {
        Self::with_method(model, layers, Mahalanobis::new(config)?)
    }
}

impl StatisticalMethod for Mahalanobis {
    type Params = MahalanobisParams;

    const KIND: DetectorKind = DetectorKind::Mahalanobis;

    fn data_source(&self) -> DataSource {
        DataSource::Trusted
    }

    fn max_batches(&self) -> usize {
        self.config.max_batches
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn config(&self) -> DetectorConfig {
        DetectorConfig::Mahalanobis(self.config.clone())
    }

    fn post_process(&self, _layer: &str, stats: &LayerStatistics) -> Result<MahalanobisParams> {
        let rcond = self.config.rcond;
        let inv_covariance = pinv_hermitian(&stats.covariance, rcond)?;
        let inv_diag_covariance = self.config.relative.then(|| {
            let diag = stats.covariance.diagonal();
            quantize_vector(&diag.map(|c| if c > rcond { 1.0 / c } else { 0.0 }))
        });
        Ok(MahalanobisParams {
            mean: quantize_vector(&stats.mean),
            inv_covariance: quantize_matrix(&inv_covariance),
            inv_diag_covariance,
        })
    }

    fn score(&self, params: &MahalanobisParams, activations: &Matrix<f32>) -> Result<Vec<f64>> {
        let delta = centered(activations, &params.mean)?;
        let weighted = &delta * &params.inv_covariance;

        Ok((0..delta.nrows())
            .map(|i| {
                let d2 = weighted.row(i).dot(&delta.row(i));
                match &params.inv_diag_covariance {
                    None => d2,
                    Some(inv_diag) => {
                        let denom: f64 = delta
                            .row(i)
                            .iter()
                            .zip(inv_diag.iter())
                            .map(|(d, w)| d * d * w)
                            .sum();
                        if denom == 0.0 {
                            0.0
                        } else {
                            d2 / denom
                        }
                    }
                }
            })
            .collect())
    }

    fn write_params(
        &self,
        params: &BTreeMap<String, MahalanobisParams>,
        file: &mut DetectorFile,
    ) -> Result<()> {
        let relative = params.values().any(|p| p.inv_diag_covariance.is_some());
        file.set_flag(RELATIVE_FLAG, relative.to_string())?;
        for (layer, p) in params {
            file.insert_vector(format!("{MEANS}.{layer}"), &p.mean);
            file.insert_matrix(format!("{INV_COVARIANCES}.{layer}"), &p.inv_covariance);
            if let Some(inv_diag) = &p.inv_diag_covariance {
                file.insert_vector(format!("{INV_DIAG_COVARIANCES}.{layer}"), inv_diag);
            }
        }
        Ok(())
    }

    fn read_params(&self, file: &DetectorFile) -> Result<BTreeMap<String, MahalanobisParams>> {
        let relative = file.bool_flag(RELATIVE_FLAG)?;
        file.names_with_prefix(MEANS)
            .into_iter()
            .map(|layer| {
                let mean = file.vector(&format!("{MEANS}.{layer}"))?;
                let d = mean.len();

                let inv_key = format!("{INV_COVARIANCES}.{layer}");
                let inv_covariance = file.matrix(&inv_key)?;
                if inv_covariance.shape() != (d, d) {
                    return Err(WardenError::DimensionMismatch {
                        expected: format!("{inv_key} of shape ({d}, {d})"),
                        actual: format!("{:?}", inv_covariance.shape()),
                    });
                }

                let inv_diag_covariance = if relative {
                    let key = format!("{INV_DIAG_COVARIANCES}.{layer}");
                    let v = file.vector(&key)?;
                    check_len(&key, d, &v)?;
                    Some(v)
                } else {
                    None
                };

                Ok((
                    layer,
                    MahalanobisParams {
                        mean,
                        inv_covariance,
                        inv_diag_covariance,
                    },
                ))
            })
            .collect()
    }
}
