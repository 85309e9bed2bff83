//! Spectral-signature detector.
//!
//! Poisoned samples tend to dominate the top principal direction of the
//! activations they are mixed into. The score of a sample is its squared
//! projection `((x - μ) · v)²` onto the unit eigenvector `v` of the largest
//! covariance eigenvalue.
//!
//! # References
//!
//! - Tran, B., Li, J., & Madry, A. (2018). Spectral signatures in backdoor
//!   attacks. NeurIPS.

use std::collections::BTreeMap;

use nalgebra::DVector;

use super::covariance::{centered, check_len};
use super::{
    quantize_vector, ActivationCovarianceDetector, DataSource, DetectorKind, StatisticalMethod,
};
use crate::config::{DetectorConfig, SpectralTrainConfig};
use crate::error::Result;
use crate::nn::Classifier;
use crate::primitives::Matrix;
use crate::serialization::DetectorFile;
use crate::stats::{top_eigenvector, LayerStatistics};

const MEANS: &str = "means";
const TOP_SINGULAR_VECTORS: &str = "top_singular_vectors";
const DATA_SOURCE_FLAG: &str = "data_source";

/// Learned state of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralParams {
    /// Mean activation.
    pub mean: DVector<f64>,
    /// Unit eigenvector of the largest covariance eigenvalue.
    pub top_singular_vector: DVector<f64>,
}

/// The spectral-signature [`StatisticalMethod`].
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralSignature {
    config: SpectralTrainConfig,
    source: DataSource,
}

impl SpectralSignature {
    /// Validates `config`; statistics will be fitted on `source`.
    ///
    /// # Errors
    ///
    /// See [`SpectralTrainConfig::setup_and_validate`].
    pub fn new(config: SpectralTrainConfig, source: DataSource) -> Result<Self> {
        Ok(Self {
            config: config.setup_and_validate()?,
            source,
        })
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &SpectralTrainConfig {
        &self.config
    }
}

/// Spectral-signature detector over the activations of a [`Classifier`].
///
/// The data source is a required argument; training fails with
/// [`crate::WardenError::Config`] when that dataset is not supplied.
///
/// # Example
///
/// ```
/// use warden::config::SpectralTrainConfig;
/// use warden::data::Dataset;
/// use warden::detectors::{AnomalyDetector, DataSource, SpectralSignatureDetector};
/// use warden::nn::{normal, Mlp};
///
/// let model = Mlp::new(&[4, 6, 2], Some(0)).expect("valid sizes");
/// let untrusted = Dataset::unlabeled(normal(100, 4, 0.0, 1.0, Some(3)));
///
/// let mut detector = SpectralSignatureDetector::new(
///     model,
///     vec!["layer0".into(), "logits".into()],
///     SpectralTrainConfig::default(),
///     DataSource::Untrusted,
/// )
/// .expect("known layers");
///
/// assert!(detector.train(Some(&untrusted), None).is_err());
/// detector.train(None, Some(&untrusted)).expect("untrusted data supplied");
/// let per_layer = detector.layerwise_scores(&normal(3, 4, 0.0, 1.0, Some(4))).expect("trained");
/// assert_eq!(per_layer.len(), 2);
/// ```
pub type SpectralSignatureDetector<C> = ActivationCovarianceDetector<SpectralSignature, C>;

impl<C: Classifier> ActivationCovarianceDetector<SpectralSignature, C> {
    /// Creates an untrained spectral-signature detector.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid config or unknown layers.
    pub fn new(
        model: C,
        layers: Vec<String>,
        config: SpectralTrainConfig,
        source: DataSource,
    ) -> Result<Self> {
        Self::with_method(model, layers, SpectralSignature::new(config, source)?)
    }
}

impl StatisticalMethod for SpectralSignature {
    type Params = SpectralParams;

    const KIND: DetectorKind = DetectorKind::SpectralSignature;

    fn data_source(&self) -> DataSource {
        self.source
    }

    fn max_batches(&self) -> usize {
        self.config.max_batches
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn config(&self) -> DetectorConfig {
        DetectorConfig::SpectralSignature(self.config.clone())
    }

    fn post_process(&self, _layer: &str, stats: &LayerStatistics) -> Result<SpectralParams> {
        let (_, v) = top_eigenvector(&stats.covariance)?;
        Ok(SpectralParams {
            mean: quantize_vector(&stats.mean),
            top_singular_vector: quantize_vector(&v),
        })
    }

    fn score(&self, params: &SpectralParams, activations: &Matrix<f32>) -> Result<Vec<f64>> {
        let delta = centered(activations, &params.mean)?;
        let projection = delta * &params.top_singular_vector;
        Ok(projection.iter().map(|p| p * p).collect())
    }

    fn write_params(
        &self,
        params: &BTreeMap<String, SpectralParams>,
        file: &mut DetectorFile,
    ) -> Result<()> {
        file.set_flag(DATA_SOURCE_FLAG, self.source.to_string())?;
        for (layer, p) in params {
            file.insert_vector(format!("{MEANS}.{layer}"), &p.mean);
            file.insert_vector(format!("{TOP_SINGULAR_VECTORS}.{layer}"), &p.top_singular_vector);
        }
        Ok(())
    }

    fn read_params(&self, file: &DetectorFile) -> Result<BTreeMap<String, SpectralParams>> {
        file.names_with_prefix(MEANS)
            .into_iter()
            .map(|layer| {
                let mean = file.vector(&format!("{MEANS}.{layer}"))?;
                let key = format!("{TOP_SINGULAR_VECTORS}.{layer}");
                let top_singular_vector = file.vector(&key)?;
                check_len(&key, mean.len(), &top_singular_vector)?;
                Ok((
                    layer,
                    SpectralParams {
                        mean,
                        top_singular_vector,
                    },
                ))
            })
            .collect()
    }
}
