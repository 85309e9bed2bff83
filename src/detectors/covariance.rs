//! Detectors built on streamed activation covariances.

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use super::{finite_scores, AnomalyDetector, DataSource, DetectorKind, LayerScores};
use crate::activations::{self, ActivationBatch};
use crate::config::{DetectorConfig, VersionedConfig};
use crate::data::Dataset;
use crate::error::{Result, WardenError};
use crate::nn::Classifier;
use crate::primitives::Matrix;
use crate::serialization::DetectorFile;
use crate::stats::{CovarianceAccumulator, LayerStatistics};

/// The part of a covariance-based detector that differs between methods.
///
/// [`ActivationCovarianceDetector`] owns the model, the data loop and the
/// accumulator; a method only turns finished per-layer statistics into
/// parameters and parameters plus activations into scores.
pub trait StatisticalMethod {
    /// Learned state of one layer.
    type Params: Clone + fmt::Debug + PartialEq;

    /// Kind written to saved files.
    const KIND: DetectorKind;

    /// Dataset the statistics are fitted on.
    fn data_source(&self) -> DataSource;

    /// Accumulator batch cap (0 = unlimited).
    fn max_batches(&self) -> usize;

    /// Samples per activation batch.
    fn batch_size(&self) -> usize;

    /// Configuration stored alongside the parameters.
    fn config(&self) -> DetectorConfig;

    /// Derives one layer's parameters from its finished statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the statistics are degenerate beyond repair.
    fn post_process(&self, layer: &str, stats: &LayerStatistics) -> Result<Self::Params>;

    /// Scores every row of `activations` (one layer) against `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if the activation width does not match `params`.
    fn score(&self, params: &Self::Params, activations: &Matrix<f32>) -> Result<Vec<f64>>;

    /// Stores all layers' parameters in `file`.
    ///
    /// # Errors
    ///
    /// Returns an error if a flag cannot be recorded.
    fn write_params(
        &self,
        params: &BTreeMap<String, Self::Params>,
        file: &mut DetectorFile,
    ) -> Result<()>;

    /// Reads all layers' parameters back.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::MissingKey`] if a required tensor is absent.
    fn read_params(&self, file: &DetectorFile) -> Result<BTreeMap<String, Self::Params>>;
}

/// Covariance-based detector over the activations of selected layers.
///
/// Training pushes the chosen dataset through the model batch by batch,
/// folds the activations into a [`CovarianceAccumulator`], finalizes it
/// once and post-processes each layer. The parameters are then fixed until
/// the next `train` or `load`.
///
/// Activations are extracted through [`activations::extract`]; set
/// [`Self::with_max_batch_size`] to forward large inputs in chunks.
#[derive(Debug, Clone)]
pub struct ActivationCovarianceDetector<M: StatisticalMethod, C: Classifier> {
    model: C,
    layers: Vec<String>,
    method: M,
    max_batch_size: Option<usize>,
    params: Option<BTreeMap<String, M::Params>>,
}

fn check_layers<C: Classifier>(model: &C, layers: &[String], kind: DetectorKind) -> Result<()> {
    if layers.is_empty() {
        return Err(WardenError::Config(format!(
            "{kind} detector needs at least one layer"
        )));
    }
    let known = model.layer_names();
    for (i, name) in layers.iter().enumerate() {
        if !known.contains(name) {
            return Err(WardenError::Config(format!(
                "model has no layer '{name}' (available: {known:?})"
            )));
        }
        if layers[..i].contains(name) {
            return Err(WardenError::Config(format!("layer '{name}' listed twice")));
        }
    }
    Ok(())
}

impl<M: StatisticalMethod, C: Classifier> ActivationCovarianceDetector<M, C> {
    /// Creates an untrained detector watching `layers` of `model`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Config`] if `layers` is empty, repeats a name,
    /// or names a layer the model does not expose.
    pub fn with_method(model: C, layers: Vec<String>, method: M) -> Result<Self> {
        check_layers(&model, &layers, M::KIND)?;
        Ok(Self {
            model,
            layers,
            method,
            max_batch_size: None,
            params: None,
        })
    }

    /// Forwards at most `max_batch_size` rows through the model at a time,
    /// both while training and while scoring.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidHyperparameter`] if `max_batch_size` is
    /// zero.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Result<Self> {
        if max_batch_size == 0 {
            return Err(WardenError::InvalidHyperparameter {
                param: "max_batch_size".into(),
                value: "0".into(),
                constraint: "> 0".into(),
            });
        }
        self.max_batch_size = Some(max_batch_size);
        Ok(self)
    }

    /// Row cap per forward pass, if any.
    #[must_use]
    pub fn max_batch_size(&self) -> Option<usize> {
        self.max_batch_size
    }

    /// The model whose activations are scored.
    #[must_use]
    pub fn model(&self) -> &C {
        &self.model
    }

    /// Layers the detector watches.
    #[must_use]
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    /// The statistical method.
    #[must_use]
    pub fn method(&self) -> &M {
        &self.method
    }

    /// Learned per-layer parameters, once trained or loaded.
    #[must_use]
    pub fn params(&self) -> Option<&BTreeMap<String, M::Params>> {
        self.params.as_ref()
    }

    /// Fits the detector on the dataset selected by the method's
    /// [`DataSource`].
    ///
    /// # Errors
    ///
    /// - [`WardenError::Config`] if the selected dataset was not supplied.
    /// - [`WardenError::EmptyInput`] if it has no samples.
    /// - Any error from activation extraction, accumulation or
    ///   post-processing.
    pub fn train(&mut self, trusted: Option<&Dataset>, untrusted: Option<&Dataset>) -> Result<()> {
        let source = self.method.data_source();
        let data = match source {
            DataSource::Trusted => trusted,
            DataSource::Untrusted => untrusted,
        }
        .ok_or_else(|| {
            WardenError::Config(format!(
                "{} detector is set to train on {source} data, but none was supplied",
                M::KIND
            ))
        })?;
        if data.is_empty() {
            return Err(WardenError::EmptyInput(format!("{source} dataset is empty")));
        }

        info!(
            "Training {} detector on {} {source} samples, layers {:?}",
            M::KIND,
            data.len(),
            self.layers
        );
        let batches = data
            .batches(self.method.batch_size(), None)?
            .map(|batch| self.extract(&batch.inputs));
        let params = self.fit_batches(batches)?;
        self.params = Some(params);
        Ok(())
    }

    /// Fits the detector directly on precomputed activation batches.
    ///
    /// Layers not watched by the detector are ignored.
    ///
    /// # Errors
    ///
    /// - [`WardenError::Config`] if a batch lacks a watched layer.
    /// - [`WardenError::EmptyInput`] if no samples arrive.
    pub fn fit_activations<I>(&mut self, batches: I) -> Result<()>
    where
        I: IntoIterator<Item = ActivationBatch>,
    {
        let params = self.fit_batches(batches.into_iter().map(Ok))?;
        self.params = Some(params);
        Ok(())
    }

    fn fit_batches<I>(&self, batches: I) -> Result<BTreeMap<String, M::Params>>
    where
        I: Iterator<Item = Result<ActivationBatch>>,
    {
        let mut accumulator = CovarianceAccumulator::new(self.method.max_batches());
        for batch in batches {
            accumulator.update(&self.select_layers(batch?)?)?;
            if accumulator.is_saturated() {
                info!(
                    "Reached max_batches ({}), stopping early",
                    accumulator.batches_seen()
                );
                break;
            }
        }
        debug!("accumulated {} activation batches", accumulator.batches_seen());

        let stats = accumulator.finalize()?;
        let params = stats
            .iter()
            .map(|(name, layer)| Ok((name.clone(), self.method.post_process(name, layer)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        info!("{} detector trained on {} layer(s)", M::KIND, params.len());
        Ok(params)
    }

    fn extract(&self, inputs: &Matrix<f32>) -> Result<ActivationBatch> {
        activations::extract(&self.model, inputs, &self.layers, self.max_batch_size)
    }

    fn select_layers(&self, mut batch: ActivationBatch) -> Result<ActivationBatch> {
        self.layers
            .iter()
            .map(|name| {
                let acts = batch.remove(name).ok_or_else(|| {
                    WardenError::Config(format!("activation batch has no layer '{name}'"))
                })?;
                Ok((name.clone(), acts))
            })
            .collect()
    }

    /// Scores precomputed activations, one entry per watched layer.
    ///
    /// # Errors
    ///
    /// - [`WardenError::State`] before training.
    /// - [`WardenError::Config`] if a watched layer is missing.
    /// - [`WardenError::NonFiniteScore`] if a score is not finite.
    pub fn layerwise_scores_for(&self, activations: &ActivationBatch) -> Result<LayerScores> {
        let params = self.params.as_ref().ok_or_else(|| {
            WardenError::State(format!("{} detector has not been trained", M::KIND))
        })?;
        params
            .iter()
            .map(|(name, layer_params)| {
                let acts = activations.get(name).ok_or_else(|| {
                    WardenError::Config(format!("activation batch has no layer '{name}'"))
                })?;
                let raw = self.method.score(layer_params, acts)?;
                let scores = finite_scores(&format!("{} score of layer '{name}'", M::KIND), raw)?;
                Ok((name.clone(), scores))
            })
            .collect()
    }
}

impl<M: StatisticalMethod, C: Classifier> AnomalyDetector for ActivationCovarianceDetector<M, C> {
    fn kind(&self) -> DetectorKind {
        M::KIND
    }

    fn is_trained(&self) -> bool {
        self.params.is_some()
    }

    fn layerwise_scores(&self, inputs: &Matrix<f32>) -> Result<LayerScores> {
        if self.params.is_none() {
            return Err(WardenError::State(format!(
                "{} detector has not been trained",
                M::KIND
            )));
        }
        self.layerwise_scores_for(&self.extract(inputs)?)
    }

    fn to_file(&self) -> Result<DetectorFile> {
        let params = self.params.as_ref().ok_or_else(|| {
            WardenError::State(format!("cannot save an untrained {} detector", M::KIND))
        })?;
        let mut file = DetectorFile::new(M::KIND);
        self.method.write_params(params, &mut file)?;
        file.set_config(&VersionedConfig::new(self.method.config()))?;
        Ok(file)
    }

    fn load_file(&mut self, file: &DetectorFile) -> Result<()> {
        file.expect_kind(M::KIND)?;
        let params = self.method.read_params(file)?;
        if params.is_empty() {
            return Err(WardenError::MissingKey(format!("means.* ({} file has no layers)", M::KIND)));
        }
        let layers: Vec<String> = params.keys().cloned().collect();
        check_layers(&self.model, &layers, M::KIND)?;
        self.layers = layers;
        self.params = Some(params);
        Ok(())
    }
}

/// Activations minus `mean`, widened to `f64`.
pub(crate) fn centered(activations: &Matrix<f32>, mean: &DVector<f64>) -> Result<DMatrix<f64>> {
    if activations.n_cols() != mean.len() {
        return Err(WardenError::dimension_mismatch(
            "activation features",
            mean.len(),
            activations.n_cols(),
        ));
    }
    Ok(DMatrix::from_fn(
        activations.n_rows(),
        activations.n_cols(),
        |i, j| f64::from(activations.get(i, j)) - mean[j],
    ))
}

/// Checks that a loaded vector has the width of its layer's mean.
pub(crate) fn check_len(key: &str, expected: usize, v: &DVector<f64>) -> Result<()> {
    if v.len() != expected {
        return Err(WardenError::dimension_mismatch(key, expected, v.len()));
    }
    Ok(())
}
