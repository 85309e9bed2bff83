//! Finetuning-divergence detector.
//!
//! A copy of the model is finetuned on trusted data. Inputs whose
//! predictions move a lot under that finetuning are suspicious; the score is
//! `KL(original || finetuned)` of the two output distributions.

use std::fmt;

use log::info;

use super::{finite_scores, AnomalyDetector, DetectorKind, LayerScores};
use crate::config::{DetectorConfig, FinetuningTrainConfig, VersionedConfig};
use crate::data::Dataset;
use crate::error::{Result, WardenError};
use crate::nn::functional::kl_divergence_rows;
use crate::nn::{Classifier, StateDict};
use crate::primitives::Matrix;
use crate::serialization::DetectorFile;
use crate::train::{Trainer, TrainingReport};

const FINETUNED: &str = "finetuned";

/// KL-divergence detector between a model and its finetuned copy.
///
/// `model` is never modified; `finetuned_model` starts as a clone of it and
/// is the only state that training changes and persistence stores.
///
/// # Example
///
/// ```
/// use warden::config::FinetuningTrainConfig;
/// use warden::detectors::{AnomalyDetector, FinetuningDetector};
/// use warden::nn::{normal, Mlp};
/// use warden::WardenError;
///
/// let model = Mlp::new(&[3, 5, 2], Some(0)).expect("valid sizes");
/// let mut detector = FinetuningDetector::new(model, FinetuningTrainConfig::default()).expect("valid config");
/// let x = normal(4, 3, 0.0, 1.0, Some(1));
/// assert!(matches!(detector.scores(&x), Err(WardenError::State(_))));
///
/// // Loading weights equal to the model's makes both copies agree
/// let snapshot = detector.to_file().expect("snapshot");
/// detector.load_file(&snapshot).expect("same architecture");
/// assert!(detector.scores(&x).expect("finite").iter().all(|&s| s == 0.0));
/// assert!(matches!(detector.layerwise_scores(&x), Err(WardenError::Unsupported(_))));
/// ```
#[derive(Clone)]
pub struct FinetuningDetector<C: Classifier> {
    model: C,
    finetuned_model: C,
    config: FinetuningTrainConfig,
    trained: bool,
}

impl<C: Classifier> fmt::Debug for FinetuningDetector<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinetuningDetector")
            .field("input_dim", &self.model.input_dim())
            .field("num_classes", &self.model.num_classes())
            .field("config", &self.config)
            .field("trained", &self.trained)
            .finish()
    }
}

impl<C: Classifier> FinetuningDetector<C> {
    /// Creates a detector for `model`.
    ///
    /// # Errors
    ///
    /// See [`FinetuningTrainConfig::setup_and_validate`].
    pub fn new(model: C, config: FinetuningTrainConfig) -> Result<Self> {
        Ok(Self {
            finetuned_model: model.clone(),
            model,
            config: config.setup_and_validate()?,
            trained: false,
        })
    }

    /// Replaces the reference model and resets the finetuned copy to it.
    pub fn set_model(&mut self, model: C) {
        self.finetuned_model = model.clone();
        self.model = model;
        self.trained = false;
    }

    /// The reference model.
    #[must_use]
    pub fn model(&self) -> &C {
        &self.model
    }

    /// The finetuned copy.
    #[must_use]
    pub fn finetuned_model(&self) -> &C {
        &self.finetuned_model
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &FinetuningTrainConfig {
        &self.config
    }

    /// Finetunes a fresh copy of the model on `trusted`.
    ///
    /// `untrusted` is accepted for symmetry with the other detectors and
    /// ignored.
    ///
    /// # Errors
    ///
    /// - [`WardenError::Config`] if `trusted` is `None` or unlabelled.
    /// - Any error from the training loop.
    pub fn train(
        &mut self,
        trusted: Option<&Dataset>,
        _untrusted: Option<&Dataset>,
    ) -> Result<TrainingReport> {
        let trusted = trusted.ok_or_else(|| {
            WardenError::Config("finetuning detector requires trusted training data".into())
        })?;

        let config = &self.config;
        let mut optimizer = config.optimizer.build(config.lr);
        info!(
            "Finetuning with {} (lr={}) for {} epoch(s)",
            config.optimizer.name(),
            config.lr,
            config.epochs
        );

        let mut finetuned = self.model.clone();
        let report = Trainer::new(config.epochs, config.batch_size)
            .with_max_steps(config.max_steps)
            .with_seed(config.seed)
            .verbose(config.verbose)
            .fit(&mut finetuned, trusted, optimizer.as_mut())?;

        self.finetuned_model = finetuned;
        self.trained = true;
        Ok(report)
    }
}

impl<C: Classifier> AnomalyDetector for FinetuningDetector<C> {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Finetuning
    }

    fn is_trained(&self) -> bool {
        self.trained
    }

    fn layerwise_scores(&self, _inputs: &Matrix<f32>) -> Result<LayerScores> {
        Err(WardenError::Unsupported(
            "layerwise scores don't exist for the finetuning detector".into(),
        ))
    }

    fn scores(&self, inputs: &Matrix<f32>) -> Result<Vec<f32>> {
        if !self.trained {
            return Err(WardenError::State(
                "finetuning detector has not been trained or loaded".into(),
            ));
        }
        let original = self.model.forward(inputs)?;
        let finetuned = self.finetuned_model.forward(inputs)?;
        let kl = kl_divergence_rows(&original, &finetuned)?;
        finite_scores("KL divergence between original and finetuned model", kl)
    }

    fn to_file(&self) -> Result<DetectorFile> {
        let mut file = DetectorFile::new(DetectorKind::Finetuning);
        for (name, (data, shape)) in self.finetuned_model.state_dict() {
            file.insert_tensor(format!("{FINETUNED}.{name}"), data, shape);
        }
        file.set_config(&VersionedConfig::new(DetectorConfig::Finetuning(
            self.config.clone(),
        )))?;
        Ok(file)
    }

    fn load_file(&mut self, file: &DetectorFile) -> Result<()> {
        file.expect_kind(DetectorKind::Finetuning)?;
        let state = file
            .names_with_prefix(FINETUNED)
            .into_iter()
            .map(|name| {
                let tensor = file.tensor(&format!("{FINETUNED}.{name}"))?.clone();
                Ok((name, tensor))
            })
            .collect::<Result<StateDict>>()?;

        let mut finetuned = self.model.clone();
        finetuned.load_state_dict(&state)?;
        self.finetuned_model = finetuned;
        self.trained = true;
        Ok(())
    }
}
