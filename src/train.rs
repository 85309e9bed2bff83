//! Supervised mini-batch training loop.
//!
//! Used by the finetuning detector to adapt a copy of the model to trusted
//! data, but usable for any [`Classifier`].

use log::{debug, info};

use crate::data::Dataset;
use crate::error::{Result, WardenError};
use crate::nn::functional::cross_entropy;
use crate::nn::optim::Optimizer;
use crate::nn::Classifier;

/// Outcome of [`Trainer::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Optimizer steps taken.
    pub steps: usize,
    /// Epochs that took at least one step (the last may be cut short by
    /// `max_steps`).
    pub epochs: usize,
    /// Loss of the last step.
    pub final_loss: f32,
    /// Loss of every step, in order.
    pub loss_history: Vec<f32>,
}

/// Cross-entropy trainer with epoch and step limits.
///
/// # Example
///
/// ```
/// use warden::data::Dataset;
/// use warden::nn::optim::Adam;
/// use warden::nn::Mlp;
/// use warden::primitives::Matrix;
/// use warden::train::Trainer;
///
/// let x = Matrix::from_vec(4, 2, vec![1.0, 0.0, 0.9, 0.1, 0.0, 1.0, 0.1, 0.9]).expect("4x2");
/// let data = Dataset::new(x, vec![0, 0, 1, 1]).expect("labelled");
/// let mut model = Mlp::new(&[2, 4, 2], Some(0)).expect("valid sizes");
///
/// let report = Trainer::new(20, 2)
///     .with_seed(7)
///     .fit(&mut model, &data, &mut Adam::new(0.05))
///     .expect("training runs");
/// assert_eq!(report.steps, 40);
/// assert!(report.final_loss < report.loss_history[0]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trainer {
    epochs: usize,
    batch_size: usize,
    max_steps: Option<usize>,
    seed: u64,
    shuffle: bool,
    verbose: bool,
}

impl Trainer {
    /// Trains for `epochs` passes over the data in batches of `batch_size`.
    #[must_use]
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        Self {
            epochs,
            batch_size,
            max_steps: None,
            seed: 0,
            shuffle: true,
            verbose: false,
        }
    }

    /// Stops after `max_steps` optimizer steps, even mid-epoch.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: Option<usize>) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Seed of the per-epoch shuffles (epoch `e` uses `seed + e`).
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Whether batches are shuffled; on by default.
    #[must_use]
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Log every step at info level instead of debug.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Runs the loop, updating `model` in place.
    ///
    /// # Errors
    ///
    /// - [`WardenError::Config`] if `data` has no labels.
    /// - [`WardenError::EmptyInput`] if `data` is empty.
    /// - [`WardenError::InvalidHyperparameter`] if `batch_size` is zero.
    /// - [`WardenError::NonFiniteScore`] if the loss diverges.
    pub fn fit<C: Classifier>(
        &self,
        model: &mut C,
        data: &Dataset,
        optimizer: &mut dyn Optimizer,
    ) -> Result<TrainingReport> {
        if data.labels().is_none() {
            return Err(WardenError::Config("training requires labelled data".into()));
        }
        if data.is_empty() {
            return Err(WardenError::EmptyInput("training dataset is empty".into()));
        }

        info!("Starting training...");
        info!("  Train examples: {}", data.len());
        info!("  Batch size: {}", self.batch_size);
        info!("  Learning rate: {}", optimizer.lr());

        let mut report = TrainingReport {
            steps: 0,
            epochs: 0,
            final_loss: f32::NAN,
            loss_history: Vec::new(),
        };

        'epochs: for epoch in 0..self.epochs {
            let shuffle = self.shuffle.then(|| self.seed.wrapping_add(epoch as u64));
            let mut epoch_loss = 0.0_f64;
            let mut epoch_steps = 0_usize;

            for batch in data.batches(self.batch_size, shuffle)? {
                if self.max_steps.is_some_and(|max| report.steps >= max) {
                    info!("Reached max steps ({})", report.steps);
                    break 'epochs;
                }
                let labels = batch
                    .labels
                    .ok_or_else(|| WardenError::Config("training requires labelled data".into()))?;

                let logits = model.forward(&batch.inputs)?;
                let (loss, grad_logits) = cross_entropy(&logits, &labels)?;
                if !loss.is_finite() {
                    return Err(WardenError::non_finite("training loss", f64::from(loss)));
                }
                let grads = model.backward(&batch.inputs, &grad_logits)?;
                optimizer.step(&mut model.parameters_mut(), &grads)?;

                if epoch_steps == 0 {
                    report.epochs += 1;
                }
                report.steps += 1;
                report.final_loss = loss;
                report.loss_history.push(loss);
                epoch_loss += f64::from(loss);
                epoch_steps += 1;
                if self.verbose {
                    info!("Step {} | Loss: {loss:.4}", report.steps);
                } else {
                    debug!("Step {} | Loss: {loss:.4}", report.steps);
                }
            }

            if epoch_steps > 0 {
                info!(
                    "Epoch {}/{} | Mean loss: {:.4}",
                    epoch + 1,
                    self.epochs,
                    epoch_loss / epoch_steps as f64
                );
            }
        }

        info!("Training complete after {} steps", report.steps);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::optim::{Adam, Sgd};
    use crate::nn::Mlp;
    use crate::primitives::Matrix;

    fn blobs() -> Dataset {
        let mut data = Vec::new();
        let mut labels = Vec::new();
        for i in 0..20 {
            let t = i as f32 * 0.05;
            data.extend_from_slice(&[1.0 + t, -1.0 + t]);
            labels.push(0);
            data.extend_from_slice(&[-1.0 - t, 1.0 - t]);
            labels.push(1);
        }
        Dataset::new(Matrix::from_vec(40, 2, data).expect("40x2"), labels).expect("labelled")
    }

    #[test]
    fn test_fit_reduces_loss() {
        let data = blobs();
        let mut model = Mlp::new(&[2, 8, 2], Some(3)).expect("valid sizes");
        let report = Trainer::new(10, 8)
            .with_seed(1)
            .fit(&mut model, &data, &mut Adam::new(0.05))
            .expect("training runs");

        assert_eq!(report.steps, 50);
        assert_eq!(report.epochs, 10);
        assert_eq!(report.loss_history.len(), 50);
        assert!(report.final_loss < report.loss_history[0]);
        assert!(report.final_loss < 0.2, "final loss {}", report.final_loss);
    }

    #[test]
    fn test_max_steps_stops_mid_epoch() {
        let data = blobs();
        let mut model = Mlp::new(&[2, 4, 2], Some(0)).expect("valid sizes");
        let report = Trainer::new(5, 4)
            .with_max_steps(Some(3))
            .fit(&mut model, &data, &mut Sgd::new(0.1))
            .expect("training runs");
        assert_eq!(report.steps, 3);
        assert_eq!(report.epochs, 1);
    }

    #[test]
    fn test_zero_max_steps_leaves_model_untouched() {
        let data = blobs();
        let mut model = Mlp::new(&[2, 4, 2], Some(0)).expect("valid sizes");
        let before = model.clone();
        let report = Trainer::new(1, 4)
            .with_max_steps(Some(0))
            .fit(&mut model, &data, &mut Sgd::new(0.1))
            .expect("training runs");
        assert_eq!(report.steps, 0);
        assert_eq!(report.epochs, 0);
        assert_eq!(model, before);
    }

    #[test]
    fn test_max_steps_at_epoch_boundary_counts_only_stepped_epochs() {
        let data = blobs();
        let mut model = Mlp::new(&[2, 4, 2], Some(0)).expect("valid sizes");
        // 40 samples in batches of 4: exactly one epoch of 10 steps
        let report = Trainer::new(5, 4)
            .with_max_steps(Some(10))
            .fit(&mut model, &data, &mut Sgd::new(0.1))
            .expect("training runs");
        assert_eq!(report.steps, 10);
        assert_eq!(report.epochs, 1);
    }

    #[test]
    fn test_training_is_deterministic_for_seed() {
        let data = blobs();
        let run = || {
            let mut model = Mlp::new(&[2, 4, 2], Some(9)).expect("valid sizes");
            Trainer::new(2, 5)
                .with_seed(4)
                .fit(&mut model, &data, &mut Adam::new(0.01))
                .expect("training runs");
            model
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_fit_rejects_bad_data() {
        let mut model = Mlp::new(&[2, 2], Some(0)).expect("valid sizes");
        let unlabeled = Dataset::unlabeled(Matrix::zeros(4, 2));
        assert!(matches!(
            Trainer::new(1, 2).fit(&mut model, &unlabeled, &mut Sgd::new(0.1)),
            Err(WardenError::Config(_))
        ));

        let empty = Dataset::new(Matrix::zeros(0, 2), vec![]).expect("empty is consistent");
        assert!(matches!(
            Trainer::new(1, 2).fit(&mut model, &empty, &mut Sgd::new(0.1)),
            Err(WardenError::EmptyInput(_))
        ));

        assert!(Trainer::new(1, 0)
            .fit(&mut model, &blobs(), &mut Sgd::new(0.1))
            .is_err());
    }
}
