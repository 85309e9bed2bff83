//! Streaming mean and covariance estimation.
//!
//! Activations are folded in batch by batch. Each batch contributes its own
//! mean and scatter matrix, which are merged into the running estimate with
//! the pairwise update of Chan, Golub & LeVeque (1979):
//!
//! ```text
//! n     = n_a + n_b
//! δ     = μ_b - μ_a
//! μ     = μ_a + δ · n_b / n
//! M     = M_a + M_b + δ δᵀ · n_a n_b / n
//! Σ     = M / (n - 1)
//! ```
//!
//! Only counts, means and scatter matrices are kept, so memory is
//! `O(layers · d²)` regardless of how many samples are processed.
//!
//! # Examples
//!
//! ```
//! use warden::primitives::Matrix;
//! use warden::stats::StreamingCovariance;
//!
//! let mut acc = StreamingCovariance::new(2);
//! acc.update(&Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 6.0]).expect("2x2")).expect("width 2");
//! acc.update(&Matrix::from_vec(1, 2, vec![5.0, 10.0]).expect("1x2")).expect("width 2");
//!
//! assert_eq!(acc.count(), 3);
//! assert!((acc.mean()[0] - 3.0).abs() < 1e-12);
//! assert!((acc.covariance()[(0, 0)] - 4.0).abs() < 1e-12);
//! ```

use std::collections::BTreeMap;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::activations::ActivationBatch;
use crate::error::{Result, WardenError};
use crate::primitives::Matrix;

/// Running mean and scatter matrix of a single feature space.
#[derive(Debug, Clone)]
pub struct StreamingCovariance {
    count: usize,
    mean: DVector<f64>,
    scatter: DMatrix<f64>,
}

impl StreamingCovariance {
    /// Creates an empty accumulator for `dim` features.
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: DVector::zeros(dim),
            scatter: DMatrix::zeros(dim, dim),
        }
    }

    /// Number of features.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Number of samples folded in so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Running mean.
    #[must_use]
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Folds a batch (rows = samples) into the running estimate.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch width differs from [`Self::dim`].
    pub fn update(&mut self, batch: &Matrix<f32>) -> Result<()> {
        let (n_b, d) = batch.shape();
        if d != self.dim() {
            return Err(WardenError::dimension_mismatch("features", self.dim(), d));
        }
        if n_b == 0 {
            return Ok(());
        }

        let mut batch_mean: DVector<f64> = DVector::zeros(d);
        for row in batch.rows() {
            for (m, &x) in batch_mean.iter_mut().zip(row) {
                *m += f64::from(x);
            }
        }
        batch_mean /= n_b as f64;

        let centered = DMatrix::from_fn(n_b, d, |i, j| f64::from(batch.get(i, j)) - batch_mean[j]);
        let batch_scatter = centered.tr_mul(&centered);

        let n_a = self.count as f64;
        let n_b_f = n_b as f64;
        let total = n_a + n_b_f;
        let delta = &batch_mean - &self.mean;

        self.mean += &delta * (n_b_f / total);
        self.scatter += batch_scatter + (&delta * delta.transpose()) * (n_a * n_b_f / total);
        self.count += n_b;
        Ok(())
    }

    /// Unbiased covariance `M / (n - 1)`.
    ///
    /// A single sample has no spread and yields the zero matrix.
    #[must_use]
    pub fn covariance(&self) -> DMatrix<f64> {
        if self.count < 2 {
            return DMatrix::zeros(self.dim(), self.dim());
        }
        let mut cov = &self.scatter / (self.count - 1) as f64;
        // Rounding in the rank-one updates can leave the result slightly asymmetric
        cov = (&cov + cov.transpose()) * 0.5;
        cov
    }
}

/// Finished statistics of one layer.
#[derive(Debug, Clone)]
pub struct LayerStatistics {
    /// Number of samples the statistics were estimated from.
    pub count: usize,
    /// Feature means.
    pub mean: DVector<f64>,
    /// Unbiased covariance matrix.
    pub covariance: DMatrix<f64>,
}

/// Per-layer covariance accumulator with an optional batch cap.
///
/// The layer set and widths are fixed by the first batch. `finalize` must
/// be called exactly once; any use afterwards is a [`WardenError::State`].
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use warden::primitives::Matrix;
/// use warden::stats::CovarianceAccumulator;
///
/// let mut acc = CovarianceAccumulator::new(0);
/// let mut batch = BTreeMap::new();
/// batch.insert("layer0".to_string(), Matrix::from_vec(3, 1, vec![1.0, 2.0, 3.0]).expect("3x1"));
/// acc.update(&batch).expect("first batch");
///
/// let stats = acc.finalize().expect("finalize once");
/// assert!((stats["layer0"].mean[0] - 2.0).abs() < 1e-12);
/// assert!(acc.finalize().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct CovarianceAccumulator {
    layers: BTreeMap<String, StreamingCovariance>,
    max_batches: usize,
    batches_seen: usize,
    finalized: bool,
}

impl CovarianceAccumulator {
    /// Creates an accumulator; `max_batches == 0` means unlimited.
    #[must_use]
    pub fn new(max_batches: usize) -> Self {
        Self {
            layers: BTreeMap::new(),
            max_batches,
            batches_seen: 0,
            finalized: false,
        }
    }

    /// Number of batches folded in.
    #[must_use]
    pub fn batches_seen(&self) -> usize {
        self.batches_seen
    }

    /// True once `max_batches` batches have been folded in.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.max_batches > 0 && self.batches_seen >= self.max_batches
    }

    /// True after [`Self::finalize`].
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Folds one activation batch into every layer's statistics.
    ///
    /// Batches arriving after the cap is reached are ignored.
    ///
    /// # Errors
    ///
    /// - [`WardenError::State`] if called after `finalize`.
    /// - [`WardenError::DimensionMismatch`] if the batch's layers or widths
    ///   differ from the first batch, or layers disagree on batch size.
    pub fn update(&mut self, batch: &ActivationBatch) -> Result<()> {
        if self.finalized {
            return Err(WardenError::State(
                "update() called after finalize()".into(),
            ));
        }
        if self.is_saturated() {
            debug!(
                "covariance accumulator saturated at {} batches, skipping batch",
                self.max_batches
            );
            return Ok(());
        }
        crate::activations::batch_size(batch)?;

        if self.layers.is_empty() {
            for (name, acts) in batch {
                self.layers
                    .insert(name.clone(), StreamingCovariance::new(acts.n_cols()));
            }
        } else if batch.len() != self.layers.len()
            || batch.keys().any(|name| !self.layers.contains_key(name))
        {
            return Err(WardenError::DimensionMismatch {
                expected: format!("layers {:?}", self.layers.keys().collect::<Vec<_>>()),
                actual: format!("layers {:?}", batch.keys().collect::<Vec<_>>()),
            });
        }
        // Reject before touching any layer so a bad batch never half-applies
        for (name, acts) in batch {
            if let Some(layer) = self.layers.get(name) {
                if layer.dim() != acts.n_cols() {
                    return Err(WardenError::dimension_mismatch(
                        &format!("{name} features"),
                        layer.dim(),
                        acts.n_cols(),
                    ));
                }
            }
        }

        for (name, acts) in batch {
            if let Some(layer) = self.layers.get_mut(name) {
                layer.update(acts)?;
            }
        }
        self.batches_seen += 1;
        debug!("folded activation batch {}", self.batches_seen);
        Ok(())
    }

    /// Freezes the statistics and returns them per layer.
    ///
    /// # Errors
    ///
    /// - [`WardenError::State`] on a second call.
    /// - [`WardenError::EmptyInput`] if no samples were folded in.
    pub fn finalize(&mut self) -> Result<BTreeMap<String, LayerStatistics>> {
        if self.finalized {
            return Err(WardenError::State("finalize() called twice".into()));
        }
        self.finalized = true;

        if self.layers.values().all(|layer| layer.count() == 0) {
            return Err(WardenError::EmptyInput(
                "no activations were accumulated before finalize()".into(),
            ));
        }

        Ok(self
            .layers
            .iter()
            .map(|(name, layer)| {
                if layer.count() < 2 {
                    warn!("layer '{name}' has {} sample(s); covariance is zero", layer.count());
                }
                (
                    name.clone(),
                    LayerStatistics {
                        count: layer.count(),
                        mean: layer.mean().clone(),
                        covariance: layer.covariance(),
                    },
                )
            })
            .collect())
    }
}

/// Computes the unbiased covariance matrix of a data matrix in one pass.
///
/// # Arguments
///
/// * `data` - Data matrix (n × p), where n is samples and p is features
///
/// # Errors
///
/// Returns error if data is empty.
///
/// # Examples
///
/// ```
/// use warden::primitives::Matrix;
/// use warden::stats::cov_matrix;
///
/// let data = Matrix::from_vec(3, 2, vec![
///     1.0, 2.0,
///     2.0, 4.0,
///     3.0, 6.0,
/// ]).expect("Valid matrix");
///
/// let cov = cov_matrix(&data).expect("Should compute covariance matrix");
/// assert!((cov[(0, 1)] - 2.0).abs() < 1e-12);
/// ```
pub fn cov_matrix(data: &Matrix<f32>) -> Result<DMatrix<f64>> {
    let n = data.n_rows();
    let p = data.n_cols();

    if n == 0 || p == 0 {
        return Err(WardenError::EmptyInput(
            "cannot compute covariance matrix for empty data".into(),
        ));
    }

    let mut means = vec![0.0_f64; p];
    for row in data.rows() {
        for (m, &x) in means.iter_mut().zip(row) {
            *m += f64::from(x);
        }
    }
    for m in &mut means {
        *m /= n as f64;
    }

    let denom = if n > 1 { (n - 1) as f64 } else { 1.0 };
    let mut cov = DMatrix::zeros(p, p);
    for i in 0..p {
        for j in 0..=i {
            // Only compute lower triangle (symmetric)
            let sum: f64 = data
                .rows()
                .map(|row| (f64::from(row[i]) - means[i]) * (f64::from(row[j]) - means[j]))
                .sum();
            cov[(i, j)] = sum / denom;
            cov[(j, i)] = sum / denom;
        }
    }
    Ok(cov)
}

#[cfg(test)]
#[path = "covariance_tests.rs"]
mod tests;
