//! Datasets of model inputs with optional class labels.
//!
//! Trusted data used for finetuning must be labelled; data that is only
//! pushed through the model for activation statistics need not be.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, WardenError};
use crate::primitives::Matrix;

/// Inputs (rows = samples) plus optional integer labels.
///
/// # Examples
///
/// ```
/// use warden::data::Dataset;
/// use warden::primitives::Matrix;
///
/// let x = Matrix::from_vec(3, 2, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).expect("3x2");
/// let data = Dataset::new(x, vec![0, 1, 0]).expect("one label per row");
///
/// let batches: Vec<_> = data.batches(2, None).expect("non-zero batch size").collect();
/// assert_eq!(batches.len(), 2);
/// assert_eq!(batches[1].inputs.shape(), (1, 2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    inputs: Matrix<f32>,
    labels: Option<Vec<usize>>,
}

/// One mini-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Rows of the batch.
    pub inputs: Matrix<f32>,
    /// Labels of those rows, if the dataset has labels.
    pub labels: Option<Vec<usize>>,
}

impl Dataset {
    /// Creates a labelled dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if the label count differs from the row count.
    pub fn new(inputs: Matrix<f32>, labels: Vec<usize>) -> Result<Self> {
        if labels.len() != inputs.n_rows() {
            return Err(WardenError::dimension_mismatch(
                "labels",
                inputs.n_rows(),
                labels.len(),
            ));
        }
        Ok(Self {
            inputs,
            labels: Some(labels),
        })
    }

    /// Creates a dataset without labels.
    #[must_use]
    pub fn unlabeled(inputs: Matrix<f32>) -> Self {
        Self {
            inputs,
            labels: None,
        }
    }

    /// Number of samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.n_rows()
    }

    /// Whether there are no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All inputs.
    #[must_use]
    pub fn inputs(&self) -> &Matrix<f32> {
        &self.inputs
    }

    /// All labels, if present.
    #[must_use]
    pub fn labels(&self) -> Option<&[usize]> {
        self.labels.as_deref()
    }

    /// Iterates over mini-batches of at most `batch_size` rows.
    ///
    /// With `shuffle = Some(seed)` the row order is permuted by a
    /// `StdRng` seeded with `seed`; `None` keeps the stored order.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is zero.
    pub fn batches(&self, batch_size: usize, shuffle: Option<u64>) -> Result<Batches<'_>> {
        if batch_size == 0 {
            return Err(WardenError::InvalidHyperparameter {
                param: "batch_size".into(),
                value: "0".into(),
                constraint: "> 0".into(),
            });
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(seed) = shuffle {
            let mut rng = StdRng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        Ok(Batches {
            dataset: self,
            order,
            batch_size,
            pos: 0,
        })
    }
}

/// Iterator returned by [`Dataset::batches`].
#[derive(Debug)]
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let idx = &self.order[self.pos..end];
        self.pos = end;
        Some(Batch {
            inputs: self.dataset.inputs.select_rows(idx),
            labels: self
                .dataset
                .labels
                .as_ref()
                .map(|labels| idx.iter().map(|&i| labels[i]).collect()),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.pos).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}
