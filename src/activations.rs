//! Activation batches and chunked extraction.
//!
//! An [`ActivationBatch`] maps layer names to `(batch, features)` matrices.
//! Every layer in a batch covers the same samples in the same order.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{Result, WardenError};
use crate::nn::Classifier;
use crate::primitives::Matrix;

/// Layer name -> activations, rows are samples.
pub type ActivationBatch = BTreeMap<String, Matrix<f32>>;

/// Number of samples in a batch.
///
/// # Errors
///
/// - [`WardenError::EmptyInput`] if the batch has no layers.
/// - [`WardenError::DimensionMismatch`] if layers disagree on the row count.
pub fn batch_size(batch: &ActivationBatch) -> Result<usize> {
    let mut sizes = batch.iter().map(|(name, acts)| (name, acts.n_rows()));
    let (first_name, n) = sizes
        .next()
        .ok_or_else(|| WardenError::EmptyInput("activation batch has no layers".into()))?;
    for (name, rows) in sizes {
        if rows != n {
            return Err(WardenError::DimensionMismatch {
                expected: format!("{n} samples (as in '{first_name}')"),
                actual: format!("{rows} samples in '{name}'"),
            });
        }
    }
    Ok(n)
}

/// Runs `model` over `inputs` and collects the activations named `names`.
///
/// With `max_batch_size = Some(k)` the inputs are forwarded `k` rows at a
/// time and the pieces are stacked back together, which bounds peak memory
/// for wide layers. `None` forwards everything at once.
///
/// # Errors
///
/// Returns an error if `max_batch_size` is zero, `inputs` is empty, or the
/// model rejects the inputs or a name.
///
/// # Example
///
/// ```
/// use warden::activations::extract;
/// use warden::nn::Mlp;
/// use warden::primitives::Matrix;
///
/// let model = Mlp::new(&[3, 4, 2], Some(0)).expect("valid sizes");
/// let x = Matrix::zeros(10, 3);
/// let acts = extract(&model, &x, &["layer0".to_string()], Some(4)).expect("known layer");
/// assert_eq!(acts["layer0"].shape(), (10, 4));
/// ```
pub fn extract<C: Classifier>(
    model: &C,
    inputs: &Matrix<f32>,
    names: &[String],
    max_batch_size: Option<usize>,
) -> Result<ActivationBatch> {
    if max_batch_size == Some(0) {
        return Err(WardenError::InvalidHyperparameter {
            param: "max_batch_size".into(),
            value: "0".into(),
            constraint: "> 0".into(),
        });
    }
    let n = inputs.n_rows();
    if n == 0 {
        return Err(WardenError::EmptyInput("no inputs to extract activations from".into()));
    }
    let chunk = max_batch_size.unwrap_or(n);
    if chunk >= n {
        return model.activations(inputs, names);
    }

    let mut pieces: BTreeMap<String, Vec<Matrix<f32>>> = BTreeMap::new();
    for start in (0..n).step_by(chunk) {
        let end = (start + chunk).min(n);
        debug!("extracting activations for rows {start}..{end}");
        for (name, acts) in model.activations(&inputs.slice_rows(start, end), names)? {
            pieces.entry(name).or_default().push(acts);
        }
    }
    pieces
        .into_iter()
        .map(|(name, parts)| Ok((name, Matrix::vstack(&parts)?)))
        .collect()
}
