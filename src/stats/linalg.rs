//! Symmetric linear algebra for covariance post-processing.
//!
//! Both the pseudo-inverse and the top eigenvector go through
//! [`nalgebra::SymmetricEigen`]; covariances are symmetric positive
//! semi-definite, so the Hermitian decomposition is both cheaper and more
//! accurate than a general SVD.

use log::warn;
use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::error::{Result, WardenError};

fn check_square(m: &DMatrix<f64>, context: &str) -> Result<()> {
    if m.nrows() != m.ncols() {
        return Err(WardenError::DimensionMismatch {
            expected: format!("square {context}"),
            actual: format!("{}x{}", m.nrows(), m.ncols()),
        });
    }
    if m.nrows() == 0 {
        return Err(WardenError::EmptyInput(format!("{context} has no features")));
    }
    if m.iter().any(|x| !x.is_finite()) {
        return Err(WardenError::non_finite(context.to_string(), f64::NAN));
    }
    Ok(())
}

/// Moore-Penrose pseudo-inverse of a symmetric matrix.
///
/// Eigenvalues with `|λ| <= rcond · max|λ|` are treated as zero, which keeps
/// near-singular covariances (few samples, many features) well behaved.
///
/// # Errors
///
/// Returns an error if the matrix is not square, empty, or contains
/// non-finite entries.
///
/// # Examples
///
/// ```
/// use nalgebra::DMatrix;
/// use warden::stats::pinv_hermitian;
///
/// let c = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]);
/// let inv = pinv_hermitian(&c, 1e-5).expect("square matrix");
/// assert!((inv[(0, 0)] - 0.5).abs() < 1e-12);
/// assert!((inv[(1, 1)] - 0.25).abs() < 1e-12);
/// ```
pub fn pinv_hermitian(m: &DMatrix<f64>, rcond: f64) -> Result<DMatrix<f64>> {
    check_square(m, "covariance")?;

    let eigen = SymmetricEigen::new(m.clone());
    let max_abs = eigen
        .eigenvalues
        .iter()
        .fold(0.0_f64, |acc, &l| acc.max(l.abs()));
    let cutoff = rcond * max_abs;

    let inv_values: DVector<f64> = eigen
        .eigenvalues
        .map(|l| if l.abs() > cutoff { 1.0 / l } else { 0.0 });
    if inv_values.iter().all(|&v| v == 0.0) {
        warn!("all eigenvalues fell below rcond cutoff {cutoff:e}; pseudo-inverse is zero");
    }

    let v = &eigen.eigenvectors;
    let scaled = v * DMatrix::from_diagonal(&inv_values);
    Ok(scaled * v.transpose())
}

/// Largest eigenvalue of a symmetric matrix and its unit eigenvector.
///
/// The sign is fixed so the component with the largest magnitude is
/// positive, making the result deterministic.
///
/// # Errors
///
/// Returns an error if the matrix is not square, empty, or contains
/// non-finite entries.
pub fn top_eigenvector(m: &DMatrix<f64>) -> Result<(f64, DVector<f64>)> {
    check_square(m, "covariance")?;

    let eigen = SymmetricEigen::new(m.clone());
    let (idx, &value) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, &f64::NEG_INFINITY), |best, cur| {
            if *cur.1 > *best.1 {
                cur
            } else {
                best
            }
        });

    let mut vector: DVector<f64> = eigen.eigenvectors.column(idx).into_owned();
    let norm = vector.norm();
    if norm > 0.0 {
        vector /= norm;
    }
    let pivot = vector
        .iter()
        .fold(0.0_f64, |acc, &x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        vector.neg_mut();
    }
    Ok((value, vector))
}
