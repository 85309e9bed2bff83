//! Stateless row-wise operations on logits.
//!
//! Rows are samples and columns are classes. The `f64` variants are used
//! for divergence scoring, where cancellation in `f32` would show up as
//! spurious non-zero scores.

use crate::error::{Result, WardenError};
use crate::primitives::Matrix;

/// Softmax on a 1D slice of f32 values.
///
/// Equation: softmax(x)\_i = exp(x\_i - max) / sum\_j exp(x\_j - max)
#[must_use]
pub fn softmax_1d(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|&x| x / sum).collect()
}

/// Log-softmax on a 1D slice, computed in f64.
///
/// Equation: log\_softmax(x)\_i = x\_i - max - log(sum exp(x\_j - max))
#[must_use]
pub fn log_softmax_1d_f64(logits: &[f32]) -> Vec<f64> {
    let max = logits
        .iter()
        .fold(f64::NEG_INFINITY, |a, &b| a.max(f64::from(b)));
    let log_sum_exp = logits
        .iter()
        .map(|&x| (f64::from(x) - max).exp())
        .sum::<f64>()
        .ln();
    logits
        .iter()
        .map(|&x| f64::from(x) - max - log_sum_exp)
        .collect()
}

/// Row-wise softmax.
#[must_use]
pub fn softmax_rows(logits: &Matrix<f32>) -> Matrix<f32> {
    let mut out = Vec::with_capacity(logits.as_slice().len());
    for row in logits.rows() {
        out.extend(softmax_1d(row));
    }
    let mut result = logits.clone();
    result.as_mut_slice().copy_from_slice(&out);
    result
}

/// Row-wise log-softmax, evaluated in f64 and stored as f32.
#[must_use]
pub fn log_softmax_rows(logits: &Matrix<f32>) -> Matrix<f32> {
    let mut result = logits.clone();
    let cols = logits.n_cols();
    for (i, row) in logits.rows().enumerate() {
        for (j, v) in log_softmax_1d_f64(row).into_iter().enumerate() {
            result.as_mut_slice()[i * cols + j] = v as f32;
        }
    }
    result
}

/// `ReLU` activation: max(0, x)
#[must_use]
pub fn relu(x: &Matrix<f32>) -> Matrix<f32> {
    x.map(|v| v.max(0.0))
}

/// Mean cross-entropy of `logits` against integer `labels`, plus the
/// gradient of the loss with respect to the logits.
///
/// # Errors
///
/// Returns an error if the label count differs from the batch size, a label
/// is out of range, or the batch is empty.
pub fn cross_entropy(logits: &Matrix<f32>, labels: &[usize]) -> Result<(f32, Matrix<f32>)> {
    let (n, classes) = logits.shape();
    if n == 0 {
        return Err(WardenError::EmptyInput("cross-entropy batch".into()));
    }
    if labels.len() != n {
        return Err(WardenError::dimension_mismatch("labels", n, labels.len()));
    }
    if let Some(&bad) = labels.iter().find(|&&y| y >= classes) {
        return Err(WardenError::DimensionMismatch {
            expected: format!("label < {classes}"),
            actual: format!("label {bad}"),
        });
    }

    let mut grad = softmax_rows(logits);
    let mut loss = 0.0_f64;
    for (i, (row, &y)) in logits.rows().zip(labels).enumerate() {
        loss -= log_softmax_1d_f64(row)[y];
        grad.set(i, y, grad.get(i, y) - 1.0);
    }
    let scale = 1.0 / n as f32;
    Ok(((loss / n as f64) as f32, grad.mul_scalar(scale)))
}

/// Per-row `KL(p || q)` where `p = softmax(p_logits)` and `q = softmax(q_logits)`.
///
/// Both distributions go through the same log-softmax, so identical logits
/// give exactly zero. Classes with `p_c == 0` contribute nothing. Results are
/// returned as computed; callers decide how to treat non-finite values.
///
/// # Errors
///
/// Returns an error if the two matrices have different shapes.
pub fn kl_divergence_rows(p_logits: &Matrix<f32>, q_logits: &Matrix<f32>) -> Result<Vec<f64>> {
    if p_logits.shape() != q_logits.shape() {
        return Err(WardenError::DimensionMismatch {
            expected: format!("{:?}", p_logits.shape()),
            actual: format!("{:?}", q_logits.shape()),
        });
    }

    Ok(p_logits
        .rows()
        .zip(q_logits.rows())
        .map(|(p_row, q_row)| {
            let log_p = log_softmax_1d_f64(p_row);
            let log_q = log_softmax_1d_f64(q_row);
            log_p
                .iter()
                .zip(&log_q)
                .map(|(&lp, &lq)| {
                    let p = lp.exp();
                    if p == 0.0 {
                        0.0
                    } else {
                        p * (lp - lq)
                    }
                })
                .sum()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits() -> Matrix<f32> {
        Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, -1.0, 0.0, 5.0]).expect("2x3")
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let probs = softmax_rows(&logits());
        for row in probs.rows() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            assert!(row.iter().all(|&p| p > 0.0));
        }
    }

    #[test]
    fn test_softmax_is_shift_invariant() {
        let a = softmax_1d(&[1.0, 2.0, 3.0]);
        let b = softmax_1d(&[101.0, 102.0, 103.0]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_log_softmax_matches_log_of_softmax() {
        let row = [0.5_f32, -1.0, 2.0];
        let log_p = log_softmax_1d_f64(&row);
        let p = softmax_1d(&row);
        for (lp, p) in log_p.iter().zip(&p) {
            assert!((lp.exp() as f32 - p).abs() < 1e-6);
        }
    }

    #[test]
    fn test_log_softmax_rows_exponentiates_to_softmax() {
        let log_p = log_softmax_rows(&logits());
        let p = softmax_rows(&logits());
        for (lp, p) in log_p.as_slice().iter().zip(p.as_slice()) {
            assert!((lp.exp() - p).abs() < 1e-6);
        }
    }

    #[test]
    fn test_relu() {
        let x = Matrix::from_vec(1, 3, vec![-1.0, 0.0, 2.0]).expect("1x3");
        assert_eq!(relu(&x).as_slice(), &[0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let logits = Matrix::zeros(2, 4);
        let (loss, grad) = cross_entropy(&logits, &[0, 3]).expect("valid labels");
        assert!((loss - 4.0_f32.ln()).abs() < 1e-6);
        // d/dz = (softmax - onehot) / n
        assert!((grad.get(0, 0) - (0.25 - 1.0) / 2.0).abs() < 1e-6);
        assert!((grad.get(0, 1) - 0.25 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_gradient_matches_finite_difference() {
        let base = logits();
        let labels = [2, 0];
        let (_, grad) = cross_entropy(&base, &labels).expect("valid labels");
        let eps = 1e-2_f32;
        for idx in 0..6 {
            let mut plus = base.clone();
            plus.as_mut_slice()[idx] += eps;
            let mut minus = base.clone();
            minus.as_mut_slice()[idx] -= eps;
            let (lp, _) = cross_entropy(&plus, &labels).expect("valid");
            let (lm, _) = cross_entropy(&minus, &labels).expect("valid");
            let numeric = (lp - lm) / (2.0 * eps);
            assert!((numeric - grad.as_slice()[idx]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_cross_entropy_rejects_bad_labels() {
        assert!(cross_entropy(&logits(), &[0]).is_err());
        assert!(cross_entropy(&logits(), &[0, 3]).is_err());
        assert!(cross_entropy(&Matrix::zeros(0, 3), &[]).is_err());
    }

    #[test]
    fn test_kl_identical_logits_is_exactly_zero() {
        let kl = kl_divergence_rows(&logits(), &logits()).expect("same shape");
        assert!(kl.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_kl_known_value() {
        // p = (0.5, 0.5), q = (e/(1+e), 1/(1+e)); logits (0,0) vs (1,0)
        let p = Matrix::from_vec(1, 2, vec![0.0, 0.0]).expect("1x2");
        let q = Matrix::from_vec(1, 2, vec![1.0, 0.0]).expect("1x2");
        let kl = kl_divergence_rows(&p, &q).expect("same shape");
        let q0 = std::f64::consts::E / (1.0 + std::f64::consts::E);
        let expected = 0.5 * (0.5 / q0).ln() + 0.5 * (0.5 / (1.0 - q0)).ln();
        assert!((kl[0] - expected).abs() < 1e-9);
        assert!(kl[0] > 0.0);
    }

    #[test]
    fn test_kl_is_asymmetric() {
        let p = Matrix::from_vec(1, 3, vec![3.0, 0.0, 0.0]).expect("1x3");
        let q = Matrix::from_vec(1, 3, vec![0.0, 1.0, 0.5]).expect("1x3");
        let pq = kl_divergence_rows(&p, &q).expect("same shape")[0];
        let qp = kl_divergence_rows(&q, &p).expect("same shape")[0];
        assert!((pq - qp).abs() > 1e-3);
    }

    #[test]
    fn test_kl_infinite_when_q_has_zero_mass() {
        let p = Matrix::from_vec(1, 2, vec![0.0, 0.0]).expect("1x2");
        let q = Matrix::from_vec(1, 2, vec![0.0, f32::NEG_INFINITY]).expect("1x2");
        let kl = kl_divergence_rows(&p, &q).expect("same shape");
        assert!(kl[0].is_infinite());
    }

    #[test]
    fn test_kl_shape_mismatch() {
        assert!(kl_divergence_rows(&logits(), &Matrix::zeros(2, 2)).is_err());
    }
}
