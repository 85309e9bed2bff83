//! Statistics over streamed activations.
//!
//! - [`StreamingCovariance`] / [`CovarianceAccumulator`]: running mean and
//!   covariance per layer, folded batch by batch
//! - [`pinv_hermitian`]: Moore-Penrose pseudo-inverse with an `rcond` cutoff
//! - [`top_eigenvector`]: dominant direction of a covariance
//! - [`quantile`]: R-7 quantiles (Hyndman & Fan 1996) of score vectors

pub mod covariance;
pub mod linalg;

pub use covariance::{cov_matrix, CovarianceAccumulator, LayerStatistics, StreamingCovariance};
pub use linalg::{pinv_hermitian, top_eigenvector};

use crate::error::{Result, WardenError};

/// Computes the `q`-quantile of `data` with linear interpolation (R-7).
///
/// # Errors
///
/// Returns an error if `data` is empty, contains NaN, or `q` is outside `[0, 1]`.
///
/// # Examples
///
/// ```
/// use warden::stats::quantile;
///
/// let data = [1.0, 2.0, 3.0, 4.0, 5.0];
/// assert_eq!(quantile(&data, 0.5).expect("valid"), 3.0);
/// assert_eq!(quantile(&data, 0.25).expect("valid"), 2.0);
/// ```
pub fn quantile(data: &[f32], q: f64) -> Result<f32> {
    if data.is_empty() {
        return Err(WardenError::EmptyInput("quantile of empty data".into()));
    }
    if !(0.0..=1.0).contains(&q) {
        return Err(WardenError::InvalidHyperparameter {
            param: "q".into(),
            value: q.to_string(),
            constraint: "in [0, 1]".into(),
        });
    }
    if let Some(&bad) = data.iter().find(|x| x.is_nan()) {
        return Err(WardenError::non_finite("quantile input", f64::from(bad)));
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(f32::total_cmp);

    // R-7 method: h = (n - 1) * q, position in the sorted array
    let h = (sorted.len() - 1) as f64 * q;
    let lower = sorted[h.floor() as usize];
    let upper = sorted[h.ceil() as usize];
    let fraction = (h - h.floor()) as f32;
    Ok(lower + fraction * (upper - lower))
}
