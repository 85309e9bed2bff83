//! Weight initialization functions.
//!
//! - Xavier/Glorot (Glorot & Bengio, 2010) for the dense layers of [`super::Mlp`]
//! - Gaussian sampling for synthetic activations in tests and demos
//!
//! # References
//!
//! - Glorot, X., & Bengio, Y. (2010). Understanding the difficulty of training
//!   deep feedforward neural networks. AISTATS.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::primitives::Matrix;

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Xavier uniform initialization (Glorot & Bengio, 2010).
///
/// Samples a `rows x cols` matrix from U(-a, a) where
/// a = sqrt(6 / (`fan_in` + `fan_out`)).
///
/// # Example
///
/// ```
/// use warden::nn::xavier_uniform;
///
/// // Weight of a layer with 784 inputs and 256 outputs
/// let weight = xavier_uniform(256, 784, Some(42));
/// assert_eq!(weight.shape(), (256, 784));
/// ```
#[must_use]
pub fn xavier_uniform(fan_out: usize, fan_in: usize, seed: Option<u64>) -> Matrix<f32> {
    let a = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    uniform(fan_out, fan_in, -a, a, seed)
}

/// Uniform distribution initialization.
///
/// Samples from U(low, high).
pub(crate) fn uniform(rows: usize, cols: usize, low: f32, high: f32, seed: Option<u64>) -> Matrix<f32> {
    let mut rng = rng_from(seed);
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(low..high)).collect();
    Matrix::from_parts(rows, cols, data)
}

/// Normal distribution sampling.
///
/// Samples a `rows x cols` matrix from N(mean, std) via Box-Muller.
#[must_use]
pub fn normal(rows: usize, cols: usize, mean: f32, std: f32, seed: Option<u64>) -> Matrix<f32> {
    let mut rng = rng_from(seed);
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
            mean + std * z
        })
        .collect();
    Matrix::from_parts(rows, cols, data)
}
