//! Fully connected (linear) layer.
//!
//! Implements the transformation y = xW^T + b together with its
//! hand-written backward pass.
//!
//! # References
//!
//! - Glorot, X., & Bengio, Y. (2010). Understanding the difficulty of training
//!   deep feedforward neural networks. AISTATS.

use super::init::xavier_uniform;
use crate::error::{Result, WardenError};
use crate::primitives::Matrix;

/// Gradients produced by [`Linear::backward`].
#[derive(Debug, Clone)]
pub struct LinearGrads {
    /// dL/dx, shape `[batch, in_features]`
    pub input: Matrix<f32>,
    /// dL/dW, shape `[out_features, in_features]`
    pub weight: Matrix<f32>,
    /// dL/db, length `out_features`
    pub bias: Vec<f32>,
}

/// Fully connected layer: y = xW^T + b
///
/// Weight initialization follows Xavier/Glorot (Glorot & Bengio, 2010);
/// the bias starts at zero.
///
/// # Shape
///
/// - Input: `(batch, in_features)`
/// - Output: `(batch, out_features)`
///
/// # Example
///
/// ```
/// use warden::nn::Linear;
/// use warden::primitives::Matrix;
///
/// let layer = Linear::with_seed(20, 30, Some(0));
/// let x = Matrix::zeros(128, 20);
/// let output = layer.forward(&x).expect("input width matches");
///
/// assert_eq!(output.shape(), (128, 30));
/// ```
#[derive(Clone, PartialEq)]
pub struct Linear {
    /// Weight matrix, shape: [out_features, in_features]
    weight: Matrix<f32>,

    /// Bias vector, length out_features
    bias: Vec<f32>,
}

impl Linear {
    /// Create a new Linear layer with Xavier initialization.
    #[must_use]
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::with_seed(in_features, out_features, None)
    }

    /// Create a Linear layer with a specific random seed.
    #[must_use]
    pub fn with_seed(in_features: usize, out_features: usize, seed: Option<u64>) -> Self {
        Self {
            weight: xavier_uniform(out_features, in_features, seed),
            bias: vec![0.0; out_features],
        }
    }

    /// Get the input feature dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.n_cols()
    }

    /// Get the output feature dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.n_rows()
    }

    /// Total number of trainable scalars.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.weight.as_slice().len() + self.bias.len()
    }

    /// Get reference to the weight matrix.
    #[must_use]
    pub fn weight(&self) -> &Matrix<f32> {
        &self.weight
    }

    /// Get reference to the bias vector.
    #[must_use]
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Replace the weight with externally loaded data.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape differs from the current weight.
    pub fn set_weight(&mut self, weight: Matrix<f32>) -> Result<()> {
        if weight.shape() != self.weight.shape() {
            return Err(WardenError::DimensionMismatch {
                expected: format!("weight {:?}", self.weight.shape()),
                actual: format!("weight {:?}", weight.shape()),
            });
        }
        self.weight = weight;
        Ok(())
    }

    /// Replace the bias with externally loaded data.
    ///
    /// # Errors
    ///
    /// Returns an error if the length differs from `out_features`.
    pub fn set_bias(&mut self, bias: Vec<f32>) -> Result<()> {
        if bias.len() != self.bias.len() {
            return Err(WardenError::dimension_mismatch("bias", self.bias.len(), bias.len()));
        }
        self.bias = bias;
        Ok(())
    }

    /// y = x @ W^T + b
    ///
    /// # Errors
    ///
    /// Returns an error if the input width is not `in_features`.
    pub fn forward(&self, input: &Matrix<f32>) -> Result<Matrix<f32>> {
        if input.n_cols() != self.in_features() {
            return Err(WardenError::dimension_mismatch(
                "linear input features",
                self.in_features(),
                input.n_cols(),
            ));
        }
        let mut output = input.matmul(&self.weight.transpose())?;
        let out = self.out_features();
        for (i, v) in output.as_mut_slice().iter_mut().enumerate() {
            *v += self.bias[i % out];
        }
        Ok(output)
    }

    /// Back-propagates `grad_output` (dL/dy) through the layer for the
    /// `input` that produced it.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes of `input` and `grad_output` do not
    /// match this layer.
    pub fn backward(&self, input: &Matrix<f32>, grad_output: &Matrix<f32>) -> Result<LinearGrads> {
        if grad_output.n_cols() != self.out_features() {
            return Err(WardenError::dimension_mismatch(
                "linear grad features",
                self.out_features(),
                grad_output.n_cols(),
            ));
        }
        if grad_output.n_rows() != input.n_rows() {
            return Err(WardenError::dimension_mismatch(
                "linear grad batch",
                input.n_rows(),
                grad_output.n_rows(),
            ));
        }

        // dW = dy^T @ x, db = sum over batch of dy, dx = dy @ W
        let weight = grad_output.transpose().matmul(input)?;
        let mut bias = vec![0.0; self.out_features()];
        for row in grad_output.rows() {
            for (b, &g) in bias.iter_mut().zip(row) {
                *b += g;
            }
        }
        let input_grad = grad_output.matmul(&self.weight)?;

        Ok(LinearGrads {
            input: input_grad,
            weight,
            bias,
        })
    }

    /// Flat mutable views of `[weight, bias]`, in that order.
    pub fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        vec![self.weight.as_mut_slice(), self.bias.as_mut_slice()]
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features())
            .field("out_features", &self.out_features())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_layer() -> Linear {
        let mut layer = Linear::with_seed(2, 2, Some(42));
        layer
            .set_weight(Matrix::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).expect("2x2"))
            .expect("same shape");
        layer.set_bias(vec![10.0, 20.0]).expect("same length");
        layer
    }

    #[test]
    fn test_linear_forward_shape() {
        let layer = Linear::new(10, 5);
        let output = layer.forward(&Matrix::zeros(32, 10)).expect("width 10");
        assert_eq!(output.shape(), (32, 5));
    }

    #[test]
    fn test_linear_num_parameters() {
        let layer = Linear::new(10, 5);
        // weight: 10*5 = 50, bias: 5, total: 55
        assert_eq!(layer.num_parameters(), 55);
    }

    #[test]
    fn test_linear_reproducible() {
        let layer1 = Linear::with_seed(10, 5, Some(42));
        let layer2 = Linear::with_seed(10, 5, Some(42));
        assert_eq!(layer1, layer2);
    }

    #[test]
    fn test_linear_with_bias() {
        let layer = fixed_layer();
        let x = Matrix::from_vec(1, 2, vec![1.0, 2.0]).expect("1x2");
        let output = layer.forward(&x).expect("width 2");

        // y = [1, 2] @ I + [10, 20] = [11, 22]
        assert!((output.get(0, 0) - 11.0).abs() < 1e-5);
        assert!((output.get(0, 1) - 22.0).abs() < 1e-5);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let layer = Linear::new(3, 2);
        assert!(layer.forward(&Matrix::zeros(1, 4)).is_err());
    }

    #[test]
    fn test_set_weight_rejects_wrong_shape() {
        let mut layer = Linear::new(3, 2);
        assert!(layer.set_weight(Matrix::zeros(3, 2)).is_err());
        assert!(layer.set_bias(vec![0.0; 3]).is_err());
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        // L = sum(y), so dL/dy = 1 everywhere
        let layer = Linear::with_seed(3, 2, Some(7));
        let x = Matrix::from_vec(2, 3, vec![0.5, -1.0, 2.0, 1.5, 0.0, -0.5]).expect("2x3");
        let ones = Matrix::from_vec(2, 2, vec![1.0; 4]).expect("2x2");
        let grads = layer.backward(&x, &ones).expect("shapes match");

        let loss = |l: &Linear| -> f32 { l.forward(&x).expect("width 3").as_slice().iter().sum() };
        let eps = 1e-2;
        for idx in 0..6 {
            let mut plus = layer.clone();
            plus.weight.as_mut_slice()[idx] += eps;
            let mut minus = layer.clone();
            minus.weight.as_mut_slice()[idx] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!((numeric - grads.weight.as_slice()[idx]).abs() < 1e-2);
        }
        // Each bias feeds both samples
        assert_eq!(grads.bias, vec![2.0, 2.0]);
        assert_eq!(grads.input.shape(), (2, 3));
    }

    #[test]
    fn test_backward_rejects_mismatched_batch() {
        let layer = Linear::new(3, 2);
        assert!(layer
            .backward(&Matrix::zeros(2, 3), &Matrix::zeros(1, 2))
            .is_err());
    }
}
