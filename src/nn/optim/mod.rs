//! Gradient-based optimizers for finetuning.
//!
//! Optimizers update flat parameter slices in place from gradients of the
//! same layout, as produced by [`crate::nn::Classifier::backward`] and
//! [`crate::nn::Classifier::parameters_mut`].
//!
//! # Example
//!
//! ```
//! use warden::nn::optim::{Optimizer, Sgd};
//!
//! let mut weights = vec![1.0_f32, 2.0, 3.0];
//! let grads = vec![vec![2.0_f32, 4.0, 6.0]];
//!
//! let mut sgd = Sgd::new(0.1);
//! sgd.step(&mut [weights.as_mut_slice()], &grads).expect("matching layout");
//! assert!((weights[0] - 0.8).abs() < 1e-6);
//! ```
//!
//! # References
//!
//! - Robbins, H., & Monro, S. (1951). A stochastic approximation method.
//! - Kingma, D. P., & Ba, J. (2015). Adam: A method for stochastic optimization. ICLR.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, WardenError};

/// Common trait for all optimizers.
pub trait Optimizer {
    /// Applies one update to `params` using `grads` (same order and lengths).
    ///
    /// # Errors
    ///
    /// Returns an error if the gradient layout does not match the
    /// parameters, or differs from the layout of earlier steps.
    fn step(&mut self, params: &mut [&mut [f32]], grads: &[Vec<f32>]) -> Result<()>;

    /// Get current learning rate.
    fn lr(&self) -> f32;

    /// Set learning rate (for schedulers).
    fn set_lr(&mut self, lr: f32);
}

fn check_layout(params: &[&mut [f32]], grads: &[Vec<f32>], state: &[Vec<f32>]) -> Result<()> {
    if params.len() != grads.len() {
        return Err(WardenError::dimension_mismatch(
            "gradient tensors",
            params.len(),
            grads.len(),
        ));
    }
    for (i, (p, g)) in params.iter().zip(grads).enumerate() {
        if p.len() != g.len() {
            return Err(WardenError::dimension_mismatch(
                &format!("gradient {i} length"),
                p.len(),
                g.len(),
            ));
        }
    }
    if !state.is_empty()
        && (state.len() != params.len() || state.iter().zip(params).any(|(s, p)| s.len() != p.len()))
    {
        return Err(WardenError::State(
            "parameter layout changed between optimizer steps".into(),
        ));
    }
    Ok(())
}

fn zeros_like(params: &[&mut [f32]]) -> Vec<Vec<f32>> {
    params.iter().map(|p| vec![0.0; p.len()]).collect()
}

/// Stochastic Gradient Descent optimizer with momentum.
///
/// Update rule:
/// ```text
/// v_t = momentum * v_{t-1} + grad
/// param = param - lr * v_t
/// ```
///
/// With Nesterov momentum:
/// ```text
/// v_t = momentum * v_{t-1} + grad
/// param = param - lr * (momentum * v_t + grad)
/// ```
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    /// Momentum factor (0 = no momentum)
    momentum: f32,
    /// Weight decay (L2 regularization)
    weight_decay: f32,
    nesterov: bool,
    /// Velocity buffers, allocated on the first step
    velocities: Vec<Vec<f32>>,
}

impl Sgd {
    /// Create a new SGD optimizer.
    #[must_use]
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            velocities: Vec::new(),
        }
    }

    /// Create SGD with momentum.
    #[must_use]
    pub fn with_momentum(lr: f32, momentum: f32) -> Self {
        Self {
            momentum,
            ..Self::new(lr)
        }
    }

    /// Enable Nesterov momentum.
    #[must_use]
    pub fn nesterov(mut self) -> Self {
        self.nesterov = true;
        self
    }

    /// Set weight decay (L2 regularization).
    #[must_use]
    pub fn weight_decay(mut self, wd: f32) -> Self {
        self.weight_decay = wd;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut [f32]], grads: &[Vec<f32>]) -> Result<()> {
        check_layout(params, grads, &self.velocities)?;
        if self.velocities.is_empty() {
            self.velocities = zeros_like(params);
        }

        for ((param, grad), velocity) in params.iter_mut().zip(grads).zip(&mut self.velocities) {
            for ((p, &g), v) in param.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                let g = g + self.weight_decay * *p;
                if self.momentum == 0.0 {
                    *p -= self.lr * g;
                    continue;
                }
                *v = self.momentum * *v + g;
                if self.nesterov {
                    *p -= self.lr * (self.momentum * *v + g);
                } else {
                    *p -= self.lr * *v;
                }
            }
        }
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Adam optimizer (Kingma & Ba, 2015).
///
/// Update rule:
/// ```text
/// m_t = β₁ * m_{t-1} + (1 - β₁) * grad
/// v_t = β₂ * v_{t-1} + (1 - β₂) * grad²
/// m̂_t = m_t / (1 - β₁ᵗ)
/// v̂_t = v_t / (1 - β₂ᵗ)
/// param = param - lr * m̂_t / (√v̂_t + ε)
/// ```
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    /// First moment estimates
    m: Vec<Vec<f32>>,
    /// Second moment estimates
    v: Vec<Vec<f32>>,
    /// Current timestep for bias correction
    t: i32,
}

impl Adam {
    /// Create a new Adam optimizer with default hyperparameters.
    ///
    /// Default: β₁=0.9, β₂=0.999, ε=1e-8
    #[must_use]
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    /// Set beta parameters.
    #[must_use]
    pub fn betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Set epsilon for numerical stability.
    #[must_use]
    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Set weight decay (L2 regularization, applied to gradient).
    #[must_use]
    pub fn weight_decay(mut self, wd: f32) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Number of steps taken.
    #[must_use]
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut [f32]], grads: &[Vec<f32>]) -> Result<()> {
        check_layout(params, grads, &self.m)?;
        if self.m.is_empty() {
            self.m = zeros_like(params);
            self.v = zeros_like(params);
        }
        self.t = self.t.saturating_add(1);

        let bias_correction1 = 1.0 - self.beta1.powi(self.t);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t);

        for (((param, grad), m), v) in params
            .iter_mut()
            .zip(grads)
            .zip(&mut self.m)
            .zip(&mut self.v)
        {
            for (((p, &g), m), v) in param.iter_mut().zip(grad).zip(m.iter_mut()).zip(v.iter_mut()) {
                let g = g + self.weight_decay * *p;
                *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;

                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

type BuildFn = dyn Fn(f32) -> Box<dyn Optimizer> + Send + Sync;

/// Builds a fresh optimizer for a given learning rate.
///
/// Stored in finetuning configs so callers choose the optimizer as a value.
/// Factories are code, not data: they are never serialized, and two
/// factories compare equal when their names match.
///
/// # Example
///
/// ```
/// use warden::nn::optim::{OptimizerFactory, Sgd};
///
/// let factory = OptimizerFactory::custom("nesterov", |lr| Box::new(Sgd::with_momentum(lr, 0.9).nesterov()));
/// let optimizer = factory.build(0.01);
/// assert_eq!(optimizer.lr(), 0.01);
/// assert_eq!(factory.name(), "nesterov");
/// ```
#[derive(Clone)]
pub struct OptimizerFactory {
    name: String,
    build: Arc<BuildFn>,
}

impl OptimizerFactory {
    /// Adam with default betas.
    #[must_use]
    pub fn adam() -> Self {
        Self::custom("adam", |lr| Box::new(Adam::new(lr)))
    }

    /// SGD with the given momentum (0 for plain SGD).
    #[must_use]
    pub fn sgd(momentum: f32) -> Self {
        Self::custom("sgd", move |lr| Box::new(Sgd::with_momentum(lr, momentum)))
    }

    /// Any optimizer constructor.
    pub fn custom<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn(f32) -> Box<dyn Optimizer> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            build: Arc::new(build),
        }
    }

    /// Name used for logging and equality.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds a new optimizer with learning rate `lr`.
    #[must_use]
    pub fn build(&self, lr: f32) -> Box<dyn Optimizer> {
        (self.build)(lr)
    }
}

impl Default for OptimizerFactory {
    fn default() -> Self {
        Self::adam()
    }
}

impl PartialEq for OptimizerFactory {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for OptimizerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizerFactory")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
