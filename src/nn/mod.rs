//! Minimal neural network framework for the models under inspection.
//!
//! The detectors need four things from a model: logits, named activations,
//! a parameter snapshot, and parameter gradients for finetuning. The
//! [`Classifier`] trait captures exactly that; [`Mlp`] is the in-crate
//! implementation with hand-written back-propagation.
//!
//! - **Layers**: [`Linear`]
//! - **Models**: [`Mlp`] (dense `ReLU` network)
//! - **Functional**: softmax, log-softmax, cross-entropy, KL divergence
//! - **Optimizers**: [`optim::Sgd`], [`optim::Adam`], [`optim::OptimizerFactory`]
//! - **Serialization**: [`serialize::save_model`], [`serialize::load_model`]
//!
//! # Example
//!
//! ```
//! use warden::nn::{Classifier, Mlp};
//! use warden::nn::functional::cross_entropy;
//! use warden::nn::optim::{Optimizer, Sgd};
//! use warden::primitives::Matrix;
//!
//! let mut model = Mlp::new(&[2, 8, 2], Some(0)).expect("valid sizes");
//! let x = Matrix::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).expect("2x2");
//! let labels = [0, 1];
//!
//! let (loss, grad_logits) = cross_entropy(&model.forward(&x).expect("width 2"), &labels).expect("valid labels");
//! let grads = model.backward(&x, &grad_logits).expect("shapes match");
//! let mut sgd = Sgd::new(0.1);
//! sgd.step(&mut model.parameters_mut(), &grads).expect("same layout");
//!
//! let (after, _) = cross_entropy(&model.forward(&x).expect("width 2"), &labels).expect("valid labels");
//! assert!(after < loss);
//! ```
//!
//! # References
//!
//! - Glorot, X., & Bengio, Y. (2010). Understanding the difficulty of training
//!   deep feedforward neural networks. AISTATS.

mod classifier;
pub mod functional;
mod init;
mod linear;
pub mod optim;
pub mod serialize;

pub use classifier::{Classifier, Mlp, LOGITS};
pub use functional as F;
pub use init::{normal, xavier_uniform};
pub use linear::{Linear, LinearGrads};
pub use serialize::StateDict;
