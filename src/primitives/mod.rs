//! Core compute primitives.
//!
//! [`Matrix`] is the batch container for model inputs, activations and logits.

mod matrix;

pub use matrix::Matrix;
