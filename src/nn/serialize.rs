//! Classifier weight serialization.
//!
//! Weights are written as plain `SafeTensors` files keyed by the names of
//! [`Classifier::state_dict`].
//!
//! # Example
//!
//! ```
//! use warden::nn::serialize::{load_model, save_model};
//! use warden::nn::Mlp;
//!
//! let dir = tempfile::tempdir().expect("tempdir");
//! let path = dir.path().join("mlp.safetensors");
//!
//! let model = Mlp::new(&[4, 8, 2], Some(1)).expect("valid sizes");
//! save_model(&model, &path).expect("save");
//!
//! let mut restored = Mlp::new(&[4, 8, 2], Some(2)).expect("valid sizes");
//! load_model(&mut restored, &path).expect("same architecture");
//! assert_eq!(model, restored);
//! ```

use std::path::Path;

use super::classifier::Classifier;
use crate::error::Result;
use crate::serialization::safetensors::{
    load_safetensors, save_safetensors_with_metadata, TensorMap, UserMetadata,
};

/// State dictionary: mapping from parameter names to data and shapes.
pub type StateDict = TensorMap;

/// Save a classifier's parameters to a `SafeTensors` file.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_model<C: Classifier, P: AsRef<Path>>(model: &C, path: P) -> Result<()> {
    save_safetensors_with_metadata(path, &model.state_dict(), &UserMetadata::new())
}

/// Load a state dictionary from a `SafeTensors` file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is malformed.
pub fn load_state_dict<P: AsRef<Path>>(path: P) -> Result<StateDict> {
    let (state, _) = load_safetensors(path)?;
    Ok(state)
}

/// Load parameters from a `SafeTensors` file into a classifier.
///
/// # Errors
///
/// Returns an error if the file is unreadable or its parameters do not
/// match the classifier.
pub fn load_model<C: Classifier, P: AsRef<Path>>(model: &mut C, path: P) -> Result<()> {
    let state = load_state_dict(path)?;
    model.load_state_dict(&state)
}

/// Number of scalars in a state dictionary.
#[must_use]
pub fn count_parameters(state: &StateDict) -> usize {
    state.values().map(|(data, _)| data.len()).sum()
}
