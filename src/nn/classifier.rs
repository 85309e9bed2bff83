//! Classifier interface and the dense ReLU network that implements it.

use super::functional::relu;
use super::linear::Linear;
use super::serialize::StateDict;
use crate::activations::ActivationBatch;
use crate::error::{Result, WardenError};
use crate::primitives::Matrix;

/// Name of the output activation exposed by every [`Mlp`].
pub const LOGITS: &str = "logits";

/// A trained classifier the detectors can inspect and finetune.
///
/// Activations are addressed by name; [`Classifier::layer_names`] lists
/// every name [`Classifier::activations`] accepts. Gradients returned by
/// [`Classifier::backward`] line up one-to-one with
/// [`Classifier::parameters_mut`].
pub trait Classifier: Clone {
    /// Width of one input row.
    fn input_dim(&self) -> usize;

    /// Number of output classes.
    fn num_classes(&self) -> usize;

    /// Every activation name, in forward order.
    fn layer_names(&self) -> Vec<String>;

    /// Logits for a batch of inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the input width is wrong.
    fn forward(&self, inputs: &Matrix<f32>) -> Result<Matrix<f32>>;

    /// Named activations for a batch of inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if a name is unknown or the input width is wrong.
    fn activations(&self, inputs: &Matrix<f32>, names: &[String]) -> Result<ActivationBatch>;

    /// Snapshot of every parameter.
    fn state_dict(&self) -> StateDict;

    /// Overwrites every parameter from `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if names or shapes do not match this model.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;

    /// Parameter gradients of a loss whose gradient with respect to the
    /// logits of `inputs` is `grad_logits`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shapes do not match.
    fn backward(&self, inputs: &Matrix<f32>, grad_logits: &Matrix<f32>) -> Result<Vec<Vec<f32>>>;

    /// Flat mutable views of every parameter.
    fn parameters_mut(&mut self) -> Vec<&mut [f32]>;
}

/// Multi-layer perceptron: `Linear -> ReLU -> ... -> Linear`.
///
/// Hidden activations are exposed after the `ReLU` as `layer0`, `layer1`,
/// ...; the final output is `logits`.
///
/// # Example
///
/// ```
/// use warden::nn::{Classifier, Mlp};
/// use warden::primitives::Matrix;
///
/// let model = Mlp::new(&[4, 8, 3], Some(0)).expect("valid sizes");
/// assert_eq!(model.layer_names(), vec!["layer0", "logits"]);
///
/// let logits = model.forward(&Matrix::zeros(5, 4)).expect("width 4");
/// assert_eq!(logits.shape(), (5, 3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Mlp {
    layers: Vec<Linear>,
}

struct Trace {
    /// Input of each linear layer
    inputs: Vec<Matrix<f32>>,
    /// Output of each linear layer before the nonlinearity
    outputs: Vec<Matrix<f32>>,
}

impl Mlp {
    /// Builds a network with layer widths `sizes = [input, hidden..., classes]`.
    ///
    /// Layer `i` is seeded with `seed + i` when a seed is given.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two sizes are given or any is zero.
    pub fn new(sizes: &[usize], seed: Option<u64>) -> Result<Self> {
        if sizes.len() < 2 || sizes.contains(&0) {
            return Err(WardenError::InvalidHyperparameter {
                param: "sizes".into(),
                value: format!("{sizes:?}"),
                constraint: "at least [input, classes], all non-zero".into(),
            });
        }
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, w)| Linear::with_seed(w[0], w[1], seed.map(|s| s.wrapping_add(i as u64))))
            .collect();
        Ok(Self { layers })
    }

    /// The dense layers, input first.
    #[must_use]
    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    /// Total number of trainable scalars.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(Linear::num_parameters).sum()
    }

    fn trace(&self, inputs: &Matrix<f32>) -> Result<Trace> {
        let mut trace = Trace {
            inputs: Vec::with_capacity(self.layers.len()),
            outputs: Vec::with_capacity(self.layers.len()),
        };
        let mut h = inputs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(&h)?;
            let next = if i + 1 < self.layers.len() { relu(&z) } else { z.clone() };
            trace.inputs.push(h);
            trace.outputs.push(z);
            h = next;
        }
        Ok(trace)
    }

    fn hidden_count(&self) -> usize {
        self.layers.len() - 1
    }
}

impl Classifier for Mlp {
    fn input_dim(&self) -> usize {
        self.layers[0].in_features()
    }

    fn num_classes(&self) -> usize {
        self.layers[self.layers.len() - 1].out_features()
    }

    fn layer_names(&self) -> Vec<String> {
        (0..self.hidden_count())
            .map(|i| format!("layer{i}"))
            .chain(std::iter::once(LOGITS.to_string()))
            .collect()
    }

    fn forward(&self, inputs: &Matrix<f32>) -> Result<Matrix<f32>> {
        let mut trace = self.trace(inputs)?;
        trace
            .outputs
            .pop()
            .ok_or_else(|| WardenError::State("network has no layers".into()))
    }

    fn activations(&self, inputs: &Matrix<f32>, names: &[String]) -> Result<ActivationBatch> {
        if names.is_empty() {
            return Err(WardenError::Config("no activation names requested".into()));
        }
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let idx = if name == LOGITS {
                self.hidden_count()
            } else {
                name.strip_prefix("layer")
                    .and_then(|i| i.parse::<usize>().ok())
                    .filter(|&i| i < self.hidden_count())
                    .ok_or_else(|| {
                        WardenError::Config(format!(
                            "unknown activation '{name}', available: {:?}",
                            self.layer_names()
                        ))
                    })?
            };
            indices.push(idx);
        }

        let trace = self.trace(inputs)?;
        let mut batch = ActivationBatch::new();
        for (name, idx) in names.iter().zip(indices) {
            // Hidden activations are post-ReLU, which is the next layer's input
            let acts = if idx == self.hidden_count() {
                trace.outputs[idx].clone()
            } else {
                trace.inputs[idx + 1].clone()
            };
            batch.insert(name.clone(), acts);
        }
        Ok(batch)
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        for (i, layer) in self.layers.iter().enumerate() {
            state.insert(
                format!("layers.{i}.weight"),
                (
                    layer.weight().as_slice().to_vec(),
                    vec![layer.out_features(), layer.in_features()],
                ),
            );
            state.insert(
                format!("layers.{i}.bias"),
                (layer.bias().to_vec(), vec![layer.out_features()]),
            );
        }
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let expected = self.state_dict();
        if let Some(extra) = state.keys().find(|k| !expected.contains_key(*k)) {
            return Err(WardenError::DimensionMismatch {
                expected: format!("parameters {:?}", expected.keys().collect::<Vec<_>>()),
                actual: format!("unexpected parameter '{extra}'"),
            });
        }
        for (name, (_, shape)) in &expected {
            let (_, found) = state
                .get(name)
                .ok_or_else(|| WardenError::MissingKey(name.clone()))?;
            if found != shape {
                return Err(WardenError::DimensionMismatch {
                    expected: format!("{name} {shape:?}"),
                    actual: format!("{name} {found:?}"),
                });
            }
        }

        // Validated above, so the loop below cannot fail halfway
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let (w, shape) = &state[&format!("layers.{i}.weight")];
            layer.set_weight(Matrix::from_vec(shape[0], shape[1], w.clone())?)?;
            let (b, _) = &state[&format!("layers.{i}.bias")];
            layer.set_bias(b.clone())?;
        }
        Ok(())
    }

    fn backward(&self, inputs: &Matrix<f32>, grad_logits: &Matrix<f32>) -> Result<Vec<Vec<f32>>> {
        let trace = self.trace(inputs)?;
        let mut grads = Vec::with_capacity(self.layers.len() * 2);
        let mut grad = grad_logits.clone();

        for i in (0..self.layers.len()).rev() {
            let layer_grads = self.layers[i].backward(&trace.inputs[i], &grad)?;
            grads.push(layer_grads.bias);
            grads.push(layer_grads.weight.into_vec());
            grad = layer_grads.input;
            if i > 0 {
                // ReLU derivative of the previous layer's pre-activation
                for (g, &z) in grad
                    .as_mut_slice()
                    .iter_mut()
                    .zip(trace.outputs[i - 1].as_slice())
                {
                    if z <= 0.0 {
                        *g = 0.0;
                    }
                }
            }
        }
        grads.reverse();
        Ok(grads)
    }

    fn parameters_mut(&mut self) -> Vec<&mut [f32]> {
        self.layers
            .iter_mut()
            .flat_map(Linear::parameters_mut)
            .collect()
    }
}

#[cfg(test)]
#[path = "classifier_tests.rs"]
mod tests;
