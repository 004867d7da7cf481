//! Model representation: the backbone seam, parameter vectors and functional weight overlays.
//!
//! A [`Network`] is a stack of named [`Linear`] layers whose last layer is the shared
//! class-incremental classification head. Everything the aggregation strategies need from a
//! backbone goes through this trait:
//!
//! - deterministic named parameter iteration (`<layer>.weight`, `<layer>.bias`, in declaration
//!   order), which is what [`ParameterVector::flatten`] and [`ParameterVector::unflatten`] rely on;
//! - a forward pass parameterized by an explicit [`WeightOverlay`], so that adapter strategies can
//!   apply transient weight deltas without mutating the backbone;
//! - a backward pass returning the gradients with respect to the *effective* weights of that
//!   forward pass.

pub mod loss;
pub mod mlp;
pub mod optim;

use std::{
    collections::BTreeMap,
    iter::{FromIterator, IntoIterator},
    slice::Iter,
};

use derive_more::{From, Index, IndexMut, Into};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    loss::{LabelScheme, TaskWindow},
    mlp::Mlp,
    optim::Optimizer,
};

/// The name of the classification head layer.
pub const HEAD: &str = "head";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A fully connected layer `y = x Wᵀ + b`.
pub struct Linear {
    /// The layer name; parameters are exposed as `<name>.weight` and `<name>.bias`.
    pub name: String,
    /// The weight matrix of shape `out x in`.
    pub weight: Array2<f32>,
    /// The bias vector of shape `out`.
    pub bias: Array1<f32>,
}

impl Linear {
    /// The number of input features.
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// The number of output features.
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Whether this layer is the classification head.
    pub fn is_head(&self) -> bool {
        self.name == HEAD
    }

    /// The number of scalar parameters of this layer.
    pub fn len(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// A backbone network made of named linear layers.
///
/// The last layer returned by [`layers()`] must be the classification head named [`HEAD`].
///
/// [`layers()`]: Network::layers
pub trait Network: Clone + Send + Sync + std::fmt::Debug {
    /// The layers in declaration order.
    fn layers(&self) -> &[Linear];

    /// The layers in declaration order, mutably.
    fn layers_mut(&mut self) -> &mut [Linear];

    /// Runs a forward pass with the given weight overlay applied on top of the stored weights.
    fn forward(&self, inputs: ArrayView2<f32>, overlay: &WeightOverlay) -> ForwardPass;

    /// Computes the gradients of a forward pass with respect to the effective layer weights.
    fn backward(
        &self,
        pass: &ForwardPass,
        grad_logits: ArrayView2<f32>,
        overlay: &WeightOverlay,
    ) -> Gradients;

    /// The classification head.
    fn head(&self) -> &Linear {
        let layers = self.layers();
        &layers[layers.len() - 1]
    }

    /// The classification head, mutably.
    fn head_mut(&mut self) -> &mut Linear {
        let layers = self.layers_mut();
        let last = layers.len() - 1;
        &mut layers[last]
    }

    /// The total number of output classes of the shared head.
    fn num_classes(&self) -> usize {
        self.head().out_features()
    }

    /// The dimension of the penultimate features fed into the head.
    fn feature_dim(&self) -> usize {
        self.head().in_features()
    }

    /// Looks up a layer by name.
    fn layer(&self, name: &str) -> Option<&Linear> {
        self.layers().iter().find(|layer| layer.name == name)
    }

    /// Looks up a layer by name, mutably.
    fn layer_mut(&mut self, name: &str) -> Option<&mut Linear> {
        self.layers_mut().iter_mut().find(|layer| layer.name == name)
    }

    /// The total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.layers().iter().map(Linear::len).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Transient per-layer weight deltas applied during a single forward/backward pass.
///
/// The overlay never becomes part of the backbone's persisted state: the effective weight of a
/// layer is `weight + overlay[layer]` for the duration of the pass only.
pub struct WeightOverlay(BTreeMap<String, Array2<f32>>);

impl WeightOverlay {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a delta for the given layer, summing with any delta already present.
    pub fn add(&mut self, layer: &str, delta: Array2<f32>) {
        match self.0.get_mut(layer) {
            Some(existing) => *existing += &delta,
            None => {
                self.0.insert(layer.to_string(), delta);
            }
        }
    }

    /// Gets the delta for the given layer, if any.
    pub fn get(&self, layer: &str) -> Option<&Array2<f32>> {
        self.0.get(layer)
    }

    /// Whether no layer is overlaid.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Computes the effective weight of a layer.
    pub fn effective_weight(&self, layer: &Linear) -> Array2<f32> {
        match self.get(&layer.name) {
            Some(delta) => &layer.weight + delta,
            None => layer.weight.clone(),
        }
    }
}

#[derive(Debug, Clone)]
/// The intermediate values of a forward pass.
pub struct ForwardPass {
    /// The input of every layer, i.e. `inputs[0]` is the batch and `inputs[l]` the activation fed
    /// into layer `l`.
    pub inputs: Vec<Array2<f32>>,
    /// The pre-activation output of every layer.
    pub outputs: Vec<Array2<f32>>,
}

impl ForwardPass {
    /// The penultimate features, i.e. the input of the classification head.
    pub fn features(&self) -> &Array2<f32> {
        &self.inputs[self.inputs.len() - 1]
    }

    /// The logits over all classes of the shared head.
    pub fn logits(&self) -> &Array2<f32> {
        &self.outputs[self.outputs.len() - 1]
    }
}

#[derive(Debug, Clone)]
/// Gradients of a scalar loss with respect to the effective weights and biases of every layer.
pub struct Gradients {
    pub weights: Vec<Array2<f32>>,
    pub biases: Vec<Array1<f32>>,
}

#[derive(Debug, Error, PartialEq)]
#[error("expected a parameter vector of length {expected}, got {actual}")]
/// Errors related to restoring a model from a parameter vector.
pub struct ShapeMismatch {
    pub expected: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, PartialEq, Default, From, Index, IndexMut, Into, Serialize, Deserialize)]
/// A flat representation of every learnable scalar of a model.
///
/// The traversal order is the declaration order of the layers, the weight (row-major) before the
/// bias of each layer.
pub struct ParameterVector(Vec<f32>);

#[allow(clippy::len_without_is_empty)]
impl ParameterVector {
    /// Flattens the parameters of a network.
    pub fn flatten<N: Network>(network: &N) -> Self {
        let mut data = Vec::with_capacity(network.num_parameters());
        for layer in network.layers() {
            data.extend(layer.weight.iter().copied());
            data.extend(layer.bias.iter().copied());
        }
        ParameterVector(data)
    }

    /// Overwrites the parameters of a network in the traversal order of [`flatten()`].
    ///
    /// # Errors
    /// Fails with a [`ShapeMismatch`] if the vector length differs from the number of parameters
    /// of the network, in which case the network is left untouched.
    ///
    /// [`flatten()`]: ParameterVector::flatten
    pub fn unflatten<N: Network>(&self, network: &mut N) -> Result<(), ShapeMismatch> {
        let expected = network.num_parameters();
        if self.0.len() != expected {
            return Err(ShapeMismatch {
                expected,
                actual: self.0.len(),
            });
        }

        let mut values = self.0.iter();
        for layer in network.layers_mut() {
            for (param, value) in layer
                .weight
                .iter_mut()
                .chain(layer.bias.iter_mut())
                .zip(&mut values)
            {
                *param = *value;
            }
        }
        Ok(())
    }

    /// Gets the number of scalars of this vector.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Creates an iterator that yields references to the scalars of this vector.
    pub fn iter(&self) -> Iter<f32> {
        self.0.iter()
    }

    /// Returns the scalars of this vector as a slice.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Splits this vector into the per-layer ranges of the given network.
    ///
    /// Each entry is the layer name with the half-open range covering its weight and bias.
    pub fn layer_ranges<N: Network>(network: &N) -> Vec<(String, std::ops::Range<usize>)> {
        let mut start = 0;
        network
            .layers()
            .iter()
            .map(|layer| {
                let range = start..start + layer.len();
                start = range.end;
                (layer.name.clone(), range)
            })
            .collect()
    }
}

impl FromIterator<f32> for ParameterVector {
    fn from_iter<I: IntoIterator<Item = f32>>(iter: I) -> Self {
        ParameterVector(iter.into_iter().collect())
    }
}

impl IntoIterator for ParameterVector {
    type Item = f32;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
