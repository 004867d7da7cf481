//! A multi-layer perceptron backbone with a shared classification head.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::model::{ForwardPass, Gradients, Linear, Network, WeightOverlay, HEAD};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A ReLU multi-layer perceptron.
///
/// Hidden layers are named `blocks.<i>`, the final layer is the classification head.
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// Creates a new perceptron with uniformly initialized weights in `±1/sqrt(fan_in)`.
    pub fn new(input_dim: usize, hidden: &[usize], num_classes: usize, seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let mut fan_in = input_dim;
        let mut layers = Vec::with_capacity(hidden.len() + 1);
        for (i, &width) in hidden.iter().enumerate() {
            layers.push(init_linear(&mut rng, format!("blocks.{}", i), fan_in, width));
            fan_in = width;
        }
        layers.push(init_linear(&mut rng, HEAD.to_string(), fan_in, num_classes));
        Self { layers }
    }

    /// Creates a perceptron from explicit layers.
    ///
    /// # Panics
    /// Panics if there are no layers or if the last layer is not named [`HEAD`].
    pub fn from_layers(layers: Vec<Linear>) -> Self {
        assert!(
            layers.last().map(Linear::is_head).unwrap_or(false),
            "the last layer must be the classification head"
        );
        Self { layers }
    }
}

fn init_linear(rng: &mut ChaCha20Rng, name: String, fan_in: usize, fan_out: usize) -> Linear {
    let bound = 1. / (fan_in.max(1) as f32).sqrt();
    Linear {
        name,
        weight: Array2::from_shape_simple_fn((fan_out, fan_in), || rng.gen_range(-bound..=bound)),
        bias: Array1::from_shape_simple_fn(fan_out, || rng.gen_range(-bound..=bound)),
    }
}

impl Network for Mlp {
    fn layers(&self) -> &[Linear] {
        &self.layers
    }

    fn layers_mut(&mut self) -> &mut [Linear] {
        &mut self.layers
    }

    fn forward(&self, inputs: ArrayView2<f32>, overlay: &WeightOverlay) -> ForwardPass {
        let depth = self.layers.len();
        let mut layer_inputs = Vec::with_capacity(depth);
        let mut outputs = Vec::with_capacity(depth);

        let mut x = inputs.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            let weight = overlay.effective_weight(layer);
            let z = x.dot(&weight.t()) + &layer.bias;
            let next = if i + 1 < depth {
                z.mapv(|v| v.max(0.))
            } else {
                z.clone()
            };
            layer_inputs.push(x);
            outputs.push(z);
            x = next;
        }

        ForwardPass {
            inputs: layer_inputs,
            outputs,
        }
    }

    fn backward(
        &self,
        pass: &ForwardPass,
        grad_logits: ArrayView2<f32>,
        overlay: &WeightOverlay,
    ) -> Gradients {
        let depth = self.layers.len();
        let mut weights = Vec::with_capacity(depth);
        let mut biases = Vec::with_capacity(depth);

        let mut grad = grad_logits.to_owned();
        for l in (0..depth).rev() {
            weights.push(grad.t().dot(&pass.inputs[l]));
            biases.push(grad.sum_axis(Axis(0)));
            if l > 0 {
                let weight = overlay.effective_weight(&self.layers[l]);
                let mut upstream = grad.dot(&weight);
                // relu
                Zip::from(&mut upstream)
                    .and(&pass.outputs[l - 1])
                    .for_each(|g, &z| {
                        if z <= 0. {
                            *g = 0.
                        }
                    });
                grad = upstream;
            }
        }

        weights.reverse();
        biases.reverse();
        Gradients { weights, biases }
    }
}
