//! First order optimizers keyed by parameter name.

use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

use crate::settings::{OptimizerKind, OptimizerSettings};

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ParamState {
    steps: i32,
    first: ArrayD<f32>,
    second: Option<ArrayD<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// An optimizer over an arbitrary set of named tensors.
///
/// The state is created lazily the first time a tensor is stepped, so the same optimizer can be
/// bound to any trainable subset of a model (all weights, only the head, only adapter factors).
pub struct Optimizer {
    settings: OptimizerSettings,
    state: BTreeMap<String, ParamState>,
}

impl Optimizer {
    /// Creates an optimizer without any state.
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            settings,
            state: BTreeMap::new(),
        }
    }

    /// Creates an SGD optimizer with momentum and without weight decay.
    pub fn sgd(lr: f32, momentum: f32) -> Self {
        Self::new(OptimizerSettings {
            kind: OptimizerKind::Sgd,
            lr,
            momentum,
            weight_decay: 0.,
        })
    }

    /// The learning rate.
    pub fn lr(&self) -> f32 {
        self.settings.lr
    }

    /// The names of the tensors this optimizer has state for.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.state.keys().map(String::as_str)
    }

    /// Updates a tensor in place given its gradient.
    pub fn step(&mut self, key: &str, mut param: ArrayViewMutD<f32>, grad: ArrayViewD<f32>) {
        let OptimizerSettings {
            kind,
            lr,
            momentum,
            weight_decay,
        } = self.settings;
        let state = self
            .state
            .entry(key.to_string())
            .or_insert_with(|| ParamState {
                steps: 0,
                first: ArrayD::zeros(grad.raw_dim()),
                second: match kind {
                    OptimizerKind::Sgd => None,
                    OptimizerKind::Adamw => Some(ArrayD::zeros(grad.raw_dim())),
                },
            });
        state.steps += 1;

        match (kind, state.second.as_mut()) {
            (OptimizerKind::Adamw, Some(second)) => {
                let correction1 = 1. - ADAM_BETA1.powi(state.steps);
                let correction2 = 1. - ADAM_BETA2.powi(state.steps);
                Zip::from(&mut param)
                    .and(&grad)
                    .and(&mut state.first)
                    .and(second)
                    .for_each(|p, &g, m, v| {
                        *p *= 1. - lr * weight_decay;
                        *m = ADAM_BETA1 * *m + (1. - ADAM_BETA1) * g;
                        *v = ADAM_BETA2 * *v + (1. - ADAM_BETA2) * g * g;
                        let m_hat = *m / correction1;
                        let v_hat = *v / correction2;
                        *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPS);
                    });
            }
            _ => {
                let first_step = state.steps == 1;
                Zip::from(&mut param)
                    .and(&grad)
                    .and(&mut state.first)
                    .for_each(|p, &g, buf| {
                        let g = g + weight_decay * *p;
                        *buf = if first_step { g } else { momentum * *buf + g };
                        *p -= lr * *buf;
                    });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1};

    use super::*;

    #[test]
    fn test_sgd_without_momentum() {
        let mut opt = Optimizer::sgd(0.1, 0.);
        let mut p = array![1., 2.];
        opt.step("p", p.view_mut().into_dyn(), array![1., -1.].view().into_dyn());
        assert!((p[0] - 0.9).abs() < 1e-6);
        assert!((p[1] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut opt = Optimizer::sgd(1., 0.5);
        let mut p = array![0.];
        let g = array![1.];
        opt.step("p", p.view_mut().into_dyn(), g.view().into_dyn());
        assert_eq!(p, array![-1.]);
        opt.step("p", p.view_mut().into_dyn(), g.view().into_dyn());
        assert_eq!(p, array![-2.5]);
        assert_eq!(opt.keys().collect::<Vec<_>>(), vec!["p"]);
    }

    #[test]
    fn test_adamw_first_step_is_lr_sized() {
        let mut opt = Optimizer::new(OptimizerSettings {
            kind: OptimizerKind::Adamw,
            lr: 0.01,
            momentum: 0.,
            weight_decay: 0.,
        });
        let mut p = Array1::<f32>::zeros(3);
        opt.step(
            "p",
            p.view_mut().into_dyn(),
            array![2., -0.5, 0.].view().into_dyn(),
        );
        assert!((p[0] + 0.01).abs() < 1e-5);
        assert!((p[1] - 0.01).abs() < 1e-5);
        assert_eq!(p[2], 0.);
    }
}
