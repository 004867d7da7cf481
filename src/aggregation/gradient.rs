//! Gradient importance (`small_omega`) based client weighting.
//!
//! During local training every client accumulates `Σ_t g_t ⊙ (θ_t - θ_{t+1})`, the realized
//! parameter displacement weighted by the gradient. The aggregator turns these importances into
//! per-parameter or per-layer client weights.

use std::ops::Range;

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregation::weights::ClientWeights;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The granularity at which gradient importances are normalized across clients.
pub enum Granularity {
    PerParameter,
    PerLayer,
}

#[derive(Debug, Clone, PartialEq)]
/// The per-client accumulator of the gradient importance.
pub struct SmallOmega(Array1<f32>);

impl SmallOmega {
    /// Creates a zeroed accumulator for `len` parameters.
    pub fn zeros(len: usize) -> Self {
        SmallOmega(Array1::zeros(len))
    }

    /// Resets the accumulator.
    pub fn reset(&mut self) {
        self.0.fill(0.);
    }

    /// Adds the contribution of one optimizer step on the parameter slice starting at `offset`.
    pub fn accumulate(
        &mut self,
        offset: usize,
        grad: ArrayView1<f32>,
        before: ArrayView1<f32>,
        after: ArrayView1<f32>,
    ) {
        let end = offset + grad.len();
        let mut slice = self.0.slice_mut(ndarray::s![offset..end]);
        ndarray::Zip::from(&mut slice)
            .and(&grad)
            .and(&before)
            .and(&after)
            .for_each(|o, &g, &b, &a| *o += g * (b - a));
    }

    /// Gets the importances.
    pub fn values(&self) -> &Array1<f32> {
        &self.0
    }
}

impl From<SmallOmega> for Vec<f32> {
    fn from(omega: SmallOmega) -> Self {
        omega.0.to_vec()
    }
}

/// Computes per-parameter client weights.
///
/// Each scalar parameter is normalized independently across clients (negative importances count
/// as zero). Parameters without any importance mass fall back to `1/K`. The result is blended with
/// the client weights by `gamma`: `(1 - gamma) * importance + gamma * client`.
pub fn parameter_weights(
    omegas: &[ArrayView1<f32>],
    client_weights: &ClientWeights,
    gamma: f64,
) -> Vec<Array1<f64>> {
    let k = omegas.len();
    let len = omegas.first().map(|o| o.len()).unwrap_or(0);
    let mut totals = Array1::<f64>::zeros(len);
    for omega in omegas {
        totals.zip_mut_with(omega, |t, &o| *t += f64::from(o.max(0.)));
    }

    omegas
        .iter()
        .zip(client_weights.iter())
        .map(|(omega, &cw)| {
            let mut weights = Array1::<f64>::zeros(len);
            ndarray::Zip::from(&mut weights)
                .and(omega)
                .and(&totals)
                .for_each(|w, &o, &total| {
                    let share = if total > 0. {
                        f64::from(o.max(0.)) / total
                    } else {
                        1. / k as f64
                    };
                    *w = (1. - gamma) * share + gamma * cw;
                });
            weights
        })
        .collect()
}

/// Computes per-layer client weights.
///
/// The importances of every client are summed within each layer range and normalized across
/// clients. A layer without any importance mass falls back to uniform `1/K` weights; otherwise the
/// importance shares are blended with the client weights by `gamma`.
///
/// Returns one set of client weights per layer range.
pub fn layer_weights(
    omegas: &[ArrayView1<f32>],
    layers: &[Range<usize>],
    client_weights: &ClientWeights,
    gamma: f64,
) -> Vec<ClientWeights> {
    layers
        .iter()
        .map(|range| {
            let mass: Vec<f64> = omegas
                .iter()
                .map(|omega| {
                    omega
                        .slice(ndarray::s![range.clone()])
                        .iter()
                        .map(|&o| f64::from(o.max(0.)))
                        .sum()
                })
                .collect();
            if mass.iter().sum::<f64>() > 0. {
                ClientWeights::normalize(&mass).blend(client_weights, gamma)
            } else {
                debug!("no gradient importance in layer {:?}: uniform weights", range);
                ClientWeights::uniform(omegas.len())
            }
        })
        .collect()
}
