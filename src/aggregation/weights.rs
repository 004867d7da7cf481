//! Client weighting schemes.
//!
//! Every scheme returns weights that sum to one whenever there is at least one client. When the
//! primary signal (sample count, entropy) carries no mass at all the weights fall back to the
//! uniform `1/K` instead of dividing by zero.

use std::collections::BTreeMap;

use derive_more::{Deref, From, Index, Into};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The constant added to every entropy when all of them vanish.
const ENTROPY_FLOOR: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The base weighting of client contributions.
pub enum Weighting {
    /// `n_i / Σ n_j`.
    Samples,
    /// `1/K` among the clients holding at least one sample.
    Uniform,
}

impl Default for Weighting {
    fn default() -> Self {
        Weighting::Samples
    }
}

#[derive(Debug, Clone, PartialEq, From, Into, Index, Deref)]
/// Normalized per-client weights.
pub struct ClientWeights(Vec<f64>);

impl ClientWeights {
    /// Creates uniform weights over `k` clients.
    pub fn uniform(k: usize) -> Self {
        ClientWeights(vec![1. / k as f64; k])
    }

    /// Normalizes raw non-negative scores, falling back to uniform weights if they carry no mass.
    pub fn normalize(raw: &[f64]) -> Self {
        match normalize(raw) {
            Some(weights) => ClientWeights(weights),
            None => {
                debug!("no weighting mass: falling back to uniform weights");
                Self::uniform(raw.len())
            }
        }
    }

    /// Computes the weights of the given per-client sample counts.
    pub fn from_samples(counts: &[usize], weighting: Weighting) -> Self {
        let raw: Vec<f64> = match weighting {
            Weighting::Samples => counts.iter().map(|&n| n as f64).collect(),
            Weighting::Uniform => counts
                .iter()
                .map(|&n| if n > 0 { 1. } else { 0. })
                .collect(),
        };
        Self::normalize(&raw)
    }

    /// Blends these weights with other weights: `(1 - beta) * self + beta * other`.
    ///
    /// # Panics
    /// Panics if the number of clients differ.
    pub fn blend(&self, other: &ClientWeights, beta: f64) -> Self {
        assert_eq!(self.0.len(), other.0.len(), "client count mismatch");
        let beta = num::clamp(beta, 0., 1.);
        ClientWeights(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| (1. - beta) * a + beta * b)
                .collect(),
        )
    }

    /// Gets the weights as a slice.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Normalizes non-negative scores to sum to one.
///
/// Returns `None` if the scores are empty, don't carry any mass, or aren't finite.
pub fn normalize(raw: &[f64]) -> Option<Vec<f64>> {
    let total: f64 = raw.iter().sum();
    if raw.is_empty() || !total.is_finite() || total <= 0. {
        return None;
    }
    Some(raw.iter().map(|x| x / total).collect())
}

/// Computes the base-2 Shannon entropy of a label histogram.
pub fn entropy(histogram: &BTreeMap<usize, usize>) -> f64 {
    let total: usize = histogram.values().sum();
    if total == 0 {
        return 0.;
    }
    histogram
        .values()
        .filter(|&&n| n > 0)
        .map(|&n| {
            let p = n as f64 / total as f64;
            -p * p.log2()
        })
        .sum()
}

/// Computes client weights proportional to the entropy of their label distributions.
///
/// If all entropies vanish, a small constant is added to each before normalizing.
pub fn entropy_weights(histograms: &[&BTreeMap<usize, usize>]) -> ClientWeights {
    let mut entropies: Vec<f64> = histograms.iter().map(|h| entropy(h)).collect();
    if entropies.iter().sum::<f64>() == 0. {
        entropies.iter_mut().for_each(|e| *e += ENTROPY_FLOOR);
    }
    ClientWeights::normalize(&entropies)
}

#[derive(Debug, Clone, PartialEq)]
/// Per-class client weights, `weights[[class, client]]`.
pub struct ClassWeights {
    pub weights: Array2<f64>,
    /// Whether any client holds samples of the class.
    pub covered: Vec<bool>,
}

/// Computes per-class client weights.
///
/// For every class the sample share and the feature variance share of each client are blended as
/// `alpha * samples + (1 - alpha) * variance`. If one of the two signals carries no mass for a
/// class, the other one is used alone; if neither does, the class is marked as uncovered and its
/// weights are zero.
///
/// `counts[i][c]` and `variances[i][c]` are the sample count and variance mass of client `i` for
/// class `c`.
pub fn class_weights(
    counts: &[Vec<f64>],
    variances: &[Vec<f64>],
    num_classes: usize,
    alpha: f64,
) -> ClassWeights {
    let clients = counts.len();
    let mut weights = Array2::zeros((num_classes, clients));
    let mut covered = vec![false; num_classes];

    let column = |table: &[Vec<f64>], class: usize| -> Vec<f64> {
        table
            .iter()
            .map(|row| row.get(class).copied().unwrap_or(0.).max(0.))
            .collect()
    };

    for class in 0..num_classes {
        let samples = normalize(&column(counts, class));
        let variance = normalize(&column(variances, class));
        let blended = match (samples, variance) {
            (Some(s), Some(v)) => s
                .iter()
                .zip(v.iter())
                .map(|(s, v)| alpha * s + (1. - alpha) * v)
                .collect(),
            (Some(s), None) => s,
            (None, Some(v)) => v,
            (None, None) => continue,
        };
        covered[class] = true;
        for (client, w) in blended.into_iter().enumerate() {
            weights[[class, client]] = w;
        }
    }

    ClassWeights { weights, covered }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sums_to_one(weights: &ClientWeights) {
        assert!((weights.iter().sum::<f64>() - 1.).abs() < 1e-12);
    }

    #[test]
    fn test_sample_weights() {
        let weights = ClientWeights::from_samples(&[80, 20], Weighting::Samples);
        assert_eq!(weights, ClientWeights::from(vec![0.8, 0.2]));
        assert_sums_to_one(&weights);
    }

    #[test]
    fn test_sample_weights_with_empty_client() {
        let weights = ClientWeights::from_samples(&[30, 0, 10], Weighting::Samples);
        assert_eq!(weights, ClientWeights::from(vec![0.75, 0., 0.25]));

        let weights = ClientWeights::from_samples(&[30, 0, 10], Weighting::Uniform);
        assert_eq!(weights, ClientWeights::from(vec![0.5, 0., 0.5]));
    }

    #[test]
    fn test_all_empty_clients_fall_back_to_uniform() {
        for weighting in &[Weighting::Samples, Weighting::Uniform] {
            let weights = ClientWeights::from_samples(&[0, 0, 0, 0], *weighting);
            assert_eq!(weights, ClientWeights::uniform(4));
            assert_sums_to_one(&weights);
        }
    }

    #[test]
    fn test_entropy() {
        let uniform: BTreeMap<_, _> = vec![(0, 5), (1, 5)].into_iter().collect();
        assert!((entropy(&uniform) - 1.).abs() < 1e-12);
        let single: BTreeMap<_, _> = vec![(3, 7)].into_iter().collect();
        assert_eq!(entropy(&single), 0.);
        assert_eq!(entropy(&BTreeMap::new()), 0.);
    }

    #[test]
    fn test_entropy_weights() {
        let a: BTreeMap<_, _> = vec![(0, 5), (1, 5)].into_iter().collect();
        let b: BTreeMap<_, _> = vec![(0, 1), (1, 1), (2, 1), (3, 1)].into_iter().collect();
        let weights = entropy_weights(&[&a, &b]);
        assert!((weights[0] - 1. / 3.).abs() < 1e-12);
        assert!((weights[1] - 2. / 3.).abs() < 1e-12);
    }

    #[test]
    fn test_entropy_weights_fallback() {
        let a: BTreeMap<usize, usize> = vec![(0, 0), (1, 0)].into_iter().collect();
        let b: BTreeMap<usize, usize> = vec![(0, 0), (1, 0)].into_iter().collect();
        let weights = entropy_weights(&[&a, &b]);
        assert_eq!(weights, ClientWeights::from(vec![0.5, 0.5]));
    }

    #[test]
    fn test_blend() {
        let a = ClientWeights::from(vec![1., 0.]);
        let b = ClientWeights::from(vec![0., 1.]);
        assert_eq!(a.blend(&b, 0.25), ClientWeights::from(vec![0.75, 0.25]));
        assert_eq!(a.blend(&b, 2.), b);
        assert_sums_to_one(&a.blend(&b, 0.3));
    }

    #[test]
    fn test_class_weights_disjoint_clients() {
        let counts = vec![vec![10., 0.], vec![0., 10.]];
        let variances = vec![vec![2., 0.], vec![0., 3.]];
        let weights = class_weights(&counts, &variances, 3, 0.5);
        assert_eq!(weights.covered, vec![true, true, false]);
        assert_eq!(weights.weights.row(0).to_vec(), vec![1., 0.]);
        assert_eq!(weights.weights.row(1).to_vec(), vec![0., 1.]);
        assert_eq!(weights.weights.row(2).to_vec(), vec![0., 0.]);
    }

    #[test]
    fn test_class_weights_blend_and_single_signal() {
        let counts = vec![vec![30., 5.], vec![10., 5.]];
        let variances = vec![vec![1., 0.], vec![1., 0.]];
        let weights = class_weights(&counts, &variances, 2, 0.5);
        assert!((weights.weights[[0, 0]] - (0.5 * 0.75 + 0.5 * 0.5)).abs() < 1e-12);
        assert!((weights.weights[[0, 1]] - (0.5 * 0.25 + 0.5 * 0.5)).abs() < 1e-12);
        // no variance mass for class 1: samples only
        assert_eq!(weights.weights.row(1).to_vec(), vec![0.5, 0.5]);
    }
}
