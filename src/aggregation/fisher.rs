//! Fisher-weighted merging and cross-task Fisher consolidation.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Ix2};
use serde::{Deserialize, Serialize};

use crate::aggregation::{average::ElementwiseAverage, AggregationError};

#[derive(Debug, Clone)]
/// An aggregator computing `Σ (F_i + eps) ⊙ X_i / Σ (F_i + eps)`.
pub struct FisherAverage {
    eps: f64,
    inner: ElementwiseAverage<Ix2>,
}

impl FisherAverage {
    /// Creates an empty aggregator with the given smoothing.
    pub fn new(eps: f64) -> Self {
        Self {
            eps,
            inner: ElementwiseAverage::new(),
        }
    }

    /// Validates and aggregates a client tensor with its diagonal Fisher estimate.
    ///
    /// # Errors
    /// Fails if the shapes differ or if any value is negative or not finite.
    pub fn try_aggregate(
        &mut self,
        object: ArrayView2<f32>,
        fisher: ArrayView2<f64>,
    ) -> Result<(), AggregationError> {
        let eps = self.eps;
        let weights = fisher.mapv(|f| f + eps);
        self.inner.try_aggregate(weights.view(), object)
    }

    /// Computes the Fisher-weighted average, if anything was aggregated.
    pub fn average(&self) -> Option<Array2<f32>> {
        self.inner.average()
    }
}

/// Sums a diagonal Fisher estimate of a matrix with `out` rows into one importance per output row.
pub fn row_mass(fisher: ArrayView2<f64>) -> Array1<f64> {
    fisher.sum_axis(Axis(1))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// The accumulated Fisher mass of all consolidated tasks, per layer and output row.
pub struct FisherConsolidation {
    mass: BTreeMap<String, Array1<f64>>,
}

impl FisherConsolidation {
    /// Creates an empty consolidation.
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulated mass of a layer.
    pub fn mass(&self, layer: &str) -> Option<&Array1<f64>> {
        self.mass.get(layer)
    }

    /// Folds the delta of a completed task into the frozen delta of a layer.
    ///
    /// Every output row is merged as `(M ⊙ old + f ⊙ new) / (M + f)` where `M` is the mass of all
    /// previously consolidated tasks and `f` the mass of the completed one, smoothed by `eps`. Rows
    /// without any previous mass take the new delta.
    /// The mass of the completed task is then added to the running total, so that important rows of
    /// earlier tasks are not overwritten by later, less confident ones.
    pub fn fold(
        &mut self,
        layer: &str,
        old: &mut Array2<f32>,
        new: ArrayView2<f32>,
        new_mass: ArrayView1<f64>,
        eps: f64,
    ) {
        let rows = old.nrows();
        let accumulated = self
            .mass
            .entry(layer.to_string())
            .or_insert_with(|| Array1::zeros(rows));

        for (row, (mut old_row, new_row)) in old
            .axis_iter_mut(Axis(0))
            .zip(new.axis_iter(Axis(0)))
            .enumerate()
        {
            let m = accumulated[row];
            let f = new_mass.get(row).copied().unwrap_or(0.).max(0.) + eps;
            let total = m + f;
            if total <= 0. {
                continue;
            }
            let (w_old, w_new) = ((m / total) as f32, (f / total) as f32);
            old_row.zip_mut_with(&new_row, |o, &n| *o = w_old * *o + w_new * n);
        }
        accumulated.zip_mut_with(&new_mass, |m, &f| *m += f.max(0.));
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_fisher_average_prefers_confident_client() {
        let mut avg = FisherAverage::new(1e-8);
        avg.try_aggregate(array![[1_f32, 1.]].view(), array![[3., 0.]].view())
            .unwrap();
        avg.try_aggregate(array![[5_f32, 3.]].view(), array![[1., 0.]].view())
            .unwrap();
        let merged = avg.average().unwrap();
        assert!((merged[[0, 0]] - 2.).abs() < 1e-5);
        // zero Fisher everywhere: the smoothing yields the plain mean
        assert!((merged[[0, 1]] - 2.).abs() < 1e-5);
    }

    #[test]
    fn test_row_mass() {
        assert_eq!(
            row_mass(array![[1., 2.], [0., 0.5]].view()),
            array![3., 0.5]
        );
    }

    #[test]
    fn test_fold_first_task_takes_new_delta() {
        let mut consolidation = FisherConsolidation::new();
        let mut old = Array2::zeros((2, 2));
        consolidation.fold(
            "head",
            &mut old,
            array![[1_f32, 2.], [3., 4.]].view(),
            array![1., 2.].view(),
            1e-8,
        );
        for (a, b) in old.iter().zip(&[1_f32, 2., 3., 4.]) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(consolidation.mass("head"), Some(&array![1., 2.]));
    }

    #[test]
    fn test_fold_weights_by_mass() {
        let mut consolidation = FisherConsolidation::new();
        let mut old = array![[0_f32], [0.]];
        consolidation.fold("l", &mut old, array![[4_f32], [4.]].view(), array![3., 1.].view(), 0.);
        consolidation.fold("l", &mut old, array![[0_f32], [0.]].view(), array![1., 3.].view(), 0.);
        // row 0: mass 3 for 4, mass 1 for 0
        assert!((old[[0, 0]] - 3.).abs() < 1e-6);
        // row 1: mass 1 for 4, mass 3 for 0
        assert!((old[[1, 0]] - 1.).abs() < 1e-6);
        assert_eq!(consolidation.mass("l"), Some(&array![4., 4.]));
    }
}
