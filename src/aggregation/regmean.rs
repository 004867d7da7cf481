//! Closed-form regression merging of linear layers.
//!
//! For a linear layer with client weights `W_i` and input Gram matrices `G_i`, the merged weight
//! minimizes the summed regression error over all clients' inputs:
//!
//! ```text
//! W = (Σ W_i G_i) (Σ G_i)⁻¹
//! ```

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    aggregation::AggregationError,
    linalg::{self, LinalgError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How the accumulated Gram matrix is inverted.
pub enum InversePolicy {
    /// An exact inverse, falling back to the pseudo-inverse if the matrix is singular.
    Inverse,
    /// Always the pseudo-inverse.
    PseudoInverse,
}

impl Default for InversePolicy {
    fn default() -> Self {
        InversePolicy::PseudoInverse
    }
}

/// Inverts a symmetric positive semi-definite matrix according to the policy.
///
/// # Errors
/// Fails if the matrix is not square or contains non-finite values.
pub fn invert(
    matrix: ArrayView2<f64>,
    policy: InversePolicy,
) -> Result<Array2<f64>, LinalgError> {
    match policy {
        InversePolicy::PseudoInverse => linalg::pinverse_symmetric(matrix),
        InversePolicy::Inverse => match linalg::inverse(matrix) {
            Err(LinalgError::Singular) => {
                debug!("singular gram matrix: using the pseudo-inverse");
                linalg::pinverse_symmetric(matrix)
            }
            result => result,
        },
    }
}

#[derive(Debug, Clone, Default)]
/// The regression merge accumulator of one linear layer.
pub struct RegMeanLayer {
    /// `Σ W_i G_i`
    weighted: Option<Array2<f64>>,
    /// `Σ G_i`
    gram: Option<Array2<f64>>,
    /// Whether a client without samples contributed, making the accumulated Gram rank deficient.
    rank_deficient: bool,
    nb_objects: usize,
}

impl RegMeanLayer {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of aggregated clients.
    pub fn len(&self) -> usize {
        self.nb_objects
    }

    /// Whether nothing has been aggregated yet.
    pub fn is_empty(&self) -> bool {
        self.nb_objects == 0
    }

    /// Validates if the weight and Gram matrix of a client may be aggregated.
    ///
    /// # Errors
    /// Fails if the Gram matrix is not square, if its dimension differs from the number of input
    /// features of the weight, if the shapes differ from previously aggregated clients, or if any
    /// value is non-finite.
    pub fn validate_aggregation(
        &self,
        weight: &ArrayView2<f32>,
        gram: &ArrayView2<f64>,
    ) -> Result<(), AggregationError> {
        let (rows, cols) = gram.dim();
        if rows != cols || cols != weight.ncols() {
            return Err(AggregationError::ShapeMismatch {
                expected: vec![weight.ncols(), weight.ncols()],
                actual: vec![rows, cols],
            });
        }
        if let Some(weighted) = &self.weighted {
            if weighted.dim() != weight.dim() {
                return Err(AggregationError::ShapeMismatch {
                    expected: weighted.shape().to_vec(),
                    actual: weight.shape().to_vec(),
                });
            }
        }
        if weight.iter().any(|x| !x.is_finite()) || gram.iter().any(|x| !x.is_finite()) {
            return Err(AggregationError::InvalidObject);
        }
        Ok(())
    }

    /// Aggregates the weight and Gram matrix of a client holding `num_samples` samples.
    ///
    /// It should be checked that [`validate_aggregation()`] succeeds before calling this.
    ///
    /// [`validate_aggregation()`]: RegMeanLayer::validate_aggregation
    pub fn aggregate(&mut self, weight: ArrayView2<f32>, gram: ArrayView2<f64>, num_samples: usize) {
        let product = weight.mapv(f64::from).dot(&gram);
        match (self.weighted.as_mut(), self.gram.as_mut()) {
            (Some(weighted), Some(total)) => {
                *weighted += &product;
                *total += &gram;
            }
            _ => {
                self.weighted = Some(product);
                self.gram = Some(gram.to_owned());
            }
        }
        self.rank_deficient |= num_samples == 0;
        self.nb_objects += 1;
    }

    /// Validates and aggregates the weight and Gram matrix of a client.
    ///
    /// # Errors
    /// Fails if the validation fails, see [`validate_aggregation()`].
    ///
    /// [`validate_aggregation()`]: RegMeanLayer::validate_aggregation
    pub fn try_aggregate(
        &mut self,
        weight: ArrayView2<f32>,
        gram: ArrayView2<f64>,
        num_samples: usize,
    ) -> Result<(), AggregationError> {
        self.validate_aggregation(&weight, &gram)?;
        self.aggregate(weight, gram, num_samples);
        Ok(())
    }

    /// The accumulated Gram matrix `Σ G_i`, if anything was aggregated.
    pub fn gram(&self) -> Option<&Array2<f64>> {
        self.gram.as_ref()
    }

    /// The accumulated product `Σ W_i G_i`, if anything was aggregated.
    pub fn weighted(&self) -> Option<&Array2<f64>> {
        self.weighted.as_ref()
    }

    /// Solves the regression merge.
    ///
    /// The pseudo-inverse is used instead of the configured policy when a client without samples
    /// contributed. If nothing was aggregated, if the accumulated Gram matrix is all zero, or if the
    /// solve fails or produces non-finite values, the `fallback` weight is returned instead.
    pub fn solve(&self, policy: InversePolicy, fallback: ArrayView2<f32>) -> Array2<f32> {
        match self.try_solve(policy) {
            Ok(Some(weight)) => weight,
            Ok(None) => {
                warn!("degenerate gram matrix: keeping the previous weight");
                fallback.to_owned()
            }
            Err(err) => {
                warn!("regression merge failed ({}): keeping the previous weight", err);
                fallback.to_owned()
            }
        }
    }

    fn try_solve(&self, policy: InversePolicy) -> Result<Option<Array2<f32>>, LinalgError> {
        let (weighted, gram) = match (&self.weighted, &self.gram) {
            (Some(weighted), Some(gram)) => (weighted, gram),
            _ => return Ok(None),
        };
        if gram.iter().all(|&x| x == 0.) {
            return Ok(None);
        }

        let policy = if self.rank_deficient {
            InversePolicy::PseudoInverse
        } else {
            policy
        };
        let inverse = invert(gram.view(), policy)?;
        let merged = weighted.dot(&inverse);
        if merged.iter().any(|x| !x.is_finite()) {
            return Ok(None);
        }
        Ok(Some(merged.mapv(|x| x as f32)))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_single_client_is_identity() {
        let weight = array![[1_f32, 2.], [3., 4.]];
        let gram = array![[2., 1.], [1., 3.]];
        let mut layer = RegMeanLayer::new();
        layer.try_aggregate(weight.view(), gram.view(), 10).unwrap();
        for policy in &[InversePolicy::Inverse, InversePolicy::PseudoInverse] {
            let merged = layer.solve(*policy, Array2::zeros((2, 2)).view());
            for (a, b) in merged.iter().zip(weight.iter()) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_identical_grams_average_weights() {
        let gram = array![[1., 0.], [0., 1.]];
        let mut layer = RegMeanLayer::new();
        layer
            .try_aggregate(array![[1_f32, 0.]].view(), gram.view(), 5)
            .unwrap();
        layer
            .try_aggregate(array![[0_f32, 1.]].view(), gram.view(), 5)
            .unwrap();
        let merged = layer.solve(InversePolicy::Inverse, array![[9_f32, 9.]].view());
        assert!((merged[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((merged[[0, 1]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_disjoint_features_take_the_owner() {
        // client 0 only ever sees feature 0, client 1 only feature 1
        let mut layer = RegMeanLayer::new();
        layer
            .try_aggregate(array![[1_f32, 7.]].view(), array![[4., 0.], [0., 0.]].view(), 4)
            .unwrap();
        layer
            .try_aggregate(array![[7_f32, 2.]].view(), array![[0., 0.], [0., 4.]].view(), 4)
            .unwrap();
        let merged = layer.solve(InversePolicy::Inverse, array![[0_f32, 0.]].view());
        assert!((merged[[0, 0]] - 1.).abs() < 1e-6);
        assert!((merged[[0, 1]] - 2.).abs() < 1e-6);
    }

    #[test]
    fn test_singular_gram_keeps_server_weight() {
        let server = array![[0.5_f32, -0.5], [1., 2.]];
        let mut layer = RegMeanLayer::new();
        for _ in 0..3 {
            layer
                .try_aggregate(array![[1_f32, 1.], [1., 1.]].view(), Array2::zeros((2, 2)).view(), 8)
                .unwrap();
        }
        for policy in &[InversePolicy::Inverse, InversePolicy::PseudoInverse] {
            let merged = layer.solve(*policy, server.view());
            assert_eq!(merged, server);
            assert!(merged.iter().all(|x| x.is_finite()));
        }
    }

    #[test]
    fn test_zero_weights_merge_to_zero() {
        let mut layer = RegMeanLayer::new();
        for _ in 0..2 {
            layer
                .try_aggregate(array![[0_f32, 0.]].view(), Array2::eye(2).view(), 5)
                .unwrap();
        }
        for policy in &[InversePolicy::Inverse, InversePolicy::PseudoInverse] {
            assert_eq!(
                layer.solve(*policy, array![[7_f32, 7.]].view()),
                array![[0_f32, 0.]]
            );
        }
    }

    #[test]
    fn test_rank_deficient_gram_uses_pseudo_inverse() {
        let mut layer = RegMeanLayer::new();
        layer
            .try_aggregate(array![[2_f32, 2.]].view(), array![[1., 1.], [1., 1.]].view(), 3)
            .unwrap();
        layer
            .try_aggregate(array![[5_f32, 5.]].view(), Array2::zeros((2, 2)).view(), 0)
            .unwrap();
        let merged = layer.solve(InversePolicy::Inverse, array![[0_f32, 0.]].view());
        assert!(merged.iter().all(|x| x.is_finite()));
        // the minimum norm solution reproduces the only informative client on its inputs
        assert!((merged[[0, 0]] + merged[[0, 1]] - 4.).abs() < 1e-5);
    }

    #[test]
    fn test_empty_layer_keeps_fallback() {
        let fallback = array![[3_f32]];
        assert_eq!(
            RegMeanLayer::new().solve(InversePolicy::Inverse, fallback.view()),
            fallback
        );
    }

    #[test]
    fn test_validation() {
        let layer = RegMeanLayer::new();
        assert!(matches!(
            layer.validate_aggregation(&array![[1_f32, 2.]].view(), &array![[1.]].view()),
            Err(AggregationError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            layer.validate_aggregation(&array![[f32::NAN]].view(), &array![[1.]].view()),
            Err(AggregationError::InvalidObject)
        ));
    }
}
