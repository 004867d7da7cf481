//! Weighted averaging of arrays.

use ndarray::{Array, ArrayView, Dimension, Zip};

use crate::aggregation::AggregationError;

#[derive(Debug, Clone)]
/// An aggregator computing `Σ w_i x_i / Σ w_i` over arrays of a common shape.
///
/// The sum is kept in `f64` regardless of the `f32` training dtype.
pub struct WeightedAverage<D: Dimension> {
    sum: Option<Array<f64, D>>,
    total_weight: f64,
    nb_objects: usize,
}

impl<D: Dimension> Default for WeightedAverage<D> {
    fn default() -> Self {
        Self {
            sum: None,
            total_weight: 0.,
            nb_objects: 0,
        }
    }
}

impl<D: Dimension> WeightedAverage<D> {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of aggregated objects.
    pub fn len(&self) -> usize {
        self.nb_objects
    }

    /// Whether nothing has been aggregated yet.
    pub fn is_empty(&self) -> bool {
        self.nb_objects == 0
    }

    /// Validates if aggregation of the aggregated arrays with the given `object` may be safely
    /// performed.
    ///
    /// # Errors
    /// Fails if the weight is negative or not finite, if the shape of the `object` differs from the
    /// shape of the previously aggregated arrays, or if the `object` contains non-finite values.
    pub fn validate_aggregation(
        &self,
        weight: f64,
        object: &ArrayView<f32, D>,
    ) -> Result<(), AggregationError> {
        if !weight.is_finite() || weight < 0. {
            return Err(AggregationError::InvalidWeight(weight));
        }
        if let Some(sum) = &self.sum {
            if sum.shape() != object.shape() {
                return Err(AggregationError::ShapeMismatch {
                    expected: sum.shape().to_vec(),
                    actual: object.shape().to_vec(),
                });
            }
        }
        if object.iter().any(|x| !x.is_finite()) {
            return Err(AggregationError::InvalidObject);
        }
        Ok(())
    }

    /// Aggregates the given `object` with the given `weight`.
    ///
    /// It should be checked that [`validate_aggregation()`] succeeds before calling this, since
    /// aggregation may panic on mismatching shapes otherwise.
    ///
    /// [`validate_aggregation()`]: WeightedAverage::validate_aggregation
    pub fn aggregate(&mut self, weight: f64, object: ArrayView<f32, D>) {
        match self.sum.as_mut() {
            Some(sum) => Zip::from(sum)
                .and(&object)
                .for_each(|s, &x| *s += weight * f64::from(x)),
            None => self.sum = Some(object.mapv(|x| weight * f64::from(x))),
        }
        self.total_weight += weight;
        self.nb_objects += 1;
    }

    /// Validates and aggregates the given `object`.
    ///
    /// # Errors
    /// Fails if the validation fails, see [`validate_aggregation()`].
    ///
    /// [`validate_aggregation()`]: WeightedAverage::validate_aggregation
    pub fn try_aggregate(
        &mut self,
        weight: f64,
        object: ArrayView<f32, D>,
    ) -> Result<(), AggregationError> {
        self.validate_aggregation(weight, &object)?;
        self.aggregate(weight, object);
        Ok(())
    }

    /// Computes the weighted average.
    ///
    /// Returns `None` if nothing was aggregated or if the aggregated weights carry no mass.
    pub fn average(&self) -> Option<Array<f32, D>> {
        match &self.sum {
            Some(sum) if self.total_weight > 0. => {
                let total = self.total_weight;
                Some(sum.mapv(|s| (s / total) as f32))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ElementwiseSums<D: Dimension> {
    weighted: Array<f64, D>,
    weights: Array<f64, D>,
    plain: Array<f64, D>,
}

#[derive(Debug, Clone)]
/// An aggregator computing `Σ w_i ⊙ x_i / Σ w_i` with elementwise weights.
///
/// Elements whose accumulated weight vanishes fall back to the unweighted mean of the aggregated
/// arrays.
pub struct ElementwiseAverage<D: Dimension> {
    sums: Option<ElementwiseSums<D>>,
    nb_objects: usize,
}

impl<D: Dimension> Default for ElementwiseAverage<D> {
    fn default() -> Self {
        Self {
            sums: None,
            nb_objects: 0,
        }
    }
}

impl<D: Dimension> ElementwiseAverage<D> {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of aggregated objects.
    pub fn len(&self) -> usize {
        self.nb_objects
    }

    /// Whether nothing has been aggregated yet.
    pub fn is_empty(&self) -> bool {
        self.nb_objects == 0
    }

    /// Validates if aggregation of the aggregated arrays with the given `object` may be safely
    /// performed.
    ///
    /// # Errors
    /// Fails if the shapes of the `weights` and the `object` differ from each other or from the
    /// previously aggregated arrays, or if any weight is negative or not finite, or if the `object`
    /// contains non-finite values.
    pub fn validate_aggregation(
        &self,
        weights: &ArrayView<f64, D>,
        object: &ArrayView<f32, D>,
    ) -> Result<(), AggregationError> {
        if weights.shape() != object.shape() {
            return Err(AggregationError::ShapeMismatch {
                expected: object.shape().to_vec(),
                actual: weights.shape().to_vec(),
            });
        }
        if let Some(sums) = &self.sums {
            if sums.plain.shape() != object.shape() {
                return Err(AggregationError::ShapeMismatch {
                    expected: sums.plain.shape().to_vec(),
                    actual: object.shape().to_vec(),
                });
            }
        }
        if let Some(&w) = weights.iter().find(|w| !w.is_finite() || **w < 0.) {
            return Err(AggregationError::InvalidWeight(w));
        }
        if object.iter().any(|x| !x.is_finite()) {
            return Err(AggregationError::InvalidObject);
        }
        Ok(())
    }

    /// Aggregates the given `object` with the given elementwise `weights`.
    ///
    /// It should be checked that [`validate_aggregation()`] succeeds before calling this.
    ///
    /// [`validate_aggregation()`]: ElementwiseAverage::validate_aggregation
    pub fn aggregate(&mut self, weights: ArrayView<f64, D>, object: ArrayView<f32, D>) {
        let object = object.mapv(f64::from);
        let weighted = Zip::from(&object)
            .and(&weights)
            .map_collect(|&x, &w| x * w);
        match self.sums.as_mut() {
            Some(sums) => {
                sums.weighted += &weighted;
                sums.weights += &weights;
                sums.plain += &object;
            }
            None => {
                self.sums = Some(ElementwiseSums {
                    weighted,
                    weights: weights.to_owned(),
                    plain: object,
                })
            }
        }
        self.nb_objects += 1;
    }

    /// Validates and aggregates the given `object`.
    ///
    /// # Errors
    /// Fails if the validation fails, see [`validate_aggregation()`].
    ///
    /// [`validate_aggregation()`]: ElementwiseAverage::validate_aggregation
    pub fn try_aggregate(
        &mut self,
        weights: ArrayView<f64, D>,
        object: ArrayView<f32, D>,
    ) -> Result<(), AggregationError> {
        self.validate_aggregation(&weights, &object)?;
        self.aggregate(weights, object);
        Ok(())
    }

    /// Computes the elementwise weighted average.
    ///
    /// Returns `None` if nothing was aggregated.
    pub fn average(&self) -> Option<Array<f32, D>> {
        let sums = self.sums.as_ref()?;
        let count = self.nb_objects as f64;
        let mut average = Array::<f32, D>::zeros(sums.plain.raw_dim());
        Zip::from(&mut average)
            .and(&sums.weighted)
            .and(&sums.weights)
            .and(&sums.plain)
            .for_each(|a, &s, &w, &p| {
                let mean = if w > 0. { s / w } else { p / count };
                *a = mean as f32;
            });
        Some(average)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1};

    use super::*;

    #[test]
    fn test_weighted_average() {
        let mut avg = WeightedAverage::new();
        avg.try_aggregate(0.8, array![1_f32, 1.].view()).unwrap();
        avg.try_aggregate(0.2, array![0_f32, 0.].view()).unwrap();
        let merged = avg.average().unwrap();
        assert!((merged[0] - 0.8).abs() < 1e-7);
        assert!((merged[1] - 0.8).abs() < 1e-7);
        assert_eq!(avg.len(), 2);
    }

    #[test]
    fn test_weighted_average_single_client_is_identity() {
        let params = array![0.1_f32, -3.25, 7e-5, 1e6];
        let mut avg = WeightedAverage::new();
        avg.try_aggregate(1., params.view()).unwrap();
        assert_eq!(avg.average().unwrap(), params);
    }

    #[test]
    fn test_weighted_average_without_mass() {
        let mut avg = WeightedAverage::new();
        assert!(avg.average().is_none());
        avg.try_aggregate(0., array![1_f32].view()).unwrap();
        assert!(avg.average().is_none());
    }

    #[test]
    fn test_weighted_average_validation() {
        let mut avg = WeightedAverage::new();
        avg.try_aggregate(1., array![1_f32, 2.].view()).unwrap();
        assert!(matches!(
            avg.validate_aggregation(1., &array![1_f32].view()),
            Err(AggregationError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            avg.validate_aggregation(-1., &array![1_f32, 2.].view()),
            Err(AggregationError::InvalidWeight(_))
        ));
        assert!(matches!(
            avg.validate_aggregation(1., &array![f32::NAN, 2.].view()),
            Err(AggregationError::InvalidObject)
        ));
    }

    #[test]
    fn test_elementwise_average() {
        let mut avg = ElementwiseAverage::new();
        avg.try_aggregate(array![3., 0.].view(), array![1_f32, 4.].view())
            .unwrap();
        avg.try_aggregate(array![1., 0.].view(), array![5_f32, 2.].view())
            .unwrap();
        // the second element has no weight at all and falls back to the plain mean
        assert_eq!(avg.average().unwrap(), array![2_f32, 3.]);
    }

    #[test]
    fn test_elementwise_average_empty() {
        let avg = ElementwiseAverage::<ndarray::Ix1>::new();
        assert!(avg.average().is_none());
        let mut avg = ElementwiseAverage::new();
        assert!(avg
            .try_aggregate(Array1::zeros(2).view(), array![1_f32].view())
            .is_err());
    }
}
