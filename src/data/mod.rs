//! The supplier of per-client task data.

pub mod synthetic;

use std::{collections::BTreeMap, sync::Arc};

use ndarray::{Array2, Axis};
use rand::{seq::SliceRandom, Rng};

pub use self::synthetic::SyntheticBenchmark;

#[derive(Debug, Clone, PartialEq, Default)]
/// A labeled set of input rows.
pub struct ClientDataset {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
}

impl ClientDataset {
    /// Creates a dataset.
    ///
    /// # Panics
    /// Panics if the number of rows and labels differ.
    pub fn new(inputs: Array2<f32>, labels: Vec<usize>) -> Self {
        assert_eq!(inputs.nrows(), labels.len(), "one label per row required");
        Self { inputs, labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Counts the samples of every class present in the dataset.
    pub fn class_counts(&self) -> BTreeMap<usize, usize> {
        let mut counts = BTreeMap::new();
        for &label in &self.labels {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
    }

    /// Splits the dataset into minibatches, shuffled if a random generator is given.
    pub fn batches<R: Rng>(
        &self,
        batch_size: usize,
        rng: Option<&mut R>,
    ) -> Vec<(Array2<f32>, Vec<usize>)> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size.max(1))
            .map(|idx| {
                (
                    self.inputs.select(Axis(0), idx),
                    idx.iter().map(|&i| self.labels[i]).collect(),
                )
            })
            .collect()
    }

    /// Draws a random subset holding `ceil(fraction * len)` rows.
    pub fn subset<R: Rng>(&self, fraction: f64, rng: &mut R) -> ClientDataset {
        let len = ((fraction.max(0.).min(1.) * self.len() as f64).ceil() as usize).min(self.len());
        if len == self.len() {
            return self.clone();
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order.truncate(len);
        order.sort_unstable();
        ClientDataset {
            inputs: self.inputs.select(Axis(0), &order),
            labels: order.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
/// A class-incremental benchmark split among a fixed number of clients.
pub trait DataSource: Send + Sync {
    /// The number of tasks of the curriculum.
    fn num_tasks(&self) -> usize;

    /// The number of new classes introduced by a task.
    fn classes_in_task(&self, task: usize) -> usize;

    /// The dimension of the input rows.
    fn input_dim(&self) -> usize;

    /// The number of clients the training data is partitioned among.
    fn num_clients(&self) -> usize;

    /// The private training partition of a client for a task.
    fn train_set(&self, task: usize, client: usize) -> Arc<ClientDataset>;

    /// The shared test set of a task.
    fn test_set(&self, task: usize) -> Arc<ClientDataset>;
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn dataset() -> ClientDataset {
        ClientDataset::new(
            array![[0.], [1.], [2.], [3.], [4.]],
            vec![3, 4, 3, 3, 5],
        )
    }

    #[test]
    fn test_class_counts() {
        let counts = dataset().class_counts();
        assert_eq!(counts.into_iter().collect::<Vec<_>>(), vec![(3, 3), (4, 1), (5, 1)]);
    }

    #[test]
    fn test_batches_cover_the_dataset() {
        let data = dataset();
        let ordered = data.batches::<ChaCha20Rng>(2, None);
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].1, vec![3, 4]);
        assert_eq!(ordered[2].0, array![[4.]]);

        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let shuffled = data.batches(2, Some(&mut rng));
        let mut rows: Vec<f32> = shuffled
            .iter()
            .flat_map(|(x, _)| x.iter().copied().collect::<Vec<_>>())
            .collect();
        rows.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(rows, vec![0., 1., 2., 3., 4.]);
        for (x, y) in shuffled {
            for (row, label) in x.iter().zip(y) {
                assert_eq!(data.labels[*row as usize], label);
            }
        }
    }

    #[test]
    fn test_subset() {
        let data = dataset();
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let half = data.subset(0.5, &mut rng);
        assert_eq!(half.len(), 3);
        for (row, label) in half.inputs.iter().zip(&half.labels) {
            assert_eq!(data.labels[*row as usize], *label);
        }
        assert_eq!(data.subset(1., &mut rng), data);
    }
}
