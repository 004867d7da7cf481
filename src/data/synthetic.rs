//! A synthetic class-incremental benchmark of Gaussian blobs.
//!
//! Every class is an isotropic Gaussian around a random center. The training samples of a class
//! are split among the clients with proportions drawn from a symmetric Dirichlet distribution, so
//! a small concentration yields strongly skewed, non-iid partitions.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Dirichlet, Distribution, StandardNormal};
use tracing::debug;

use crate::{
    data::{ClientDataset, DataSource},
    settings::DataSettings,
};

/// The spread of the class centers.
const CENTER_SCALE: f32 = 2.;

#[derive(Debug, Clone)]
/// A class-incremental Gaussian blob benchmark.
pub struct SyntheticBenchmark {
    input_dim: usize,
    classes_per_task: usize,
    /// `train[task][client]`
    train: Vec<Vec<Arc<ClientDataset>>>,
    test: Vec<Arc<ClientDataset>>,
}

impl SyntheticBenchmark {
    /// Generates the benchmark for the given number of clients.
    pub fn new(settings: &DataSettings, clients: usize) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(settings.seed);
        let noise = settings.noise.abs();

        let mut train: Vec<Vec<Arc<ClientDataset>>> = Vec::with_capacity(settings.tasks);
        let mut test = Vec::with_capacity(settings.tasks);
        for task in 0..settings.tasks {
            let mut client_rows: Vec<(Vec<f32>, Vec<usize>)> =
                vec![(Vec::new(), Vec::new()); clients];
            let mut test_rows = (Vec::new(), Vec::new());
            for local in 0..settings.classes_per_task {
                let class = task * settings.classes_per_task + local;
                let center: Array1<f32> = (0..settings.input_dim)
                    .map(|_| CENTER_SCALE * rng.sample::<f32, _>(StandardNormal))
                    .collect();

                let shares = partition(
                    settings.train_samples_per_class,
                    clients,
                    settings.dirichlet_alpha,
                    &mut rng,
                );
                for (client, &count) in shares.iter().enumerate() {
                    for _ in 0..count {
                        let (rows, labels) = &mut client_rows[client];
                        rows.extend(sample_around(&center, noise, &mut rng));
                        labels.push(class);
                    }
                }
                for _ in 0..settings.test_samples_per_class {
                    test_rows.0.extend(sample_around(&center, noise, &mut rng));
                    test_rows.1.push(class);
                }
            }

            train.push(
                client_rows
                    .into_iter()
                    .map(|(rows, labels)| Arc::new(to_dataset(rows, labels, settings.input_dim)))
                    .collect(),
            );
            test.push(Arc::new(to_dataset(test_rows.0, test_rows.1, settings.input_dim)));
            debug!(
                "task {}: client partition sizes {:?}",
                task,
                train[task].iter().map(|d: &Arc<ClientDataset>| d.len()).collect::<Vec<_>>()
            );
        }

        Self {
            input_dim: settings.input_dim,
            classes_per_task: settings.classes_per_task,
            train,
            test,
        }
    }
}

fn sample_around(center: &Array1<f32>, noise: f32, rng: &mut ChaCha20Rng) -> Vec<f32> {
    center
        .iter()
        .map(|c| c + noise * rng.sample::<f32, _>(StandardNormal))
        .collect()
}

/// Splits `total` samples among `clients` with Dirichlet distributed proportions.
fn partition(total: usize, clients: usize, alpha: f64, rng: &mut ChaCha20Rng) -> Vec<usize> {
    if clients < 2 {
        return vec![total; clients];
    }
    let proportions = Dirichlet::new_with_size(alpha.max(f64::MIN_POSITIVE), clients)
        .map(|dirichlet| dirichlet.sample(rng))
        .unwrap_or_else(|_| vec![1. / clients as f64; clients]);

    // largest remainder rounding keeps the total exact
    let mut counts: Vec<usize> = proportions
        .iter()
        .map(|p| (p * total as f64).floor() as usize)
        .collect();
    let mut remainders: Vec<(usize, f64)> = proportions
        .iter()
        .enumerate()
        .map(|(i, p)| (i, p * total as f64 - counts[i] as f64))
        .collect();
    remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let missing = total.saturating_sub(counts.iter().sum::<usize>());
    for (i, _) in remainders.into_iter().take(missing) {
        counts[i] += 1;
    }
    counts
}

fn to_dataset(rows: Vec<f32>, labels: Vec<usize>, dim: usize) -> ClientDataset {
    let inputs = Array2::from_shape_vec((labels.len(), dim), rows)
        .unwrap_or_else(|_| Array2::zeros((0, dim)));
    ClientDataset::new(inputs, labels)
}

impl DataSource for SyntheticBenchmark {
    fn num_tasks(&self) -> usize {
        self.train.len()
    }

    fn classes_in_task(&self, _task: usize) -> usize {
        self.classes_per_task
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn num_clients(&self) -> usize {
        self.train.first().map(Vec::len).unwrap_or(0)
    }

    fn train_set(&self, task: usize, client: usize) -> Arc<ClientDataset> {
        self.train[task][client].clone()
    }

    fn test_set(&self, task: usize) -> Arc<ClientDataset> {
        self.test[task].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DataSettings {
        DataSettings {
            tasks: 2,
            classes_per_task: 3,
            input_dim: 4,
            train_samples_per_class: 50,
            test_samples_per_class: 5,
            noise: 0.1,
            dirichlet_alpha: 0.5,
            seed: 3,
        }
    }

    #[test]
    fn test_partitions_hold_every_sample() {
        let bench = SyntheticBenchmark::new(&settings(), 4);
        assert_eq!(bench.num_tasks(), 2);
        assert_eq!(bench.num_clients(), 4);
        for task in 0..2 {
            let total: usize = (0..4).map(|c| bench.train_set(task, c).len()).sum();
            assert_eq!(total, 150);
            assert_eq!(bench.test_set(task).len(), 15);
            for client in 0..4 {
                let data = bench.train_set(task, client);
                assert_eq!(data.inputs.ncols(), 4);
                assert!(data
                    .labels
                    .iter()
                    .all(|&l| (task * 3..task * 3 + 3).contains(&l)));
            }
        }
    }

    #[test]
    fn test_generation_is_seeded() {
        let a = SyntheticBenchmark::new(&settings(), 3);
        let b = SyntheticBenchmark::new(&settings(), 3);
        assert_eq!(a.train_set(1, 2), b.train_set(1, 2));
        assert_eq!(a.test_set(0), b.test_set(0));
    }

    #[test]
    fn test_partition() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let counts = partition(101, 5, 0.3, &mut rng);
        assert_eq!(counts.len(), 5);
        assert_eq!(counts.iter().sum::<usize>(), 101);
        assert_eq!(partition(7, 1, 1., &mut rng), vec![7]);
    }
}
