//! Class-conditional Gaussian prototypes and their per-task mixtures.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal, WeightedIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::linalg::{self, LinalgError};

/// The jitter added to variances before sampling.
const VARIANCE_JITTER: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The covariance of a Gaussian prototype.
pub enum Covariance {
    /// Per-feature variances.
    Diagonal(Array1<f64>),
    /// A full covariance matrix.
    Full(Array2<f64>),
}

impl Covariance {
    /// The total variance, i.e. the trace of the covariance.
    pub fn trace(&self) -> f64 {
        match self {
            Covariance::Diagonal(var) => var.sum(),
            Covariance::Full(cov) => cov.diag().sum(),
        }
    }

    /// The feature dimension.
    pub fn dim(&self) -> usize {
        match self {
            Covariance::Diagonal(var) => var.len(),
            Covariance::Full(cov) => cov.nrows(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The Gaussian summary of the features of one class on one client.
pub struct ClassStatistics {
    pub count: usize,
    pub mean: Array1<f64>,
    pub covariance: Covariance,
}

/// Fits one Gaussian per class over a batch of features.
///
/// Classes with fewer than two samples are skipped since their variance is undefined. Variances
/// are unbiased.
pub fn class_statistics(
    features: ArrayView2<f32>,
    labels: &[usize],
    full_cov: bool,
) -> BTreeMap<usize, ClassStatistics> {
    let mut rows: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        rows.entry(label).or_default().push(i);
    }

    rows.into_iter()
        .filter(|(_, idx)| idx.len() > 1)
        .filter_map(|(label, idx)| {
            let x = features.select(Axis(0), &idx).mapv(f64::from);
            let count = idx.len();
            let mean = x.mean_axis(Axis(0))?;
            let centered = &x - &mean;
            let denom = (count - 1) as f64;
            let covariance = if full_cov {
                Covariance::Full(centered.t().dot(&centered) / denom)
            } else {
                Covariance::Diagonal(centered.mapv(|v| v * v).sum_axis(Axis(0)) / denom)
            };
            Some((
                label,
                ClassStatistics {
                    count,
                    mean,
                    covariance,
                },
            ))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One mixture component, contributed by one client.
pub struct Component {
    pub weight: f64,
    pub mean: Array1<f64>,
    pub covariance: Covariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which tasks' mixtures are replayed.
pub enum ReplayWindow {
    /// All tasks up to and including the current one.
    All,
    /// Only tasks before the current one.
    OnlyOld,
    /// Only the current task.
    OnlyCurrent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// The per-task, per-class Gaussian mixtures and the running class histogram.
pub struct MixtureStore {
    /// `mogs_per_task[task][class]` lists one component per contributing client.
    mogs_per_task: BTreeMap<usize, BTreeMap<usize, Vec<Component>>>,
    /// How often every class has been observed by the clients so far.
    history_classes: BTreeMap<usize, u64>,
    /// The tasks whose mixtures have been finalized.
    finalized: Vec<usize>,
}

impl MixtureStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The mixtures of a task.
    pub fn task(&self, task: usize) -> Option<&BTreeMap<usize, Vec<Component>>> {
        self.mogs_per_task.get(&task)
    }

    /// The running class histogram.
    pub fn history(&self) -> &BTreeMap<usize, u64> {
        &self.history_classes
    }

    /// Whether the mixtures of a task have been finalized.
    pub fn is_finalized(&self, task: usize) -> bool {
        self.finalized.contains(&task)
    }

    /// Replaces the mixtures of a task by the merge of the given client statistics.
    ///
    /// Every client contributes one component per class, weighted by its share of the class
    /// samples. The mixtures of a finalized task are never overwritten.
    pub fn set_task(&mut self, task: usize, clients: &[&BTreeMap<usize, ClassStatistics>]) {
        if self.is_finalized(task) {
            warn!("mixtures of task {} are finalized: ignoring new statistics", task);
            return;
        }

        let mut mixtures: BTreeMap<usize, Vec<Component>> = BTreeMap::new();
        for stats in clients {
            for (&class, stat) in stats.iter() {
                mixtures.entry(class).or_default().push(Component {
                    weight: stat.count as f64,
                    mean: stat.mean.clone(),
                    covariance: stat.covariance.clone(),
                });
            }
        }
        for components in mixtures.values_mut() {
            let total: f64 = components.iter().map(|c| c.weight).sum();
            for component in components.iter_mut() {
                component.weight /= total;
            }
        }
        debug!("task {}: {} class mixtures", task, mixtures.len());
        self.mogs_per_task.insert(task, mixtures);
    }

    /// Marks the mixtures of a task as final.
    pub fn finalize(&mut self, task: usize) {
        if !self.is_finalized(task) {
            self.finalized.push(task);
        }
    }

    /// Adds observed class counts to the running histogram.
    pub fn observe(&mut self, seen: &BTreeMap<usize, u64>) {
        for (&class, &count) in seen {
            *self.history_classes.entry(class).or_insert(0) += count;
        }
    }

    /// Samples synthetic features from the mixtures of the replayed tasks.
    ///
    /// `samples_per_class * num_classes` class labels are drawn from the running histogram of the
    /// replayed classes, then one component per sample, then a feature from that component.
    /// Diagonal variances are inflated by `variance_scale`.
    ///
    /// Returns `None` if there is nothing to replay.
    ///
    /// # Errors
    /// Fails if a covariance can't be factorized.
    pub fn sample<R: Rng>(
        &self,
        current_task: usize,
        window: ReplayWindow,
        samples_per_class: usize,
        variance_scale: f64,
        rng: &mut R,
    ) -> Result<Option<(Array2<f32>, Vec<usize>)>, LinalgError> {
        let classes: BTreeMap<usize, &Vec<Component>> = self
            .mogs_per_task
            .iter()
            .filter(|(&task, _)| match window {
                ReplayWindow::All => task <= current_task,
                ReplayWindow::OnlyOld => task < current_task,
                ReplayWindow::OnlyCurrent => task == current_task,
            })
            .flat_map(|(_, mixtures)| mixtures.iter())
            .filter(|(_, components)| !components.is_empty())
            .map(|(&class, components)| (class, components))
            .collect();
        if classes.is_empty() {
            return Ok(None);
        }

        let labels: Vec<usize> = classes.keys().copied().collect();
        let histogram: Vec<f64> = labels
            .iter()
            .map(|class| self.history_classes.get(class).copied().unwrap_or(0) as f64)
            .collect();
        let class_dist = WeightedIndex::new(&histogram)
            .or_else(|_| WeightedIndex::new(vec![1.; labels.len()]))
            .map_err(|_| LinalgError::NonFinite)?;

        // factors and component distributions per class
        let mut samplers = Vec::with_capacity(labels.len());
        for class in &labels {
            let components = classes[class];
            let factors = components
                .iter()
                .map(|c| component_factor(&c.covariance, variance_scale))
                .collect::<Result<Vec<_>, _>>()?;
            let weights: Vec<f64> = components.iter().map(|c| c.weight).collect();
            let component_dist = WeightedIndex::new(&weights)
                .or_else(|_| WeightedIndex::new(vec![1.; weights.len()]))
                .map_err(|_| LinalgError::NonFinite)?;
            samplers.push((components, factors, component_dist));
        }

        let dim = classes
            .values()
            .next()
            .and_then(|c| c.first())
            .map(|c| c.mean.len())
            .unwrap_or(0);
        let total = samples_per_class * labels.len();
        let mut features = Array2::<f32>::zeros((total, dim));
        let mut sampled = Vec::with_capacity(total);
        for mut row in features.axis_iter_mut(Axis(0)) {
            let which = class_dist.sample(rng);
            let (components, factors, component_dist) = &samplers[which];
            let c = component_dist.sample(rng);
            let z: Array1<f64> = (0..dim).map(|_| StandardNormal.sample(rng)).collect();
            let x = &components[c].mean + &factors[c].sample(&z);
            row.assign(&x.mapv(|v| v as f32));
            sampled.push(labels[which]);
        }
        Ok(Some((features, sampled)))
    }
}

enum Factor {
    Diagonal(Array1<f64>),
    Full(Array2<f64>),
}

impl Factor {
    fn sample(&self, z: &Array1<f64>) -> Array1<f64> {
        match self {
            Factor::Diagonal(std) => std * z,
            Factor::Full(l) => l.dot(z),
        }
    }
}

fn component_factor(covariance: &Covariance, variance_scale: f64) -> Result<Factor, LinalgError> {
    match covariance {
        Covariance::Diagonal(var) => Ok(Factor::Diagonal(
            var.mapv(|v| ((v.max(0.) + VARIANCE_JITTER) * variance_scale).sqrt()),
        )),
        Covariance::Full(cov) => {
            let mut jittered = cov.clone();
            jittered.diag_mut().mapv_inplace(|v| v + VARIANCE_JITTER);
            linalg::psd_sqrt(jittered.view()).map(Factor::Full)
        }
    }
}
