//! Low-rank adapters and the continual folding of their deltas across tasks.
//!
//! An adapted layer computes with `W + old + B A` (or a VeRA delta): `W` is the frozen base
//! weight, `old` the frozen accumulation of the deltas of all completed tasks and `B A` the delta
//! of the current task.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    aggregation::fisher::FisherConsolidation,
    linalg::{self, LinalgError},
    model::WeightOverlay,
};

/// Gram matrices below this magnitude are treated as zero by the factor solves.
const TINY: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How the delta of a completed task is folded into the frozen accumulated delta.
pub enum ContinualMerge {
    /// `old += d`; the current task trains on top of `old`.
    RunSum,
    /// `old = (old (t - 1) + d) / t`; the current task trains on top of `old`.
    RunMean,
    /// Folded like `RunMean` but the current task trains on its own delta only. Evaluation
    /// uses the sum of all task deltas.
    IndividualSum,
    /// Folded like `RunMean` but the current task trains on its own delta only. Evaluation
    /// uses the mean of all task deltas.
    IndividualMean,
    /// Row-wise blend weighted by the accumulated Fisher mass; the current task trains on its own
    /// delta only.
    Fisher,
}

impl Default for ContinualMerge {
    fn default() -> Self {
        ContinualMerge::RunSum
    }
}

impl ContinualMerge {
    /// Whether the current task is trained on top of the accumulated delta.
    pub fn trains_on_old(self) -> bool {
        matches!(self, ContinualMerge::RunSum | ContinualMerge::RunMean)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A low-rank adapter `B A` of an `out x in` weight.
pub struct LowRank {
    /// The down projection, `rank x in`.
    pub a: Array2<f32>,
    /// The up projection, `out x rank`.
    pub b: Array2<f32>,
}

impl LowRank {
    /// Creates an adapter with a uniformly initialized `A` and a zero `B`, so that the initial
    /// delta vanishes.
    pub fn new<R: Rng>(rank: usize, in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            a: kaiming_uniform((rank, in_features), rng),
            b: Array2::zeros((out_features, rank)),
        }
    }

    pub fn rank(&self) -> usize {
        self.a.nrows()
    }

    /// The weight delta `B A`.
    pub fn delta(&self) -> Array2<f32> {
        self.b.dot(&self.a)
    }

    /// Maps the gradient with respect to the effective weight to the gradients of `A` and `B`.
    pub fn gradients(&self, grad: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        (self.b.t().dot(&grad), grad.dot(&self.a.t()))
    }
}

/// Samples from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, where `fan_in` is the number of columns.
fn kaiming_uniform<R: Rng>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
    let bound = 1. / (shape.1.max(1) as f32).sqrt();
    Array2::from_shape_simple_fn(shape, || rng.gen_range(-bound..=bound))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The frozen random basis of a VeRA layer.
pub struct VeraBasis {
    /// `out x rank`
    pub b: Array2<f32>,
    /// `rank x in`
    pub a: Array2<f32>,
}

impl VeraBasis {
    /// Generates the bases of all given `(name, in, out)` layers from one seed.
    ///
    /// The same seed and shapes always yield the same bases, so clients and server agree on them
    /// without exchanging them.
    pub fn generate(
        seed: u64,
        rank: usize,
        layers: &[(String, usize, usize)],
    ) -> BTreeMap<String, VeraBasis> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        layers
            .iter()
            .map(|(name, in_features, out_features)| {
                let basis = VeraBasis {
                    b: kaiming_uniform((*out_features, rank), &mut rng),
                    a: kaiming_uniform((rank, *in_features), &mut rng),
                };
                (name.clone(), basis)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The trainable scaling vectors of a VeRA layer: `delta = diag(b) B diag(d) A`.
pub struct VeraScaling {
    /// `out`
    pub b: Array1<f32>,
    /// `rank`
    pub d: Array1<f32>,
}

impl VeraScaling {
    /// Creates scalings with `b = 0` and `d = d_initial`.
    pub fn new(out_features: usize, rank: usize, d_initial: f32) -> Self {
        Self {
            b: Array1::zeros(out_features),
            d: Array1::from_elem(rank, d_initial),
        }
    }

    fn scaled_product(&self, basis: &VeraBasis) -> Array2<f32> {
        (&basis.b * &self.d).dot(&basis.a)
    }

    /// The weight delta.
    pub fn delta(&self, basis: &VeraBasis) -> Array2<f32> {
        self.scaled_product(basis) * &self.b.view().insert_axis(Axis(1))
    }

    /// Maps the gradient with respect to the effective weight to the gradients of `b` and `d`.
    pub fn gradients(
        &self,
        basis: &VeraBasis,
        grad: ArrayView2<f32>,
    ) -> (Array1<f32>, Array1<f32>) {
        let db = (&grad * &self.scaled_product(basis)).sum_axis(Axis(1));
        let scaled_b = &basis.b * &self.b.view().insert_axis(Axis(1));
        let dd = (scaled_b * grad.dot(&basis.a.t())).sum_axis(Axis(0));
        (db, dd)
    }
}

/// Builds the overlay a client trains with.
pub fn train_overlay(
    merge: ContinualMerge,
    old: &BTreeMap<String, Array2<f32>>,
    deltas: BTreeMap<String, Array2<f32>>,
) -> WeightOverlay {
    let mut overlay = WeightOverlay::new();
    for (layer, delta) in deltas {
        if merge.trains_on_old() {
            if let Some(old) = old.get(&layer) {
                overlay.add(&layer, old.clone());
            }
        }
        overlay.add(&layer, delta);
    }
    overlay
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The frozen accumulation of the deltas of all completed tasks.
pub struct ContinualDelta {
    merge: ContinualMerge,
    eps: f64,
    old: BTreeMap<String, Array2<f32>>,
    /// The number of folded tasks.
    tasks: usize,
    consolidation: FisherConsolidation,
    /// The Fisher row mass of the current task, reported at its end.
    pending_mass: BTreeMap<String, Array1<f64>>,
}

impl ContinualDelta {
    /// Creates an empty accumulation. `eps` smooths the Fisher masses of the `Fisher` merge.
    pub fn new(merge: ContinualMerge, eps: f64) -> Self {
        Self {
            merge,
            eps,
            old: BTreeMap::new(),
            tasks: 0,
            consolidation: FisherConsolidation::new(),
            pending_mass: BTreeMap::new(),
        }
    }

    pub fn merge(&self) -> ContinualMerge {
        self.merge
    }

    /// The accumulated delta of every layer.
    pub fn old(&self) -> &BTreeMap<String, Array2<f32>> {
        &self.old
    }

    /// The number of folded tasks.
    pub fn tasks(&self) -> usize {
        self.tasks
    }

    /// Records the Fisher row mass of the current task, used by the next fold.
    pub fn set_pending_mass(&mut self, mass: BTreeMap<String, Array1<f64>>) {
        self.pending_mass = mass;
    }

    /// The Fisher mass of a layer to fold the current task with.
    ///
    /// Without a reported mass the current task counts as much as an average completed task.
    fn current_mass(&self, layer: &str, rows: usize) -> Array1<f64> {
        if let Some(mass) = self.pending_mass.get(layer) {
            return mass.clone();
        }
        match self.consolidation.mass(layer) {
            Some(total) if self.tasks > 0 => total / self.tasks as f64,
            _ => Array1::ones(rows),
        }
    }

    /// Folds the deltas of the completed task into the accumulation.
    pub fn fold(&mut self, deltas: &BTreeMap<String, Array2<f32>>) {
        let t = (self.tasks + 1) as f32;
        for (layer, delta) in deltas {
            let mass = match self.merge {
                ContinualMerge::Fisher => Some(self.current_mass(layer, delta.nrows())),
                _ => None,
            };
            let old = self
                .old
                .entry(layer.clone())
                .or_insert_with(|| Array2::zeros(delta.raw_dim()));
            match (self.merge, mass) {
                (ContinualMerge::RunSum, _) => *old += delta,
                (ContinualMerge::Fisher, Some(mass)) => {
                    self.consolidation
                        .fold(layer, old, delta.view(), mass.view(), self.eps)
                }
                _ => *old = (&*old * (t - 1.) + delta) / t,
            }
        }
        self.tasks += 1;
        self.pending_mass.clear();
        debug!("folded task delta: {} tasks accumulated", self.tasks);
    }

    /// Builds the overlay the global model is evaluated with.
    pub fn eval_overlay(&self, deltas: BTreeMap<String, Array2<f32>>) -> WeightOverlay {
        let t = self.tasks as f32;
        let mut overlay = WeightOverlay::new();
        for (layer, delta) in deltas {
            let effective = match self.old.get(&layer) {
                None => delta,
                Some(old) => match self.merge {
                    ContinualMerge::RunSum => old + &delta,
                    ContinualMerge::RunMean | ContinualMerge::IndividualMean => {
                        (old * t + &delta) / (t + 1.)
                    }
                    ContinualMerge::IndividualSum => old * t + &delta,
                    ContinualMerge::Fisher => {
                        let mut preview = old.clone();
                        let mass = self.current_mass(&layer, delta.nrows());
                        self.consolidation.clone().fold(
                            &layer,
                            &mut preview,
                            delta.view(),
                            mass.view(),
                            self.eps,
                        );
                        preview
                    }
                },
            };
            overlay.add(&layer, effective);
        }
        overlay
    }
}

/// Solves `min |B A - T|` for `A` given `B`: `A = (BᵀB)⁺ Bᵀ T`.
///
/// Returns `None` if `BᵀB` vanishes.
pub fn solve_down(
    b: ArrayView2<f64>,
    target: ArrayView2<f64>,
) -> Result<Option<Array2<f64>>, LinalgError> {
    let btb = b.t().dot(&b);
    if btb.iter().all(|x| x.abs() < TINY) {
        return Ok(None);
    }
    let pinv = linalg::pinverse_symmetric(btb.view())?;
    Ok(Some(pinv.dot(&b.t()).dot(&target)))
}

/// Solves `min |B A - T|` for `B` given `A`: `B = T Aᵀ (A Aᵀ)⁺`.
///
/// Returns `None` if `A Aᵀ` vanishes.
pub fn solve_up(
    a: ArrayView2<f64>,
    target: ArrayView2<f64>,
) -> Result<Option<Array2<f64>>, LinalgError> {
    let aat = a.dot(&a.t());
    if aat.iter().all(|x| x.abs() < TINY) {
        return Ok(None);
    }
    let pinv = linalg::pinverse_symmetric(aat.view())?;
    Ok(Some(target.dot(&a.t()).dot(&pinv)))
}

/// Factorizes a target delta into an adapter by alternating closed-form solves, starting from
/// `initial`. A factor whose solve degenerates keeps its previous value.
pub fn factorize(
    target: ArrayView2<f64>,
    initial: &LowRank,
    iterations: usize,
) -> Result<LowRank, LinalgError> {
    let mut a = initial.a.mapv(f64::from);
    let mut b = initial.b.mapv(f64::from);
    for _ in 0..iterations {
        if let Some(solved) = solve_up(a.view(), target)? {
            b = solved;
        }
        if let Some(solved) = solve_down(b.view(), target)? {
            a = solved;
        }
    }
    Ok(LowRank {
        a: a.mapv(|x| x as f32),
        b: b.mapv(|x| x as f32),
    })
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn deltas(value: f32) -> BTreeMap<String, Array2<f32>> {
        vec![("blocks.0".to_string(), Array2::from_elem((2, 2), value))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_low_rank_init_has_zero_delta() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let adapter = LowRank::new(2, 5, 3, &mut rng);
        assert_eq!(adapter.a.dim(), (2, 5));
        assert_eq!(adapter.b.dim(), (3, 2));
        assert_eq!(adapter.delta(), Array2::<f32>::zeros((3, 5)));
        assert!(adapter.a.iter().all(|x| x.abs() <= 1. / 5_f32.sqrt()));
    }

    #[test]
    fn test_low_rank_gradients() {
        let adapter = LowRank {
            a: array![[1., 2.]],
            b: array![[3.], [4.]],
        };
        let grad = array![[1., 0.], [0., 1.]];
        let (ga, gb) = adapter.gradients(grad.view());
        assert_eq!(ga, array![[3., 4.]]);
        assert_eq!(gb, array![[1.], [2.]]);
    }

    #[test]
    fn test_vera_gradients_match_finite_differences() {
        let basis = VeraBasis {
            b: array![[0.5, -0.2], [0.1, 0.3], [-0.4, 0.6]],
            a: array![[0.2, 0.7], [-0.3, 0.1]],
        };
        let scaling = VeraScaling {
            b: array![0.3, -0.5, 0.8],
            d: array![1.2, -0.7],
        };
        // loss = sum(delta * c), so the gradient with respect to the weight is c
        let c = array![[0.1, -0.2], [0.4, 0.3], [-0.6, 0.5]];
        let loss = |s: &VeraScaling| (s.delta(&basis) * &c).sum();
        let (db, dd) = scaling.gradients(&basis, c.view());

        let h = 1e-2;
        for i in 0..3 {
            let (mut plus, mut minus) = (scaling.clone(), scaling.clone());
            plus.b[i] += h;
            minus.b[i] -= h;
            assert!(((loss(&plus) - loss(&minus)) / (2. * h) - db[i]).abs() < 1e-4);
        }
        for k in 0..2 {
            let (mut plus, mut minus) = (scaling.clone(), scaling.clone());
            plus.d[k] += h;
            minus.d[k] -= h;
            assert!(((loss(&plus) - loss(&minus)) / (2. * h) - dd[k]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_vera_basis_is_seeded() {
        let layers = vec![("blocks.0".to_string(), 4, 3)];
        let a = VeraBasis::generate(7, 2, &layers);
        assert_eq!(a, VeraBasis::generate(7, 2, &layers));
        assert_ne!(a, VeraBasis::generate(8, 2, &layers));
        assert_eq!(a["blocks.0"].b.dim(), (3, 2));
        assert_eq!(a["blocks.0"].a.dim(), (2, 4));
        let scaling = VeraScaling::new(3, 2, 0.1);
        assert_eq!(scaling.delta(&a["blocks.0"]), Array2::<f32>::zeros((3, 4)));
    }

    #[test]
    fn test_run_mean_is_the_arithmetic_mean() {
        let mut continual = ContinualDelta::new(ContinualMerge::RunMean, 1e-8);
        continual.fold(&deltas(1.));
        continual.fold(&deltas(3.));
        assert_eq!(continual.tasks(), 2);
        assert_eq!(continual.old()["blocks.0"], Array2::from_elem((2, 2), 2.));
    }

    #[test]
    fn test_run_sum_accumulates() {
        let mut continual = ContinualDelta::new(ContinualMerge::RunSum, 1e-8);
        continual.fold(&deltas(1.));
        continual.fold(&deltas(3.));
        assert_eq!(continual.old()["blocks.0"], Array2::from_elem((2, 2), 4.));
        let overlay = continual.eval_overlay(deltas(0.5));
        assert_eq!(overlay.get("blocks.0"), Some(&Array2::from_elem((2, 2), 4.5)));
    }

    #[test]
    fn test_individual_overlays() {
        for (merge, expected) in &[
            (ContinualMerge::IndividualSum, 6.),
            (ContinualMerge::IndividualMean, 2.),
        ] {
            let mut continual = ContinualDelta::new(*merge, 1e-8);
            continual.fold(&deltas(1.));
            continual.fold(&deltas(3.));
            // the current task trains on its own delta
            let train = train_overlay(*merge, continual.old(), deltas(2.));
            assert_eq!(train.get("blocks.0"), Some(&Array2::from_elem((2, 2), 2.)));
            let eval = continual.eval_overlay(deltas(2.));
            assert_eq!(
                eval.get("blocks.0"),
                Some(&Array2::from_elem((2, 2), *expected))
            );
        }
    }

    #[test]
    fn test_run_mean_trains_on_old() {
        let mut continual = ContinualDelta::new(ContinualMerge::RunMean, 1e-8);
        continual.fold(&deltas(2.));
        let train = train_overlay(ContinualMerge::RunMean, continual.old(), deltas(1.));
        assert_eq!(train.get("blocks.0"), Some(&Array2::from_elem((2, 2), 3.)));
    }

    #[test]
    fn test_fisher_fold_keeps_important_rows() {
        let mut continual = ContinualDelta::new(ContinualMerge::Fisher, 1e-12);
        let layer = "blocks.0".to_string();
        continual.set_pending_mass(vec![(layer.clone(), array![9., 0.])].into_iter().collect());
        continual.fold(&deltas(1.));
        // the first task is taken as is, even where it reports no mass
        assert!(continual.old()[&layer].iter().all(|x| (x - 1.).abs() < 1e-5));

        continual.set_pending_mass(vec![(layer.clone(), array![1., 9.])].into_iter().collect());
        continual.fold(&deltas(11.));
        let old = &continual.old()[&layer];
        // row 0 was important for the first task, row 1 only for the second
        assert!((old[[0, 0]] - 2.).abs() < 1e-4);
        assert!((old[[1, 0]] - 11.).abs() < 1e-4);
    }

    #[test]
    fn test_factorize_recovers_low_rank_target() {
        let target = array![[1., 2.], [2., 4.], [3., 6.]];
        let initial = LowRank {
            a: array![[0.5_f32, 0.5]],
            b: array![[0_f32], [0.], [0.]],
        };
        let adapter = factorize(target.view(), &initial, 3).unwrap();
        let delta = adapter.delta();
        for (x, y) in delta.iter().zip(target.iter()) {
            assert!((f64::from(*x) - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_solve_down_without_up_projection() {
        let b = Array2::<f64>::zeros((3, 1));
        assert_eq!(solve_down(b.view(), Array2::ones((3, 2)).view()), Ok(None));
    }
}
