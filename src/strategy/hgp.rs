//! Model averaging with a server-side head rebalanced on replayed Gaussian prototypes.
//!
//! Clients report class-conditional Gaussians of their penultimate features. The server keeps
//! them as per-task mixtures, draws synthetic features from them and retrains the head on those
//! with decoupled (norm-free) logits, so that classes of earlier tasks keep their share of the
//! decision space.

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info};

use crate::{
    aggregation::{
        mixture::{class_statistics, ClassStatistics, MixtureStore, ReplayWindow},
        MergeError,
    },
    lifecycle::TaskCounters,
    model::{
        loss::cross_entropy,
        Gradients,
        Network,
        Optimizer,
        ParameterVector,
        ShapeMismatch,
        WeightOverlay,
    },
    payload::{ClientInfo, ClientPayload, ServerPayload},
    settings::{HgpSettings, StrategyKind},
    strategy::{
        average_into,
        fedavg::load_params,
        full_step,
        param_keys,
        sample_weights,
        ClientStrategy,
        RoundContext,
        ServerStrategy,
        TrainScope,
    },
};

const NORM_EPS: f32 = 1e-7;

/// Cross-entropy of logits rescaled to `z / (|z| tau)`, with the gradient with respect to `z`.
///
/// The gradient of every row is orthogonal to the row itself.
pub fn decoupled_cross_entropy(
    logits: ArrayView2<f32>,
    labels: &[usize],
    tau: f32,
) -> (f32, Array2<f32>) {
    let norms: Vec<f32> = logits
        .axis_iter(Axis(0))
        .map(|row| row.dot(&row).sqrt() + NORM_EPS)
        .collect();
    let mut scaled = logits.to_owned();
    for (mut row, &norm) in scaled.axis_iter_mut(Axis(0)).zip(&norms) {
        row.mapv_inplace(|z| z / (norm * tau));
    }
    let (loss, mut grad) = cross_entropy(scaled.view(), labels);
    for ((mut g, z), &norm) in grad
        .axis_iter_mut(Axis(0))
        .zip(logits.axis_iter(Axis(0)))
        .zip(&norms)
    {
        let unit = z.mapv(|v| v / norm);
        let along = g.dot(&unit);
        g.zip_mut_with(&unit, |g, &u| *g = (*g - along * u) / (norm * tau));
    }
    (loss, grad)
}

#[derive(Debug, Clone)]
/// A client reporting its model with the Gaussian prototypes of its classes.
pub struct HgpClient {
    settings: HgpSettings,
    class_statistics: BTreeMap<usize, ClassStatistics>,
    seen: BTreeMap<usize, u64>,
}

impl HgpClient {
    pub fn new(settings: HgpSettings) -> Self {
        Self {
            settings,
            class_statistics: BTreeMap::new(),
            seen: BTreeMap::new(),
        }
    }
}

impl<N: Network> ClientStrategy<N> for HgpClient {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hgp
    }

    fn load(&mut self, network: &mut N, payload: &ServerPayload) -> Result<(), MergeError> {
        self.class_statistics.clear();
        self.seen.clear();
        load_params(network, payload)
    }

    fn step(
        &mut self,
        network: &mut N,
        grads: &Gradients,
        optimizer: &mut Optimizer,
        scope: TrainScope,
    ) {
        full_step(network, grads, optimizer, scope)
    }

    fn end_round(&mut self, network: &N, ctx: RoundContext<'_>) -> Result<(), MergeError> {
        let pass = network.forward(ctx.data.inputs.view(), &WeightOverlay::new());
        self.class_statistics = class_statistics(
            pass.features().view(),
            &ctx.data.labels,
            self.settings.full_cov,
        );
        self.seen = ctx.seen.clone();
        Ok(())
    }

    fn client_info(&self, network: &N) -> ClientPayload {
        ClientPayload::Prototype {
            params: ParameterVector::flatten(network),
            class_statistics: self.class_statistics.clone(),
            seen_classes: self.seen.clone(),
        }
    }

    fn linear_probe_epochs(&self) -> usize {
        self.settings.linear_probe_epochs
    }
}

#[derive(Debug, Clone)]
/// A server averaging the models and rebalancing the head on replayed prototypes.
pub struct HgpServer {
    settings: HgpSettings,
    store: MixtureStore,
    optimizer: Optimizer,
    rng: ChaCha20Rng,
}

impl HgpServer {
    pub fn new(settings: HgpSettings, seed: u64) -> Self {
        let optimizer = Optimizer::sgd(settings.rebalance_lr, 0.9);
        Self {
            settings,
            store: MixtureStore::new(),
            optimizer,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    fn replay_window(&self) -> ReplayWindow {
        if self.settings.reb_only_old {
            ReplayWindow::OnlyOld
        } else if self.settings.reb_only_cur {
            ReplayWindow::OnlyCurrent
        } else {
            ReplayWindow::All
        }
    }

    /// Retrains the head on synthetic features of the replayed classes.
    fn rebalance<N: Network>(
        &mut self,
        network: &mut N,
        counters: &TaskCounters,
    ) -> Result<(), MergeError> {
        let task = counters.cur_task().unwrap_or(0);
        let seen = counters.seen_classes().min(network.num_classes());
        let window = self.replay_window();
        let (weight_key, bias_key) = param_keys(&network.head().name);
        let batch_size = self.settings.rebalance_batch_size.max(1);
        let mut last_loss = None;

        for _ in 0..self.settings.rebalance_epochs {
            let (features, labels) = match self.store.sample(
                task,
                window,
                self.settings.samples_per_class,
                self.settings.variance_scale,
                &mut self.rng,
            )? {
                Some(replay) => replay,
                None => {
                    debug!("nothing to replay for task {}", task);
                    return Ok(());
                }
            };
            let head = network.head_mut();
            if features.ncols() != head.in_features() {
                return Err(MergeError::Shape(ShapeMismatch {
                    expected: head.in_features(),
                    actual: features.ncols(),
                }));
            }

            for (x, y) in features
                .axis_chunks_iter(Axis(0), batch_size)
                .zip(labels.chunks(batch_size))
            {
                let logits = x.dot(&head.weight.t()) + &head.bias;
                let seen_logits = logits.slice(s![.., ..seen]);
                let (loss, grad) = if self.settings.logit_norm > 0. {
                    decoupled_cross_entropy(seen_logits, y, self.settings.logit_norm)
                } else {
                    cross_entropy(seen_logits, y)
                };
                let mut grad_weight = Array2::zeros(head.weight.raw_dim());
                grad_weight
                    .slice_mut(s![..seen, ..])
                    .assign(&grad.t().dot(&x));
                let mut grad_bias = Array1::zeros(head.bias.raw_dim());
                grad_bias
                    .slice_mut(s![..seen])
                    .assign(&grad.sum_axis(Axis(0)));
                self.optimizer.step(
                    &weight_key,
                    head.weight.view_mut().into_dyn(),
                    grad_weight.view().into_dyn(),
                );
                self.optimizer.step(
                    &bias_key,
                    head.bias.view_mut().into_dyn(),
                    grad_bias.view().into_dyn(),
                );
                last_loss = Some(loss);
            }
        }
        if let Some(loss) = last_loss {
            info!("rebalanced the head on {} classes: loss {:.4}", seen, loss);
        }
        Ok(())
    }
}

impl<N: Network> ServerStrategy<N> for HgpServer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hgp
    }

    fn server_info(&self, network: &N) -> ServerPayload {
        ServerPayload::Params {
            params: ParameterVector::flatten(network),
        }
    }

    fn merge(
        &mut self,
        network: &mut N,
        clients: &[ClientInfo],
        counters: &TaskCounters,
    ) -> Result<(), MergeError> {
        let reports = clients
            .iter()
            .map(|client| match &client.payload {
                ClientPayload::Prototype {
                    params,
                    class_statistics,
                    seen_classes,
                } => Ok((params, class_statistics, seen_classes)),
                other => Err(other.mismatch("prototype")),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let params: Vec<_> = reports.iter().map(|(params, _, _)| *params).collect();
        average_into(
            network,
            &params,
            &sample_weights(clients, self.settings.weighting),
        )?;

        for (_, _, seen) in &reports {
            self.store.observe(seen);
        }
        let statistics: Vec<_> = reports.iter().map(|(_, stats, _)| *stats).collect();
        self.store
            .set_task(counters.cur_task().unwrap_or(0), &statistics);

        if self.settings.rebalance_every_round {
            self.rebalance(network, counters)?;
        }
        Ok(())
    }

    fn end_task(
        &mut self,
        network: &mut N,
        _clients: &[ClientInfo],
        counters: &TaskCounters,
    ) -> Result<(), MergeError> {
        if !self.settings.rebalance_every_round {
            self.rebalance(network, counters)?;
        }
        if let Some(task) = counters.cur_task() {
            self.store.finalize(task);
        }
        Ok(())
    }

    fn optimizer(&self) -> Option<&Optimizer> {
        Some(&self.optimizer)
    }

    fn restore_optimizer(&mut self, optimizer: Optimizer) {
        self.optimizer = optimizer;
    }

    fn save_extra(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&self.store)
    }

    fn load_extra(&mut self, bytes: &[u8]) -> Result<(), bincode::Error> {
        self.store = bincode::deserialize(bytes)?;
        Ok(())
    }
}
