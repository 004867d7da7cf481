//! Fisher-weighted low-rank adapter merging with Fisher consolidation across tasks.
//!
//! Clients only train the up projections `B`. Per round they are averaged elementwise by the
//! diagonal Fisher estimate of every client, the regression target of the effective deltas `B A`
//! is solved with the Gram matrices and `A` is fitted to it given the merged `B`, with outlying
//! entries reset to zero. Once per task every client reports how much each output row of the
//! effective deltas mattered, which weighs the fold of the task into the frozen accumulated delta.

use std::collections::BTreeMap;

use ndarray::{s, Array1, Array2, Axis};
use rand::{distributions::Distribution, seq::index, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::WeightedIndex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    aggregation::{
        average::WeightedAverage,
        fisher::{row_mass, FisherAverage},
        weights::Weighting,
        MergeError,
    },
    data::ClientDataset,
    lifecycle::TaskCounters,
    model::{
        loss::{cross_entropy, softmax},
        Gradients,
        Linear,
        Network,
        Optimizer,
        ShapeMismatch,
        TaskWindow,
        WeightOverlay,
        HEAD,
    },
    payload::{ClientInfo, ClientPayload, Grams, ServerPayload},
    settings::{LoraFisherSettings, StrategyKind},
    strategy::{
        adapter::{solve_down, train_overlay, ContinualDelta, LowRank},
        collect_grams,
        lora::{
            adapted_layers,
            adapter_step,
            average_heads,
            deltas,
            init_adapters,
            load_head,
            regression_merge,
        },
        sample_weights,
        ClientStrategy,
        RoundContext,
        ServerStrategy,
        TrainScope,
    },
};

/// Entries of a merged down projection beyond this magnitude are reset to zero.
const DOWN_PROJECTION_BOUND: f32 = 0.25;

/// Runs single-sample backward passes on up to `max_samples` random samples, each against a
/// label drawn from the predicted distribution over the task window.
fn sampled_gradients<N: Network>(
    network: &N,
    overlay: &WeightOverlay,
    data: &ClientDataset,
    window: TaskWindow,
    max_samples: usize,
    rng: &mut ChaCha20Rng,
) -> Vec<Gradients> {
    let amount = max_samples.min(data.len());
    let classes = network.num_classes();
    if amount == 0 || window.classes == 0 || window.end() > classes {
        return Vec::new();
    }
    let mut gradients = Vec::with_capacity(amount);
    for i in index::sample(rng, data.len(), amount).iter() {
        let inputs = data.inputs.row(i).insert_axis(Axis(0)).to_owned();
        let pass = network.forward(inputs.view(), overlay);
        let window_logits = pass.logits().slice(s![.., window.range()]);
        let probs = softmax(window_logits);
        let label = match WeightedIndex::new(probs.row(0).iter()) {
            Ok(dist) => dist.sample(rng),
            Err(_) => continue,
        };
        let (_, grad) = cross_entropy(window_logits, &[label]);
        let mut grad_logits = Array2::zeros((1, classes));
        grad_logits.slice_mut(s![.., window.range()]).assign(&grad);
        gradients.push(network.backward(&pass, grad_logits.view(), overlay));
    }
    gradients
}

/// The positions of the adapted layers in the network.
fn adapted_indices<N: Network>(
    network: &N,
    adapters: &BTreeMap<String, LowRank>,
) -> Vec<(usize, String)> {
    network
        .layers()
        .iter()
        .enumerate()
        .filter(|(_, layer)| adapters.contains_key(&layer.name))
        .map(|(i, layer)| (i, layer.name.clone()))
        .collect()
}

#[derive(Debug, Clone)]
/// A client training adapters and estimating their Fisher information.
pub struct FisherClient {
    settings: LoraFisherSettings,
    rng: ChaCha20Rng,
    adapters: BTreeMap<String, LowRank>,
    old: BTreeMap<String, Array2<f32>>,
    fisher: BTreeMap<String, Array2<f64>>,
    grams: Grams,
}

impl FisherClient {
    pub fn new<N: Network>(settings: LoraFisherSettings, _network: &N, client_id: usize) -> Self {
        let rng = ChaCha20Rng::seed_from_u64(settings.seed.wrapping_add(client_id as u64));
        Self {
            settings,
            rng,
            adapters: BTreeMap::new(),
            old: BTreeMap::new(),
            fisher: BTreeMap::new(),
            grams: Grams::new(),
        }
    }

    fn train_overlay(&self) -> WeightOverlay {
        train_overlay(self.settings.cl_merge, &self.old, deltas(&self.adapters))
    }
}

impl<N: Network> ClientStrategy<N> for FisherClient {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LoraFisher
    }

    fn load(&mut self, network: &mut N, payload: &ServerPayload) -> Result<(), MergeError> {
        match payload {
            ServerPayload::Adapter {
                adapters,
                old_deltas,
                head,
            } => {
                load_head(network, head)?;
                self.adapters = adapters.clone();
                self.old = old_deltas.clone();
                self.fisher.clear();
                self.grams.clear();
                Ok(())
            }
            other => Err(other.mismatch("adapter")),
        }
    }

    fn overlay(&self, _network: &N) -> WeightOverlay {
        self.train_overlay()
    }

    fn step(
        &mut self,
        network: &mut N,
        grads: &Gradients,
        optimizer: &mut Optimizer,
        scope: TrainScope,
    ) {
        adapter_step(network, &mut self.adapters, grads, optimizer, scope, false)
    }

    fn end_round(&mut self, network: &N, ctx: RoundContext<'_>) -> Result<(), MergeError> {
        let overlay = self.train_overlay();
        let samples = sampled_gradients(
            network,
            &overlay,
            ctx.data,
            ctx.window,
            self.settings.fisher_maxiter,
            &mut self.rng,
        );
        let indices = adapted_indices(network, &self.adapters);
        let mut fisher = BTreeMap::new();
        for (i, name) in &indices {
            let adapter = &self.adapters[name];
            let mut total = Array2::<f64>::zeros(adapter.b.raw_dim());
            for grads in &samples {
                let (_, grad_b) = adapter.gradients(grads.weights[*i].view());
                total += &grad_b.mapv(|g| f64::from(g) * f64::from(g));
            }
            if !samples.is_empty() {
                total /= samples.len() as f64;
            }
            fisher.insert(name.clone(), total);
        }
        self.fisher = fisher;

        let mut layers: Vec<String> = self.adapters.keys().cloned().collect();
        layers.push(HEAD.to_string());
        self.grams = collect_grams(
            network,
            &overlay,
            ctx.data,
            &layers,
            &self.settings.regmean,
            ctx.rng,
        );
        Ok(())
    }

    fn client_info(&self, network: &N) -> ClientPayload {
        ClientPayload::Fisher {
            adapters: self.adapters.clone(),
            fisher: self.fisher.clone(),
            grams: self.grams.clone(),
            head: network.head().clone(),
        }
    }

    fn end_task(
        &mut self,
        network: &N,
        ctx: RoundContext<'_>,
    ) -> Result<Option<ClientPayload>, MergeError> {
        let overlay = self.train_overlay();
        let samples = sampled_gradients(
            network,
            &overlay,
            ctx.data,
            ctx.window,
            self.settings.fisher_maxiter,
            &mut self.rng,
        );
        let mut mass = BTreeMap::new();
        for (i, name) in adapted_indices(network, &self.adapters) {
            // the squared row norm of a single-sample weight gradient is |δ_r|² |x|²
            let mut total = Array1::<f64>::zeros(network.layers()[i].out_features());
            for grads in &samples {
                total += &row_mass(grads.weights[i].mapv(|g| f64::from(g) * f64::from(g)).view());
            }
            if !samples.is_empty() {
                total /= samples.len() as f64;
            }
            mass.insert(name, total);
        }
        Ok(Some(ClientPayload::TaskFisher { mass }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FisherState {
    adapters: BTreeMap<String, LowRank>,
    continual: ContinualDelta,
}

type FisherReport<'a> = (
    &'a BTreeMap<String, LowRank>,
    &'a BTreeMap<String, Array2<f64>>,
    &'a Grams,
    &'a Linear,
);

#[derive(Debug, Clone)]
/// A server merging adapters by Fisher weights and regression.
pub struct FisherServer {
    settings: LoraFisherSettings,
    shapes: Vec<(String, usize, usize)>,
    state: FisherState,
    rng: ChaCha20Rng,
}

impl FisherServer {
    pub fn new<N: Network>(settings: LoraFisherSettings, network: &N) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(settings.seed);
        let shapes = adapted_layers(network, false);
        let adapters = init_adapters(&shapes, settings.rank, &mut rng);
        let continual = ContinualDelta::new(settings.cl_merge, settings.fisher_eps);
        Self {
            settings,
            shapes,
            state: FisherState {
                adapters,
                continual,
            },
            rng,
        }
    }

    fn merge_adapter(
        &self,
        name: &str,
        previous: &LowRank,
        reports: &[FisherReport<'_>],
        clients: &[ClientInfo],
        weights: &[f64],
    ) -> Result<LowRank, MergeError> {
        let mut b = FisherAverage::new(self.settings.fisher_eps);
        let mut a = WeightedAverage::new();
        let mut products = WeightedAverage::new();
        let mut client_products = Vec::with_capacity(reports.len());
        for (((adapters, fisher, _, _), client), &w) in reports.iter().zip(clients).zip(weights) {
            let missing = || MergeError::MissingStatistics {
                client: client.client_id,
                layer: name.to_string(),
            };
            let adapter = adapters.get(name).ok_or_else(missing)?;
            let fisher = fisher.get(name).ok_or_else(missing)?;
            b.try_aggregate(adapter.b.view(), fisher.view())?;
            a.try_aggregate(w, adapter.a.view())?;
            let product = adapter.delta();
            products.try_aggregate(w, product.view())?;
            client_products.push(product);
        }
        let b = b.average().unwrap_or_else(|| previous.b.clone());
        let averaged_a = a.average().unwrap_or_else(|| previous.a.clone());
        let fallback = products
            .average()
            .unwrap_or_else(|| previous.delta());

        let grams: Vec<&Grams> = reports.iter().map(|(_, _, grams, _)| *grams).collect();
        let target = regression_merge(
            name,
            clients.iter().zip(client_products),
            &grams,
            &self.settings.regmean,
            &fallback,
        )?;
        let mut a = match solve_down(b.mapv(f64::from).view(), target.mapv(f64::from).view()) {
            Ok(Some(a)) => a.mapv(|x| x as f32),
            Ok(None) => averaged_a,
            Err(err) => {
                warn!("solving the down projection of {} failed ({}): keeping the average", name, err);
                averaged_a
            }
        };
        let outliers = a.iter().filter(|x| x.abs() > DOWN_PROJECTION_BOUND).count();
        if outliers > 0 {
            debug!("zeroing {} outliers of the down projection of {}", outliers, name);
            a.mapv_inplace(|x| if x.abs() > DOWN_PROJECTION_BOUND { 0. } else { x });
        }
        Ok(LowRank { a, b })
    }
}

impl<N: Network> ServerStrategy<N> for FisherServer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LoraFisher
    }

    fn begin_task(&mut self, _network: &mut N, counters: &TaskCounters) {
        if counters.cur_task().unwrap_or(0) > 0 {
            let deltas = deltas(&self.state.adapters);
            self.state.continual.fold(&deltas);
            self.state.adapters = init_adapters(&self.shapes, self.settings.rank, &mut self.rng);
        }
    }

    fn server_info(&self, network: &N) -> ServerPayload {
        ServerPayload::Adapter {
            adapters: self.state.adapters.clone(),
            old_deltas: self.state.continual.old().clone(),
            head: network.head().clone(),
        }
    }

    fn eval_overlay(&self, _network: &N) -> WeightOverlay {
        self.state.continual.eval_overlay(deltas(&self.state.adapters))
    }

    fn merge(
        &mut self,
        network: &mut N,
        clients: &[ClientInfo],
        _counters: &TaskCounters,
    ) -> Result<(), MergeError> {
        let reports = clients
            .iter()
            .map(|client| match &client.payload {
                ClientPayload::Fisher {
                    adapters,
                    fisher,
                    grams,
                    head,
                } => Ok((adapters, fisher, grams, head)),
                other => Err(other.mismatch("fisher")),
            })
            .collect::<Result<Vec<FisherReport<'_>>, _>>()?;
        let weights = sample_weights(clients, Weighting::Samples);

        let mut merged = BTreeMap::new();
        for (name, previous) in &self.state.adapters {
            let adapter = self.merge_adapter(name, previous, &reports, clients, weights.as_slice())?;
            merged.insert(name.clone(), adapter);
        }
        self.state.adapters = merged;

        let heads: Vec<_> = reports.iter().map(|(_, _, _, head)| Some(*head)).collect();
        let mut head = average_heads(network.head(), &heads, clients, &weights)?;
        let grams: Vec<&Grams> = reports.iter().map(|(_, _, grams, _)| *grams).collect();
        head.weight = regression_merge(
            HEAD,
            clients
                .iter()
                .zip(reports.iter().map(|(_, _, _, head)| head.weight.clone())),
            &grams,
            &self.settings.regmean,
            &head.weight,
        )?;
        *network.head_mut() = head;
        debug!("merged {} adapters by fisher weights", self.state.adapters.len());
        Ok(())
    }

    fn end_task(
        &mut self,
        _network: &mut N,
        clients: &[ClientInfo],
        _counters: &TaskCounters,
    ) -> Result<(), MergeError> {
        let masses = clients
            .iter()
            .map(|client| match &client.payload {
                ClientPayload::TaskFisher { mass } => Ok(mass),
                other => Err(other.mismatch("task_fisher")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let weights = sample_weights(clients, Weighting::Samples);

        let mut pending: BTreeMap<String, Array1<f64>> = BTreeMap::new();
        for (mass, &w) in masses.iter().zip(weights.iter()) {
            for (layer, rows) in mass.iter() {
                match pending.get_mut(layer) {
                    Some(total) if total.len() == rows.len() => total.scaled_add(w, rows),
                    Some(total) => {
                        return Err(MergeError::Shape(ShapeMismatch {
                            expected: total.len(),
                            actual: rows.len(),
                        }))
                    }
                    None => {
                        pending.insert(layer.clone(), rows * w);
                    }
                }
            }
        }
        debug!("consolidating the fisher mass of {} layers", pending.len());
        self.state.continual.set_pending_mass(pending);
        Ok(())
    }

    fn save_extra(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&self.state)
    }

    fn load_extra(&mut self, bytes: &[u8]) -> Result<(), bincode::Error> {
        self.state = bincode::deserialize(bytes)?;
        Ok(())
    }
}
