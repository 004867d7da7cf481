//! Low-rank adapter training and merging.
//!
//! The base weights are frozen and identical on every replica. Clients train one adapter per
//! backbone layer (and per head if `lora_head` is set, otherwise the head is trained directly) on
//! top of the frozen accumulated delta of the completed tasks. The server averages the factors `A`
//! and `B` separately or, with the regression hybrid, regression-merges the effective deltas and
//! factorizes the result back into an adapter.

use std::collections::BTreeMap;

use ndarray::{Array2, Ix1, Ix2};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    aggregation::{
        average::WeightedAverage,
        regmean::RegMeanLayer,
        weights::{ClientWeights, Weighting},
        MergeError,
    },
    lifecycle::TaskCounters,
    model::{Gradients, Linear, Network, Optimizer, ShapeMismatch, WeightOverlay, HEAD},
    payload::{ClientInfo, ClientPayload, Grams, ServerPayload},
    settings::{LoraSettings, RegMeanSettings, StrategyKind},
    strategy::{
        adapter::{factorize, train_overlay, ContinualDelta, LowRank},
        collect_grams,
        param_keys,
        sample_weights,
        ClientStrategy,
        RoundContext,
        ServerStrategy,
        TrainScope,
    },
};

/// The `(name, in, out)` shapes of the adapted layers.
pub(crate) fn adapted_layers<N: Network>(
    network: &N,
    adapt_head: bool,
) -> Vec<(String, usize, usize)> {
    network
        .layers()
        .iter()
        .filter(|layer| adapt_head || !layer.is_head())
        .map(|layer| (layer.name.clone(), layer.in_features(), layer.out_features()))
        .collect()
}

/// Creates fresh adapters for the given layer shapes.
pub(crate) fn init_adapters(
    shapes: &[(String, usize, usize)],
    rank: usize,
    rng: &mut ChaCha20Rng,
) -> BTreeMap<String, LowRank> {
    shapes
        .iter()
        .map(|(name, in_features, out_features)| {
            (
                name.clone(),
                LowRank::new(rank, *in_features, *out_features, rng),
            )
        })
        .collect()
}

/// The deltas `B A` of the adapters.
pub(crate) fn deltas(adapters: &BTreeMap<String, LowRank>) -> BTreeMap<String, Array2<f32>> {
    adapters
        .iter()
        .map(|(name, adapter)| (name.clone(), adapter.delta()))
        .collect()
}

/// Replaces the head of the network by a broadcast one.
pub(crate) fn load_head<N: Network>(network: &mut N, head: &Linear) -> Result<(), ShapeMismatch> {
    let local = network.head_mut();
    if local.weight.dim() != head.weight.dim() || local.bias.len() != head.bias.len() {
        return Err(ShapeMismatch {
            expected: local.len(),
            actual: head.len(),
        });
    }
    *local = head.clone();
    Ok(())
}

/// Steps the adapter factors and, if it carries no adapter, the head.
///
/// The base weights and the biases of the adapted layers stay frozen, as do the down projections
/// `A` unless `train_down` is set.
pub(crate) fn adapter_step<N: Network>(
    network: &mut N,
    adapters: &mut BTreeMap<String, LowRank>,
    grads: &Gradients,
    optimizer: &mut Optimizer,
    scope: TrainScope,
    train_down: bool,
) {
    for (i, layer) in network.layers_mut().iter_mut().enumerate() {
        if scope == TrainScope::HeadOnly && !layer.is_head() {
            continue;
        }
        match adapters.get_mut(&layer.name) {
            Some(adapter) => {
                let (grad_a, grad_b) = adapter.gradients(grads.weights[i].view());
                if train_down {
                    optimizer.step(
                        &format!("{}.lora_a", layer.name),
                        adapter.a.view_mut().into_dyn(),
                        grad_a.view().into_dyn(),
                    );
                }
                optimizer.step(
                    &format!("{}.lora_b", layer.name),
                    adapter.b.view_mut().into_dyn(),
                    grad_b.view().into_dyn(),
                );
            }
            None if layer.is_head() => {
                let (weight_key, bias_key) = param_keys(&layer.name);
                optimizer.step(
                    &weight_key,
                    layer.weight.view_mut().into_dyn(),
                    grads.weights[i].view().into_dyn(),
                );
                optimizer.step(
                    &bias_key,
                    layer.bias.view_mut().into_dyn(),
                    grads.biases[i].view().into_dyn(),
                );
            }
            None => {}
        }
    }
}

/// Averages the heads reported by the clients.
pub(crate) fn average_heads(
    previous: &Linear,
    heads: &[Option<&Linear>],
    clients: &[ClientInfo],
    weights: &ClientWeights,
) -> Result<Linear, MergeError> {
    let mut weight = WeightedAverage::<Ix2>::new();
    let mut bias = WeightedAverage::<Ix1>::new();
    for ((head, client), &w) in heads.iter().zip(clients).zip(weights.iter()) {
        let head = head.ok_or_else(|| MergeError::MissingStatistics {
            client: client.client_id,
            layer: HEAD.to_string(),
        })?;
        weight.try_aggregate(w, head.weight.view())?;
        bias.try_aggregate(w, head.bias.view())?;
    }
    Ok(Linear {
        name: previous.name.clone(),
        weight: weight.average().unwrap_or_else(|| previous.weight.clone()),
        bias: bias.average().unwrap_or_else(|| previous.bias.clone()),
    })
}

/// Regression-merges a layer from per-client weights and Grams, with `fallback` for degenerate
/// Grams.
pub(crate) fn regression_merge<'a>(
    layer: &str,
    contributions: impl Iterator<Item = (&'a ClientInfo, Array2<f32>)>,
    grams: &[&Grams],
    settings: &RegMeanSettings,
    fallback: &Array2<f32>,
) -> Result<Array2<f32>, MergeError> {
    let mut regression = RegMeanLayer::new();
    for ((client, weight), client_grams) in contributions.zip(grams) {
        let gram = client_grams
            .get(layer)
            .ok_or_else(|| MergeError::MissingStatistics {
                client: client.client_id,
                layer: layer.to_string(),
            })?;
        regression.try_aggregate(weight.view(), gram.view(), client.num_train_samples)?;
    }
    Ok(regression.solve(settings.inverse, fallback.view()))
}

#[derive(Debug, Clone)]
/// A client training low-rank adapters.
pub struct LoraClient {
    settings: LoraSettings,
    adapters: BTreeMap<String, LowRank>,
    old: BTreeMap<String, Array2<f32>>,
    grams: Grams,
}

impl LoraClient {
    pub fn new<N: Network>(settings: LoraSettings, _network: &N) -> Self {
        Self {
            settings,
            adapters: BTreeMap::new(),
            old: BTreeMap::new(),
            grams: Grams::new(),
        }
    }
}

impl<N: Network> ClientStrategy<N> for LoraClient {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lora
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
                self.grams.clear();
                Ok(())
            }
            other => Err(other.mismatch("adapter")),
        }
    }

    fn overlay(&self, _network: &N) -> WeightOverlay {
        train_overlay(self.settings.cl_merge, &self.old, deltas(&self.adapters))
    }

    fn step(
        &mut self,
        network: &mut N,
        grads: &Gradients,
        optimizer: &mut Optimizer,
        scope: TrainScope,
    ) {
        adapter_step(
            network,
            &mut self.adapters,
            grads,
            optimizer,
            scope,
            !self.settings.freeze_a,
        )
    }

    fn end_round(&mut self, network: &N, ctx: RoundContext<'_>) -> Result<(), MergeError> {
        if let Some(regmean) = &self.settings.regmean {
            let mut layers: Vec<String> = self.adapters.keys().cloned().collect();
            layers.push(HEAD.to_string());
            let overlay = ClientStrategy::<N>::overlay(self, network);
            self.grams = collect_grams(network, &overlay, ctx.data, &layers, regmean, ctx.rng);
        }
        Ok(())
    }

    fn client_info(&self, network: &N) -> ClientPayload {
        ClientPayload::Adapter {
            adapters: self.adapters.clone(),
            head: if self.settings.lora_head {
                None
            } else {
                Some(network.head().clone())
            },
            grams: self.grams.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LoraState {
    adapters: BTreeMap<String, LowRank>,
    continual: ContinualDelta,
}

#[derive(Debug, Clone)]
/// A server merging low-rank adapters and folding them across tasks.
pub struct LoraServer {
    settings: LoraSettings,
    shapes: Vec<(String, usize, usize)>,
    state: LoraState,
    rng: ChaCha20Rng,
}

impl LoraServer {
    pub fn new<N: Network>(settings: LoraSettings, network: &N) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(settings.seed);
        let shapes = adapted_layers(network, settings.lora_head);
        let adapters = init_adapters(&shapes, settings.rank, &mut rng);
        let continual = ContinualDelta::new(settings.cl_merge, 0.);
        Self {
            settings,
            shapes,
            state: LoraState {
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
        reports: &[(&BTreeMap<String, LowRank>, Option<&Linear>, &Grams)],
        clients: &[ClientInfo],
        weights: &ClientWeights,
    ) -> Result<LowRank, MergeError> {
        let mut adapters = Vec::with_capacity(reports.len());
        for ((client_adapters, _, _), client) in reports.iter().zip(clients) {
            let adapter = client_adapters
                .get(name)
                .ok_or_else(|| MergeError::MissingStatistics {
                    client: client.client_id,
                    layer: name.to_string(),
                })?;
            adapters.push(adapter);
        }

        let mut a = WeightedAverage::<Ix2>::new();
        let mut b = WeightedAverage::<Ix2>::new();
        for (adapter, &w) in adapters.iter().zip(weights.iter()) {
            a.try_aggregate(w, adapter.a.view())?;
            b.try_aggregate(w, adapter.b.view())?;
        }
        let averaged = LowRank {
            a: a.average().unwrap_or_else(|| previous.a.clone()),
            b: b.average().unwrap_or_else(|| previous.b.clone()),
        };

        let regmean = match &self.settings.regmean {
            Some(regmean) => regmean,
            None => return Ok(averaged),
        };
        let mut products = WeightedAverage::<Ix2>::new();
        for (adapter, &w) in adapters.iter().zip(weights.iter()) {
            products.try_aggregate(w, adapter.delta().view())?;
        }
        let fallback = products.average().unwrap_or_else(|| averaged.delta());
        let grams: Vec<&Grams> = reports.iter().map(|(_, _, grams)| *grams).collect();
        let target = regression_merge(
            name,
            clients.iter().zip(adapters.iter().map(|a| a.delta())),
            &grams,
            regmean,
            &fallback,
        )?;
        match factorize(
            target.mapv(f64::from).view(),
            &averaged,
            self.settings.alternating_iters,
        ) {
            Ok(adapter) => Ok(adapter),
            Err(err) => {
                warn!("factorizing the merged delta of {} failed ({}): keeping the averaged factors", name, err);
                Ok(averaged)
            }
        }
    }
}

impl<N: Network> ServerStrategy<N> for LoraServer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lora
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
                ClientPayload::Adapter {
                    adapters,
                    head,
                    grams,
                } => Ok((adapters, head.as_ref(), grams)),
                other => Err(other.mismatch("adapter")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let weights = sample_weights(clients, Weighting::Samples);

        let mut merged = BTreeMap::new();
        for (name, previous) in &self.state.adapters {
            let adapter = self.merge_adapter(name, previous, &reports, clients, &weights)?;
            merged.insert(name.clone(), adapter);
        }
        self.state.adapters = merged;

        if !self.settings.lora_head {
            let heads: Vec<_> = reports.iter().map(|(_, head, _)| *head).collect();
            let mut head = average_heads(network.head(), &heads, clients, &weights)?;
            if let Some(regmean) = &self.settings.regmean {
                let grams: Vec<&Grams> = reports.iter().map(|(_, _, grams)| *grams).collect();
                let weights = heads.iter().flatten().map(|h| h.weight.clone());
                head.weight = regression_merge(
                    HEAD,
                    clients.iter().zip(weights),
                    &grams,
                    regmean,
                    &network.head().weight,
                )?;
            }
            *network.head_mut() = head;
        }
        debug!("merged {} adapters", self.state.adapters.len());
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

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1};

    use super::*;
    use crate::{
        model::Mlp,
        strategy::{adapter::ContinualMerge, tests::info},
    };

    fn settings() -> LoraSettings {
        LoraSettings {
            rank: 1,
            lora_head: false,
            cl_merge: ContinualMerge::RunMean,
            regmean: None,
            alternating_iters: 2,
            freeze_a: false,
            seed: 0,
        }
    }

    fn single(name: &str, a: Array2<f32>, b: Array2<f32>) -> BTreeMap<String, LowRank> {
        vec![(name.to_string(), LowRank { a, b })].into_iter().collect()
    }

    fn network() -> Mlp {
        Mlp::new(2, &[2], 2, 0)
    }

    #[test]
    fn test_factors_are_averaged_separately() {
        let mut net = network();
        let mut server = LoraServer::new(settings(), &net);
        let head = net.head().clone();
        let clients = vec![
            info(
                0,
                10,
                ClientPayload::Adapter {
                    adapters: single("blocks.0", array![[1., 1.]], array![[2.], [2.]]),
                    head: Some(head.clone()),
                    grams: Grams::new(),
                },
            ),
            info(
                1,
                10,
                ClientPayload::Adapter {
                    adapters: single("blocks.0", array![[3., 3.]], array![[4.], [4.]]),
                    head: Some(head),
                    grams: Grams::new(),
                },
            ),
        ];
        server
            .merge(&mut net, &clients, &TaskCounters::new())
            .unwrap();
        let merged = &server.state.adapters["blocks.0"];
        assert_eq!(merged.a, array![[2., 2.]]);
        assert_eq!(merged.b, array![[3.], [3.]]);
        // not the average of the products, which would be 7
        assert_eq!(merged.delta(), Array2::from_elem((2, 2), 6.));
    }

    #[test]
    fn test_missing_head_is_reported() {
        let mut net = network();
        let mut server = LoraServer::new(settings(), &net);
        let adapters = server.state.adapters.clone();
        let clients = vec![info(
            4,
            1,
            ClientPayload::Adapter {
                adapters,
                head: None,
                grams: Grams::new(),
            },
        )];
        let err = server
            .merge(&mut net, &clients, &TaskCounters::new())
            .unwrap_err();
        assert!(matches!(err, MergeError::MissingStatistics { client: 4, .. }));
    }

    #[test]
    fn test_new_task_folds_and_reinitializes() {
        let mut net = network();
        let mut server = LoraServer::new(settings(), &net);
        server.state.adapters = single("blocks.0", array![[1., 0.]], array![[1.], [1.]]);
        let mut counters = TaskCounters::new();
        counters.begin_task(1);
        ServerStrategy::<Mlp>::begin_task(&mut server, &mut net, &counters);
        assert_eq!(server.state.continual.tasks(), 0);

        counters.begin_task(1);
        ServerStrategy::<Mlp>::begin_task(&mut server, &mut net, &counters);
        assert_eq!(server.state.continual.tasks(), 1);
        assert_eq!(
            server.state.continual.old()["blocks.0"],
            array![[1., 0.], [1., 0.]]
        );
        // fresh adapters have a vanishing delta
        assert!(server
            .state
            .adapters
            .values()
            .all(|a| a.delta().iter().all(|&x| x == 0.)));
    }

    #[test]
    fn test_client_trains_adapters_only() {
        let mut net = network();
        let server = LoraServer::new(settings(), &net);
        let mut client = LoraClient::new(settings(), &net);
        let payload = ServerStrategy::<Mlp>::server_info(&server, &net);
        client.load(&mut net, &payload).unwrap();
        let before = net.clone();

        let overlay = ClientStrategy::<Mlp>::overlay(&client, &net);
        let inputs = array![[1., -1.], [0.5, 2.]];
        let pass = net.forward(inputs.view(), &overlay);
        let grads = net.backward(&pass, array![[1., -1.], [1., -1.]].view(), &overlay);
        let mut optimizer = Optimizer::sgd(0.1, 0.);
        client.step(&mut net, &grads, &mut optimizer, TrainScope::Full);

        assert_eq!(net.layers()[0], before.layers()[0]);
        assert_ne!(net.head(), before.head());
        assert!(optimizer.keys().any(|k| k == "blocks.0.lora_b"));
        assert!(optimizer.keys().any(|k| k == "head.weight"));
    }

    #[test]
    fn test_frozen_down_projections_keep_the_broadcast_value() {
        let mut net = network();
        let frozen = LoraSettings {
            freeze_a: true,
            ..settings()
        };
        let server = LoraServer::new(frozen.clone(), &net);
        let mut client = LoraClient::new(frozen, &net);
        let payload = ServerStrategy::<Mlp>::server_info(&server, &net);
        client.load(&mut net, &payload).unwrap();
        let broadcast = client.adapters["blocks.0"].clone();

        let grads = Gradients {
            weights: vec![Array2::eye(2), Array2::ones((2, 2))],
            biases: vec![Array1::ones(2), Array1::ones(2)],
        };
        let mut optimizer = Optimizer::sgd(0.1, 0.);
        // after the first step B is non-zero, so A receives a gradient too
        for _ in 0..2 {
            client.step(&mut net, &grads, &mut optimizer, TrainScope::Full);
        }

        let trained = &client.adapters["blocks.0"];
        assert_eq!(trained.a, broadcast.a);
        assert_ne!(trained.b, broadcast.b);
        assert!(!optimizer.keys().any(|k| k == "blocks.0.lora_a"));
        assert!(optimizer.keys().any(|k| k == "head.weight"));
    }

    #[test]
    fn test_regression_hybrid_recovers_a_rank_one_target() {
        let mut net = network();
        let mut server = LoraServer::new(
            LoraSettings {
                regmean: Some(RegMeanSettings::default()),
                ..settings()
            },
            &net,
        );
        let head = net.head().clone();
        let identity: Grams = vec![
            ("blocks.0".to_string(), Array2::eye(2)),
            (HEAD.to_string(), Array2::eye(2)),
        ]
        .into_iter()
        .collect();
        let payload = |b: Array2<f32>| ClientPayload::Adapter {
            adapters: single("blocks.0", array![[1., 2.]], b),
            head: Some(head.clone()),
            grams: identity.clone(),
        };
        let clients = vec![
            info(0, 10, payload(array![[1.], [0.]])),
            info(1, 30, payload(array![[0.], [1.]])),
        ];
        server
            .merge(&mut net, &clients, &TaskCounters::new())
            .unwrap();
        // equal Grams: the regression target is the plain mean of the products
        let expected = array![[0.5, 1.], [0.5, 1.]];
        let delta = server.state.adapters["blocks.0"].delta();
        for (x, y) in delta.iter().zip(expected.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
        assert_eq!(net.head().weight.dim(), head.weight.dim());
    }
}
