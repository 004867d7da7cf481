//! VeRA: trainable scaling vectors on a frozen random basis shared by all replicas.
//!
//! Both halves regenerate the basis from `basis_seed`, only the scalings `b` and `d` travel.

use std::collections::BTreeMap;

use ndarray::{Array2, Ix1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    aggregation::{average::WeightedAverage, weights::Weighting, MergeError},
    lifecycle::TaskCounters,
    model::{Gradients, Network, Optimizer, WeightOverlay},
    payload::{ClientInfo, ClientPayload, ServerPayload},
    settings::{StrategyKind, VeraSettings},
    strategy::{
        adapter::{train_overlay, ContinualDelta, VeraBasis, VeraScaling},
        lora::{adapted_layers, average_heads, load_head},
        param_keys,
        sample_weights,
        ClientStrategy,
        ServerStrategy,
        TrainScope,
    },
};

fn fresh_scalings(
    shapes: &[(String, usize, usize)],
    settings: &VeraSettings,
) -> BTreeMap<String, VeraScaling> {
    shapes
        .iter()
        .map(|(name, _, out_features)| {
            (
                name.clone(),
                VeraScaling::new(*out_features, settings.rank, settings.d_initial),
            )
        })
        .collect()
}

fn deltas(
    basis: &BTreeMap<String, VeraBasis>,
    scalings: &BTreeMap<String, VeraScaling>,
) -> BTreeMap<String, Array2<f32>> {
    scalings
        .iter()
        .filter_map(|(name, scaling)| {
            basis
                .get(name)
                .map(|basis| (name.clone(), scaling.delta(basis)))
        })
        .collect()
}

#[derive(Debug, Clone)]
/// A client training the scaling vectors of every adapted layer.
pub struct VeraClient {
    settings: VeraSettings,
    basis: BTreeMap<String, VeraBasis>,
    scalings: BTreeMap<String, VeraScaling>,
    old: BTreeMap<String, Array2<f32>>,
}

impl VeraClient {
    pub fn new<N: Network>(settings: VeraSettings, network: &N) -> Self {
        let basis = VeraBasis::generate(
            settings.basis_seed,
            settings.rank,
            &adapted_layers(network, settings.lora_head),
        );
        Self {
            settings,
            basis,
            scalings: BTreeMap::new(),
            old: BTreeMap::new(),
        }
    }
}

impl<N: Network> ClientStrategy<N> for VeraClient {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Vera
    }

    fn load(&mut self, network: &mut N, payload: &ServerPayload) -> Result<(), MergeError> {
        match payload {
            ServerPayload::Vera {
                scalings,
                old_deltas,
                head,
            } => {
                load_head(network, head)?;
                self.scalings = scalings.clone();
                self.old = old_deltas.clone();
                Ok(())
            }
            other => Err(other.mismatch("vera")),
        }
    }

    fn overlay(&self, _network: &N) -> WeightOverlay {
        train_overlay(
            self.settings.cl_merge,
            &self.old,
            deltas(&self.basis, &self.scalings),
        )
    }

    fn step(
        &mut self,
        network: &mut N,
        grads: &Gradients,
        optimizer: &mut Optimizer,
        scope: TrainScope,
    ) {
        for (i, layer) in network.layers_mut().iter_mut().enumerate() {
            if scope == TrainScope::HeadOnly && !layer.is_head() {
                continue;
            }
            let adapted = self
                .scalings
                .get_mut(&layer.name)
                .zip(self.basis.get(&layer.name));
            match adapted {
                Some((scaling, basis)) => {
                    let (grad_b, grad_d) = scaling.gradients(basis, grads.weights[i].view());
                    optimizer.step(
                        &format!("{}.vera_b", layer.name),
                        scaling.b.view_mut().into_dyn(),
                        grad_b.view().into_dyn(),
                    );
                    optimizer.step(
                        &format!("{}.vera_d", layer.name),
                        scaling.d.view_mut().into_dyn(),
                        grad_d.view().into_dyn(),
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

    fn client_info(&self, network: &N) -> ClientPayload {
        ClientPayload::Vera {
            scalings: self.scalings.clone(),
            head: if self.settings.lora_head {
                None
            } else {
                Some(network.head().clone())
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VeraState {
    scalings: BTreeMap<String, VeraScaling>,
    continual: ContinualDelta,
}

#[derive(Debug, Clone)]
/// A server averaging the scaling vectors and folding their deltas across tasks.
pub struct VeraServer {
    settings: VeraSettings,
    shapes: Vec<(String, usize, usize)>,
    basis: BTreeMap<String, VeraBasis>,
    state: VeraState,
}

impl VeraServer {
    pub fn new<N: Network>(settings: VeraSettings, network: &N) -> Self {
        let shapes = adapted_layers(network, settings.lora_head);
        let basis = VeraBasis::generate(settings.basis_seed, settings.rank, &shapes);
        let state = VeraState {
            scalings: fresh_scalings(&shapes, &settings),
            continual: ContinualDelta::new(settings.cl_merge, 0.),
        };
        Self {
            settings,
            shapes,
            basis,
            state,
        }
    }
}

impl<N: Network> ServerStrategy<N> for VeraServer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Vera
    }

    fn begin_task(&mut self, _network: &mut N, counters: &TaskCounters) {
        if counters.cur_task().unwrap_or(0) > 0 {
            let deltas = deltas(&self.basis, &self.state.scalings);
            self.state.continual.fold(&deltas);
            self.state.scalings = fresh_scalings(&self.shapes, &self.settings);
        }
    }

    fn server_info(&self, network: &N) -> ServerPayload {
        ServerPayload::Vera {
            scalings: self.state.scalings.clone(),
            old_deltas: self.state.continual.old().clone(),
            head: network.head().clone(),
        }
    }

    fn eval_overlay(&self, _network: &N) -> WeightOverlay {
        self.state
            .continual
            .eval_overlay(deltas(&self.basis, &self.state.scalings))
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
                ClientPayload::Vera { scalings, head } => Ok((scalings, head.as_ref())),
                other => Err(other.mismatch("vera")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let weights = sample_weights(clients, Weighting::Samples);

        for (name, scaling) in self.state.scalings.iter_mut() {
            let mut b = WeightedAverage::<Ix1>::new();
            let mut d = WeightedAverage::<Ix1>::new();
            for (((scalings, _), client), &w) in reports.iter().zip(clients).zip(weights.iter()) {
                let reported = scalings
                    .get(name)
                    .ok_or_else(|| MergeError::MissingStatistics {
                        client: client.client_id,
                        layer: name.clone(),
                    })?;
                b.try_aggregate(w, reported.b.view())?;
                d.try_aggregate(w, reported.d.view())?;
            }
            if let (Some(b), Some(d)) = (b.average(), d.average()) {
                *scaling = VeraScaling { b, d };
            }
        }

        if !self.settings.lora_head {
            let heads: Vec<_> = reports.iter().map(|(_, head)| *head).collect();
            let head = average_heads(network.head(), &heads, clients, &weights)?;
            *network.head_mut() = head;
        }
        debug!("merged {} scaling pairs", self.state.scalings.len());
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
