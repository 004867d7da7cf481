//! The merge strategies.
//!
//! A strategy comes in two halves that agree on a payload schema: a [`ClientStrategy`] decides
//! which tensors a client trains and what it reports, a [`ServerStrategy`] merges the reports
//! into the global model and owns every piece of state that outlives a round. Both halves are
//! selected from the same [`StrategySettings`] by [`client_strategy()`] and [`server_strategy()`].

pub mod adapter;
pub mod cocoavg;
pub mod fedavg;
pub mod fisher;
pub mod hgp;
pub mod lora;
pub mod regmean;
pub mod vera;

use std::{collections::BTreeMap, fmt::Debug};

use ndarray::{Array1, ArrayView1, ArrayView2, Ix1};
use rand_chacha::ChaCha20Rng;

pub use self::adapter::ContinualMerge;
use crate::{
    aggregation::{average::WeightedAverage, weights::ClientWeights, MergeError},
    data::ClientDataset,
    lifecycle::TaskCounters,
    linalg,
    model::{
        Gradients,
        LabelScheme,
        Network,
        Optimizer,
        ParameterVector,
        ShapeMismatch,
        TaskWindow,
        WeightOverlay,
    },
    payload::{ClientInfo, ClientPayload, Grams, ServerPayload},
    settings::{RegMeanSettings, StrategyKind, StrategySettings},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The subset of the model a training step may update.
pub enum TrainScope {
    /// Everything the strategy trains.
    Full,
    /// Only the classification head (linear probing).
    HeadOnly,
}

/// The local view of a client on its data at the end of a round or task.
pub struct RoundContext<'a> {
    /// The local training data of the current task.
    pub data: &'a ClientDataset,
    /// The head window of the current task.
    pub window: TaskWindow,
    pub scheme: LabelScheme,
    pub rng: &'a mut ChaCha20Rng,
    /// The labels observed during the round and how often.
    pub seen: &'a BTreeMap<usize, u64>,
}

/// The client half of a merge strategy.
pub trait ClientStrategy<N: Network>: Send + Debug {
    /// The name of the strategy.
    fn kind(&self) -> StrategyKind;

    /// Resets the per-task state.
    fn begin_task(&mut self, _network: &N, _counters: &TaskCounters) {}

    /// Loads the broadcast global state into the local model.
    ///
    /// # Errors
    /// Fails if the payload belongs to another strategy or does not fit the local model.
    fn load(&mut self, network: &mut N, payload: &ServerPayload) -> Result<(), MergeError>;

    /// The transient weight deltas of the training forward pass.
    fn overlay(&self, _network: &N) -> WeightOverlay {
        WeightOverlay::new()
    }

    /// Applies one optimizer step to the trainable tensors.
    fn step(
        &mut self,
        network: &mut N,
        grads: &Gradients,
        optimizer: &mut Optimizer,
        scope: TrainScope,
    );

    /// Collects the statistics which require a full pass over the local data.
    ///
    /// # Errors
    /// Fails if a statistic can't be computed.
    fn end_round(&mut self, _network: &N, _ctx: RoundContext<'_>) -> Result<(), MergeError> {
        Ok(())
    }

    /// Serializes what the server half needs for the merge of a round.
    fn client_info(&self, network: &N) -> ClientPayload;

    /// Computes the once-per-task artifacts, if the strategy has any.
    ///
    /// # Errors
    /// Fails if an artifact can't be computed.
    fn end_task(
        &mut self,
        _network: &N,
        _ctx: RoundContext<'_>,
    ) -> Result<Option<ClientPayload>, MergeError> {
        Ok(None)
    }

    /// The number of head-only epochs at the first round of a task.
    fn linear_probe_epochs(&self) -> usize {
        0
    }
}

/// The server half of a merge strategy.
pub trait ServerStrategy<N: Network>: Send + Debug {
    /// The name of the strategy.
    fn kind(&self) -> StrategyKind;

    /// Consolidates the previous task, if any, and prepares the new one.
    fn begin_task(&mut self, _network: &mut N, _counters: &TaskCounters) {}

    /// Reinitializes per-round state.
    fn begin_round(&mut self, _network: &mut N, _counters: &TaskCounters) {}

    /// The global state broadcast to the clients.
    fn server_info(&self, network: &N) -> ServerPayload;

    /// The transient weight deltas the global model is evaluated with.
    fn eval_overlay(&self, _network: &N) -> WeightOverlay {
        WeightOverlay::new()
    }

    /// Merges the reports of a round into the global model.
    ///
    /// # Errors
    /// Fails if a report belongs to another strategy or does not fit the global model.
    fn merge(
        &mut self,
        network: &mut N,
        clients: &[ClientInfo],
        counters: &TaskCounters,
    ) -> Result<(), MergeError>;

    /// Consolidates the once-per-task reports at the end of a task.
    ///
    /// # Errors
    /// Fails if a report belongs to another strategy.
    fn end_task(
        &mut self,
        _network: &mut N,
        _clients: &[ClientInfo],
        _counters: &TaskCounters,
    ) -> Result<(), MergeError> {
        Ok(())
    }

    /// The persistent optimizer of the server, if the strategy keeps one.
    fn optimizer(&self) -> Option<&Optimizer> {
        None
    }

    /// Restores the persistent optimizer of the server.
    fn restore_optimizer(&mut self, _optimizer: Optimizer) {}

    /// Encodes the strategy specific persistent state.
    ///
    /// # Errors
    /// Fails if the state can't be encoded.
    fn save_extra(&self) -> Result<Vec<u8>, bincode::Error>;

    /// Restores the strategy specific persistent state.
    ///
    /// # Errors
    /// Fails if the bytes were not produced by the same strategy.
    fn load_extra(&mut self, bytes: &[u8]) -> Result<(), bincode::Error>;
}

/// Creates the client half of the configured strategy.
pub fn client_strategy<N: Network + 'static>(
    settings: &StrategySettings,
    network: &N,
    client_id: usize,
) -> Box<dyn ClientStrategy<N>> {
    match settings {
        StrategySettings::FedAvg(_) => Box::new(fedavg::FedAvgClient),
        StrategySettings::CocoAvg(s) => Box::new(cocoavg::CocoAvgClient::new(s.clone(), network)),
        StrategySettings::RegMean(s) => Box::new(regmean::RegMeanClient::new(s.clone())),
        StrategySettings::Lora(s) => Box::new(lora::LoraClient::new(s.clone(), network)),
        StrategySettings::Vera(s) => Box::new(vera::VeraClient::new(s.clone(), network)),
        StrategySettings::LoraFisher(s) => {
            Box::new(fisher::FisherClient::new(s.clone(), network, client_id))
        }
        StrategySettings::Hgp(s) => Box::new(hgp::HgpClient::new(s.clone())),
    }
}

/// Creates the server half of the configured strategy.
pub fn server_strategy<N: Network + 'static>(
    settings: &StrategySettings,
    network: &N,
    seed: u64,
) -> Box<dyn ServerStrategy<N>> {
    match settings {
        StrategySettings::FedAvg(s) => Box::new(fedavg::FedAvgServer::new(s.weighting)),
        StrategySettings::CocoAvg(s) => Box::new(cocoavg::CocoAvgServer::new(s.clone())),
        StrategySettings::RegMean(s) => Box::new(regmean::RegMeanServer::new(s.clone())),
        StrategySettings::Lora(s) => Box::new(lora::LoraServer::new(s.clone(), network)),
        StrategySettings::Vera(s) => Box::new(vera::VeraServer::new(s.clone(), network)),
        StrategySettings::LoraFisher(s) => Box::new(fisher::FisherServer::new(s.clone(), network)),
        StrategySettings::Hgp(s) => Box::new(hgp::HgpServer::new(s.clone(), seed)),
    }
}

/// The parameter names of the weight and bias of a layer.
pub(crate) fn param_keys(layer: &str) -> (String, String) {
    (format!("{}.weight", layer), format!("{}.bias", layer))
}

/// Steps the weights and biases of every layer in scope.
pub(crate) fn full_step<N: Network>(
    network: &mut N,
    grads: &Gradients,
    optimizer: &mut Optimizer,
    scope: TrainScope,
) {
    for (i, layer) in network.layers_mut().iter_mut().enumerate() {
        if scope == TrainScope::HeadOnly && !layer.is_head() {
            continue;
        }
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
}

/// Flattens gradients in the traversal order of [`ParameterVector::flatten()`].
pub(crate) fn flatten_gradients(grads: &Gradients) -> Array1<f32> {
    grads
        .weights
        .iter()
        .zip(&grads.biases)
        .flat_map(|(w, b)| w.iter().chain(b.iter()).copied().collect::<Vec<_>>())
        .collect()
}

/// The sample based weights of the reporting clients.
pub(crate) fn sample_weights(
    clients: &[ClientInfo],
    weighting: crate::aggregation::weights::Weighting,
) -> ClientWeights {
    let counts: Vec<usize> = clients.iter().map(|c| c.num_train_samples).collect();
    ClientWeights::from_samples(&counts, weighting)
}

/// Checks that a parameter vector fits the network.
pub(crate) fn check_len<N: Network>(
    network: &N,
    params: &ParameterVector,
) -> Result<(), ShapeMismatch> {
    let expected = network.num_parameters();
    if params.len() == expected {
        Ok(())
    } else {
        Err(ShapeMismatch {
            expected,
            actual: params.len(),
        })
    }
}

/// Averages full parameter vectors into the network.
pub(crate) fn average_into<N: Network>(
    network: &mut N,
    params: &[&ParameterVector],
    weights: &ClientWeights,
) -> Result<(), MergeError> {
    let mut average = WeightedAverage::<Ix1>::new();
    for (p, &w) in params.iter().zip(weights.iter()) {
        check_len(network, p)?;
        average.try_aggregate(w, ArrayView1::from(p.as_slice()))?;
    }
    if let Some(merged) = average.average() {
        ParameterVector::from(merged.to_vec()).unflatten(network)?;
    }
    Ok(())
}

/// Splits a parameter vector of the network into per-layer weight and bias views.
pub(crate) fn layer_views<'a, N: Network>(
    network: &N,
    params: &'a ParameterVector,
) -> Result<Vec<(ArrayView2<'a, f32>, ArrayView1<'a, f32>)>, MergeError> {
    check_len(network, params)?;
    let mut views = Vec::with_capacity(network.layers().len());
    let mut rest = params.as_slice();
    for layer in network.layers() {
        let (weight, tail) = rest.split_at(layer.weight.len());
        let (bias, tail) = tail.split_at(layer.bias.len());
        rest = tail;
        let weight = ArrayView2::from_shape(layer.weight.raw_dim(), weight).map_err(|_| {
            MergeError::Shape(ShapeMismatch {
                expected: layer.weight.len(),
                actual: weight.len(),
            })
        })?;
        views.push((weight, ArrayView1::from(bias)));
    }
    Ok(views)
}

/// Accumulates the damped input Gram matrices of the given layers over a fraction of the data.
///
/// The layers are looked up by name; unknown names are skipped.
pub(crate) fn collect_grams<N: Network>(
    network: &N,
    overlay: &WeightOverlay,
    data: &ClientDataset,
    layers: &[String],
    settings: &RegMeanSettings,
    rng: &mut ChaCha20Rng,
) -> Grams {
    let subset = data.subset(settings.gram_fraction, rng);
    let pass = network.forward(subset.inputs.view(), overlay);
    network
        .layers()
        .iter()
        .enumerate()
        .filter(|(_, layer)| layers.contains(&layer.name))
        .map(|(i, layer)| {
            let alpha = if layer.is_head() {
                settings.alpha_head
            } else {
                settings.alpha_backbone
            };
            let mut gram = linalg::damp(&linalg::gram(pass.inputs[i].view()), alpha);
            settings.precision.round(&mut gram);
            (layer.name.clone(), gram)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use ndarray::array;

    use super::*;
    use crate::{
        aggregation::weights::Weighting,
        model::{Linear, Mlp, HEAD},
    };

    /// A network with a single `1 x 1` head, i.e. two parameters.
    pub fn tiny() -> Mlp {
        Mlp::from_layers(vec![Linear {
            name: HEAD.to_string(),
            weight: array![[0.]],
            bias: array![0.],
        }])
    }

    pub fn info(client_id: usize, num_train_samples: usize, payload: ClientPayload) -> ClientInfo {
        ClientInfo {
            client_id,
            num_train_samples,
            payload,
        }
    }

    #[test]
    fn test_average_into_with_sample_weights() {
        let mut net = tiny();
        let a = ParameterVector::from(vec![1., 1.]);
        let b = ParameterVector::from(vec![0., 0.]);
        let weights = ClientWeights::from_samples(&[80, 20], Weighting::Samples);
        average_into(&mut net, &[&a, &b], &weights).unwrap();
        let merged = ParameterVector::flatten(&net);
        assert!(merged.iter().all(|x| (x - 0.8).abs() < 1e-6));
    }

    #[test]
    fn test_average_into_rejects_wrong_length() {
        let mut net = tiny();
        let wrong = ParameterVector::from(vec![1.; 3]);
        let err = average_into(&mut net, &[&wrong], &ClientWeights::uniform(1)).unwrap_err();
        assert!(matches!(
            err,
            MergeError::Shape(ShapeMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_layer_views() {
        let net = Mlp::new(2, &[3], 2, 0);
        let params = ParameterVector::flatten(&net);
        let views = layer_views(&net, &params).unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].0, net.layers()[0].weight.view());
        assert_eq!(views[1].1, net.head().bias.view());
    }

    #[test]
    fn test_flatten_gradients_matches_parameter_order() {
        let net = Mlp::new(2, &[3], 2, 0);
        let grads = Gradients {
            weights: net.layers().iter().map(|l| l.weight.clone()).collect(),
            biases: net.layers().iter().map(|l| l.bias.clone()).collect(),
        };
        assert_eq!(
            flatten_gradients(&grads).to_vec(),
            ParameterVector::flatten(&net).as_slice().to_vec()
        );
    }

    #[test]
    fn test_head_only_step_keeps_backbone() {
        let mut net = Mlp::new(2, &[3], 2, 0);
        let before = net.clone();
        let grads = Gradients {
            weights: net.layers().iter().map(|l| l.weight.mapv(|_| 1.)).collect(),
            biases: net.layers().iter().map(|l| l.bias.mapv(|_| 1.)).collect(),
        };
        let mut optimizer = Optimizer::sgd(0.1, 0.);
        full_step(&mut net, &grads, &mut optimizer, TrainScope::HeadOnly);
        assert_eq!(net.layers()[0], before.layers()[0]);
        assert_eq!(net.head().weight, &before.head().weight - 0.1);
    }
}
