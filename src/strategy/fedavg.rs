//! Plain weighted averaging of the full parameter vector.

use tracing::debug;

use crate::{
    aggregation::{weights::Weighting, MergeError},
    lifecycle::TaskCounters,
    model::{Gradients, Network, Optimizer, ParameterVector},
    payload::{ClientInfo, ClientPayload, ServerPayload},
    settings::StrategyKind,
    strategy::{average_into, full_step, sample_weights, ClientStrategy, ServerStrategy, TrainScope},
};

/// Loads a full parameter vector broadcast by the server.
pub(crate) fn load_params<N: Network>(
    network: &mut N,
    payload: &ServerPayload,
) -> Result<(), MergeError> {
    match payload {
        ServerPayload::Params { params } => Ok(params.unflatten(network)?),
        other => Err(other.mismatch("params")),
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// A client training and reporting the full model.
pub struct FedAvgClient;

impl<N: Network> ClientStrategy<N> for FedAvgClient {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FedAvg
    }

    fn load(&mut self, network: &mut N, payload: &ServerPayload) -> Result<(), MergeError> {
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

    fn client_info(&self, network: &N) -> ClientPayload {
        ClientPayload::Params {
            params: ParameterVector::flatten(network),
        }
    }
}

#[derive(Debug, Clone)]
/// A server averaging the full models of the clients.
pub struct FedAvgServer {
    weighting: Weighting,
}

impl FedAvgServer {
    pub fn new(weighting: Weighting) -> Self {
        Self { weighting }
    }
}

impl<N: Network> ServerStrategy<N> for FedAvgServer {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FedAvg
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
        _counters: &TaskCounters,
    ) -> Result<(), MergeError> {
        let params = clients
            .iter()
            .map(|client| match &client.payload {
                ClientPayload::Params { params } => Ok(params),
                other => Err(other.mismatch("params")),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let weights = sample_weights(clients, self.weighting);
        debug!("averaging {} models with weights {:?}", params.len(), weights.as_slice());
        average_into(network, &params, &weights)
    }

    fn save_extra(&self) -> Result<Vec<u8>, bincode::Error> {
        Ok(Vec::new())
    }

    fn load_extra(&mut self, _bytes: &[u8]) -> Result<(), bincode::Error> {
        Ok(())
    }
}
