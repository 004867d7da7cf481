use std::{path::PathBuf, sync::Arc};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    checkpoint::{Checkpoint, CheckpointError},
    client::ClientModel,
    data::DataSource,
    lifecycle::LifecycleError,
    model::{Mlp, Network},
    server::ServerModel,
    settings::{
        CheckpointSettings,
        FederationSettings,
        NetworkSettings,
        OptimizerSettings,
        StrategySettings,
    },
    state_machine::{
        phases::{Idle, PhaseState, Shared},
        StateMachine,
    },
    strategy::{client_strategy, server_strategy},
};

#[derive(Debug, Error)]
/// Errors which can occur while building a [`StateMachine`].
pub enum StateMachineInitializationError {
    #[error("restoring the checkpoint failed: {0}")]
    Restore(#[from] CheckpointError),
    #[error("resuming the clients failed: {0}")]
    Resume(#[from] LifecycleError),
}

/// Builds the global model, the clients and the initial state of a run.
pub struct StateMachineInitializer {
    federation: FederationSettings,
    optimizer: OptimizerSettings,
    network: NetworkSettings,
    strategy: StrategySettings,
    checkpoint: CheckpointSettings,
    data: Arc<dyn DataSource>,
    restore: Option<PathBuf>,
}

impl StateMachineInitializer {
    /// Creates a new [`StateMachineInitializer`].
    pub fn new(
        federation: FederationSettings,
        optimizer: OptimizerSettings,
        network: NetworkSettings,
        strategy: StrategySettings,
        checkpoint: CheckpointSettings,
        data: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            federation,
            optimizer,
            network,
            strategy,
            checkpoint,
            data,
            restore: None,
        }
    }

    /// Resumes the run from a checkpoint written by the same strategy.
    pub fn restore_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.restore = Some(path.into());
        self
    }

    /// Initializes a new [`StateMachine`] in the idle state.
    ///
    /// # Errors
    /// Fails if the checkpoint to resume from can't be restored.
    pub fn init(self) -> Result<StateMachine<Mlp>, StateMachineInitializationError> {
        let classes: usize = (0..self.data.num_tasks())
            .map(|task| self.data.classes_in_task(task))
            .sum();
        let network = Mlp::new(
            self.data.input_dim(),
            &self.network.hidden,
            classes,
            self.network.seed,
        );
        debug!(
            "initialized a network with {} parameters",
            network.num_parameters()
        );

        let seed = self.federation.seed;
        let strategy = server_strategy(&self.strategy, &network, seed);
        let mut server = ServerModel::new(network.clone(), strategy);
        let mut clients: Vec<_> = (0..self.data.num_clients())
            .map(|id| {
                ClientModel::new(
                    id,
                    network.clone(),
                    client_strategy(&self.strategy, &network, id),
                    self.optimizer,
                    self.federation.label_scheme,
                    seed,
                )
            })
            .collect();

        if let Some(path) = &self.restore {
            server.restore(Checkpoint::load(path)?)?;
            for client in clients.iter_mut() {
                client.resume(server.counters().clone())?;
            }
            info!("resuming from {}", path.display());
        }

        let shared = Shared::new(
            self.federation,
            self.checkpoint,
            self.data,
            server,
            clients,
            ChaCha20Rng::seed_from_u64(seed),
        );
        Ok(PhaseState::<Idle, _>::new(shared).into())
    }
}
