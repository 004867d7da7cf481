use thiserror::Error;
use tracing::error;

use crate::{
    aggregation::MergeError,
    checkpoint::CheckpointError,
    client::TrainError,
    lifecycle::LifecycleError,
    model::Network,
    state_machine::{
        phases::{Phase, PhaseName, PhaseState, Shared, Shutdown},
        StateMachine,
        StateMachineError,
    },
};

/// Errors which can occur during the execution of a phase.
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("invalid setup: {0}")]
    Configuration(String),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("local training failed: {0}")]
    Train(#[from] TrainError),
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    error: Option<StateMachineError>,
}

impl<N: Network + 'static> Phase<N> for PhaseState<Failure, N> {
    const NAME: PhaseName = PhaseName::Failure;

    fn process(&mut self) -> Result<(), PhaseError> {
        if let Some(error) = &self.private.error {
            error!("phase state error: {}", error);
        }
        Ok(())
    }

    fn next(mut self) -> Option<StateMachine<N>> {
        Some(PhaseState::<Shutdown, _>::new(self.shared, self.private.error.take()).into())
    }
}

impl<N: Network> PhaseState<Failure, N> {
    /// Creates a new failure state.
    pub fn new(shared: Shared<N>, error: StateMachineError) -> Self {
        Self {
            private: Failure { error: Some(error) },
            shared,
        }
    }
}
