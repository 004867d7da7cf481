use tracing::info;

use crate::{
    model::Network,
    state_machine::{
        phases::{BeginTask, Phase, PhaseError, PhaseName, PhaseState, Shared, Shutdown},
        StateMachine,
    },
};

/// The idle state.
///
/// Checks that the federation fits the benchmark before the first task starts.
#[derive(Debug)]
pub struct Idle;

impl<N: Network + 'static> Phase<N> for PhaseState<Idle, N> {
    const NAME: PhaseName = PhaseName::Idle;

    fn process(&mut self) -> Result<(), PhaseError> {
        let shared = &self.shared;
        let data = &shared.data;
        if data.num_tasks() == 0 {
            return Err(PhaseError::Configuration(
                "the benchmark has no tasks".to_string(),
            ));
        }
        if shared.clients.len() != data.num_clients() {
            return Err(PhaseError::Configuration(format!(
                "{} clients for a benchmark partitioned among {}",
                shared.clients.len(),
                data.num_clients()
            )));
        }

        let network = shared.server.network();
        let input_dim = network
            .layers()
            .first()
            .map(|layer| layer.in_features())
            .unwrap_or(0);
        if input_dim != data.input_dim() {
            return Err(PhaseError::Configuration(format!(
                "the network expects {} input features, the benchmark provides {}",
                input_dim,
                data.input_dim()
            )));
        }

        let classes: usize = (0..data.num_tasks())
            .map(|task| data.classes_in_task(task))
            .sum();
        if classes > network.num_classes() {
            return Err(PhaseError::Configuration(format!(
                "the head has {} outputs for {} classes",
                network.num_classes(),
                classes
            )));
        }

        info!(
            "{} clients, {} tasks, {} classes, strategy {}",
            shared.clients.len(),
            data.num_tasks(),
            classes,
            shared.server.kind()
        );
        Ok(())
    }

    fn next(self) -> Option<StateMachine<N>> {
        Some(if self.shared.has_next_task() {
            PhaseState::<BeginTask, _>::new(self.shared).into()
        } else {
            info!("no tasks left");
            PhaseState::<Shutdown, _>::new(self.shared, None).into()
        })
    }
}

impl<N: Network> PhaseState<Idle, N> {
    /// Creates a new idle state.
    pub fn new(shared: Shared<N>) -> Self {
        Self {
            private: Idle,
            shared,
        }
    }
}
