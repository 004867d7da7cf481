use tracing::debug;

use crate::{
    model::Network,
    state_machine::{
        phases::{Phase, PhaseError, PhaseName, PhaseState, Round, Shared},
        StateMachine,
    },
};

/// The task start state.
#[derive(Debug)]
pub struct BeginTask;

impl<N: Network + 'static> Phase<N> for PhaseState<BeginTask, N> {
    const NAME: PhaseName = PhaseName::BeginTask;

    /// Advances the server and every client to the next task.
    fn process(&mut self) -> Result<(), PhaseError> {
        let task = self.shared.next_task();
        let classes = self.shared.data.classes_in_task(task);
        let capacity = self.shared.server.network().num_classes();
        let seen = self.shared.server.counters().seen_classes();
        if seen + classes > capacity {
            return Err(PhaseError::Configuration(format!(
                "task {} needs the head outputs {}..{} but there are only {}",
                task,
                seen,
                seen + classes,
                capacity
            )));
        }

        self.shared.server.begin_task(classes)?;
        for client in self.shared.clients.iter_mut() {
            client.begin_task(classes)?;
        }
        debug!("{} clients started task {}", self.shared.clients.len(), task);
        Ok(())
    }

    fn next(self) -> Option<StateMachine<N>> {
        Some(PhaseState::<Round, _>::new(self.shared).into())
    }
}

impl<N: Network> PhaseState<BeginTask, N> {
    /// Creates a new task start state.
    pub fn new(shared: Shared<N>) -> Self {
        Self {
            private: BeginTask,
            shared,
        }
    }
}
