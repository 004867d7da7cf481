use tracing::{debug, info};

use crate::{
    model::Network,
    state_machine::{
        phases::{BeginTask, Phase, PhaseError, PhaseName, PhaseState, Shared, Shutdown},
        StateMachine,
    },
};

/// The task end state.
#[derive(Debug)]
pub struct EndTask;

impl<N: Network + 'static> Phase<N> for PhaseState<EndTask, N> {
    const NAME: PhaseName = PhaseName::EndTask;

    /// Collects the once-per-task reports, consolidates them and writes a checkpoint if one is due.
    fn process(&mut self) -> Result<(), PhaseError> {
        let shared = &mut self.shared;
        let task = shared.server.counters().cur_task().unwrap_or(0);

        let mut reports = Vec::new();
        for client in shared.clients.iter_mut() {
            let local = shared.data.train_set(task, client.id());
            if let Some(report) = client.end_task_client(&local)? {
                reports.push(report);
            }
        }
        debug!("{} task reports", reports.len());
        shared.server.end_task_server(&reports)?;

        if shared.checkpoint.is_due(task, shared.data.num_tasks()) {
            if let Some(directory) = &shared.checkpoint.directory {
                let path = directory.join(format!("task_{}.ckpt", task));
                shared.server.checkpoint()?.save(&path)?;
                info!("checkpoint written to {}", path.display());
            }
        }
        Ok(())
    }

    fn next(self) -> Option<StateMachine<N>> {
        Some(if self.shared.has_next_task() {
            PhaseState::<BeginTask, _>::new(self.shared).into()
        } else {
            PhaseState::<Shutdown, _>::new(self.shared, None).into()
        })
    }
}

impl<N: Network> PhaseState<EndTask, N> {
    /// Creates a new task end state.
    pub fn new(shared: Shared<N>) -> Self {
        Self {
            private: EndTask,
            shared,
        }
    }
}
