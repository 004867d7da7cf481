use std::{fmt, sync::Arc};

use derive_more::Display;
use rand_chacha::ChaCha20Rng;
use tracing::{error_span, info, warn};

use crate::{
    client::ClientModel,
    data::DataSource,
    model::Network,
    server::ServerModel,
    settings::{CheckpointSettings, FederationSettings},
    state_machine::{
        phases::{Failure, PhaseError},
        RunReport,
        StateMachine,
        StateMachineError,
    },
};

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
/// The name of a phase of the simulation.
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "BeginTask")]
    BeginTask,
    #[display(fmt = "Round")]
    Round,
    #[display(fmt = "EndTask")]
    EndTask,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Shutdown")]
    Shutdown,
}

/// A trait that must be implemented by a state in order to move to a next state.
pub trait Phase<N: Network> {
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    fn process(&mut self) -> Result<(), PhaseError>;

    /// Logs the outcome of the phase.
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    fn next(self) -> Option<StateMachine<N>>;
}

/// The state shared by all phases.
pub struct Shared<N: Network> {
    pub(in crate::state_machine) federation: FederationSettings,
    pub(in crate::state_machine) checkpoint: CheckpointSettings,
    pub(in crate::state_machine) data: Arc<dyn DataSource>,
    pub(in crate::state_machine) server: ServerModel<N>,
    pub(in crate::state_machine) clients: Vec<ClientModel<N>>,
    /// Drives the participant sampling.
    pub(in crate::state_machine) rng: ChaCha20Rng,
    pub(in crate::state_machine) report: RunReport,
}

impl<N: Network> fmt::Debug for Shared<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("federation", &self.federation)
            .field("checkpoint", &self.checkpoint)
            .field("server", &self.server)
            .field("clients", &self.clients.len())
            .field("report", &self.report)
            .finish()
    }
}

impl<N: Network> Shared<N> {
    pub fn new(
        federation: FederationSettings,
        checkpoint: CheckpointSettings,
        data: Arc<dyn DataSource>,
        server: ServerModel<N>,
        clients: Vec<ClientModel<N>>,
        rng: ChaCha20Rng,
    ) -> Self {
        Self {
            federation,
            checkpoint,
            data,
            server,
            clients,
            rng,
            report: RunReport::default(),
        }
    }

    /// The index of the task that starts next.
    pub(in crate::state_machine) fn next_task(&self) -> usize {
        self.server
            .counters()
            .cur_task()
            .map(|task| task + 1)
            .unwrap_or(0)
    }

    /// Whether the curriculum has tasks left.
    pub(in crate::state_machine) fn has_next_task(&self) -> bool {
        self.next_task() < self.data.num_tasks()
    }
}

#[derive(Debug)]
/// A state of the [`StateMachine`].
pub struct PhaseState<S, N: Network> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared state.
    pub(in crate::state_machine) shared: Shared<N>,
}

impl<S, N> PhaseState<S, N>
where
    N: Network + 'static,
    Self: Phase<N>,
{
    /// Runs the current phase to completion and transitions to the next phase.
    pub fn run_phase(mut self) -> Option<StateMachine<N>> {
        let phase = Self::NAME;
        let span = error_span!(
            "run_phase",
            phase = %phase,
            task = ?self.shared.server.counters().cur_task(),
            round = self.shared.server.round(),
        );
        let _enter = span.enter();

        info!("starting phase");
        if let Err(err) = self.process() {
            warn!("failed to perform the phase tasks");
            return Some(self.into_failure_state(err));
        }
        info!("phase ran successfully");

        self.broadcast();

        info!("transitioning to the next phase");
        self.next()
    }

    fn into_failure_state(self, err: PhaseError) -> StateMachine<N> {
        let error = StateMachineError::Phase {
            phase: Self::NAME,
            source: err,
        };
        PhaseState::<Failure, _>::new(self.shared, error).into()
    }
}
