use tracing::{error_span, info};

use crate::{
    model::Network,
    state_machine::{
        phases::{PhaseName, PhaseState, Shared},
        RunReport,
        StateMachineError,
    },
};

/// The shutdown state.
#[derive(Debug)]
pub struct Shutdown {
    error: Option<StateMachineError>,
}

impl<N: Network> PhaseState<Shutdown, N> {
    /// Creates a new shutdown state, carrying the error that ended the run, if any.
    pub fn new(shared: Shared<N>, error: Option<StateMachineError>) -> Self {
        Self {
            private: Shutdown { error },
            shared,
        }
    }

    /// Ends the run with its report, or with the error that aborted it.
    pub fn finish(self) -> Result<RunReport, StateMachineError> {
        let span = error_span!("run_phase", phase = %PhaseName::Shutdown);
        let _enter = span.enter();

        match self.private.error {
            Some(error) => {
                info!("shutting down after a failure");
                Err(error)
            }
            None => {
                info!(
                    "shutting down after {} tasks",
                    self.shared.server.counters().history().len()
                );
                Ok(self.shared.report)
            }
        }
    }
}
