//! The state machine that drives a simulated federated continual learning run.
//!
//! # Phase states
//!
//! **Idle**
//!
//! Checks that the federation, the network and the benchmark fit together.
//!
//! **BeginTask**
//!
//! Advances the server and every client to the next task of the curriculum.
//!
//! **Round**
//!
//! Samples the participants of a communication round, trains them locally on the broadcast
//! global state (on a rayon pool if `federation.parallel_clients` is set), merges their reports
//! and evaluates the merged model on the test sets of all seen tasks. Repeats until the configured
//! number of rounds per task is reached.
//!
//! **EndTask**
//!
//! Collects the once-per-task reports of the clients, consolidates them on the server and writes
//! a checkpoint if one is due.
//!
//! **Failure**
//!
//! Logs the error which aborted a phase. A failed run is never resumed: NaN losses, out of window
//! labels and malformed reports indicate a broken experiment setup.
//!
//! **Shutdown**
//!
//! Ends the run with its [`RunReport`] or with the error of the failed phase.

pub mod initializer;
pub mod phases;

#[cfg(test)]
mod tests;

use derive_more::From;
use serde::Serialize;
use thiserror::Error;

pub use self::initializer::{StateMachineInitializationError, StateMachineInitializer};
use self::phases::{
    BeginTask,
    EndTask,
    Failure,
    Idle,
    Phase,
    PhaseError,
    PhaseName,
    PhaseState,
    Round,
    Shutdown,
};
use crate::model::Network;

/// Error that aborted a run.
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("{phase} phase failed: {source}")]
    Phase {
        phase: PhaseName,
        source: PhaseError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// The accuracy of the global model after a round.
pub struct RoundAccuracy {
    pub task: usize,
    /// The number of merged rounds of the task.
    pub round: usize,
    /// The accuracy on the test set of every task seen so far.
    pub per_task: Vec<f64>,
}

impl RoundAccuracy {
    pub fn mean(&self) -> f64 {
        self.per_task.iter().sum::<f64>() / self.per_task.len().max(1) as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
/// The outcome of a completed run.
pub struct RunReport {
    pub accuracies: Vec<RoundAccuracy>,
}

impl RunReport {
    /// The accuracy after the last round of the run.
    pub fn last(&self) -> Option<&RoundAccuracy> {
        self.accuracies.last()
    }
}

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<N: Network> {
    Idle(PhaseState<Idle, N>),
    BeginTask(PhaseState<BeginTask, N>),
    Round(PhaseState<Round, N>),
    EndTask(PhaseState<EndTask, N>),
    Failure(PhaseState<Failure, N>),
    Shutdown(PhaseState<Shutdown, N>),
}

impl<N> StateMachine<N>
where
    N: Network + 'static,
    PhaseState<Idle, N>: Phase<N>,
    PhaseState<BeginTask, N>: Phase<N>,
    PhaseState<Round, N>: Phase<N>,
    PhaseState<EndTask, N>: Phase<N>,
    PhaseState<Failure, N>: Phase<N>,
{
    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    /// Returns the next state or `None` if the [`StateMachine`] reached the state [`Shutdown`].
    pub fn next(self) -> Option<Self> {
        match self {
            StateMachine::Idle(state) => state.run_phase(),
            StateMachine::BeginTask(state) => state.run_phase(),
            StateMachine::Round(state) => state.run_phase(),
            StateMachine::EndTask(state) => state.run_phase(),
            StateMachine::Failure(state) => state.run_phase(),
            StateMachine::Shutdown(_) => None,
        }
    }

    /// Runs the state machine until it shuts down.
    ///
    /// # Errors
    /// Fails with the error of the first phase that failed.
    pub fn run(self) -> Result<RunReport, StateMachineError> {
        let mut state = self;
        loop {
            state = match state {
                StateMachine::Shutdown(shutdown) => return shutdown.finish(),
                // only the shutdown state has no successor
                other => match other.next() {
                    Some(next) => next,
                    None => return Ok(RunReport::default()),
                },
            };
        }
    }
}
