//! This module provides the `PhaseStates` of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod begin_task;
mod end_task;
mod failure;
mod idle;
mod phase;
mod round;
mod shutdown;

pub use self::{
    begin_task::BeginTask,
    end_task::EndTask,
    failure::{Failure, PhaseError},
    idle::Idle,
    phase::{Phase, PhaseName, PhaseState, Shared},
    round::Round,
    shutdown::Shutdown,
};
