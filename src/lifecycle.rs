//! Task bookkeeping and the hook ordering shared by clients and the server.
//!
//! The driver must invoke the hooks in the order
//!
//! ```text
//! begin_task -> { begin_round_server, begin_round_client, observe*, end_round_client,
//!                 end_round_server }* -> end_task_client, end_task_server
//! ```
//!
//! Calling a hook out of order is a [`LifecycleError`].

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::TaskWindow;

#[derive(Debug, Error, PartialEq)]
/// A hook was invoked in a phase that does not allow it.
pub enum LifecycleError {
    #[error("{hook} is not allowed in the {phase} phase")]
    InvalidTransition { hook: &'static str, phase: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
/// The lifecycle phase of a client model.
pub enum ClientPhase {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "TaskActive")]
    TaskActive,
    #[display(fmt = "RoundActive")]
    RoundActive,
    #[display(fmt = "RoundDone")]
    RoundDone,
    #[display(fmt = "TaskDone")]
    TaskDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
/// The lifecycle phase of the server model.
pub enum ServerPhase {
    #[display(fmt = "Created")]
    Created,
    #[display(fmt = "TaskActive")]
    TaskActive,
    #[display(fmt = "RoundActive")]
    RoundActive,
    #[display(fmt = "RoundDone")]
    RoundDone,
    #[display(fmt = "TaskDone")]
    TaskDone,
}

/// Moves `phase` to `to` if it is currently one of `from`.
pub(crate) fn transition<P>(
    phase: &mut P,
    hook: &'static str,
    from: &[P],
    to: P,
) -> Result<(), LifecycleError>
where
    P: Copy + PartialEq + std::fmt::Display,
{
    ensure(*phase, hook, from)?;
    *phase = to;
    Ok(())
}

/// Checks that `phase` is one of `allowed`.
pub(crate) fn ensure<P>(phase: P, hook: &'static str, allowed: &[P]) -> Result<(), LifecycleError>
where
    P: Copy + PartialEq + std::fmt::Display,
{
    if allowed.contains(&phase) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition {
            hook,
            phase: phase.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// The task counters of a class-incremental curriculum.
///
/// No task is active before the first [`begin_task()`]. The offset of the current task in the
/// shared head is always recomputed from the class history of the completed tasks.
///
/// [`begin_task()`]: TaskCounters::begin_task
pub struct TaskCounters {
    classes_per_task: Vec<usize>,
}

impl TaskCounters {
    /// Creates counters without any task.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores counters from the class history of all started tasks.
    pub fn from_history(classes_per_task: Vec<usize>) -> Self {
        Self { classes_per_task }
    }

    /// Starts a new task introducing `classes` classes and returns its index.
    pub fn begin_task(&mut self, classes: usize) -> usize {
        self.classes_per_task.push(classes);
        self.classes_per_task.len() - 1
    }

    /// The index of the current task, if any task was started.
    pub fn cur_task(&self) -> Option<usize> {
        self.classes_per_task.len().checked_sub(1)
    }

    /// The number of classes of all completed tasks.
    pub fn cur_offset(&self) -> usize {
        match self.classes_per_task.split_last() {
            Some((_, completed)) => completed.iter().sum(),
            None => 0,
        }
    }

    /// The number of classes of the current task.
    pub fn cpt(&self) -> usize {
        self.classes_per_task.last().copied().unwrap_or(0)
    }

    /// The head window of the current task.
    pub fn window(&self) -> TaskWindow {
        TaskWindow::new(self.cur_offset(), self.cpt())
    }

    /// The number of classes seen so far, including the current task.
    pub fn seen_classes(&self) -> usize {
        self.classes_per_task.iter().sum()
    }

    /// The class history of all started tasks.
    pub fn history(&self) -> &[usize] {
        &self.classes_per_task
    }

    /// The head window of a started task.
    pub fn task_window(&self, task: usize) -> Option<TaskWindow> {
        let classes = *self.classes_per_task.get(task)?;
        let offset = self.classes_per_task[..task].iter().sum();
        Some(TaskWindow::new(offset, classes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_before_first_task() {
        let counters = TaskCounters::new();
        assert_eq!(counters.cur_task(), None);
        assert_eq!(counters.cur_offset(), 0);
        assert_eq!(counters.cpt(), 0);
        assert_eq!(counters.seen_classes(), 0);
    }

    #[test]
    fn test_counters_with_variable_classes() {
        let mut counters = TaskCounters::new();
        assert_eq!(counters.begin_task(5), 0);
        assert_eq!(counters.window(), TaskWindow::new(0, 5));
        assert_eq!(counters.begin_task(3), 1);
        assert_eq!(counters.cur_offset(), 5);
        assert_eq!(counters.begin_task(4), 2);
        assert_eq!(counters.cur_task(), Some(2));
        assert_eq!(counters.window(), TaskWindow::new(8, 4));
        assert_eq!(counters.seen_classes(), 12);
        assert_eq!(counters.task_window(1), Some(TaskWindow::new(5, 3)));
        assert_eq!(counters.task_window(3), None);
    }

    #[test]
    fn test_transition() {
        let mut phase = ClientPhase::Idle;
        transition(
            &mut phase,
            "begin_task",
            &[ClientPhase::Idle, ClientPhase::TaskDone],
            ClientPhase::TaskActive,
        )
        .unwrap();
        assert_eq!(phase, ClientPhase::TaskActive);

        let err = transition(
            &mut phase,
            "end_round_client",
            &[ClientPhase::RoundActive],
            ClientPhase::RoundDone,
        )
        .unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                hook: "end_round_client",
                phase: "TaskActive".to_string()
            }
        );
        assert_eq!(phase, ClientPhase::TaskActive);
    }
}
