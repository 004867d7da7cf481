//! The authoritative global model.

use tracing::{debug, info};

use crate::{
    aggregation::MergeError,
    checkpoint::{Checkpoint, CheckpointError},
    data::DataSource,
    lifecycle::{ensure, transition, LifecycleError, ServerPhase, TaskCounters},
    model::{loss::predict, Network, ParameterVector},
    payload::{ClientInfo, ServerInfo},
    settings::StrategyKind,
    strategy::ServerStrategy,
};

#[derive(Debug)]
/// The server model: the global network with the server half of a merge strategy.
///
/// The server is the single writer of the global state. Its hooks follow the order
///
/// ```text
/// Created -> { begin_task -> { begin_round_server -> end_round_server }* -> end_task_server }*
/// ```
pub struct ServerModel<N: Network> {
    network: N,
    strategy: Box<dyn ServerStrategy<N>>,
    counters: TaskCounters,
    phase: ServerPhase,
    round: usize,
}

impl<N: Network> ServerModel<N> {
    pub fn new(network: N, strategy: Box<dyn ServerStrategy<N>>) -> Self {
        Self {
            network,
            strategy,
            counters: TaskCounters::new(),
            phase: ServerPhase::Created,
            round: 0,
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn counters(&self) -> &TaskCounters {
        &self.counters
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    /// The number of merged rounds of the current task.
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    /// Starts a new task introducing `classes` classes and consolidates the previous one.
    pub fn begin_task(&mut self, classes: usize) -> Result<(), LifecycleError> {
        transition(
            &mut self.phase,
            "begin_task",
            &[ServerPhase::Created, ServerPhase::TaskDone],
            ServerPhase::TaskActive,
        )?;
        let task = self.counters.begin_task(classes);
        self.round = 0;
        self.strategy.begin_task(&mut self.network, &self.counters);
        info!(
            "task {} covers the classes {:?}",
            task,
            self.counters.window().range()
        );
        Ok(())
    }

    pub fn begin_round_server(&mut self) -> Result<(), LifecycleError> {
        transition(
            &mut self.phase,
            "begin_round_server",
            &[ServerPhase::TaskActive, ServerPhase::RoundDone],
            ServerPhase::RoundActive,
        )?;
        self.strategy.begin_round(&mut self.network, &self.counters);
        Ok(())
    }

    /// The snapshot broadcast to the clients of the current round.
    pub fn get_server_info(&self) -> Result<ServerInfo, LifecycleError> {
        ensure(self.phase, "get_server_info", &[ServerPhase::RoundActive])?;
        Ok(ServerInfo {
            task: self.counters.cur_task().unwrap_or(0),
            round: self.round,
            payload: self.strategy.server_info(&self.network),
        })
    }

    /// Merges the reports of the sampled clients into the global model.
    ///
    /// An empty list of reports leaves the global model unchanged.
    ///
    /// # Errors
    /// Fails if called out of order or if a report does not fit the strategy.
    pub fn end_round_server(&mut self, clients: &[ClientInfo]) -> Result<(), MergeError> {
        transition(
            &mut self.phase,
            "end_round_server",
            &[ServerPhase::RoundActive],
            ServerPhase::RoundDone,
        )?;
        if clients.is_empty() {
            debug!("no client reports in round {}", self.round);
        } else {
            self.strategy
                .merge(&mut self.network, clients, &self.counters)?;
        }
        self.round += 1;
        Ok(())
    }

    /// Consolidates the once-per-task reports of the clients.
    pub fn end_task_server(&mut self, clients: &[ClientInfo]) -> Result<(), MergeError> {
        transition(
            &mut self.phase,
            "end_task_server",
            &[ServerPhase::TaskActive, ServerPhase::RoundDone],
            ServerPhase::TaskDone,
        )?;
        self.strategy
            .end_task(&mut self.network, clients, &self.counters)?;
        Ok(())
    }

    /// The accuracy of the global model on the test set of every task seen so far.
    ///
    /// Predictions are the argmax over the head columns of all seen classes.
    pub fn evaluate(&self, data: &dyn DataSource) -> Vec<f64> {
        let tasks = self.counters.cur_task().map(|t| t + 1).unwrap_or(0);
        let seen = self.counters.seen_classes();
        let overlay = self.strategy.eval_overlay(&self.network);
        (0..tasks)
            .map(|task| {
                let test = data.test_set(task);
                if test.is_empty() {
                    return 0.;
                }
                let pass = self.network.forward(test.inputs.view(), &overlay);
                let correct = predict(pass.logits().view(), seen)
                    .iter()
                    .zip(&test.labels)
                    .filter(|(predicted, label)| predicted == label)
                    .count();
                correct as f64 / test.len() as f64
            })
            .collect()
    }

    /// Snapshots the global state at the end of a task.
    pub fn checkpoint(&self) -> Result<Checkpoint, CheckpointError> {
        ensure(self.phase, "checkpoint", &[ServerPhase::TaskDone])?;
        Ok(Checkpoint {
            strategy: self.strategy.kind(),
            task: self.counters.cur_task().unwrap_or(0),
            classes_per_task: self.counters.history().to_vec(),
            comm_round: self.round,
            network_state: ParameterVector::flatten(&self.network),
            optimizer_state: self.strategy.optimizer().cloned(),
            strategy_extra: self.strategy.save_extra()?,
        })
    }

    /// Restores a fresh server from a checkpoint of the same strategy.
    ///
    /// The server resumes at the end of the checkpointed task.
    pub fn restore(&mut self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        ensure(self.phase, "restore", &[ServerPhase::Created])?;
        checkpoint.check_strategy(self.strategy.kind())?;
        checkpoint.network_state.unflatten(&mut self.network)?;
        self.strategy.load_extra(&checkpoint.strategy_extra)?;
        if let Some(optimizer) = checkpoint.optimizer_state {
            self.strategy.restore_optimizer(optimizer);
        }
        self.counters = TaskCounters::from_history(checkpoint.classes_per_task);
        self.round = checkpoint.comm_round;
        self.phase = ServerPhase::TaskDone;
        info!("restored the server at the end of task {}", checkpoint.task);
        Ok(())
    }
}
