//! The local model of a simulated client.

use std::collections::BTreeMap;

use derive_more::Display;
use ndarray::ArrayView2;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    aggregation::MergeError,
    data::ClientDataset,
    lifecycle::{ensure, transition, ClientPhase, LifecycleError, TaskCounters},
    model::{
        loss::{windowed_cross_entropy, LossError},
        LabelScheme,
        Network,
        Optimizer,
    },
    payload::{ClientInfo, ServerInfo},
    settings::OptimizerSettings,
    strategy::{ClientStrategy, RoundContext, TrainScope},
};

#[derive(Debug, Error)]
/// Errors which can occur during local training.
pub enum TrainError {
    #[error("nan loss on client {client} in task {task}, round {round}, epoch {epoch}")]
    NanLoss {
        client: usize,
        task: usize,
        round: usize,
        epoch: usize,
    },
    #[error("invalid labels: {0}")]
    Label(#[from] LossError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("strategy failed: {0}")]
    Merge(#[from] MergeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Display)]
#[display(fmt = "RoundStats(loss={}, batches={})", loss, batches)]
/// The outcome of the local training of a round.
pub struct RoundStats {
    /// The mean loss over the batches of the last epoch.
    pub loss: f32,
    /// The number of optimizer steps.
    pub batches: usize,
}

#[derive(Debug)]
/// A client model: a private replica of the network with the client half of a merge strategy.
pub struct ClientModel<N: Network> {
    id: usize,
    network: N,
    strategy: Box<dyn ClientStrategy<N>>,
    counters: TaskCounters,
    phase: ClientPhase,
    optimizer_settings: OptimizerSettings,
    optimizer: Option<Optimizer>,
    label_scheme: LabelScheme,
    round: usize,
    epoch: usize,
    seen: BTreeMap<usize, u64>,
    probe_done: bool,
    participated: bool,
    rng: ChaCha20Rng,
}

impl<N: Network> ClientModel<N> {
    /// Creates an idle client.
    pub fn new(
        id: usize,
        network: N,
        strategy: Box<dyn ClientStrategy<N>>,
        optimizer_settings: OptimizerSettings,
        label_scheme: LabelScheme,
        seed: u64,
    ) -> Self {
        Self {
            id,
            network,
            strategy,
            counters: TaskCounters::new(),
            phase: ClientPhase::Idle,
            optimizer_settings,
            optimizer: None,
            label_scheme,
            round: 0,
            epoch: 0,
            seen: BTreeMap::new(),
            probe_done: false,
            participated: false,
            rng: ChaCha20Rng::seed_from_u64(seed.wrapping_add(id as u64)),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    pub fn counters(&self) -> &TaskCounters {
        &self.counters
    }

    /// Fast-forwards an idle client to the end of the last completed task of a restored run.
    pub fn resume(&mut self, counters: TaskCounters) -> Result<(), LifecycleError> {
        transition(
            &mut self.phase,
            "resume",
            &[ClientPhase::Idle],
            ClientPhase::TaskDone,
        )?;
        self.counters = counters;
        Ok(())
    }

    /// Starts a new task introducing `classes` classes.
    pub fn begin_task(&mut self, classes: usize) -> Result<(), LifecycleError> {
        transition(
            &mut self.phase,
            "begin_task",
            &[ClientPhase::Idle, ClientPhase::TaskDone],
            ClientPhase::TaskActive,
        )?;
        self.counters.begin_task(classes);
        self.probe_done = false;
        self.participated = false;
        self.round = 0;
        self.strategy.begin_task(&self.network, &self.counters);
        Ok(())
    }

    /// Loads the broadcast global state and builds a fresh optimizer for the round.
    ///
    /// # Errors
    /// Fails if called outside of a task or if the payload does not fit the strategy.
    pub fn begin_round_client(&mut self, info: &ServerInfo) -> Result<(), TrainError> {
        transition(
            &mut self.phase,
            "begin_round_client",
            &[ClientPhase::TaskActive, ClientPhase::RoundDone],
            ClientPhase::RoundActive,
        )?;
        self.strategy.load(&mut self.network, &info.payload)?;
        self.optimizer = Some(Optimizer::new(self.optimizer_settings));
        self.seen.clear();
        self.round = info.round;
        self.epoch = 0;
        Ok(())
    }

    /// Runs one minibatch and returns its loss, updating the model if `update` is set.
    ///
    /// # Errors
    /// Fails if a label is outside of the task window, if the loss is not finite or, with
    /// `update`, if no round is active.
    pub fn observe(
        &mut self,
        inputs: ArrayView2<f32>,
        labels: &[usize],
        update: bool,
    ) -> Result<f32, TrainError> {
        self.observe_scoped(inputs, labels, update, TrainScope::Full)
    }

    fn observe_scoped(
        &mut self,
        inputs: ArrayView2<f32>,
        labels: &[usize],
        update: bool,
        scope: TrainScope,
    ) -> Result<f32, TrainError> {
        if update {
            ensure(self.phase, "observe", &[ClientPhase::RoundActive])?;
        } else {
            ensure(
                self.phase,
                "observe",
                &[
                    ClientPhase::TaskActive,
                    ClientPhase::RoundActive,
                    ClientPhase::RoundDone,
                    ClientPhase::TaskDone,
                ],
            )?;
        }

        let overlay = self.strategy.overlay(&self.network);
        let pass = self.network.forward(inputs, &overlay);
        let (loss, grad_logits) = windowed_cross_entropy(
            pass.logits().view(),
            labels,
            self.counters.window(),
            self.label_scheme,
        )?;
        if !loss.is_finite() {
            return Err(TrainError::NanLoss {
                client: self.id,
                task: self.counters.cur_task().unwrap_or(0),
                round: self.round,
                epoch: self.epoch,
            });
        }
        if !update {
            return Ok(loss);
        }

        for &label in labels {
            *self.seen.entry(label).or_insert(0) += 1;
        }
        let grads = self
            .network
            .backward(&pass, grad_logits.view(), &overlay);
        if let Some(optimizer) = self.optimizer.as_mut() {
            self.strategy
                .step(&mut self.network, &grads, optimizer, scope);
        }
        Ok(loss)
    }

    /// Runs one local epoch over shuffled minibatches and returns the mean loss.
    pub fn train_epoch(
        &mut self,
        data: &ClientDataset,
        batch_size: usize,
        scope: TrainScope,
    ) -> Result<(f32, usize), TrainError> {
        let batches = data.batches(batch_size, Some(&mut self.rng));
        let mut total = 0.;
        for (inputs, labels) in &batches {
            total += self.observe_scoped(inputs.view(), labels, true, scope)?;
        }
        self.epoch += 1;
        let mean = if batches.is_empty() {
            0.
        } else {
            total / batches.len() as f32
        };
        Ok((mean, batches.len()))
    }

    /// Runs the local training of a round, preceded by the linear probe at the first round of a
    /// task if the strategy asks for one.
    pub fn train_round(
        &mut self,
        data: &ClientDataset,
        epochs: usize,
        batch_size: usize,
    ) -> Result<RoundStats, TrainError> {
        let mut stats = RoundStats {
            loss: 0.,
            batches: 0,
        };
        if !self.probe_done {
            let probe_epochs = self.strategy.linear_probe_epochs();
            if probe_epochs > 0 {
                debug!("client {}: linear probe for {} epochs", self.id, probe_epochs);
            }
            for _ in 0..probe_epochs {
                let (loss, batches) = self.train_epoch(data, batch_size, TrainScope::HeadOnly)?;
                stats.loss = loss;
                stats.batches += batches;
            }
            self.probe_done = true;
        }
        for _ in 0..epochs {
            let (loss, batches) = self.train_epoch(data, batch_size, TrainScope::Full)?;
            stats.loss = loss;
            stats.batches += batches;
        }
        Ok(stats)
    }

    /// Releases the optimizer of the round and collects the statistics of the strategy.
    pub fn end_round_client(&mut self, data: &ClientDataset) -> Result<(), TrainError> {
        transition(
            &mut self.phase,
            "end_round_client",
            &[ClientPhase::RoundActive],
            ClientPhase::RoundDone,
        )?;
        self.optimizer = None;
        self.participated = true;
        self.strategy.end_round(
            &self.network,
            RoundContext {
                data,
                window: self.counters.window(),
                scheme: self.label_scheme,
                rng: &mut self.rng,
                seen: &self.seen,
            },
        )?;
        Ok(())
    }

    /// Serializes the report of the round.
    pub fn get_client_info(&self, data: &ClientDataset) -> Result<ClientInfo, LifecycleError> {
        ensure(self.phase, "get_client_info", &[ClientPhase::RoundDone])?;
        Ok(ClientInfo {
            client_id: self.id,
            num_train_samples: data.len(),
            payload: self.strategy.client_info(&self.network),
        })
    }

    /// Runs a whole round: load, train, collect and report.
    pub fn run_round(
        &mut self,
        info: &ServerInfo,
        data: &ClientDataset,
        epochs: usize,
        batch_size: usize,
    ) -> Result<ClientInfo, TrainError> {
        self.begin_round_client(info)?;
        if data.is_empty() {
            warn!("client {} has no samples in task {}", self.id, info.task);
        }
        let stats = self.train_round(data, epochs, batch_size)?;
        debug!("client {}: {}", self.id, stats);
        self.end_round_client(data)?;
        Ok(self.get_client_info(data)?)
    }

    /// Finishes the task and computes the once-per-task report of the strategy, if any.
    ///
    /// Clients that did not take part in any round of the task report nothing.
    pub fn end_task_client(
        &mut self,
        data: &ClientDataset,
    ) -> Result<Option<ClientInfo>, TrainError> {
        transition(
            &mut self.phase,
            "end_task_client",
            &[ClientPhase::TaskActive, ClientPhase::RoundDone],
            ClientPhase::TaskDone,
        )?;
        if !self.participated {
            return Ok(None);
        }
        let payload = self.strategy.end_task(
            &self.network,
            RoundContext {
                data,
                window: self.counters.window(),
                scheme: self.label_scheme,
                rng: &mut self.rng,
                seen: &self.seen,
            },
        )?;
        Ok(payload.map(|payload| ClientInfo {
            client_id: self.id,
            num_train_samples: data.len(),
            payload,
        }))
    }
}
