#![cfg_attr(docsrs, feature(doc_cfg))]
//! # FedCL: a simulation testbed for federated continual learning
//!
//! A federation of simulated clients observes a class-incremental curriculum of tasks. Every
//! client trains a private replica of a shared network on its partition of the current task and
//! periodically reports to a server, which merges the reports into the global model and
//! consolidates the knowledge of completed tasks.
//!
//! ## Lifecycle
//!
//! Clients ([`client::ClientModel`]) and the server ([`server::ServerModel`]) expose the hooks
//!
//! ```text
//! begin_task -> { begin_round_server, begin_round_client, observe*, end_round_client,
//!                 end_round_server }* -> end_task_client, end_task_server
//! ```
//!
//! which the [`state_machine::StateMachine`] invokes in this fixed order. Calling a hook out of
//! order fails with a [`lifecycle::LifecycleError`].
//!
//! ## Merge strategies
//!
//! A strategy is a pair of a client half and a server half ([`strategy::ClientStrategy`],
//! [`strategy::ServerStrategy`]) agreeing on a payload schema:
//!
//! - `fedavg`: weighted averaging of the full parameter vector.
//! - `cocoavg`: class-aware averaging with per-class head rows, entropy and gradient weighting.
//! - `regmean`: closed-form regression merge of the linear layers from input Gram matrices.
//! - `lora` and `vera`: low-rank adapter merges folded across tasks by a continual policy.
//! - `lora_fisher`: Fisher-weighted adapter merge with Fisher-mass consolidation across tasks.
//! - `hgp`: Gaussian-mixture prototypes replayed to rebalance the classification head.
//!
//! ## Running a simulation
//!
//! The `fedcl-simulate` binary loads a configuration file (see `configs/` in the repository root)
//! and runs the configured strategy on a synthetic benchmark:
//!
//! ```text
//! fedcl-simulate -c configs/config.toml
//! ```

pub mod aggregation;
pub mod checkpoint;
pub mod client;
pub mod data;
pub mod lifecycle;
pub mod linalg;
pub mod model;
pub mod payload;
pub mod server;
pub mod settings;
pub mod state_machine;
pub mod strategy;
