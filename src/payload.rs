//! The payloads exchanged between the clients and the server.
//!
//! The payload schema is fixed by the merge strategy: a client and the server of the same strategy
//! always agree on the variant, any other variant is rejected by the server as a schema mismatch.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::{
    aggregation::{mixture::ClassStatistics, MergeError},
    model::{Linear, ParameterVector},
    strategy::adapter::{LowRank, VeraScaling},
};

/// Per-layer Gram matrices of the layer inputs.
pub type Grams = BTreeMap<String, Array2<f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Everything a client reports to the server at the end of a round or task.
pub struct ClientInfo {
    pub client_id: usize,
    /// The number of local training samples of the current task.
    pub num_train_samples: usize,
    pub payload: ClientPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The strategy dependent part of a [`ClientInfo`].
pub enum ClientPayload {
    /// The full parameter vector.
    Params { params: ParameterVector },
    /// The full parameter vector together with class and gradient statistics.
    ClassAware {
        params: ParameterVector,
        class_counts: BTreeMap<usize, usize>,
        class_statistics: BTreeMap<usize, ClassStatistics>,
        small_omega: Option<Vec<f32>>,
    },
    /// The full parameter vector together with the Gram matrices of the merged layers.
    RegMean { params: ParameterVector, grams: Grams },
    /// Low-rank adapters, the directly trained head and, for the regression hybrid, Gram matrices.
    Adapter {
        adapters: BTreeMap<String, LowRank>,
        head: Option<Linear>,
        grams: Grams,
    },
    /// VeRA scaling vectors and the directly trained head.
    Vera {
        scalings: BTreeMap<String, VeraScaling>,
        head: Option<Linear>,
    },
    /// Low-rank adapters with the diagonal Fisher estimate of their up projections.
    Fisher {
        adapters: BTreeMap<String, LowRank>,
        fisher: BTreeMap<String, Array2<f64>>,
        grams: Grams,
        head: Linear,
    },
    /// The per-row Fisher mass of the effective task deltas, reported once per task.
    TaskFisher { mass: BTreeMap<String, Array1<f64>> },
    /// The full parameter vector with class-conditional feature prototypes.
    Prototype {
        params: ParameterVector,
        class_statistics: BTreeMap<usize, ClassStatistics>,
        seen_classes: BTreeMap<usize, u64>,
    },
}

impl ClientPayload {
    /// The schema name of the payload.
    pub fn schema(&self) -> &'static str {
        match self {
            ClientPayload::Params { .. } => "params",
            ClientPayload::ClassAware { .. } => "class_aware",
            ClientPayload::RegMean { .. } => "regmean",
            ClientPayload::Adapter { .. } => "adapter",
            ClientPayload::Vera { .. } => "vera",
            ClientPayload::Fisher { .. } => "fisher",
            ClientPayload::TaskFisher { .. } => "task_fisher",
            ClientPayload::Prototype { .. } => "prototype",
        }
    }

    /// Builds the error for a payload that does not match the `expected` schema.
    pub fn mismatch(&self, expected: &'static str) -> MergeError {
        MergeError::SchemaMismatch {
            expected,
            found: self.schema(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The global state broadcast to the clients at the start of a round.
pub struct ServerInfo {
    pub task: usize,
    pub round: usize,
    pub payload: ServerPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The strategy dependent part of a [`ServerInfo`].
pub enum ServerPayload {
    /// The full global parameter vector.
    Params { params: ParameterVector },
    /// The global adapters, the accumulated deltas of the completed tasks and the global head.
    Adapter {
        adapters: BTreeMap<String, LowRank>,
        old_deltas: BTreeMap<String, Array2<f32>>,
        head: Linear,
    },
    /// The global VeRA scalings, the accumulated deltas of the completed tasks and the global head.
    Vera {
        scalings: BTreeMap<String, VeraScaling>,
        old_deltas: BTreeMap<String, Array2<f32>>,
        head: Linear,
    },
}

impl ServerPayload {
    /// The schema name of the payload.
    pub fn schema(&self) -> &'static str {
        match self {
            ServerPayload::Params { .. } => "params",
            ServerPayload::Adapter { .. } => "adapter",
            ServerPayload::Vera { .. } => "vera",
        }
    }

    /// Builds the error for a payload that does not match the `expected` schema.
    pub fn mismatch(&self, expected: &'static str) -> MergeError {
        MergeError::SchemaMismatch {
            expected,
            found: self.schema(),
        }
    }
}
