//! Aggregation primitives composed by the merge strategies.
//!
//! Every aggregator follows the same protocol: [`validate_aggregation()`] checks a client
//! contribution against what has been aggregated so far, [`aggregate()`] folds it in, and a final
//! call computes the merged value. A strategy composes one aggregator per layer or layer group.
//!
//! [`validate_aggregation()`]: average::WeightedAverage::validate_aggregation
//! [`aggregate()`]: average::WeightedAverage::aggregate

pub mod average;
pub mod fisher;
pub mod gradient;
pub mod mixture;
pub mod regmean;
pub mod weights;

use thiserror::Error;

use crate::{lifecycle::LifecycleError, linalg::LinalgError, model::ShapeMismatch};

#[derive(Debug, Error, PartialEq)]
/// Errors related to the validation of a single client contribution.
pub enum AggregationError {
    #[error("invalid aggregation weight {0}")]
    InvalidWeight(f64),
    #[error("the object contains non-finite values")]
    InvalidObject,
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

#[derive(Debug, Error)]
/// Errors related to merging client contributions into the global model.
pub enum MergeError {
    #[error("payload schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid client contribution: {0}")]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Shape(#[from] ShapeMismatch),
    #[error("unknown layer {0}")]
    UnknownLayer(String),
    #[error("client {client} did not report statistics for layer {layer}")]
    MissingStatistics { client: usize, layer: String },
    #[error("linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}
