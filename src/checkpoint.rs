//! Persistence of the server state between tasks.

use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    lifecycle::LifecycleError,
    model::{Optimizer, ParameterVector, ShapeMismatch},
    settings::StrategyKind,
};

#[derive(Debug, Error)]
/// Errors which can occur while writing or restoring a checkpoint.
pub enum CheckpointError {
    #[error("checkpoint io failed: {0}")]
    Io(#[from] io::Error),
    #[error("checkpoint encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("checkpoint of strategy {found} can't be restored by strategy {expected}")]
    StrategyMismatch {
        expected: StrategyKind,
        found: StrategyKind,
    },
    #[error("checkpoint does not fit the network: {0}")]
    Shape(#[from] ShapeMismatch),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A snapshot of the server at the end of a task.
pub struct Checkpoint {
    /// The strategy which produced the snapshot.
    pub strategy: StrategyKind,
    /// The index of the last completed task.
    pub task: usize,
    /// The number of classes of every completed task.
    pub classes_per_task: Vec<usize>,
    /// The number of merged rounds of the last task.
    pub comm_round: usize,
    pub network_state: ParameterVector,
    /// The persistent server optimizer, for strategies which keep one.
    pub optimizer_state: Option<Optimizer>,
    /// The opaque state of the strategy, only readable by the same strategy.
    pub strategy_extra: Vec<u8>,
}

impl Checkpoint {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Writes the checkpoint to `path`, creating missing parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CheckpointError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        Self::from_bytes(&fs::read(path)?)
    }

    /// Fails if the checkpoint was written by another strategy.
    pub fn check_strategy(&self, expected: StrategyKind) -> Result<(), CheckpointError> {
        if self.strategy == expected {
            Ok(())
        } else {
            Err(CheckpointError::StrategyMismatch {
                expected,
                found: self.strategy,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            strategy: StrategyKind::Hgp,
            task: 1,
            classes_per_task: vec![2, 3],
            comm_round: 4,
            network_state: ParameterVector::from(vec![0.5, -1., 2.]),
            optimizer_state: Some(Optimizer::sgd(0.01, 0.9)),
            strategy_extra: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_bytes_restore_the_checkpoint() {
        let bytes = checkpoint().to_bytes().unwrap();
        assert_eq!(Checkpoint::from_bytes(&bytes).unwrap(), checkpoint());
    }

    #[test]
    fn test_truncated_bytes() {
        let bytes = checkpoint().to_bytes().unwrap();
        assert!(matches!(
            Checkpoint::from_bytes(&bytes[..bytes.len() / 2]),
            Err(CheckpointError::Encoding(_))
        ));
    }

    #[test]
    fn test_strategy_mismatch() {
        let err = checkpoint().check_strategy(StrategyKind::FedAvg).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::StrategyMismatch {
                expected: StrategyKind::FedAvg,
                found: StrategyKind::Hgp
            }
        ));
        assert!(checkpoint().check_strategy(StrategyKind::Hgp).is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("fedcl-checkpoint-{}", std::process::id()));
        let path = dir.join("nested").join("task_1.ckpt");
        checkpoint().save(&path).unwrap();
        assert_eq!(Checkpoint::load(&path).unwrap(), checkpoint());
        fs::remove_dir_all(&dir).unwrap();
    }
}
