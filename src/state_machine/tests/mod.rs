//! State machine integration tests.

use std::sync::Arc;

use ndarray::Array2;

use crate::{
    checkpoint::CheckpointError,
    client::TrainError,
    data::{ClientDataset, MockDataSource},
    model::{loss::LossError, LabelScheme},
    settings::{
        CheckpointSettings,
        FedAvgSettings,
        FederationSettings,
        HgpSettings,
        LoraSettings,
        NetworkSettings,
        OptimizerKind,
        OptimizerSettings,
        StrategySettings,
    },
    state_machine::{
        phases::{PhaseError, PhaseName},
        RunReport,
        StateMachineError,
        StateMachineInitializationError,
        StateMachineInitializer,
    },
    strategy::ContinualMerge,
};

const CLASSES_PER_TASK: usize = 2;

/// Two well separated clusters per task, one per class, alternating labels.
fn blobs(task: usize, samples: usize) -> ClientDataset {
    let centers = [[3., 0.], [0., 3.], [-3., 0.], [0., -3.]];
    let labels: Vec<usize> = (0..samples)
        .map(|i| task * CLASSES_PER_TASK + i % CLASSES_PER_TASK)
        .collect();
    let inputs = Array2::from_shape_fn((samples, 2), |(i, j)| {
        let center = centers[labels[i] % centers.len()];
        center[j] + 0.1 * ((i + j) % 3) as f32
    });
    ClientDataset::new(inputs, labels)
}

fn benchmark(tasks: usize, clients: usize) -> MockDataSource {
    let mut data = MockDataSource::new();
    data.expect_num_tasks().return_const(tasks);
    data.expect_classes_in_task().return_const(CLASSES_PER_TASK);
    data.expect_input_dim().return_const(2_usize);
    data.expect_num_clients().return_const(clients);
    data.expect_train_set()
        .returning(|task, client| Arc::new(blobs(task, 6 + 2 * client)));
    data.expect_test_set().returning(|task| Arc::new(blobs(task, 4)));
    data
}

fn federation(clients: usize) -> FederationSettings {
    FederationSettings {
        clients,
        rounds: 2,
        epochs: 2,
        batch_size: 4,
        participation: 1.,
        parallel_clients: false,
        seed: 11,
        label_scheme: LabelScheme::Offset,
        evaluate: true,
    }
}

fn optimizer() -> OptimizerSettings {
    OptimizerSettings {
        kind: OptimizerKind::Sgd,
        lr: 0.05,
        momentum: 0.9,
        weight_decay: 0.,
    }
}

fn network() -> NetworkSettings {
    NetworkSettings {
        hidden: vec![8],
        seed: 1,
    }
}

fn initializer(
    federation: FederationSettings,
    strategy: StrategySettings,
    checkpoint: CheckpointSettings,
    data: MockDataSource,
) -> StateMachineInitializer {
    StateMachineInitializer::new(
        federation,
        optimizer(),
        network(),
        strategy,
        checkpoint,
        Arc::new(data),
    )
}

fn run(strategy: StrategySettings, federation: FederationSettings) -> RunReport {
    let clients = federation.clients;
    initializer(
        federation,
        strategy,
        CheckpointSettings::default(),
        benchmark(2, clients),
    )
    .init()
    .unwrap()
    .run()
    .unwrap()
}

fn fedavg() -> StrategySettings {
    StrategySettings::FedAvg(FedAvgSettings::default())
}

fn assert_complete(report: &RunReport, tasks: usize, rounds: usize) {
    assert_eq!(report.accuracies.len(), tasks * rounds);
    for (i, accuracy) in report.accuracies.iter().enumerate() {
        assert_eq!(accuracy.task, i / rounds);
        assert_eq!(accuracy.round, i % rounds + 1);
        assert_eq!(accuracy.per_task.len(), accuracy.task + 1);
        assert!(accuracy.per_task.iter().all(|a| (0. ..=1.).contains(a)));
    }
}

#[test]
fn test_fedavg_runs_all_tasks() {
    let report = run(fedavg(), federation(2));
    assert_complete(&report, 2, 2);
}

#[test]
fn test_parallel_clients_match_sequential_clients() {
    let sequential = run(fedavg(), federation(3));
    let parallel = run(
        fedavg(),
        FederationSettings {
            parallel_clients: true,
            ..federation(3)
        },
    );
    assert_eq!(sequential, parallel);
}

#[test]
fn test_partial_participation() {
    let report = run(
        fedavg(),
        FederationSettings {
            participation: 0.5,
            ..federation(4)
        },
    );
    assert_complete(&report, 2, 2);
}

#[test]
fn test_lora_runs_all_tasks() {
    let strategy = StrategySettings::Lora(LoraSettings {
        rank: 2,
        lora_head: false,
        cl_merge: ContinualMerge::RunMean,
        regmean: None,
        alternating_iters: 1,
        freeze_a: false,
        seed: 5,
    });
    assert_complete(&run(strategy, federation(2)), 2, 2);
}

#[test]
fn test_hgp_runs_all_tasks() {
    let strategy = StrategySettings::Hgp(HgpSettings {
        rebalance_epochs: 2,
        samples_per_class: 8,
        ..HgpSettings::default()
    });
    assert_complete(&run(strategy, federation(2)), 2, 2);
}

#[test]
fn test_label_outside_the_window_aborts_the_run() {
    let mut data = MockDataSource::new();
    data.expect_num_tasks().return_const(2_usize);
    data.expect_classes_in_task().return_const(CLASSES_PER_TASK);
    data.expect_input_dim().return_const(2_usize);
    data.expect_num_clients().return_const(1_usize);
    // the samples of task 1 are served during task 0
    data.expect_train_set()
        .returning(|_, _| Arc::new(blobs(1, 4)));
    data.expect_test_set().returning(|task| Arc::new(blobs(task, 4)));

    let err = initializer(federation(1), fedavg(), CheckpointSettings::default(), data)
        .init()
        .unwrap()
        .run()
        .unwrap_err();
    match err {
        StateMachineError::Phase { phase, source } => {
            assert_eq!(phase, PhaseName::Round);
            assert!(matches!(
                source,
                PhaseError::Train(TrainError::Label(LossError::LabelOutOfWindow { .. }))
            ));
        }
    }
}

#[test]
fn test_empty_benchmark_is_rejected() {
    let data = benchmark(0, 1);
    let err = initializer(federation(1), fedavg(), CheckpointSettings::default(), data)
        .init()
        .unwrap()
        .run()
        .unwrap_err();
    assert!(matches!(
        err,
        StateMachineError::Phase {
            phase: PhaseName::Idle,
            source: PhaseError::Configuration(_)
        }
    ));
}

#[test]
fn test_resume_from_checkpoint() {
    let directory = std::env::temp_dir().join(format!("fedcl-resume-{}", std::process::id()));
    let checkpoint = CheckpointSettings {
        directory: Some(directory.clone()),
        interval: 1,
    };
    let strategy = StrategySettings::Hgp(HgpSettings {
        rebalance_epochs: 1,
        samples_per_class: 4,
        ..HgpSettings::default()
    });

    let full = initializer(federation(2), strategy.clone(), checkpoint, benchmark(2, 2))
        .init()
        .unwrap()
        .run()
        .unwrap();
    assert_complete(&full, 2, 2);
    assert!(directory.join("task_0.ckpt").exists());
    assert!(directory.join("task_1.ckpt").exists());

    let resumed = initializer(
        federation(2),
        strategy,
        CheckpointSettings::default(),
        benchmark(2, 2),
    )
    .restore_from(directory.join("task_0.ckpt"))
    .init()
    .unwrap()
    .run()
    .unwrap();
    assert_eq!(resumed.accuracies.len(), 2);
    assert!(resumed.accuracies.iter().all(|a| a.task == 1));

    let mismatch = initializer(
        federation(2),
        fedavg(),
        CheckpointSettings::default(),
        benchmark(2, 2),
    )
    .restore_from(directory.join("task_1.ckpt"))
    .init();
    assert!(matches!(
        mismatch,
        Err(StateMachineInitializationError::Restore(
            CheckpointError::StrategyMismatch { .. }
        ))
    ));

    std::fs::remove_dir_all(&directory).unwrap();
}
