use std::io::Write;

use validator::Validate;

use super::*;

/// Writes `content` to a fresh file in the temporary directory.
fn config_file(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("fedcl-{}-{}.toml", name, std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

const BASE: &str = r#"
[log]
filter = "info"

[federation]
clients = 2
rounds = 1
epochs = 1
batch_size = 4

[optimizer]
kind = "sgd"
lr = 0.1

[network]
hidden = [4]

[data]
tasks = 2
classes_per_task = 2
input_dim = 3
train_samples_per_class = 10
test_samples_per_class = 5
"#;

fn with_strategy(name: &str, strategy: &str) -> Result<Settings, SettingsError> {
    let path = config_file(name, &format!("{}\n[strategy]\n{}", BASE, strategy));
    let settings = Settings::new(&path);
    std::fs::remove_file(&path).unwrap();
    settings
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self {
            clients: 2,
            rounds: 1,
            epochs: 1,
            batch_size: 4,
            participation: 1.,
            parallel_clients: false,
            seed: 0,
            label_scheme: LabelScheme::Offset,
            evaluate: true,
        }
    }
}

#[test]
fn test_settings_new() {
    let settings = Settings::new("configs/config.toml").unwrap();
    assert_eq!(settings.strategy.kind(), StrategyKind::Lora);
    match settings.strategy {
        StrategySettings::Lora(lora) => {
            assert_eq!(lora.rank, 4);
            assert_eq!(lora.cl_merge, ContinualMerge::RunMean);
            assert_eq!(lora.regmean.map(|r| r.inverse), Some(InversePolicy::PseudoInverse));
        }
        other => panic!("unexpected strategy {}", other.kind()),
    }
    assert!(settings.checkpoint.directory.is_none());
    assert!(Settings::new("").is_err());
}

#[test]
fn test_defaults() {
    let settings = with_strategy("defaults", r#"kind = "hgp""#).unwrap();
    assert_eq!(settings.federation.participation, 1.);
    assert!(settings.federation.evaluate);
    assert_eq!(settings.federation.label_scheme, LabelScheme::Offset);
    assert_eq!(settings.optimizer.momentum, 0.);
    assert_eq!(settings.data.noise, 0.5);
    assert_eq!(settings.checkpoint.interval, 1);
    assert_eq!(settings.strategy, StrategySettings::Hgp(HgpSettings::default()));
}

#[test]
fn test_unknown_strategy_is_rejected() {
    assert!(matches!(
        with_strategy("unknown", r#"kind = "fedprox""#),
        Err(SettingsError::Loading(_))
    ));
}

#[test]
fn test_unknown_continual_merge_is_rejected() {
    assert!(matches!(
        with_strategy("cl-merge", "kind = \"lora\"\nrank = 2\ncl_merge = \"run_median\""),
        Err(SettingsError::Loading(_))
    ));
}

#[test]
fn test_invalid_log_filter_is_rejected() {
    let content = BASE.replace(r#"filter = "info""#, r#"filter = "info,fedcl=notalevel""#);
    let path = config_file("filter", &format!("{}\n[strategy]\nkind = \"fedavg\"", content));
    assert!(Settings::new(&path).is_err());
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_validate_strategy() {
    assert!(matches!(
        with_strategy("rank", "kind = \"vera\"\nrank = 0"),
        Err(SettingsError::Validation(_))
    ));
    assert!(matches!(
        with_strategy("fisher-merge", "kind = \"lora\"\nrank = 2\ncl_merge = \"fisher\""),
        Err(SettingsError::Validation(_))
    ));
    assert!(matches!(
        with_strategy(
            "replay",
            "kind = \"hgp\"\nreb_only_old = true\nreb_only_cur = true"
        ),
        Err(SettingsError::Validation(_))
    ));
    assert!(with_strategy("lora-fisher", "kind = \"lora_fisher\"\nrank = 2").is_ok());
}

#[test]
fn test_validate_federation() {
    assert!(FederationSettings::default().validate().is_ok());
    assert!(FederationSettings {
        participation: 0.,
        ..FederationSettings::default()
    }
    .validate()
    .is_err());
    assert!(FederationSettings {
        participation: 1. + f64::EPSILON,
        ..FederationSettings::default()
    }
    .validate()
    .is_err());
    assert!(FederationSettings {
        clients: 0,
        ..FederationSettings::default()
    }
    .validate()
    .is_err());
}

#[test]
fn test_validate_optimizer() {
    let optimizer = OptimizerSettings {
        kind: OptimizerKind::Adamw,
        lr: 1e-3,
        momentum: 0.,
        weight_decay: 0.01,
    };
    assert!(optimizer.validate_optimizer().is_ok());
    assert!(OptimizerSettings { lr: 0., ..optimizer }
        .validate_optimizer()
        .is_err());
    assert!(OptimizerSettings {
        momentum: 1.,
        ..optimizer
    }
    .validate_optimizer()
    .is_err());
}

#[test]
fn test_checkpoint_is_due() {
    let mut checkpoint = CheckpointSettings::default();
    assert!(!checkpoint.is_due(0, 3));
    checkpoint.directory = Some(PathBuf::from("checkpoints"));
    checkpoint.interval = 2;
    assert!(!checkpoint.is_due(0, 3));
    assert!(checkpoint.is_due(1, 3));
    // the last task is always checkpointed
    assert!(checkpoint.is_due(2, 3));
}
