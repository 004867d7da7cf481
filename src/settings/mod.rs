//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. Examples of
//! configuration files can be found in the `configs/` directory located in the repository root.

#[cfg(test)]
mod tests;

use std::{fmt, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use derive_more::Display;
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
    Serialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    aggregation::{gradient::Granularity, regmean::InversePolicy, weights::Weighting},
    linalg::Precision,
    model::LabelScheme,
    strategy::ContinualMerge,
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub federation: FederationSettings,
    pub optimizer: OptimizerSettings,
    pub network: NetworkSettings,
    #[validate]
    pub data: DataSettings,
    pub strategy: StrategySettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedcl").separator("__"))?;
        config.try_into()
    }

    /// Checks the cross-section invariants.
    fn validate_settings(&self) -> Result<(), ValidationError> {
        self.optimizer.validate_optimizer()?;
        self.strategy.validate_strategy()
    }
}

/// A wrapper for validate derive.
fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.validate_settings()
}

#[derive(Debug, Clone, Validate, Deserialize)]
#[validate(schema(function = "validate_federation"))]
/// The simulated federation settings.
pub struct FederationSettings {
    /// The number of simulated clients.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// clients = 10
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCL_FEDERATION__CLIENTS=10
    /// ```
    #[validate(range(min = 1))]
    pub clients: usize,
    /// The number of communication rounds per task.
    #[validate(range(min = 1))]
    pub rounds: usize,
    /// The number of local epochs per round.
    #[validate(range(min = 1))]
    pub epochs: usize,
    /// The local minibatch size.
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// The fraction of clients sampled in every round, in `(0, 1]`.
    #[serde(default = "default_participation")]
    pub participation: f64,
    /// Whether the sampled clients train in parallel.
    #[serde(default)]
    pub parallel_clients: bool,
    /// The seed from which every random decision of a run derives.
    #[serde(default)]
    pub seed: u64,
    /// How global labels are mapped into the window of the current task.
    #[serde(default)]
    pub label_scheme: LabelScheme,
    /// Whether the global model is evaluated on the seen tasks after every round.
    #[serde(default = "default_true")]
    pub evaluate: bool,
}

fn default_participation() -> f64 {
    1.
}

fn default_true() -> bool {
    true
}

impl FederationSettings {
    /// Checks the participation fraction.
    fn validate_federation(&self) -> Result<(), ValidationError> {
        if 0. < self.participation && self.participation <= 1. {
            Ok(())
        } else {
            Err(ValidationError::new("participation must be in (0, 1]"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_federation(s: &FederationSettings) -> Result<(), ValidationError> {
    s.validate_federation()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The kind of local optimizer.
pub enum OptimizerKind {
    #[display(fmt = "sgd")]
    Sgd,
    #[display(fmt = "adamw")]
    Adamw,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// The local optimizer settings.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [optimizer]
/// kind = "sgd"
/// lr = 0.05
/// momentum = 0.9
/// ```
pub struct OptimizerSettings {
    pub kind: OptimizerKind,
    pub lr: f32,
    #[serde(default)]
    pub momentum: f32,
    #[serde(default)]
    pub weight_decay: f32,
}

impl OptimizerSettings {
    fn validate_optimizer(&self) -> Result<(), ValidationError> {
        if self.lr > 0. && (0. ..1.).contains(&self.momentum) && self.weight_decay >= 0. {
            Ok(())
        } else {
            Err(ValidationError::new("invalid optimizer hyperparameters"))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
/// The backbone settings.
pub struct NetworkSettings {
    /// The widths of the hidden layers.
    pub hidden: Vec<usize>,
    /// The seed of the weight initialisation.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Validate, Deserialize)]
/// The synthetic class-incremental benchmark settings.
pub struct DataSettings {
    /// The number of tasks of the curriculum.
    #[validate(range(min = 1))]
    pub tasks: usize,
    /// The number of new classes introduced by every task.
    #[validate(range(min = 1))]
    pub classes_per_task: usize,
    /// The dimension of the input features.
    #[validate(range(min = 1))]
    pub input_dim: usize,
    /// The number of training samples per class, split among the clients.
    #[validate(range(min = 1))]
    pub train_samples_per_class: usize,
    /// The number of test samples per class.
    #[validate(range(min = 1))]
    pub test_samples_per_class: usize,
    /// The standard deviation of the class clusters.
    #[serde(default = "default_noise")]
    pub noise: f32,
    /// The concentration of the Dirichlet distribution skewing the client partitions.
    #[serde(default = "default_dirichlet")]
    pub dirichlet_alpha: f64,
    /// The seed of the data generation and partitioning.
    #[serde(default)]
    pub seed: u64,
}

fn default_noise() -> f32 {
    0.5
}

fn default_dirichlet() -> f64 {
    1.
}

#[derive(Debug, Clone, Deserialize)]
/// Checkpoint settings.
pub struct CheckpointSettings {
    /// The directory in which a checkpoint is written at the end of a task. No checkpoints are
    /// written if unset.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [checkpoint]
    /// directory = "./checkpoints"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCL_CHECKPOINT__DIRECTORY=./checkpoints
    /// ```
    pub directory: Option<PathBuf>,
    /// A checkpoint is written after every `interval`-th task and after the last one.
    #[serde(default = "default_interval")]
    pub interval: usize,
}

fn default_interval() -> usize {
    1
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            directory: None,
            interval: default_interval(),
        }
    }
}

impl CheckpointSettings {
    /// Whether a checkpoint is due after the task `task` of `tasks`.
    pub fn is_due(&self, task: usize, tasks: usize) -> bool {
        self.directory.is_some() && ((task + 1) % self.interval.max(1) == 0 || task + 1 == tasks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The name of a merge strategy.
pub enum StrategyKind {
    #[display(fmt = "fedavg")]
    FedAvg,
    #[display(fmt = "cocoavg")]
    CocoAvg,
    #[display(fmt = "regmean")]
    RegMean,
    #[display(fmt = "lora")]
    Lora,
    #[display(fmt = "vera")]
    Vera,
    #[display(fmt = "lora_fisher")]
    LoraFisher,
    #[display(fmt = "hgp")]
    Hgp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// The merge strategy settings.
///
/// Unknown strategy names are rejected when the settings are parsed.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [strategy]
/// kind = "lora"
/// rank = 4
/// cl_merge = "run_mean"
/// ```
pub enum StrategySettings {
    #[serde(rename = "fedavg")]
    FedAvg(FedAvgSettings),
    #[serde(rename = "cocoavg")]
    CocoAvg(CocoAvgSettings),
    #[serde(rename = "regmean")]
    RegMean(RegMeanSettings),
    Lora(LoraSettings),
    Vera(VeraSettings),
    LoraFisher(LoraFisherSettings),
    Hgp(HgpSettings),
}

impl StrategySettings {
    /// The name of the configured strategy.
    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategySettings::FedAvg(_) => StrategyKind::FedAvg,
            StrategySettings::CocoAvg(_) => StrategyKind::CocoAvg,
            StrategySettings::RegMean(_) => StrategyKind::RegMean,
            StrategySettings::Lora(_) => StrategyKind::Lora,
            StrategySettings::Vera(_) => StrategyKind::Vera,
            StrategySettings::LoraFisher(_) => StrategyKind::LoraFisher,
            StrategySettings::Hgp(_) => StrategyKind::Hgp,
        }
    }

    /// Checks the strategy hyperparameters.
    pub(crate) fn validate_strategy(&self) -> Result<(), ValidationError> {
        match self {
            StrategySettings::FedAvg(_) => Ok(()),
            StrategySettings::CocoAvg(s) => s.validate_cocoavg(),
            StrategySettings::RegMean(s) => s.validate_regmean(),
            StrategySettings::Lora(s) => s.validate_lora(),
            StrategySettings::Vera(s) => s.validate_vera(),
            StrategySettings::LoraFisher(s) => s.validate_lora_fisher(),
            StrategySettings::Hgp(s) => s.validate_hgp(),
        }
    }
}

fn is_fraction(x: f64) -> bool {
    (0. ..=1.).contains(&x)
}

fn check(condition: bool, code: &'static str) -> Result<(), ValidationError> {
    if condition {
        Ok(())
    } else {
        Err(ValidationError::new(code))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
/// Plain weighted averaging of the full parameter vector.
pub struct FedAvgSettings {
    #[serde(default)]
    pub weighting: Weighting,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
/// Gradient based client weighting.
pub struct GradientSettings {
    /// Whether the importance is normalized per scalar parameter or per layer.
    pub granularity: Granularity,
    /// The share of the sample weight blended into per-layer importance weights.
    #[serde(default)]
    pub gamma_gr_numcl: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
/// Class-aware averaging of the full model.
pub struct CocoAvgSettings {
    /// The base client weighting of the backbone.
    #[serde(default)]
    pub weighting: Weighting,
    /// If set, the head rows are merged per class, blending the sample share (with this factor)
    /// and the feature variance share (with its complement).
    #[serde(default)]
    pub alpha_sample_classes: Option<f64>,
    /// If set, the client weights are blended with label entropy weights by this factor.
    #[serde(default)]
    pub entropy_beta: Option<f64>,
    /// If set, the backbone is merged with gradient importance weights.
    #[serde(default)]
    pub gradient: Option<GradientSettings>,
    /// The number of head-only epochs at the first round of every task.
    #[serde(default)]
    pub linear_probe_epochs: usize,
}

impl CocoAvgSettings {
    fn validate_cocoavg(&self) -> Result<(), ValidationError> {
        check(
            self.alpha_sample_classes.map(is_fraction).unwrap_or(true),
            "alpha_sample_classes must be in [0, 1]",
        )?;
        check(
            self.entropy_beta.map(is_fraction).unwrap_or(true),
            "entropy_beta must be in [0, 1]",
        )?;
        check(
            self.gradient
                .map(|g| is_fraction(g.gamma_gr_numcl))
                .unwrap_or(true),
            "gamma_gr_numcl must be in [0, 1]",
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// Closed-form regression merge of the linear layers.
pub struct RegMeanSettings {
    /// The damping of the backbone Gram matrices towards their diagonal.
    #[serde(default = "default_alpha")]
    pub alpha_backbone: f64,
    /// The damping of the head Gram matrix towards its diagonal.
    #[serde(default = "default_alpha")]
    pub alpha_head: f64,
    /// The fraction of the local data used to accumulate the Gram matrices.
    #[serde(default = "default_fraction")]
    pub gram_fraction: f64,
    /// The accumulation precision of the Gram matrices.
    #[serde(default)]
    pub precision: Precision,
    /// Whether the accumulated Gram matrix is inverted or pseudo-inverted.
    #[serde(default)]
    pub inverse: InversePolicy,
    /// If set, only the head is regression-merged and the backbone is averaged.
    #[serde(default)]
    pub head_only: bool,
}

impl Default for RegMeanSettings {
    fn default() -> Self {
        Self {
            alpha_backbone: default_alpha(),
            alpha_head: default_alpha(),
            gram_fraction: default_fraction(),
            precision: Precision::default(),
            inverse: InversePolicy::default(),
            head_only: false,
        }
    }
}

fn default_alpha() -> f64 {
    0.9
}

fn default_fraction() -> f64 {
    1.
}

impl RegMeanSettings {
    fn validate_regmean(&self) -> Result<(), ValidationError> {
        check(
            is_fraction(self.alpha_backbone) && is_fraction(self.alpha_head),
            "regmean alpha must be in [0, 1]",
        )?;
        check(
            0. < self.gram_fraction && self.gram_fraction <= 1.,
            "gram_fraction must be in (0, 1]",
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// Low-rank adapter training and merging.
pub struct LoraSettings {
    /// The rank of the adapters.
    pub rank: usize,
    /// Whether the head carries an adapter too, instead of being trained and averaged directly.
    #[serde(default)]
    pub lora_head: bool,
    /// How the delta of a completed task is folded into the frozen accumulated delta.
    #[serde(default)]
    pub cl_merge: ContinualMerge,
    /// If set, the effective adapter deltas are regression-merged instead of averaging the factors.
    #[serde(default)]
    pub regmean: Option<RegMeanSettings>,
    /// The number of alternating closed-form solves of the regression hybrid.
    #[serde(default = "default_iters")]
    pub alternating_iters: usize,
    /// Whether clients keep the down projections `A` at their broadcast value and only train `B`.
    #[serde(default)]
    pub freeze_a: bool,
    /// The seed of the adapter initialisation.
    #[serde(default)]
    pub seed: u64,
}

fn default_iters() -> usize {
    1
}

impl LoraSettings {
    fn validate_lora(&self) -> Result<(), ValidationError> {
        check(self.rank > 0, "rank must be positive")?;
        check(
            self.cl_merge != ContinualMerge::Fisher,
            "the fisher continual merge requires the lora_fisher strategy",
        )?;
        check(self.alternating_iters > 0, "alternating_iters must be positive")?;
        self.regmean
            .as_ref()
            .map(RegMeanSettings::validate_regmean)
            .unwrap_or(Ok(()))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// Shared random basis adapters.
pub struct VeraSettings {
    /// The rank of the shared basis.
    pub rank: usize,
    /// The initial value of the trainable `d` scaling vectors.
    #[serde(default = "default_d_initial")]
    pub d_initial: f32,
    /// How the delta of a completed task is folded into the frozen accumulated delta.
    #[serde(default)]
    pub cl_merge: ContinualMerge,
    /// Whether the head carries an adapter too.
    #[serde(default)]
    pub lora_head: bool,
    /// The seed of the shared frozen basis.
    #[serde(default)]
    pub basis_seed: u64,
}

fn default_d_initial() -> f32 {
    0.1
}

impl VeraSettings {
    fn validate_vera(&self) -> Result<(), ValidationError> {
        check(self.rank > 0, "rank must be positive")?;
        check(
            self.cl_merge != ContinualMerge::Fisher,
            "the fisher continual merge requires the lora_fisher strategy",
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// Fisher-weighted low-rank adapter merging.
pub struct LoraFisherSettings {
    /// The rank of the adapters.
    pub rank: usize,
    /// How the delta of a completed task is folded into the frozen accumulated delta.
    #[serde(default = "default_fisher_merge")]
    pub cl_merge: ContinualMerge,
    /// The maximum number of samples of the per-round Fisher estimate.
    #[serde(default = "default_fisher_maxiter")]
    pub fisher_maxiter: usize,
    /// The smoothing added to every Fisher value before normalizing.
    #[serde(default = "default_fisher_eps")]
    pub fisher_eps: f64,
    /// The regression settings of the `A` factor and head solves.
    #[serde(default)]
    pub regmean: RegMeanSettings,
    /// The seed of the adapter initialisation and of the Monte-Carlo sampling.
    #[serde(default)]
    pub seed: u64,
}

fn default_fisher_merge() -> ContinualMerge {
    ContinualMerge::Fisher
}

fn default_fisher_maxiter() -> usize {
    64
}

fn default_fisher_eps() -> f64 {
    1e-8
}

impl LoraFisherSettings {
    fn validate_lora_fisher(&self) -> Result<(), ValidationError> {
        check(self.rank > 0, "rank must be positive")?;
        check(self.fisher_maxiter > 0, "fisher_maxiter must be positive")?;
        check(self.fisher_eps > 0., "fisher_eps must be positive")?;
        self.regmean.validate_regmean()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
/// Gaussian-mixture prototype replay.
pub struct HgpSettings {
    /// The client weighting of the model average.
    #[serde(default)]
    pub weighting: Weighting,
    /// Whether the prototypes carry a full covariance instead of a diagonal one.
    #[serde(default)]
    pub full_cov: bool,
    /// The inflation factor of the diagonal variances when sampling.
    #[serde(default = "default_variance_scale")]
    pub variance_scale: f64,
    /// The number of synthetic features drawn per class and rebalancing epoch.
    #[serde(default = "default_samples_per_class")]
    pub samples_per_class: usize,
    /// The number of head rebalancing epochs.
    #[serde(default = "default_rebalance_epochs")]
    pub rebalance_epochs: usize,
    /// The learning rate of the head rebalancing.
    #[serde(default = "default_rebalance_lr")]
    pub rebalance_lr: f32,
    /// The minibatch size of the head rebalancing.
    #[serde(default = "default_rebalance_batch_size")]
    pub rebalance_batch_size: usize,
    /// The temperature of the decoupled logits.
    #[serde(default = "default_logit_norm")]
    pub logit_norm: f32,
    /// Only replay classes of previous tasks.
    #[serde(default)]
    pub reb_only_old: bool,
    /// Only replay classes of the current task.
    #[serde(default)]
    pub reb_only_cur: bool,
    /// Rebalance the head after every round instead of only at the end of a task.
    #[serde(default)]
    pub rebalance_every_round: bool,
    /// The number of head-only epochs at the first round of every task.
    #[serde(default)]
    pub linear_probe_epochs: usize,
}

fn default_variance_scale() -> f64 {
    3.
}

fn default_samples_per_class() -> usize {
    64
}

fn default_rebalance_epochs() -> usize {
    10
}

fn default_rebalance_lr() -> f32 {
    0.01
}

fn default_rebalance_batch_size() -> usize {
    64
}

fn default_logit_norm() -> f32 {
    0.1
}

impl Default for HgpSettings {
    fn default() -> Self {
        Self {
            weighting: Weighting::default(),
            full_cov: false,
            variance_scale: default_variance_scale(),
            samples_per_class: default_samples_per_class(),
            rebalance_epochs: default_rebalance_epochs(),
            rebalance_lr: default_rebalance_lr(),
            rebalance_batch_size: default_rebalance_batch_size(),
            logit_norm: default_logit_norm(),
            reb_only_old: false,
            reb_only_cur: false,
            rebalance_every_round: false,
            linear_probe_epochs: 0,
        }
    }
}

impl HgpSettings {
    fn validate_hgp(&self) -> Result<(), ValidationError> {
        check(
            !(self.reb_only_old && self.reb_only_cur),
            "reb_only_old and reb_only_cur are mutually exclusive",
        )?;
        check(
            self.variance_scale > 0. && self.logit_norm > 0. && self.rebalance_lr > 0.,
            "invalid rebalancing hyperparameters",
        )?;
        check(
            self.rebalance_batch_size > 0,
            "rebalance_batch_size must be positive",
        )
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDCL_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
