use std::{path::PathBuf, process, sync::Arc};

use anyhow::Context;
use structopt::StructOpt;
use tracing_subscriber::*;

use fedcl::{
    data::synthetic::SyntheticBenchmark,
    settings::Settings,
    state_machine::StateMachineInitializer,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedcl-simulate")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
    /// Checkpoint to resume the run from
    #[structopt(short, long, parse(from_os_str))]
    restore: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = Settings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let Settings {
        federation,
        optimizer,
        network,
        data,
        strategy,
        checkpoint,
        log,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log.filter)
        .with_ansi(true)
        .init();

    let data = SyntheticBenchmark::new(&data, federation.clients);
    let mut initializer = StateMachineInitializer::new(
        federation,
        optimizer,
        network,
        strategy,
        checkpoint,
        Arc::new(data),
    );
    if let Some(path) = opt.restore {
        initializer = initializer.restore_from(path);
    }
    let state_machine = initializer
        .init()
        .context("failed to initialize the state machine")?;

    let report = state_machine.run().context("the simulation failed")?;
    match report.last() {
        Some(accuracy) => info!(
            "final mean accuracy {:.4} over {} tasks",
            accuracy.mean(),
            accuracy.per_task.len()
        ),
        None => warn!("the simulation did not evaluate the global model"),
    }
    Ok(())
}
