//! Launches a system from a configuration file: parses it, builds the
//! clock and every configured worker, admits them, then runs until
//! interrupted (spec.md §6 "CLI surface").

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use time::OffsetDateTime;

use race_core::adapter::AdapterWorker;
use race_core::clock::Clock;
use race_core::config::{SystemConfig, WorkerConfig};
use race_core::replay::{JsonLinesArchiveReader, ReplayScheduler};
use race_core::system::{SupervisionPolicy, System};
use race_core::{ChannelId, Error as CoreError, MailboxPolicy, Result as CoreResult, Worker, WorkerId};

#[derive(Parser)]
#[command(name = "race", version, about = "Run a RACE system from a configuration file")]
struct Cli {
    /// Path to the system configuration file (JSON).
    config_path: PathBuf,

    /// Override the configured simulation base date (RFC3339).
    #[arg(long = "base-date")]
    base_date: Option<String>,

    /// Override the configured simulation time scale.
    #[arg(long = "time-scale")]
    time_scale: Option<f64>,
}

const EXIT_CLEAN: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_RUNTIME_FATAL: i32 = 2;

enum RunError {
    Init(anyhow::Error),
    Runtime(anyhow::Error),
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => std::process::exit(EXIT_CLEAN),
        Err(RunError::Init(e)) => {
            error!("initialization failed: {e:#}");
            std::process::exit(EXIT_INIT_FAILURE);
        }
        Err(RunError::Runtime(e)) => {
            error!("runtime failure: {e:#}");
            std::process::exit(EXIT_RUNTIME_FATAL);
        }
    }
}

async fn run(cli: Cli) -> Result<(), RunError> {
    let text = fs::read_to_string(&cli.config_path)
        .with_context(|| format!("reading config file {}", cli.config_path.display()))
        .map_err(RunError::Init)?;
    let system_config = SystemConfig::from_json_str(&text)
        .map_err(anyhow::Error::from)
        .map_err(RunError::Init)?;

    let base_date = match &cli.base_date {
        Some(s) => OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
            .context("parsing --base-date")
            .map_err(RunError::Init)?,
        None => system_config
            .base_date_parsed()
            .map_err(anyhow::Error::from)
            .map_err(RunError::Init)?,
    };
    let time_scale = cli.time_scale.unwrap_or(system_config.time_scale);

    let clock = Clock::new(base_date, time_scale);
    let system = System::new(clock);

    for config in system_config.worker_configs() {
        let name = config.name().map_err(anyhow::Error::from).map_err(RunError::Init)?.to_string();
        spawn_from_config(&system, config)
            .await
            .with_context(|| format!("starting worker `{name}`"))
            .map_err(RunError::Init)?;
        info!("worker `{name}` started");
    }

    info!("all workers started; running until interrupted");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")
        .map_err(RunError::Runtime)?;
    info!("shutdown requested");
    system.shutdown().await;
    Ok(())
}

/// Maps a worker's `class` to one of the concrete `Worker` implementations
/// this crate ships (spec.md §6: `class` is "implementation selector").
/// Domain-specific worker classes are an external collaborator's concern
/// (see crate docs); only the two generic framework workers are built in.
async fn spawn_from_config(system: &Arc<System>, config: WorkerConfig) -> CoreResult<WorkerId> {
    let id = WorkerId::new(config.name()?);
    let capacity = config.buffer_size();
    let class = config.class()?;

    let worker: Box<dyn Worker> = match class {
        "replay" => {
            let path = Path::new(config.archive_path()?);
            let reader = JsonLinesArchiveReader::open(path)?;
            let channel: ChannelId = config
                .write_to()
                .first()
                .ok_or_else(|| CoreError::Config("replay worker requires write-to".into()))?
                .as_str()
                .into();
            Box::new(ReplayScheduler::new(
                id.clone(),
                Box::new(reader),
                channel,
                None,
                &config,
            )?)
        }
        "adapter" => Box::new(AdapterWorker::new(id.clone(), &config, None, None)?),
        other => {
            return Err(CoreError::Config(format!("unknown worker class `{other}`")));
        }
    };

    system
        .spawn_worker(
            worker,
            config,
            MailboxPolicy::DropNewest { capacity },
            SupervisionPolicy::default(),
            None,
        )
        .await
}
