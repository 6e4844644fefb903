use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use itertools::Itertools;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

use fleet_runner::cloud::{CloudApi, InventoryCloud, LauncherCloud};
use fleet_runner::config::{Config, JobSettings, Mode};
use fleet_runner::controller::{FleetController, FleetPlan};
use fleet_runner::dispatcher::{tally_kinds, InstallationDispatcher};
use fleet_runner::error::{FleetError, Result};
use fleet_runner::event_log::EventLog;
use fleet_runner::executor::{Console, RemoteCommand, RemoteExecutor};
use fleet_runner::job::FleetJob;
use fleet_runner::known_hosts::KnownHosts;
use fleet_runner::local::LocalExecutor;
use fleet_runner::node::{load_inventory, nominal_rating, Node};
use fleet_runner::progress::ProgressFile;
use fleet_runner::recruiter::RecruitRequest;
use fleet_runner::session::SshExecutor;
use fleet_runner::shutdown::ShutdownCoordinator;
use fleet_runner::workload::TemplateWorkload;

const EVENT_LOG: &str = "results.jlog";
const PROGRESS_FILE: &str = "progress.json";
// Home directories of simulated nodes under --local.
const LOCAL_NODES_DIR: &str = "nodes";

fn executor(settings: &JobSettings, log: &EventLog, quiet: bool) -> Arc<dyn RemoteExecutor> {
    let console = if quiet {
        Console::silent()
    } else {
        Console::new(true)
    };
    if settings.local {
        Arc::new(LocalExecutor::new(
            log.clone(),
            console,
            settings.grace_period,
            &settings.data_dir.join(LOCAL_NODES_DIR),
        ))
    } else {
        Arc::new(SshExecutor::new(log.clone(), console, settings.grace_period))
    }
}

fn require_inventory(settings: &JobSettings) -> Result<&Path> {
    settings
        .inventory
        .as_deref()
        .ok_or_else(|| FleetError::ConfigError("--inventory is required in this mode".to_string()))
}

fn new_job(settings: &JobSettings, log: EventLog, shutdown: ShutdownCoordinator) -> FleetJob {
    FleetJob::new(
        log,
        shutdown,
        settings.policy(),
        ProgressFile::new(&settings.data_dir.join(PROGRESS_FILE)),
        Instant::now() + settings.time_limit,
    )
}

async fn run_job(
    cli: &Config,
    settings: &JobSettings,
    shutdown: ShutdownCoordinator,
) -> Result<i32> {
    let data_dir = settings.data_dir.as_path();
    let log = EventLog::create(&data_dir.join(EVENT_LOG))?;
    let cloud: Arc<dyn CloudApi> = if settings.launch {
        Arc::new(LauncherCloud::from_command_line(&settings.launcher)?)
    } else {
        Arc::new(InventoryCloud::new(require_inventory(settings)?))
    };
    let workload = Arc::new(TemplateWorkload::new(&settings.workload_spec()?, data_dir)?);
    let executor = executor(settings, &log, cli.quiet);

    let job = Arc::new(new_job(settings, log, shutdown));
    let mut controller =
        FleetController::new(cloud, executor, workload, nominal_rating, &job, Some(data_dir));
    if settings.purge_known_hosts {
        controller = controller.with_known_hosts(KnownHosts::user_default());
    }
    let plan = FleetPlan {
        recruit: RecruitRequest {
            count: settings.n_nodes,
            filter: settings.filter.clone(),
            ssh_key_name: settings.ssh_key_name.clone(),
        },
        items: settings.items(),
        install_time_limit: settings.install_time_limit,
        launch: settings.launch,
        autoscale: settings.autoscale,
    };

    let summary = controller.run(job, &plan).await;
    eprintln!("[fleet] {}", summary);
    if let Some(reason) = &summary.aborted {
        eprintln!("[fleet] Aborted: {}", reason);
    }
    Ok(summary.exit_code())
}

/// Runs one command on every node of the inventory and prints how each call ended.
async fn run_tell(
    cli: &Config,
    settings: &JobSettings,
    shutdown: ShutdownCoordinator,
) -> Result<i32> {
    let command = cli
        .command
        .clone()
        .ok_or_else(|| FleetError::ConfigError("--command is required in tell mode".to_string()))?;
    let nodes: Vec<Node> = load_inventory(require_inventory(settings)?)?
        .into_iter()
        .filter(|descriptor| descriptor.is_started())
        .filter_map(|descriptor| Node::from_descriptor(descriptor, nominal_rating))
        .collect();
    if nodes.is_empty() {
        return Err(FleetError::NoNodesRecruited);
    }

    let log = EventLog::create(&settings.data_dir.join(EVENT_LOG))?;
    let executor = executor(settings, &log, cli.quiet);
    let job = new_job(settings, log, shutdown);
    let outcomes = InstallationDispatcher::new(executor)
        .broadcast(
            &job,
            &nodes,
            &RemoteCommand::shell(command),
            settings.item_time_limit,
        )
        .await;

    for (node, outcome) in nodes.iter().zip(&outcomes) {
        if !outcome.is_ok() {
            eprintln!("[fleet] {} {}: {}", node, outcome.kind, outcome.detail);
        }
    }
    let tally = tally_kinds(&outcomes)
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(kind, count)| format!("{} {}", count, kind))
        .join(", ");
    eprintln!("[fleet] {} nodes: {}", nodes.len(), tally);
    Ok(if outcomes.iter().all(|o| o.is_ok()) { 0 } else { 1 })
}

/// Terminates every node listed in the inventory.
async fn run_terminate(settings: &JobSettings) -> Result<i32> {
    let descriptors = load_inventory(require_inventory(settings)?)?;
    if descriptors.is_empty() {
        eprintln!("[fleet] Nothing to terminate.");
        return Ok(0);
    }
    let ids: Vec<String> = descriptors.iter().map(|d| d.instance_id.clone()).collect();
    let cloud = LauncherCloud::from_command_line(&settings.launcher)?;
    cloud.terminate(&ids).await?;
    if settings.purge_known_hosts {
        KnownHosts::user_default().forget(&descriptors).await;
    }
    eprintln!("[fleet] Terminated {} nodes: {}", ids.len(), ids.iter().join(" "));
    Ok(0)
}

async fn run(cli: &Config) -> Result<i32> {
    let settings = cli.settings()?;
    std::fs::create_dir_all(&settings.data_dir)?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handler()?;

    match cli.mode {
        Mode::Run => {
            settings.save(&settings.data_dir)?;
            eprintln!("[fleet] Running {} items!", settings.items().len());
            run_job(cli, &settings, shutdown).await
        }
        Mode::Tell => run_tell(cli, &settings, shutdown).await,
        Mode::Terminate => run_terminate(&settings).await,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Config::parse();
    match run(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "Job failed");
            eprintln!("[fleet] {}", e);
            std::process::exit(2);
        }
    }
}
