//! Configuration for fleet jobs.
//!
//! `Config` holds the clap structs for command line arguments and flags. `JobSettings` is
//! its validated form, which is also written to `settings.json` in the data directory so a
//! finished job records exactly how it was run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::autoscale::Autoscale;
use crate::error::{FleetError, Result};
use crate::job::JobPolicy;
use crate::workload::{InstallerField, WorkloadSpec};

pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Parser, Debug, Clone)]
#[command(version, author)]
pub struct Config {
    /// Run a batch job (run), broadcast one command (tell), or terminate nodes (terminate)
    #[arg(value_enum)]
    pub mode: Mode,

    /// Number of nodes to recruit; 0 sizes the fleet from the work with the --autoscale-* factors
    #[arg(long, default_value = "1")]
    pub nodes: usize,

    /// (With --nodes 0) Nodes per item to launch up front
    #[arg(long, default_value = "1")]
    pub autoscale_init: f64,

    /// (With --nodes 0) Recruit more while working nodes are below unfinished items times this
    #[arg(long, default_value = "1")]
    pub autoscale_min: f64,

    /// (With --nodes 0) Never recruit past unfinished items times this
    #[arg(long, default_value = "1")]
    pub autoscale_max: f64,

    /// (With --nodes 0) Seconds between checks of the number of working nodes
    #[arg(long, default_value = "20")]
    pub autoscale_interval: f64,

    /// JSON object of node constraints, passed to the launcher as is
    #[arg(long, default_value = "{}")]
    pub filter: String,

    /// Launch new nodes; otherwise nodes come from --inventory
    #[arg(long)]
    pub launch: bool,

    /// Cloud CLI used to launch and terminate nodes
    #[arg(long, default_value = "ncs")]
    pub launcher: String,

    /// Name of the SSH client key registered with the cloud account
    #[arg(long, default_value = "fleet")]
    pub ssh_key_name: String,

    /// JSON file of node descriptors to use instead of launching
    #[arg(long)]
    pub inventory: Option<PathBuf>,

    /// Directory for logs, progress, inventories and retrieved artifacts
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// First work item id
    #[arg(long, default_value = "1")]
    pub start_item: u64,

    /// Last work item id (inclusive)
    #[arg(long, default_value = "1")]
    pub end_item: u64,

    /// Step between work item ids
    #[arg(long, default_value = "1")]
    pub item_step: u64,

    /// Seconds allowed per work item attempt
    #[arg(long, default_value = "480")]
    pub item_time_limit: f64,

    /// Seconds allowed for installing on each node
    #[arg(long, default_value = "1800")]
    pub install_time_limit: f64,

    /// Seconds the whole job may run; no new work starts after that
    #[arg(long, default_value = "21600")]
    pub time_limit: f64,

    /// YAML workload file with installer, command and output templates
    #[arg(long)]
    pub workload: Option<PathBuf>,

    /// Installer command, overriding the workload file
    #[arg(long)]
    pub installer_cmd: Option<String>,

    /// Item command template, overriding the workload file
    #[arg(long)]
    pub item_cmd: Option<String>,

    /// Remote artifact to retrieve after each item, overriding the workload file
    #[arg(long)]
    pub item_output: Option<String>,

    /// Local file to upload before the installer runs
    #[arg(long)]
    pub upload: Option<PathBuf>,

    /// Consecutive failures a node may have before it is retired
    #[arg(long, default_value = "2")]
    pub max_consecutive_failures: u32,

    /// Idle workers retire while working nodes exceed unfinished items times this
    #[arg(long, default_value = "3")]
    pub overage_factor: f64,

    /// Attempts after which an item is abandoned (default: retry forever)
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Seconds between queue checks of an idle worker
    #[arg(long, default_value = "1")]
    pub poll_interval: f64,

    /// Seconds a timed-out command gets to wind down
    #[arg(long, default_value = "5")]
    pub grace_period: f64,

    /// Each worker stops after its first item
    #[arg(long)]
    pub one_item_per_worker: bool,

    /// Run commands locally with `sh -c` instead of over SSH
    #[arg(long)]
    pub local: bool,

    /// Leave host keys of released nodes in ~/.ssh/known_hosts
    #[arg(long)]
    pub keep_known_hosts: bool,

    /// (Tell mode) Command to run on every node
    #[arg(long)]
    pub command: Option<String>,

    /// Don't echo remote output to the terminal
    #[arg(long, short)]
    pub quiet: bool,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, ValueEnum)]
pub enum Mode {
    #[value(name = "run")]
    Run,
    #[value(name = "tell")]
    Tell,
    #[value(name = "terminate")]
    Terminate,
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(FleetError::ConfigError(format!(
            "--{} must be a positive number of seconds, got {}",
            name, value
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

/// Validated settings of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    pub n_nodes: usize,
    /// Present when `n_nodes` is zero.
    pub autoscale: Option<Autoscale>,
    pub filter: Value,
    pub launch: bool,
    pub launcher: String,
    pub ssh_key_name: String,
    pub inventory: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub start_item: u64,
    pub end_item: u64,
    pub item_step: u64,
    #[serde(with = "crate::serde::secs")]
    pub item_time_limit: Duration,
    #[serde(with = "crate::serde::secs")]
    pub install_time_limit: Duration,
    #[serde(with = "crate::serde::secs")]
    pub time_limit: Duration,
    pub workload: Option<PathBuf>,
    pub installer_cmd: Option<String>,
    pub item_cmd: Option<String>,
    pub item_output: Option<String>,
    pub upload: Option<PathBuf>,
    pub max_consecutive_failures: u32,
    pub overage_factor: f64,
    pub max_attempts: Option<u32>,
    #[serde(with = "crate::serde::secs")]
    pub poll_interval: Duration,
    #[serde(with = "crate::serde::secs")]
    pub grace_period: Duration,
    pub one_item_per_worker: bool,
    pub local: bool,
    pub purge_known_hosts: bool,
}

impl Config {
    pub fn settings(&self) -> Result<JobSettings> {
        let filter: Value = serde_json::from_str(&self.filter)?;
        if !filter.is_object() {
            return Err(FleetError::ConfigError(
                "--filter must be a JSON object".to_string(),
            ));
        }
        if self.item_step == 0 {
            return Err(FleetError::ConfigError("--item-step must be positive".to_string()));
        }
        if self.end_item < self.start_item {
            return Err(FleetError::ConfigError(format!(
                "--end-item {} is before --start-item {}",
                self.end_item, self.start_item
            )));
        }
        if !self.launch && self.inventory.is_none() && self.mode != Mode::Terminate {
            return Err(FleetError::ConfigError(
                "Either --launch or --inventory is required".to_string(),
            ));
        }
        if !(self.overage_factor > 0.0) {
            return Err(FleetError::ConfigError(
                "--overage-factor must be positive".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(FleetError::ConfigError(
                "--max-attempts must be at least 1".to_string(),
            ));
        }
        let autoscale = if self.nodes == 0 {
            if self.mode == Mode::Run && !self.launch {
                return Err(FleetError::ConfigError(
                    "--nodes 0 sizes a fleet of launched nodes and needs --launch".to_string(),
                ));
            }
            let autoscale = Autoscale {
                init: self.autoscale_init,
                min: self.autoscale_min,
                max: self.autoscale_max,
                check_interval: seconds("autoscale-interval", self.autoscale_interval)?,
            };
            autoscale.validate()?;
            Some(autoscale)
        } else {
            None
        };

        Ok(JobSettings {
            n_nodes: self.nodes,
            autoscale,
            filter,
            launch: self.launch,
            launcher: self.launcher.clone(),
            ssh_key_name: self.ssh_key_name.clone(),
            inventory: self.inventory.clone(),
            data_dir: self.data_dir.clone(),
            start_item: self.start_item,
            end_item: self.end_item,
            item_step: self.item_step,
            item_time_limit: seconds("item-time-limit", self.item_time_limit)?,
            install_time_limit: seconds("install-time-limit", self.install_time_limit)?,
            time_limit: seconds("time-limit", self.time_limit)?,
            workload: self.workload.clone(),
            installer_cmd: self.installer_cmd.clone(),
            item_cmd: self.item_cmd.clone(),
            item_output: self.item_output.clone(),
            upload: self.upload.clone(),
            max_consecutive_failures: self.max_consecutive_failures,
            overage_factor: self.overage_factor,
            max_attempts: self.max_attempts,
            poll_interval: seconds("poll-interval", self.poll_interval)?,
            grace_period: seconds("grace-period", self.grace_period)?,
            one_item_per_worker: self.one_item_per_worker,
            local: self.local,
            purge_known_hosts: !self.keep_known_hosts && !self.local,
        })
    }
}

impl JobSettings {
    /// Work item ids, in order.
    pub fn items(&self) -> Vec<u64> {
        (self.start_item..=self.end_item)
            .step_by(self.item_step as usize)
            .collect()
    }

    pub fn policy(&self) -> JobPolicy {
        JobPolicy {
            item_time_limit: self.item_time_limit,
            max_consecutive_failures: self.max_consecutive_failures,
            overage_factor: self.overage_factor,
            max_attempts: self.max_attempts,
            poll_interval: self.poll_interval,
            grace_period: self.grace_period,
            one_item_per_worker: self.one_item_per_worker,
        }
    }

    /// The workload file (or the default frame workload), with command line overrides.
    pub fn workload_spec(&self) -> Result<WorkloadSpec> {
        let mut spec = match &self.workload {
            Some(path) => WorkloadSpec::from_file(path)?,
            None => WorkloadSpec::default(),
        };
        if let Some(command) = &self.item_cmd {
            spec.command = command.clone();
            // A custom command has no default artifact.
            if self.workload.is_none() {
                spec.output = None;
            }
        }
        if let Some(output) = &self.item_output {
            spec.output = Some(output.clone());
        }
        if self.installer_cmd.is_some() || self.upload.is_some() {
            let mut installer = spec.installer_spec().cloned().unwrap_or_default();
            if let Some(command) = &self.installer_cmd {
                installer.command = Some(command.clone());
            }
            if let Some(upload) = &self.upload {
                installer.upload = Some(upload.clone());
            }
            spec.installer = Some(InstallerField(installer));
        }
        Ok(spec)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let file = std::fs::File::create(dir.join(SETTINGS_FILE))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}
