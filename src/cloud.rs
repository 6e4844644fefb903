//! The cloud account API: the only way nodes are acquired and released.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::error::{FleetError, Result};
use crate::node::{load_inventory, NodeDescriptor};

#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Requests `count` nodes matching `filter`, reachable with the SSH key `ssh_key_name`.
    ///
    /// The returned descriptors may include nodes that never started.
    async fn launch(
        &self,
        count: usize,
        filter: &Value,
        ssh_key_name: &str,
    ) -> Result<Vec<NodeDescriptor>>;

    async fn terminate(&self, instance_ids: &[String]) -> Result<()>;

    /// How many devices matching `filter` could be launched right now, if the provider
    /// can tell.
    async fn available(&self, _filter: &Value) -> Result<Option<usize>> {
        Ok(None)
    }
}

/// Drives an external cloud CLI:
///
/// - `<program> [args..] launch --count N --filter JSON --sshClientKeyName K --json`,
///   printing a JSON array of node descriptors on stdout;
/// - `<program> [args..] terminate --instanceId ID [ID..]`;
/// - `<program> [args..] available --filter JSON`, printing a device count on stdout.
pub struct LauncherCloud {
    program: String,
    args: Vec<String>,
}

impl LauncherCloud {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a launcher given as one shell-like string, e.g. `python3 ncs.py`.
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| FleetError::ConfigError("Launcher command is empty".to_string()))?;
        Ok(Self::new(program, words.collect()))
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn cli_failed(op: &'static str, output: &std::process::Output) -> FleetError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    FleetError::CloudError {
        op,
        message: format!("launcher exited with {}: {}", output.status, stderr.trim()),
    }
}

#[async_trait]
impl CloudApi for LauncherCloud {
    async fn launch(
        &self,
        count: usize,
        filter: &Value,
        ssh_key_name: &str,
    ) -> Result<Vec<NodeDescriptor>> {
        let output = self
            .command()
            .arg("launch")
            .arg("--count")
            .arg(count.to_string())
            .arg("--filter")
            .arg(filter.to_string())
            .arg("--sshClientKeyName")
            .arg(ssh_key_name)
            .arg("--json")
            .output()
            .await?;
        if !output.status.success() {
            return Err(cli_failed("launch", &output));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<()> {
        let output = self
            .command()
            .arg("terminate")
            .arg("--instanceId")
            .args(instance_ids)
            .output()
            .await?;
        if !output.status.success() {
            return Err(cli_failed("terminate", &output));
        }
        Ok(())
    }

    async fn available(&self, filter: &Value) -> Result<Option<usize>> {
        let output = self
            .command()
            .arg("available")
            .arg("--filter")
            .arg(filter.to_string())
            .output()
            .await?;
        if !output.status.success() {
            return Err(cli_failed("available", &output));
        }
        let count = String::from_utf8_lossy(&output.stdout);
        count
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FleetError::CloudError {
                op: "available",
                message: format!("expected a device count, got '{}'", count.trim()),
            })
    }
}

/// Hands out nodes listed in an inventory file instead of renting new ones.
///
/// Terminating only forgets the nodes; they belong to whoever listed them.
pub struct InventoryCloud {
    path: PathBuf,
}

impl InventoryCloud {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

#[async_trait]
impl CloudApi for InventoryCloud {
    async fn launch(
        &self,
        count: usize,
        _filter: &Value,
        _ssh_key_name: &str,
    ) -> Result<Vec<NodeDescriptor>> {
        let mut descriptors = load_inventory(&self.path)?;
        descriptors.retain(NodeDescriptor::is_started);
        descriptors.truncate(count);
        Ok(descriptors)
    }

    async fn available(&self, _filter: &Value) -> Result<Option<usize>> {
        let descriptors = load_inventory(&self.path)?;
        Ok(Some(descriptors.iter().filter(|d| d.is_started()).count()))
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<()> {
        tracing::info!(
            count = instance_ids.len(),
            "Released inventory nodes without terminating them"
        );
        Ok(())
    }
}
