use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::Result;
use crate::event_log::EventLog;
use crate::executor::{
    exception_outcome, exit_outcome, pump_lines, timeout_outcome, Console, RemoteCommand,
    RemoteExecutor, StreamKind,
};
use crate::node::Node;
use crate::outcome::{CallPhase, Outcome};

/// Runs commands as local `sh -c` processes, treating `work_dir/<node id>` as the node's
/// home directory. Handy for dry runs and for testing workloads without renting anything.
pub struct LocalExecutor {
    log: EventLog,
    console: Console,
    grace_period: Duration,
    work_dir: PathBuf,
}

impl LocalExecutor {
    pub fn new(
        log: EventLog,
        console: Console,
        grace_period: Duration,
        work_dir: &Path,
    ) -> Self {
        Self {
            log,
            console,
            grace_period,
            work_dir: work_dir.to_path_buf(),
        }
    }

    fn home(&self, node: &Node) -> PathBuf {
        self.work_dir.join(&node.id)
    }

    async fn drive(
        &self,
        node: &Node,
        request: &RemoteCommand,
        deadline: Instant,
        time_limit: Duration,
    ) -> Outcome {
        let home = self.home(node);
        if let Err(e) = tokio::fs::create_dir_all(&home).await {
            return exception_outcome(&self.log, node, &e.into());
        }

        if let Some(upload) = &request.upload {
            self.log.operation(
                &node.id,
                "upload",
                json!([upload.local_path.display().to_string(), upload.remote_name]),
            );
            let dest = home.join(&upload.remote_name);
            match timeout_at(deadline, tokio::fs::copy(&upload.local_path, &dest)).await {
                Err(_) => {
                    return timeout_outcome(&self.log, node, time_limit).at(CallPhase::Upload)
                }
                Ok(Err(e)) => {
                    return exception_outcome(&self.log, node, &e.into()).at(CallPhase::Upload)
                }
                Ok(Ok(_)) => {}
            }
        }

        if let Some(command) = &request.command {
            self.log.operation(&node.id, "command", json!(command));
            let mut child = match self.spawn(node, &home, command) {
                Ok(child) => child,
                Err(e) => return exception_outcome(&self.log, node, &e),
            };
            let prefix = self.console.prefix(node);
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let finished = timeout_at(deadline, async {
                join(
                    pump_lines(stdout, StreamKind::Stdout, &node.id, prefix.as_ref(), &self.log),
                    pump_lines(stderr, StreamKind::Stderr, &node.id, prefix.as_ref(), &self.log),
                )
                .await;
                child.wait().await
            })
            .await;
            let status: ExitStatus = match finished {
                Err(_) => {
                    self.terminate(node, &mut child).await;
                    return timeout_outcome(&self.log, node, time_limit);
                }
                Ok(Err(e)) => return exception_outcome(&self.log, node, &e.into()),
                Ok(Ok(status)) => status,
            };
            let outcome = exit_outcome(&self.log, node, &status);
            if !outcome.is_ok() {
                return outcome;
            }
        }

        if let Some(download) = &request.download {
            let local_path = download.local_path();
            self.log.operation(
                &node.id,
                "download",
                json!([download.remote_name, local_path.display().to_string()]),
            );
            let fetch = async {
                tokio::fs::create_dir_all(&download.local_dir).await?;
                tokio::fs::copy(home.join(&download.remote_name), &local_path).await
            };
            match timeout_at(deadline, fetch).await {
                Err(_) => {
                    return timeout_outcome(&self.log, node, time_limit).at(CallPhase::Download)
                }
                Ok(Err(e)) => {
                    return exception_outcome(&self.log, node, &e.into()).at(CallPhase::Download)
                }
                Ok(Ok(_)) => {}
            }
        }

        Outcome::ok(&node.id)
    }

    /// The command leads its own process group, so a timeout can stop everything it forked.
    fn spawn(&self, node: &Node, home: &Path, command: &str) -> Result<Child> {
        Ok(Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(home)
            .env("FLEET_INSTANCE_ID", &node.id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?)
    }

    /// SIGTERM to the whole process group, then SIGKILL to whatever is left of it once the
    /// grace period is over.
    async fn terminate(&self, node: &Node, child: &mut Child) {
        let group = child.id().map(|pid| format!("-{}", pid));
        if let Some(group) = &group {
            signal_group("-TERM", group).await;
        }
        if timeout(self.grace_period, child.wait()).await.is_err() {
            tracing::debug!(node = %node.short_id(), "Killing process after grace period");
            let _ = child.start_kill();
        }
        // Descendants can outlive the shell itself.
        if let Some(group) = &group {
            signal_group("-KILL", group).await;
        }
        let _ = child.wait().await;
    }
}

async fn signal_group(signal: &str, group: &str) {
    let status = Command::new("kill")
        .arg(signal)
        .arg("--")
        .arg(group)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        tracing::warn!(group, signal, error = %e, "Failed to signal process group");
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(
        &self,
        node: &Node,
        request: &RemoteCommand,
        time_limit: Duration,
    ) -> Outcome {
        let deadline = Instant::now() + time_limit;
        self.drive(node, request, deadline, time_limit).await
    }
}
