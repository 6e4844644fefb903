use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{FleetError, Result};
use crate::event_log::EventLog;
use crate::executor::{
    exception_outcome, exit_outcome, pump_lines, timeout_outcome, Console, Download,
    RemoteCommand, RemoteExecutor, StreamKind, Upload,
};
use crate::node::Node;
use crate::outcome::{error_type_name, CallPhase, Outcome};

/// Runs commands over SSH, one multiplexed session per call.
pub struct SshExecutor {
    log: EventLog,
    console: Console,
    /// How long a session gets to close after its command timed out.
    grace_period: Duration,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(log: EventLog, console: Console, grace_period: Duration) -> Self {
        Self {
            log,
            console,
            grace_period,
            connect_timeout: Duration::from_secs(30),
        }
    }

    async fn connect(&self, node: &Node) -> std::result::Result<Session, openssh::Error> {
        let mut builder = SessionBuilder::default();
        builder
            .user(node.endpoint.user.clone())
            .port(node.endpoint.port)
            .known_hosts_check(KnownHosts::Add)
            .connect_timeout(self.connect_timeout)
            .server_alive_interval(Duration::from_secs(15));
        builder.connect_mux(&node.endpoint.host).await
    }

    /// Upload, command, download, each against the same deadline.
    async fn drive(
        &self,
        session: &Session,
        node: &Node,
        request: &RemoteCommand,
        deadline: Instant,
        time_limit: Duration,
    ) -> Outcome {
        if let Some(upload) = &request.upload {
            self.log.operation(
                &node.id,
                "upload",
                json!([upload.local_path.display().to_string(), upload.remote_name]),
            );
            match timeout_at(deadline, self.upload(session, upload)).await {
                Err(_) => {
                    return timeout_outcome(&self.log, node, time_limit).at(CallPhase::Upload)
                }
                Ok(Err(e)) => {
                    return exception_outcome(&self.log, node, &e).at(CallPhase::Upload)
                }
                Ok(Ok(())) => {}
            }
        }

        if let Some(command) = &request.command {
            self.log.operation(&node.id, "command", json!(command));
            let outcome = match timeout_at(deadline, self.run(session, node, command)).await {
                Err(_) => return timeout_outcome(&self.log, node, time_limit),
                Ok(Err(e)) => return exception_outcome(&self.log, node, &e),
                Ok(Ok(status)) => exit_outcome(&self.log, node, &status),
            };
            if !outcome.is_ok() {
                return outcome;
            }
        }

        if let Some(download) = &request.download {
            self.log.operation(
                &node.id,
                "download",
                json!([
                    download.remote_name,
                    download.local_path().display().to_string()
                ]),
            );
            match timeout_at(deadline, self.download(session, download)).await {
                Err(_) => {
                    return timeout_outcome(&self.log, node, time_limit).at(CallPhase::Download)
                }
                Ok(Err(e)) => {
                    return exception_outcome(&self.log, node, &e).at(CallPhase::Download)
                }
                Ok(Ok(())) => {}
            }
        }

        Outcome::ok(&node.id)
    }

    async fn run(&self, session: &Session, node: &Node, command: &str) -> Result<ExitStatus> {
        let mut cmd = session.command("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut process = cmd.spawn().await?;

        let prefix = self.console.prefix(node);
        join(
            pump_lines(
                process.stdout().take(),
                StreamKind::Stdout,
                &node.id,
                prefix.as_ref(),
                &self.log,
            ),
            pump_lines(
                process.stderr().take(),
                StreamKind::Stderr,
                &node.id,
                prefix.as_ref(),
                &self.log,
            ),
        )
        .await;
        Ok(process.wait().await?)
    }

    async fn upload(&self, session: &Session, upload: &Upload) -> Result<()> {
        let mut file = tokio::fs::File::open(&upload.local_path).await?;
        let mut cmd = session.command("sh");
        cmd.arg("-c")
            .arg("cat > \"$1\"")
            .arg("fleet-upload")
            .arg(&upload.remote_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut process = cmd.spawn().await?;
        if let Some(mut stdin) = process.stdin().take() {
            tokio::io::copy(&mut file, &mut stdin).await?;
            stdin.shutdown().await?;
        }
        let status = process.wait().await?;
        if !status.success() {
            return Err(transfer_failed(&upload.remote_name, status));
        }
        Ok(())
    }

    async fn download(&self, session: &Session, download: &Download) -> Result<()> {
        tokio::fs::create_dir_all(&download.local_dir).await?;
        let local_path = download.local_path();
        let mut cmd = session.command("cat");
        cmd.arg(&download.remote_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut process = cmd.spawn().await?;
        let mut file = tokio::fs::File::create(&local_path).await?;
        if let Some(mut stdout) = process.stdout().take() {
            tokio::io::copy(&mut stdout, &mut file).await?;
        }
        file.flush().await?;
        let status = process.wait().await?;
        if !status.success() {
            drop(file);
            let _ = tokio::fs::remove_file(&local_path).await;
            return Err(transfer_failed(&download.remote_name, status));
        }
        Ok(())
    }
}

/// A node that could not be reached is `unreachable`, however long it took to find out.
fn connect_failed(log: &EventLog, node: &Node, type_name: &str, message: &str) -> Outcome {
    tracing::warn!(node = %node.short_id(), error = %message, "Failed to connect");
    log.exception(&node.id, type_name, message);
    Outcome::unreachable(&node.id, type_name, message).at(CallPhase::Connect)
}

fn transfer_failed(name: &str, status: ExitStatus) -> FleetError {
    FleetError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("transfer of '{}' exited with {}", name, status),
    ))
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        node: &Node,
        request: &RemoteCommand,
        time_limit: Duration,
    ) -> Outcome {
        let deadline = Instant::now() + time_limit;
        self.log.operation(
            &node.id,
            "connect",
            json!([node.endpoint.destination(), node.endpoint.port]),
        );
        let session = match timeout_at(deadline, self.connect(node)).await {
            Err(_) => {
                let message = format!(
                    "no session within the call's limit of {:.1}s",
                    time_limit.as_secs_f64()
                );
                return connect_failed(&self.log, node, "ConnectTimeout", &message);
            }
            Ok(Err(e)) => {
                return connect_failed(&self.log, node, &error_type_name(&e), &e.to_string())
            }
            Ok(Ok(session)) => session,
        };
        tracing::debug!(node = %node.short_id(), "Connected");

        let outcome = self
            .drive(&session, node, request, deadline, time_limit)
            .await;

        // Closing the master connection is what stops a command that outlived its limit.
        match timeout(self.grace_period, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(node = %node.short_id(), error = %e, "Error while closing session");
            }
            Err(_) => tracing::warn!(
                node = %node.short_id(),
                "Session did not close within the grace period"
            ),
        }
        outcome
    }
}
