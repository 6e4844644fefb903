//! Forgetting host keys of released nodes.
//!
//! Sessions accept new host keys on first contact, so every node a job touches leaves a line
//! in `known_hosts`. Cloud endpoints are recycled: the next device behind the same host and
//! port has a different key, and ssh refuses it as a changed host. Released nodes are
//! therefore removed with `ssh-keygen -R`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::node::NodeDescriptor;

/// The name ssh files a host key under: `host` on port 22, `[host]:port` elsewhere.
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    /// `None` means the user's default, `~/.ssh/known_hosts`.
    file: Option<PathBuf>,
}

impl KnownHosts {
    pub fn user_default() -> Self {
        Self { file: None }
    }

    pub fn at(file: &Path) -> Self {
        Self {
            file: Some(file.to_path_buf()),
        }
    }

    /// Removes the host keys of every descriptor with an SSH endpoint. Best-effort.
    ///
    /// Returns how many endpoints `ssh-keygen` accepted.
    pub async fn forget(&self, descriptors: &[NodeDescriptor]) -> usize {
        let mut forgotten = 0;
        for ssh in descriptors.iter().filter_map(|d| d.ssh.as_ref()) {
            let pattern = host_pattern(&ssh.host, ssh.port);
            if self.remove(&pattern).await {
                forgotten += 1;
            }
        }
        tracing::debug!(forgotten, "Purged known hosts");
        forgotten
    }

    async fn remove(&self, pattern: &str) -> bool {
        let mut command = Command::new("ssh-keygen");
        command.arg("-q").arg("-R").arg(pattern);
        if let Some(file) = &self.file {
            command.arg("-f").arg(file);
        }
        let status = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::warn!(host = pattern, %status, "ssh-keygen could not purge host key");
                false
            }
            Err(e) => {
                tracing::warn!(host = pattern, error = %e, "Failed to run ssh-keygen");
                false
            }
        }
    }
}
