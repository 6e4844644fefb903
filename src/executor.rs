//! Running one command on one node.
//!
//! A [`RemoteExecutor`] never fails: every way a call can end (exit code, timeout, connection
//! failure, local error) comes back as an [`Outcome`], and every significant step is appended
//! to the event log before `execute` returns.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use colored::ColoredString;
use colourado::{Color, ColorPalette, PaletteType};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::FleetError;
use crate::event_log::EventLog;
use crate::node::Node;
use crate::outcome::Outcome;

/// File to copy to the node before the command runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub local_path: PathBuf,
    /// Destination relative to the remote home directory.
    pub remote_name: String,
}

/// File to fetch from the node after the command succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub remote_name: String,
    /// Local directory the file is written into, under its base name.
    pub local_dir: PathBuf,
}

impl Download {
    pub fn local_path(&self) -> PathBuf {
        let base = std::path::Path::new(&self.remote_name)
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| self.remote_name.clone().into());
        self.local_dir.join(base)
    }
}

/// Everything one call does on a node, in order: upload, command, download.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteCommand {
    pub command: Option<String>,
    pub upload: Option<Upload>,
    pub download: Option<Download>,
}

impl RemoteCommand {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `request` on `node`, bounded by `time_limit` of wall-clock time.
    ///
    /// If the limit elapses, the command is told to terminate, given a short grace period,
    /// and the outcome is `timeout` whatever the process does afterwards.
    async fn execute(&self, node: &Node, request: &RemoteCommand, time_limit: Duration)
        -> Outcome;
}

const PALETTE_SIZE: u32 = 24;

/// Echoes remote output to the local terminal, each line prefixed with a colored node id.
#[derive(Clone)]
pub struct Console {
    palette: Option<Arc<Vec<Color>>>,
}

impl Console {
    pub fn new(enabled: bool) -> Self {
        let palette = enabled
            .then(|| Arc::new(ColorPalette::new(PALETTE_SIZE, PaletteType::Pastel, false).colors));
        Self { palette }
    }

    pub fn silent() -> Self {
        Self { palette: None }
    }

    /// Colored `[node]` prefix; the same node always gets the same color.
    pub fn prefix(&self, node: &Node) -> Option<ColoredString> {
        let palette = self.palette.as_ref()?;
        let mut hasher = DefaultHasher::new();
        node.id.hash(&mut hasher);
        let color = palette[(hasher.finish() % palette.len() as u64) as usize];
        Some(node.prettify(color))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

/// Streams `reader` line by line into the event log (and the console, if a prefix is given)
/// until EOF.
pub(crate) async fn pump_lines<R: AsyncRead + Unpin>(
    reader: Option<R>,
    kind: StreamKind,
    node_id: &str,
    prefix: Option<&ColoredString>,
    log: &EventLog,
) {
    let reader = match reader {
        Some(reader) => reader,
        None => return,
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(reader.buffer().len());
    loop {
        buf.clear();
        if let Err(e) = read_until2(&mut reader, b'\r', b'\n', &mut buf).await {
            tracing::debug!(node = node_id, error = %e, "Output stream ended with error");
            break;
        }
        // An empty buffer means that EOF was reached.
        if buf.is_empty() {
            break;
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end();
        // `\r\n` leaves an empty piece behind, as do blank lines.
        if line.is_empty() {
            continue;
        }
        match kind {
            StreamKind::Stdout => log.stdout(node_id, line),
            StreamKind::Stderr => log.stderr(node_id, line),
        }
        if let Some(prefix) = prefix {
            // Without the lock, lines from different nodes get mixed.
            let stdout = std::io::stdout();
            let mut guard = stdout.lock();
            let _ = writeln!(guard, "{} {}", prefix, line);
        }
    }
}

/// Reads into `buf` until either delimiter (inclusive) or EOF.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            match memchr::memchr2(delimiter1, delimiter2, available) {
                Some(i) => {
                    buf.extend_from_slice(&available[..=i]);
                    (true, i + 1)
                }
                None => {
                    buf.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}

/// Exit code of a finished process; death by signal N is reported as -N.
pub(crate) fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

/// Logs and classifies a local error raised while driving a call.
pub(crate) fn exception_outcome(log: &EventLog, node: &Node, error: &FleetError) -> Outcome {
    let type_name = error.type_name();
    let message = error.message();
    tracing::warn!(node = %node.short_id(), error = %message, "Exception during remote call");
    log.exception(&node.id, &type_name, &message);
    Outcome::exception(&node.id, &type_name, &message)
}

pub(crate) fn timeout_outcome(log: &EventLog, node: &Node, time_limit: Duration) -> Outcome {
    let secs = time_limit.as_secs_f64();
    tracing::warn!(node = %node.short_id(), limit_secs = secs, "Remote call timed out");
    log.timeout(&node.id, secs);
    Outcome::timeout(&node.id, secs)
}

pub(crate) fn exit_outcome(log: &EventLog, node: &Node, status: &ExitStatus) -> Outcome {
    let code = exit_code(status);
    log.returncode(&node.id, code);
    if code != 0 {
        tracing::warn!(node = %node.short_id(), code, "Remote command failed");
    }
    Outcome::exited(&node.id, code)
}
