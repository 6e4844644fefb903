//! Acquiring and releasing nodes.
//!
//! `NodeRecruiter` and `Terminator` are the only callers of [`CloudApi`]. Both leave an
//! audit trail in the data directory so that leaked instances can be found by hand:
//! `launchedInstances.csv` for every instance ever launched, `badTerminations.csv` for
//! every instance whose termination failed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::{json, Value};

use crate::cloud::CloudApi;
use crate::error::Result;
use crate::event_log::EventLog;
use crate::job::FleetJob;
use crate::known_hosts::KnownHosts;
use crate::node::{save_inventory, Node, NodeDescriptor, Rater, MASTER_ID};

pub const LAUNCHED_CSV: &str = "launchedInstances.csv";
pub const BAD_TERMINATIONS_CSV: &str = "badTerminations.csv";
pub const RECRUITED_INVENTORY: &str = "recruitLaunched.json";

/// Appends CSV rows, writing `header` first if the file is new.
fn append_csv(path: &Path, header: &str, rows: &[String]) -> std::io::Result<()> {
    let is_new = !path.exists();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if is_new {
        writeln!(file, "{}", header)?;
    }
    for row in rows {
        writeln!(file, "{}", row)?;
    }
    file.flush()
}

pub struct Terminator {
    cloud: Arc<dyn CloudApi>,
    log: EventLog,
    data_dir: Option<PathBuf>,
    known_hosts: Option<KnownHosts>,
}

impl Terminator {
    pub fn new(cloud: Arc<dyn CloudApi>, log: EventLog, data_dir: Option<&Path>) -> Self {
        Self {
            cloud,
            log,
            data_dir: data_dir.map(Path::to_path_buf),
            known_hosts: None,
        }
    }

    /// Also purges the host keys of every node this terminator releases.
    pub fn with_known_hosts(mut self, known_hosts: KnownHosts) -> Self {
        self.known_hosts = Some(known_hosts);
        self
    }

    /// Destroys the given nodes, best-effort.
    ///
    /// `op` names the reason in the event log (e.g. `terminateBad`, `terminateFinal`).
    /// Failures are logged and recorded but never returned. Returns whether the call
    /// succeeded.
    pub async fn terminate(&self, nodes: &[NodeDescriptor], op: &str) -> bool {
        if nodes.is_empty() {
            return true;
        }
        let instance_ids: Vec<String> = nodes.iter().map(|d| d.instance_id.clone()).collect();
        self.log.operation(MASTER_ID, op, json!(instance_ids));
        let terminated = match self.cloud.terminate(&instance_ids).await {
            Ok(()) => {
                tracing::info!(count = instance_ids.len(), op, "Terminated nodes");
                true
            }
            Err(e) => {
                tracing::error!(
                    count = instance_ids.len(),
                    op,
                    error = %e,
                    "Failed to terminate nodes; they may need to be terminated by hand"
                );
                self.log.exception(MASTER_ID, &e.type_name(), &e.message());
                self.record_bad(&instance_ids);
                false
            }
        };
        if let Some(known_hosts) = &self.known_hosts {
            known_hosts.forget(nodes).await;
        }
        terminated
    }

    fn record_bad(&self, instance_ids: &[String]) {
        let dir = match &self.data_dir {
            Some(dir) => dir,
            None => return,
        };
        let now = Utc::now().to_rfc3339();
        let rows: Vec<String> = instance_ids
            .iter()
            .map(|id| format!("{},{}", now, id))
            .collect();
        let path = dir.join(BAD_TERMINATIONS_CSV);
        if let Err(e) = append_csv(&path, "dateTime,instanceId", &rows) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to record bad terminations");
        }
    }
}

/// What to ask the cloud for.
#[derive(Debug, Clone)]
pub struct RecruitRequest {
    pub count: usize,
    pub filter: Value,
    pub ssh_key_name: String,
}

pub struct NodeRecruiter {
    cloud: Arc<dyn CloudApi>,
    rater: Rater,
    data_dir: Option<PathBuf>,
    /// Everything recruited so far, across rounds, for `recruitLaunched.json`.
    recruited: Mutex<Vec<NodeDescriptor>>,
}

impl NodeRecruiter {
    pub fn new(cloud: Arc<dyn CloudApi>, rater: Rater, data_dir: Option<&Path>) -> Self {
        Self {
            cloud,
            rater,
            data_dir: data_dir.map(Path::to_path_buf),
            recruited: Mutex::new(Vec::new()),
        }
    }

    /// Launches nodes and returns the usable ones.
    ///
    /// Launched nodes that did not start, or that came without an SSH endpoint, are handed
    /// to `terminator` right away. Recruits nothing once the job should stop.
    pub async fn recruit(
        &self,
        job: &FleetJob,
        request: &RecruitRequest,
        terminator: &Terminator,
    ) -> Result<Vec<Node>> {
        if job.should_stop() {
            tracing::warn!("Not recruiting: deadline passed or shutdown requested");
            return Ok(Vec::new());
        }
        job.log.operation(
            MASTER_ID,
            "launchInstances",
            json!({ "count": request.count, "filter": request.filter }),
        );
        tracing::info!(count = request.count, "Launching nodes");

        // Runs to completion even past the deadline, so every launched instance is recorded.
        let descriptors = self
            .cloud
            .launch(request.count, &request.filter, &request.ssh_key_name)
            .await?;
        self.record_launched(&descriptors);

        if job.should_stop() {
            tracing::warn!(
                count = descriptors.len(),
                "Job stopped while launching; terminating launched nodes"
            );
            terminator.terminate(&descriptors, "terminateUnused").await;
            return Ok(Vec::new());
        }

        let mut nodes = Vec::new();
        let mut rejected = Vec::new();
        for descriptor in descriptors {
            if !descriptor.is_started() {
                tracing::info!(
                    id = %descriptor.instance_id,
                    state = %descriptor.state,
                    "Node did not start"
                );
                rejected.push(descriptor);
                continue;
            }
            match Node::from_descriptor(descriptor.clone(), self.rater) {
                Some(node) => nodes.push(node),
                None => {
                    tracing::warn!(id = %descriptor.instance_id, "Node has no SSH endpoint");
                    rejected.push(descriptor);
                }
            }
        }
        terminator.terminate(&rejected, "terminateBad").await;

        self.save_recruited(&nodes);
        job.log.operation(
            MASTER_ID,
            "recruited",
            json!({ "nStarted": nodes.len(), "nRejected": rejected.len() }),
        );
        tracing::info!(started = nodes.len(), rejected = rejected.len(), "Recruited nodes");
        Ok(nodes)
    }

    fn save_recruited(&self, nodes: &[Node]) {
        let mut recruited = self.recruited.lock().unwrap_or_else(PoisonError::into_inner);
        recruited.extend(nodes.iter().map(|node| node.descriptor.clone()));
        let dir = match &self.data_dir {
            Some(dir) => dir,
            None => return,
        };
        let path = dir.join(RECRUITED_INVENTORY);
        if let Err(e) = save_inventory(&path, &recruited) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to save recruited nodes");
        }
    }

    fn record_launched(&self, descriptors: &[NodeDescriptor]) {
        let dir = match &self.data_dir {
            Some(dir) => dir,
            None => return,
        };
        let now = Utc::now().to_rfc3339();
        let rows: Vec<String> = descriptors
            .iter()
            .map(|d| format!("{},{},{}", now, d.instance_id, d.state))
            .collect();
        let path = dir.join(LAUNCHED_CSV);
        if let Err(e) = append_csv(&path, "dateTime,instanceId,state", &rows) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Failed to record launched instances"
            );
        }
    }
}
