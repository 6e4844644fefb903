//! Top-level sequencing of a batch job.
//!
//! recruit → install → seed the queue → one worker per good node → wait → terminate.
//! Every node the job started is handed to the terminator on every path, including aborts.
//! With autoscaling, more nodes are recruited and installed while the workers run whenever
//! too few of them are still working.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use crate::autoscale::Autoscale;
use crate::cloud::CloudApi;
use crate::dispatcher::InstallationDispatcher;
use crate::error::FleetError;
use crate::executor::RemoteExecutor;
use crate::job::FleetJob;
use crate::known_hosts::KnownHosts;
use crate::node::{save_inventory, Node, NodeDescriptor, Rater, MASTER_ID};
use crate::queue::WorkItem;
use crate::recruiter::{NodeRecruiter, RecruitRequest, Terminator};
use crate::worker::{WorkerExit, WorkerPool};
use crate::workload::Workload;

pub const SURVIVING_INVENTORY: &str = "survivingInstances.json";

/// What one job should do.
#[derive(Debug, Clone)]
pub struct FleetPlan {
    pub recruit: RecruitRequest,
    pub items: Vec<u64>,
    pub install_time_limit: Duration,
    /// Whether the job owns its nodes. Borrowed nodes are written to
    /// `survivingInstances.json` at the end instead of being terminated.
    pub launch: bool,
    /// Size the fleet from the work left. Only honored when launching; a zero
    /// `recruit.count` then means "as many as `init` asks for".
    pub autoscale: Option<Autoscale>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub items_succeeded: u64,
    pub items_wanted: u64,
    pub nodes_used: usize,
    pub nodes_recruited: usize,
    /// Why the job was aborted, if it was.
    pub aborted: Option<String>,
}

impl JobSummary {
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.items_succeeded >= self.items_wanted
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for JobSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} items completed, using {} of {} recruited nodes",
            self.items_succeeded, self.items_wanted, self.nodes_used, self.nodes_recruited
        )
    }
}

/// Nodes added while the job ran.
#[derive(Debug, Default)]
struct Replenished {
    recruited: usize,
    /// Installed and handed to the pool.
    nodes: Vec<Node>,
}

pub struct FleetController {
    cloud: Arc<dyn CloudApi>,
    recruiter: NodeRecruiter,
    terminator: Terminator,
    dispatcher: InstallationDispatcher,
    pool: WorkerPool,
    workload: Arc<dyn Workload>,
    data_dir: Option<PathBuf>,
}

impl FleetController {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        executor: Arc<dyn RemoteExecutor>,
        workload: Arc<dyn Workload>,
        rater: Rater,
        job: &FleetJob,
        data_dir: Option<&Path>,
    ) -> Self {
        Self {
            recruiter: NodeRecruiter::new(Arc::clone(&cloud), rater, data_dir),
            terminator: Terminator::new(Arc::clone(&cloud), job.log.clone(), data_dir),
            cloud,
            dispatcher: InstallationDispatcher::new(Arc::clone(&executor)),
            pool: WorkerPool::new(executor, Arc::clone(&workload)),
            workload,
            data_dir: data_dir.map(Path::to_path_buf),
        }
    }

    /// Purges the host keys of every node the job releases.
    pub fn with_known_hosts(mut self, known_hosts: KnownHosts) -> Self {
        self.terminator = self.terminator.with_known_hosts(known_hosts);
        self
    }

    pub async fn run(&self, job: Arc<FleetJob>, plan: &FleetPlan) -> JobSummary {
        let wanted = plan.items.len() as u64;
        let autoscale = plan.autoscale.filter(|_| plan.launch);
        let mut request = plan.recruit.clone();
        if let Some(autoscale) = &autoscale {
            if request.count == 0 {
                request.count = self.initial_count(autoscale, plan).await;
            }
        }
        job.log.operation(
            MASTER_ID,
            "starting",
            json!({ "nItems": wanted, "nNodes": request.count, "launch": plan.launch }),
        );

        let nodes = match self.recruiter.recruit(&job, &request, &self.terminator).await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(error = %e, "Recruitment failed");
                job.log.exception(MASTER_ID, &e.type_name(), &e.message());
                Vec::new()
            }
        };
        let recruited = nodes.len();
        if nodes.is_empty() {
            return self.abort(&job, wanted, 0, 0, FleetError::NoNodesRecruited);
        }

        let (good, _bad) = self
            .dispatcher
            .install_all(
                &job,
                nodes,
                self.workload.as_ref(),
                plan.install_time_limit,
                &self.terminator,
            )
            .await;
        if good.is_empty() {
            return self.abort(&job, wanted, 0, recruited, FleetError::NoGoodNodes);
        }

        for &id in &plan.items {
            job.queue.push_back(WorkItem::new(id));
        }
        job.save_progress();
        job.log.operation(
            MASTER_ID,
            "parallelRender",
            json!({ "nWorkers": good.len(), "nItems": wanted }),
        );
        tracing::info!(workers = good.len(), items = wanted, "Distributing work");

        let (joining_tx, joining_rx) = flume::unbounded();
        let replenish = async {
            match &autoscale {
                Some(autoscale) => self.replenish(&job, plan, autoscale, joining_tx).await,
                None => {
                    drop(joining_tx);
                    Replenished::default()
                }
            }
        };
        let workers = self
            .pool
            .run_growing(Arc::clone(&job), good.clone(), joining_rx);
        let (reports, added) = join(workers, replenish).await;
        let mut used = good;
        used.extend(added.nodes);

        if plan.launch {
            let owned: Vec<NodeDescriptor> =
                used.iter().map(|node| node.descriptor.clone()).collect();
            self.terminator.terminate(&owned, "terminateFinal").await;
        } else {
            let unreliable: Vec<&Node> = reports
                .iter()
                .filter(|report| report.exit == WorkerExit::Unreliable)
                .map(|report| &report.node)
                .collect();
            let retired: Vec<NodeDescriptor> =
                unreliable.iter().map(|node| node.descriptor.clone()).collect();
            self.terminator
                .terminate(&retired, "terminateFailedWorker")
                .await;
            let surviving: Vec<&Node> = used
                .iter()
                .filter(|node| !unreliable.iter().any(|bad| bad.id == node.id))
                .collect();
            self.save_surviving(&surviving);
        }

        let summary = JobSummary {
            items_succeeded: job.queue.tally().succeeded,
            items_wanted: wanted,
            nodes_used: used.len(),
            nodes_recruited: recruited + added.recruited,
            aborted: None,
        };
        self.finish(&job, summary)
    }

    async fn initial_count(&self, autoscale: &Autoscale, plan: &FleetPlan) -> usize {
        let available = match self.cloud.available(&plan.recruit.filter).await {
            Ok(available) => available,
            Err(e) => {
                tracing::warn!(error = %e, "Could not count available devices");
                None
            }
        };
        let count = autoscale.initial_count(plan.items.len(), available);
        tracing::info!(count, available = ?available, "Sized initial fleet");
        count
    }

    /// Recruits and installs more nodes whenever too few are working, handing the good
    /// ones to the pool through `joining`. Returns once the work is done or the job stops.
    async fn replenish(
        &self,
        job: &FleetJob,
        plan: &FleetPlan,
        autoscale: &Autoscale,
        joining: flume::Sender<Node>,
    ) -> Replenished {
        let mut replenished = Replenished::default();
        let mut next_check = Instant::now() + autoscale.check_interval;
        loop {
            job.shutdown
                .sleep(job.capped(job.policy.poll_interval))
                .await;
            let unfinished = job.queue.tally().unfinished();
            if job.should_stop() || unfinished == 0 {
                break;
            }
            if Instant::now() < next_check {
                continue;
            }
            next_check = Instant::now() + autoscale.check_interval;

            let working = job.working();
            let mut count = autoscale.shortfall(working, unfinished);
            if count == 0 {
                continue;
            }
            if let Ok(Some(available)) = self.cloud.available(&plan.recruit.filter).await {
                count = count.min(available);
            }
            if count == 0 {
                tracing::debug!("No devices available to replenish the fleet");
                continue;
            }
            tracing::info!(working, unfinished, count, "Too few working nodes; recruiting more");
            job.log.operation(
                MASTER_ID,
                "replenish",
                json!({ "nWorking": working, "nUnfinished": unfinished, "count": count }),
            );

            let request = RecruitRequest {
                count,
                ..plan.recruit.clone()
            };
            let nodes = match self.recruiter.recruit(job, &request, &self.terminator).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    tracing::warn!(error = %e, "Replenishing recruitment failed");
                    job.log.exception(MASTER_ID, &e.type_name(), &e.message());
                    continue;
                }
            };
            replenished.recruited += nodes.len();
            let (good, _bad) = self
                .dispatcher
                .install_all(
                    job,
                    nodes,
                    self.workload.as_ref(),
                    plan.install_time_limit,
                    &self.terminator,
                )
                .await;
            for node in good {
                replenished.nodes.push(node.clone());
                // The pool only stops listening once this sender is dropped.
                let _ = joining.send(node);
            }
        }
        replenished
    }

    fn abort(
        &self,
        job: &FleetJob,
        wanted: u64,
        used: usize,
        recruited: usize,
        reason: FleetError,
    ) -> JobSummary {
        tracing::error!(reason = %reason, "Aborting job");
        let summary = JobSummary {
            items_succeeded: 0,
            items_wanted: wanted,
            nodes_used: used,
            nodes_recruited: recruited,
            aborted: Some(reason.to_string()),
        };
        self.finish(job, summary)
    }

    fn finish(&self, job: &FleetJob, summary: JobSummary) -> JobSummary {
        job.save_progress();
        job.log.operation(MASTER_ID, "finished", json!(summary));
        tracing::info!("{}", summary);
        summary
    }

    fn save_surviving(&self, nodes: &[&Node]) {
        let dir = match &self.data_dir {
            Some(dir) => dir,
            None => return,
        };
        let descriptors: Vec<NodeDescriptor> =
            nodes.iter().map(|node| node.descriptor.clone()).collect();
        let path = dir.join(SURVIVING_INVENTORY);
        if let Err(e) = save_inventory(&path, &descriptors) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to save surviving nodes");
        }
    }
}
