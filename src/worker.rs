//! One worker per installed node, all draining the job's queue.
//!
//! A worker claims an item, runs it, and either marks it succeeded or puts it back. It
//! stops when the queue is finished, when the job should stop, when it is surplus to the
//! remaining work, or when its node failed too many times in a row.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::executor::{exception_outcome, timeout_outcome, RemoteExecutor};
use crate::job::FleetJob;
use crate::node::{Node, NodeState};
use crate::outcome::{CallPhase, Outcome};
use crate::queue::WorkItem;
use crate::workload::Workload;

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerExit {
    /// Every item succeeded or was abandoned.
    Drained,
    /// More workers than the remaining work needs.
    Surplus,
    /// Too many consecutive failures; the node should be terminated.
    Unreliable,
    Shutdown,
    Deadline,
    /// Finished its one item.
    OneItem,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerExit::Drained => "drained",
            WorkerExit::Surplus => "surplus",
            WorkerExit::Unreliable => "unreliable",
            WorkerExit::Shutdown => "shutdown",
            WorkerExit::Deadline => "deadline",
            WorkerExit::OneItem => "oneItem",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub node: Node,
    pub attempts: u64,
    pub succeeded: u64,
    pub exit: WorkerExit,
}

pub struct WorkerPool {
    executor: Arc<dyn RemoteExecutor>,
    workload: Arc<dyn Workload>,
}

impl WorkerPool {
    pub fn new(executor: Arc<dyn RemoteExecutor>, workload: Arc<dyn Workload>) -> Self {
        Self { executor, workload }
    }

    /// Spawns one worker per node and waits for all of them.
    ///
    /// Reports arrive in the order workers finish. A worker that panicked sends none.
    pub async fn run(&self, job: Arc<FleetJob>, nodes: Vec<Node>) -> Vec<WorkerReport> {
        let (_, joining) = flume::unbounded();
        self.run_growing(job, nodes, joining).await
    }

    /// Like [`run`](Self::run), but also starts a worker for every node that arrives on
    /// `joining` until its senders are gone.
    pub async fn run_growing(
        &self,
        job: Arc<FleetJob>,
        nodes: Vec<Node>,
        joining: flume::Receiver<Node>,
    ) -> Vec<WorkerReport> {
        let mut workers = JoinSet::new();
        for node in nodes {
            self.spawn(&mut workers, &job, node);
        }

        let mut reports = Vec::new();
        let mut accepting = true;
        loop {
            tokio::select! {
                joined = joining.recv_async(), if accepting => match joined {
                    Ok(node) => {
                        tracing::info!(node = %node.short_id(), "Worker joining");
                        self.spawn(&mut workers, &job, node);
                    }
                    Err(_) => accepting = false,
                },
                Some(finished) = workers.join_next() => match finished {
                    Ok(report) => reports.push(report),
                    Err(e) => tracing::error!(error = %e, "Worker task failed"),
                },
                else => break,
            }
        }
        reports
    }

    fn spawn(&self, workers: &mut JoinSet<WorkerReport>, job: &Arc<FleetJob>, node: Node) {
        let job = Arc::clone(job);
        let executor = Arc::clone(&self.executor);
        let workload = Arc::clone(&self.workload);
        workers.spawn(async move { work(&job, executor.as_ref(), workload.as_ref(), node).await });
    }
}

/// The worker loop for one node.
pub async fn work(
    job: &FleetJob,
    executor: &dyn RemoteExecutor,
    workload: &dyn Workload,
    mut node: Node,
) -> WorkerReport {
    node.state = NodeState::Working;
    job.worker_started();
    tracing::debug!(node = %node.short_id(), "Worker started");

    let mut consecutive_failures = 0u32;
    let mut attempts = 0u64;
    let mut succeeded = 0u64;
    let exit = loop {
        if job.shutdown.is_signaled() {
            break WorkerExit::Shutdown;
        }
        if job.deadline_passed() {
            break WorkerExit::Deadline;
        }

        let item = match job.queue.pop_front() {
            Some(item) => item,
            None => {
                if job.queue.tally().unfinished() == 0 {
                    break WorkerExit::Drained;
                }
                job.shutdown
                    .sleep(job.capped(job.policy.poll_interval))
                    .await;
                let unfinished = job.queue.tally().unfinished();
                if unfinished == 0 {
                    break WorkerExit::Drained;
                }
                if job.working() as f64 > unfinished as f64 * job.policy.overage_factor {
                    break WorkerExit::Surplus;
                }
                continue;
            }
        };

        attempts += 1;
        let outcome = attempt(job, executor, workload, &node, item).await;
        if outcome.is_ok() {
            succeeded += 1;
            consecutive_failures = 0;
            if job.policy.one_item_per_worker {
                break WorkerExit::OneItem;
            }
            continue;
        }

        consecutive_failures += 1;
        if consecutive_failures > job.policy.max_consecutive_failures {
            tracing::warn!(
                node = %node.short_id(),
                failures = consecutive_failures,
                "Retiring unreliable node"
            );
            break WorkerExit::Unreliable;
        }
        // Gives healthier nodes the first pick of the requeued item.
        job.shutdown
            .sleep(job.capped(job.policy.poll_interval))
            .await;
    };

    node.state = NodeState::Retiring;
    job.log.operation(
        &node.id,
        "workerExit",
        json!({ "reason": exit, "attempts": attempts, "succeeded": succeeded }),
    );
    tracing::info!(node = %node.short_id(), reason = %exit, succeeded, "Worker finished");
    job.worker_stopped();
    WorkerReport {
        node,
        attempts,
        succeeded,
        exit,
    }
}

/// One attempt at `item` on `node`. Hands the item back to the queue in every case.
async fn attempt(
    job: &FleetJob,
    executor: &dyn RemoteExecutor,
    workload: &dyn Workload,
    node: &Node,
    item: WorkItem,
) -> Outcome {
    // Attempt count including this one, as logged and retried.
    let tried = WorkItem {
        attempts: item.attempts + 1,
        ..item
    };
    job.record_item(&node.id, tried, "starting", 0);
    let time_limit = job.capped(job.policy.item_time_limit);

    let (outcome, retrieves) = match workload.item_command(node, item) {
        Ok(request) => {
            let retrieves = request.download.is_some();
            let call = executor.execute(node, &request, time_limit);
            let outcome = match timeout(time_limit + job.policy.grace_period, call).await {
                Ok(outcome) => outcome,
                Err(_) => timeout_outcome(&job.log, node, time_limit),
            };
            (outcome, retrieves)
        }
        Err(e) => (exception_outcome(&job.log, node, &e), false),
    };
    let outcome = outcome.for_item(item.id);
    let rc = outcome.exit_code().map(i64::from).unwrap_or(-1);

    if outcome.is_ok() {
        job.queue.succeed(item);
        job.record_item(&node.id, tried, "computed", 0);
        if retrieves {
            job.record_item(&node.id, tried, "retrieved", 0);
        }
        return outcome;
    }

    if outcome.phase == CallPhase::Download {
        job.record_item(&node.id, tried, "computed", 0);
        job.record_item(&node.id, tried, "retrieveFailed", rc);
    } else {
        job.record_item(&node.id, tried, "computeFailed", rc);
    }
    tracing::debug!(
        node = %node.short_id(),
        item = item.id,
        kind = %outcome.kind,
        detail = %outcome.detail,
        "Attempt failed"
    );

    match job.policy.max_attempts {
        Some(max) if tried.attempts >= max => {
            job.queue.abandon(item);
            job.record_item(&node.id, tried, "abandoned", rc);
            tracing::warn!(item = item.id, attempts = tried.attempts, "Abandoning item");
        }
        _ => job.queue.push_back(tried),
    }
    job.save_progress();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use crate::error::Result;
    use crate::event_log::{EventLog, EventType};
    use crate::executor::RemoteCommand;
    use crate::job::JobPolicy;
    use crate::node::{nominal_rating, NodeDescriptor};
    use crate::progress::ProgressFile;
    use crate::shutdown::ShutdownCoordinator;

    struct Scripted {
        /// Node ids whose calls all fail with a non-zero exit.
        failing: Vec<String>,
        /// How long a successful call takes.
        ok_delay: Duration,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn failing_on(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|id| id.to_string()).collect(),
                ok_delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_on(&self, node_id: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == node_id)
                .count()
        }
    }

    #[async_trait]
    impl RemoteExecutor for Scripted {
        async fn execute(&self, node: &Node, request: &RemoteCommand, _: Duration) -> Outcome {
            let command = request.command.clone().unwrap_or_default();
            self.calls.lock().unwrap().push((node.id.clone(), command));
            if self.failing.contains(&node.id) {
                Outcome::exited(&node.id, 1)
            } else {
                tokio::time::sleep(self.ok_delay).await;
                Outcome::ok(&node.id)
            }
        }
    }

    struct Echo;

    impl Workload for Echo {
        fn installer(&self, _: &Node) -> Result<Option<RemoteCommand>> {
            Ok(None)
        }

        fn item_command(&self, _: &Node, item: WorkItem) -> Result<RemoteCommand> {
            Ok(RemoteCommand::shell(format!("echo {}", item.id)))
        }
    }

    fn node(id: &str) -> Node {
        let desc: NodeDescriptor = serde_json::from_value(serde_json::json!({
            "instanceId": id, "state": "started", "ssh": {"host": "h", "user": "u"}
        }))
        .unwrap();
        Node::from_descriptor(desc, nominal_rating).unwrap()
    }

    fn job(policy: JobPolicy, items: std::ops::Range<u64>) -> Arc<FleetJob> {
        let job = FleetJob::new(
            EventLog::in_memory(),
            ShutdownCoordinator::new(),
            policy,
            ProgressFile::disabled(),
            Instant::now() + Duration::from_secs(30),
        );
        for id in items {
            job.queue.push_back(WorkItem::new(id));
        }
        Arc::new(job)
    }

    fn fast_policy() -> JobPolicy {
        JobPolicy {
            poll_interval: Duration::from_millis(10),
            ..JobPolicy::default()
        }
    }

    #[tokio::test]
    async fn failing_node_gets_exactly_three_attempts() {
        let job = job(fast_policy(), 0..10);
        let executor = Scripted::failing_on(&["bad"]);
        let report = work(&job, &executor, &Echo, node("bad")).await;

        assert_eq!(report.exit, WorkerExit::Unreliable);
        assert_eq!(report.attempts, 3);
        assert_eq!(executor.calls.lock().unwrap().len(), 3);
        assert_eq!(report.node.state, NodeState::Retiring);

        let tally = job.queue.tally();
        assert_eq!(tally.queued, 10);
        assert_eq!(tally.in_flight, 0);
        assert!(tally.is_conserved());
    }

    #[tokio::test]
    async fn failed_items_move_to_the_back_and_carry_attempts() {
        let job = job(fast_policy(), 0..3);
        let executor = Scripted::failing_on(&["bad"]);
        work(&job, &executor, &Echo, node("bad")).await;
        // Items 0, 1, 2 each failed once and were requeued in that order.
        let requeued: Vec<_> = std::iter::from_fn(|| job.queue.pop_front()).collect();
        assert_eq!(
            requeued,
            vec![
                WorkItem { id: 0, attempts: 1 },
                WorkItem { id: 1, attempts: 1 },
                WorkItem { id: 2, attempts: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn max_attempts_abandons_items() {
        let policy = JobPolicy {
            max_attempts: Some(1),
            ..fast_policy()
        };
        let job = job(policy, 0..2);
        let executor = Scripted::failing_on(&["bad"]);
        let report = work(&job, &executor, &Echo, node("bad")).await;
        assert_eq!(report.exit, WorkerExit::Drained);
        let tally = job.queue.tally();
        assert_eq!(tally.abandoned, 2);
        assert!(tally.is_conserved());

        let abandoned = job
            .log
            .records()
            .into_iter()
            .filter(|r| r.kind == EventType::StateChange && r.args["state"] == "abandoned")
            .count();
        assert_eq!(abandoned, 2);
    }

    #[tokio::test]
    async fn pool_drains_queue_around_a_bad_node() {
        let job = job(fast_policy(), 0..12);
        // Slow enough that `a` gets back to the queue between its failures.
        let executor = Arc::new(Scripted {
            ok_delay: Duration::from_millis(50),
            ..Scripted::failing_on(&["a"])
        });
        let pool = WorkerPool::new(executor.clone(), Arc::new(Echo));
        let reports = pool.run(Arc::clone(&job), vec![node("a"), node("b")]).await;

        assert_eq!(reports.len(), 2);
        let tally = job.queue.tally();
        assert_eq!(tally.succeeded, 12);
        assert!(tally.is_conserved());
        let a = reports.iter().find(|r| r.node.id == "a").unwrap();
        assert_eq!(a.exit, WorkerExit::Unreliable);
        assert_eq!(a.attempts, 3);
        assert_eq!(a.succeeded, 0);
        assert_eq!(executor.calls_on("a"), 3);
        let b = reports.iter().find(|r| r.node.id == "b").unwrap();
        assert_eq!(b.succeeded, 12);
        assert_eq!(job.working(), 0);
    }

    #[tokio::test]
    async fn one_item_per_worker() {
        let policy = JobPolicy {
            one_item_per_worker: true,
            ..fast_policy()
        };
        let job = job(policy, 0..5);
        let executor = Scripted::failing_on(&[]);
        let report = work(&job, &executor, &Echo, node("n")).await;
        assert_eq!(report.exit, WorkerExit::OneItem);
        assert_eq!(job.queue.tally().succeeded, 1);
    }

    /// Never finishes an item; keeps every claimed item in flight.
    struct Stalling {
        started: AtomicU32,
    }

    #[async_trait]
    impl RemoteExecutor for Stalling {
        async fn execute(&self, node: &Node, _: &RemoteCommand, limit: Duration) -> Outcome {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(limit).await;
            Outcome::timeout(&node.id, limit.as_secs_f64())
        }
    }

    #[tokio::test]
    async fn idle_workers_shed_when_outnumbering_work() {
        // One item, five workers: four find the queue empty while 5 > 1 * 3.
        let policy = JobPolicy {
            item_time_limit: Duration::from_millis(300),
            max_attempts: Some(3),
            ..fast_policy()
        };
        let job = job(policy, 0..1);
        let executor = Arc::new(Stalling {
            started: AtomicU32::new(0),
        });
        let pool = WorkerPool::new(executor.clone(), Arc::new(Echo));
        let nodes = (0..5).map(|i| node(&format!("n{}", i))).collect();

        let shed = tokio::time::timeout(Duration::from_secs(5), pool.run(Arc::clone(&job), nodes))
            .await
            .unwrap();
        let surplus = shed.iter().filter(|r| r.exit == WorkerExit::Surplus).count();
        assert!(surplus >= 2, "expected idle workers to shed, got {}", surplus);
        assert!(job.queue.tally().is_conserved());
        assert_eq!(
            shed.iter().map(|r| r.attempts).sum::<u64>(),
            u64::from(executor.started.load(Ordering::SeqCst))
        );
    }
}
