//! Fan-out of one request per node: installation and one-off broadcasts.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::time::{timeout_at, Instant};

use crate::executor::{exception_outcome, timeout_outcome, RemoteCommand, RemoteExecutor};
use crate::job::FleetJob;
use crate::node::{Node, NodeDescriptor, NodeState, MASTER_ID};
use crate::outcome::{Outcome, OutcomeKind};
use crate::recruiter::Terminator;
use crate::workload::Workload;

const CANCELLED: &str = "shutdown requested before the call started";

pub struct InstallationDispatcher {
    executor: Arc<dyn RemoteExecutor>,
}

impl InstallationDispatcher {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Runs `request` on every node concurrently. Outcomes come back in node order.
    pub async fn broadcast(
        &self,
        job: &FleetJob,
        nodes: &[Node],
        request: &RemoteCommand,
        time_limit: Duration,
    ) -> Vec<Outcome> {
        let calls = nodes
            .iter()
            .map(|node| (node.clone(), Some(request.clone())))
            .collect();
        self.fan_out(job, calls, time_limit).await
    }

    /// One task per call. A `None` request resolves to `ok` without contacting the node.
    async fn fan_out(
        &self,
        job: &FleetJob,
        calls: Vec<(Node, Option<RemoteCommand>)>,
        time_limit: Duration,
    ) -> Vec<Outcome> {
        let time_limit = job.capped(time_limit);
        // Bounds a call whose executor ignores its own limit.
        let hard_deadline = Instant::now() + time_limit + job.policy.grace_period;
        let stopped = job.shutdown.is_signaled();

        let node_ids: Vec<String> = calls.iter().map(|(node, _)| node.id.clone()).collect();
        let handles = calls.into_iter().map(move |(node, request)| {
            let executor = Arc::clone(&self.executor);
            let log = job.log.clone();
            tokio::spawn(async move {
                let request = match request {
                    Some(request) => request,
                    None => return Outcome::ok(&node.id),
                };
                if stopped {
                    log.exception(&node.id, "Cancelled", CANCELLED);
                    return Outcome::exception(&node.id, "Cancelled", CANCELLED);
                }
                match timeout_at(hard_deadline, executor.execute(&node, &request, time_limit))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => timeout_outcome(&log, &node, time_limit),
                }
            })
        });

        join_all(handles)
            .await
            .into_iter()
            .zip(node_ids)
            .map(|(joined, node_id)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(node = %node_id, error = %e, "Remote call task failed");
                    job.log.exception(&node_id, "JoinError", &e.to_string());
                    Outcome::exception(&node_id, "JoinError", &e.to_string())
                }
            })
            .collect()
    }

    /// Installs the workload on every node and terminates the ones that failed.
    ///
    /// Returns the good nodes (state `installed`) and the outcomes of the bad ones.
    pub async fn install_all(
        &self,
        job: &FleetJob,
        nodes: Vec<Node>,
        workload: &dyn Workload,
        time_limit: Duration,
        terminator: &Terminator,
    ) -> (Vec<Node>, Vec<Outcome>) {
        let mut calls = Vec::with_capacity(nodes.len());
        let mut failed_early = Vec::new();
        for mut node in nodes {
            match workload.installer(&node) {
                Ok(request) => {
                    node.state = NodeState::Installing;
                    calls.push((node, request));
                }
                Err(e) => {
                    node.state = NodeState::Failed;
                    failed_early.push((node.clone(), exception_outcome(&job.log, &node, &e)));
                }
            }
        }
        job.log.operation(
            MASTER_ID,
            "install",
            json!({ "nNodes": calls.len(), "timeLimit": time_limit.as_secs_f64() }),
        );
        tracing::info!(nodes = calls.len(), "Installing");

        let nodes: Vec<Node> = calls.iter().map(|(node, _)| node.clone()).collect();
        let outcomes = self.fan_out(job, calls, time_limit).await;
        let (mut good, mut bad) = triage(nodes.into_iter().zip(outcomes).collect());
        bad.extend(failed_early);

        for node in good.iter_mut() {
            node.state = NodeState::Installed;
        }
        for (node, outcome) in bad.iter_mut() {
            node.state = NodeState::Failed;
            tracing::warn!(
                node = %node.short_id(),
                kind = %outcome.kind,
                detail = %outcome.detail,
                "Installation failed"
            );
        }
        let released: Vec<NodeDescriptor> =
            bad.iter().map(|(node, _)| node.descriptor.clone()).collect();
        terminator.terminate(&released, "terminateBad").await;

        job.log.operation(
            MASTER_ID,
            "installed",
            json!({ "nGood": good.len(), "nBad": bad.len() }),
        );
        tracing::info!(good = good.len(), bad = bad.len(), "Installation finished");
        (good, bad.into_iter().map(|(_, outcome)| outcome).collect())
    }
}

/// Splits nodes into those whose outcome is `ok` and the rest.
pub fn triage(results: Vec<(Node, Outcome)>) -> (Vec<Node>, Vec<(Node, Outcome)>) {
    let mut good = Vec::new();
    let mut bad = Vec::new();
    for (node, outcome) in results {
        if outcome.kind == OutcomeKind::Ok {
            good.push(node);
        } else {
            bad.push((node, outcome));
        }
    }
    (good, bad)
}

/// Count of outcomes by kind, in a fixed order, for broadcast summaries.
pub fn tally_kinds(outcomes: &[Outcome]) -> Vec<(OutcomeKind, usize)> {
    [
        OutcomeKind::Ok,
        OutcomeKind::NonZeroExit,
        OutcomeKind::Timeout,
        OutcomeKind::Unreachable,
        OutcomeKind::Exception,
    ]
    .into_iter()
    .map(|kind| (kind, outcomes.iter().filter(|o| o.kind == kind).count()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::cloud::CloudApi;
    use crate::error::Result;
    use crate::event_log::EventLog;
    use crate::job::JobPolicy;
    use crate::node::nominal_rating;
    use crate::progress::ProgressFile;
    use crate::queue::WorkItem;
    use crate::shutdown::ShutdownCoordinator;

    /// Answers with a fixed outcome kind per node id, `ok` by default.
    struct FixedExecutor {
        kinds: HashMap<String, OutcomeKind>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteExecutor for FixedExecutor {
        async fn execute(&self, node: &Node, _: &RemoteCommand, limit: Duration) -> Outcome {
            self.calls.lock().unwrap().push(node.id.clone());
            match self.kinds.get(&node.id) {
                Some(OutcomeKind::NonZeroExit) => Outcome::exited(&node.id, 1),
                Some(OutcomeKind::Timeout) => Outcome::timeout(&node.id, limit.as_secs_f64()),
                Some(OutcomeKind::Unreachable) => {
                    Outcome::unreachable(&node.id, "Connect", "Connection refused")
                }
                Some(OutcomeKind::Exception) => panic!("executor bug on {}", node.id),
                _ => Outcome::ok(&node.id),
            }
        }
    }

    #[derive(Default)]
    struct RecordingCloud {
        terminated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CloudApi for RecordingCloud {
        async fn launch(&self, _: usize, _: &Value, _: &str) -> Result<Vec<NodeDescriptor>> {
            Ok(Vec::new())
        }

        async fn terminate(&self, ids: &[String]) -> Result<()> {
            self.terminated.lock().unwrap().extend_from_slice(ids);
            Ok(())
        }
    }

    struct Installer;

    impl Workload for Installer {
        fn installer(&self, _: &Node) -> Result<Option<RemoteCommand>> {
            Ok(Some(RemoteCommand::shell("./install.sh")))
        }

        fn item_command(&self, _: &Node, _: WorkItem) -> Result<RemoteCommand> {
            Ok(RemoteCommand::shell("true"))
        }
    }

    fn node(id: &str) -> Node {
        let desc: NodeDescriptor = serde_json::from_value(serde_json::json!({
            "instanceId": id, "state": "started", "ssh": {"host": "h", "user": "u"}
        }))
        .unwrap();
        Node::from_descriptor(desc, nominal_rating).unwrap()
    }

    fn job() -> FleetJob {
        FleetJob::new(
            EventLog::in_memory(),
            ShutdownCoordinator::new(),
            JobPolicy::default(),
            ProgressFile::disabled(),
            Instant::now() + Duration::from_secs(60),
        )
    }

    fn executor(kinds: &[(&str, OutcomeKind)]) -> Arc<FixedExecutor> {
        Arc::new(FixedExecutor {
            kinds: kinds.iter().map(|(id, kind)| (id.to_string(), *kind)).collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn triage_splits_on_ok() {
        let (good, bad) = triage(vec![
            (node("a"), Outcome::ok("a")),
            (node("b"), Outcome::exited("b", 2)),
            (node("c"), Outcome::timeout("c", 1.0)),
        ]);
        assert_eq!(good.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(bad.len(), 2);
        assert_eq!(bad[1].1.kind, OutcomeKind::Timeout);
    }

    #[tokio::test]
    async fn install_all_terminates_bad_nodes_immediately() {
        let job = job();
        let executor = executor(&[
            ("b", OutcomeKind::NonZeroExit),
            ("c", OutcomeKind::Unreachable),
        ]);
        let cloud = Arc::new(RecordingCloud::default());
        let terminator = Terminator::new(cloud.clone(), job.log.clone(), None);
        let dispatcher = InstallationDispatcher::new(executor.clone());

        let nodes = vec![node("a"), node("b"), node("c"), node("d")];
        let (good, bad) = dispatcher
            .install_all(&job, nodes, &Installer, Duration::from_secs(5), &terminator)
            .await;

        assert_eq!(good.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["a", "d"]);
        assert!(good.iter().all(|n| n.state == NodeState::Installed));
        assert_eq!(bad.len(), 2);
        assert_eq!(*cloud.terminated.lock().unwrap(), vec!["b", "c"]);
        assert_eq!(executor.calls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn broadcast_after_shutdown_starts_nothing() {
        let job = job();
        job.shutdown.signal();
        let executor = executor(&[]);
        let dispatcher = InstallationDispatcher::new(executor.clone());
        let outcomes = dispatcher
            .broadcast(
                &job,
                &[node("a"), node("b")],
                &RemoteCommand::shell("uptime"),
                Duration::from_secs(1),
            )
            .await;
        assert!(outcomes.iter().all(|o| o.kind == OutcomeKind::Exception));
        assert!(outcomes[0].detail.starts_with("Cancelled: "));
        assert!(executor.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_keeps_node_order() {
        let job = job();
        let dispatcher = InstallationDispatcher::new(executor(&[("b", OutcomeKind::Timeout)]));
        let outcomes = dispatcher
            .broadcast(
                &job,
                &[node("a"), node("b"), node("c")],
                &RemoteCommand::shell("uptime"),
                Duration::from_secs(1),
            )
            .await;
        let ids: Vec<_> = outcomes.iter().map(|o| o.node_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let counts = tally_kinds(&outcomes);
        assert_eq!(counts[0], (OutcomeKind::Ok, 2));
        assert_eq!(counts[2], (OutcomeKind::Timeout, 1));
    }

    #[tokio::test]
    async fn panicked_call_is_attributed_to_its_node() {
        let job = job();
        let dispatcher =
            InstallationDispatcher::new(executor(&[("b", OutcomeKind::Exception)]));
        let outcomes = dispatcher
            .broadcast(
                &job,
                &[node("a"), node("b"), node("c")],
                &RemoteCommand::shell("uptime"),
                Duration::from_secs(1),
            )
            .await;

        assert_eq!(outcomes[1].node_id, "b");
        assert_eq!(outcomes[1].kind, OutcomeKind::Exception);
        assert!(outcomes[1].detail.starts_with("JoinError: "), "{}", outcomes[1].detail);
        assert!(outcomes[0].is_ok() && outcomes[2].is_ok());
        let exception = &job.log.records()[0];
        assert_eq!(exception.instance_id, "b");
        assert_eq!(exception.args["type"], "JoinError");
    }
}
