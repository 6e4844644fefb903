//! Per-job shared context.
//!
//! Everything the concurrent parts of a job share lives in one `FleetJob`, handed to each
//! component explicitly. Several jobs can run side by side in one process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::event_log::EventLog;
use crate::progress::ProgressFile;
use crate::queue::{WorkItem, WorkQueue};
use crate::shutdown::ShutdownCoordinator;

/// Retry, retirement and timing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPolicy {
    pub item_time_limit: Duration,
    /// A node is retired once its consecutive failures exceed this.
    pub max_consecutive_failures: u32,
    /// Idle workers retire while `working > unfinished * overage_factor`.
    pub overage_factor: f64,
    /// Attempts after which an item is abandoned; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub poll_interval: Duration,
    /// Time a timed-out command gets to wind down before the call is given up on.
    pub grace_period: Duration,
    pub one_item_per_worker: bool,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            item_time_limit: Duration::from_secs(600),
            max_consecutive_failures: 2,
            overage_factor: 3.0,
            max_attempts: None,
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
            one_item_per_worker: false,
        }
    }
}

pub struct FleetJob {
    pub queue: WorkQueue,
    pub log: EventLog,
    pub shutdown: ShutdownCoordinator,
    pub policy: JobPolicy,
    pub progress: ProgressFile,
    /// No new work starts after this instant.
    pub deadline: Instant,
    working: AtomicUsize,
}

impl FleetJob {
    pub fn new(
        log: EventLog,
        shutdown: ShutdownCoordinator,
        policy: JobPolicy,
        progress: ProgressFile,
        deadline: Instant,
    ) -> Self {
        Self {
            queue: WorkQueue::new(),
            log,
            shutdown,
            policy,
            progress,
            deadline,
            working: AtomicUsize::new(0),
        }
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True once no new work may be started.
    pub fn should_stop(&self) -> bool {
        self.shutdown.is_signaled() || self.deadline_passed()
    }

    /// Caps `limit` by the time left before the deadline.
    pub fn capped(&self, limit: Duration) -> Duration {
        limit.min(self.remaining())
    }

    pub fn working(&self) -> usize {
        self.working.load(Ordering::SeqCst)
    }

    pub(crate) fn worker_started(&self) {
        self.working.fetch_add(1, Ordering::SeqCst);
        self.save_progress();
    }

    pub(crate) fn worker_stopped(&self) {
        self.working.fetch_sub(1, Ordering::SeqCst);
        self.save_progress();
    }

    /// Logs an item state change and refreshes the progress file.
    pub fn record_item(&self, node_id: &str, item: WorkItem, state: &str, rc: i64) {
        self.log.item_state(node_id, item.id, state, rc);
        self.progress.note_item(item.id, state, item.attempts);
        self.save_progress();
    }

    pub fn save_progress(&self) {
        let tally = self.queue.tally();
        self.progress
            .save(tally.succeeded, tally.created, self.working());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(deadline: Instant) -> FleetJob {
        FleetJob::new(
            EventLog::in_memory(),
            ShutdownCoordinator::new(),
            JobPolicy::default(),
            ProgressFile::disabled(),
            deadline,
        )
    }

    #[tokio::test]
    async fn limits_are_capped_by_deadline() {
        let job = job(Instant::now() + Duration::from_secs(10));
        assert!(!job.should_stop());
        assert_eq!(job.capped(Duration::from_secs(2)), Duration::from_secs(2));
        assert!(job.capped(Duration::from_secs(60)) <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn past_deadline_stops_work() {
        let job = job(Instant::now());
        assert!(job.deadline_passed());
        assert!(job.should_stop());
        assert_eq!(job.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn shutdown_stops_work() {
        let job = job(Instant::now() + Duration::from_secs(10));
        job.shutdown.signal();
        assert!(job.should_stop());
    }

    #[tokio::test]
    async fn record_item_logs_state_change() {
        let job = job(Instant::now() + Duration::from_secs(10));
        job.queue.push_back(WorkItem::new(4));
        let item = job.queue.pop_front().unwrap();
        job.worker_started();
        job.record_item("n1", item, "starting", 0);
        assert_eq!(job.working(), 1);

        let record = &job.log.records()[0];
        assert_eq!(record.instance_id, "n1");
        assert_eq!(record.args["state"], "starting");
        let snap = job.progress.snapshot(0, 1, 1);
        assert_eq!(snap.frame_details[0].frame_num, 4);
        job.worker_stopped();
        assert_eq!(job.working(), 0);
    }
}
