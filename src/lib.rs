//! Fleet runner: runs a batch of numbered work items across a fleet of rented nodes.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse and represent nodes.
pub mod node;
// How remote calls end.
pub mod outcome;
// JSON-lines event log.
pub mod event_log;
// Progress snapshot file.
pub mod progress;
// Cooperative shutdown.
pub mod shutdown;
// Shared queue of work items.
pub mod queue;
// The remote call seam and its shared plumbing.
pub mod executor;
// SSH executor.
pub mod session;
// Executor running commands on this host.
pub mod local;
// What to run on the nodes.
pub mod workload;
// State shared by everything in one job.
pub mod job;
// Launching and terminating nodes.
pub mod cloud;
// Purging host keys of released nodes.
pub mod known_hosts;
// Fleet sizing.
pub mod autoscale;
// Node recruitment and termination bookkeeping.
pub mod recruiter;
// Installation and broadcast.
pub mod dispatcher;
// One worker per node.
pub mod worker;
// Job sequencing.
pub mod controller;

pub use autoscale::Autoscale;
pub use cloud::{CloudApi, InventoryCloud, LauncherCloud};
pub use config::{Config, JobSettings, Mode};
pub use controller::{FleetController, FleetPlan, JobSummary};
pub use dispatcher::InstallationDispatcher;
pub use error::{FleetError, Result};
pub use event_log::{EventLog, EventRecord, EventType};
pub use executor::{Console, Download, RemoteCommand, RemoteExecutor, Upload};
pub use job::{FleetJob, JobPolicy};
pub use known_hosts::KnownHosts;
pub use local::LocalExecutor;
pub use node::{Node, NodeDescriptor, NodeState};
pub use outcome::{CallPhase, Outcome, OutcomeKind};
pub use queue::{WorkItem, WorkQueue};
pub use recruiter::{NodeRecruiter, RecruitRequest, Terminator};
pub use session::SshExecutor;
pub use shutdown::ShutdownCoordinator;
pub use worker::{WorkerExit, WorkerPool, WorkerReport};
pub use workload::{TemplateWorkload, Workload, WorkloadSpec};
