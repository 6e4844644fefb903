//! Classified results of remote calls.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutcomeKind {
    Ok,
    NonZeroExit,
    Timeout,
    Unreachable,
    Exception,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutcomeKind::Ok => "ok",
            OutcomeKind::NonZeroExit => "nonZeroExit",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::Unreachable => "unreachable",
            OutcomeKind::Exception => "exception",
        };
        f.write_str(name)
    }
}

/// Step of a remote call at which its outcome was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallPhase {
    Connect,
    Upload,
    Command,
    Download,
}

/// What happened when one command ran on one node.
///
/// Outcomes are data, never errors: callers decide whether to retry, requeue or retire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub node_id: String,
    pub work_item: Option<u64>,
    pub kind: OutcomeKind,
    /// Exit code for `nonZeroExit`, `Type: message` for `unreachable`/`exception`,
    /// the time limit in seconds for `timeout`.
    pub detail: String,
    pub phase: CallPhase,
    pub timestamp: DateTime<Utc>,
}

impl Outcome {
    fn new(node_id: &str, kind: OutcomeKind, detail: String) -> Self {
        Self {
            node_id: node_id.to_string(),
            work_item: None,
            kind,
            detail,
            phase: CallPhase::Command,
            timestamp: Utc::now(),
        }
    }

    pub fn ok(node_id: &str) -> Self {
        Self::new(node_id, OutcomeKind::Ok, String::new())
    }

    pub fn exited(node_id: &str, code: i32) -> Self {
        if code == 0 {
            Self::ok(node_id)
        } else {
            Self::new(node_id, OutcomeKind::NonZeroExit, code.to_string())
        }
    }

    pub fn timeout(node_id: &str, limit_secs: f64) -> Self {
        Self::new(node_id, OutcomeKind::Timeout, format!("{}", limit_secs))
    }

    pub fn unreachable(node_id: &str, type_name: &str, message: &str) -> Self {
        Self::new(
            node_id,
            OutcomeKind::Unreachable,
            format!("{}: {}", type_name, message),
        )
    }

    pub fn exception(node_id: &str, type_name: &str, message: &str) -> Self {
        Self::new(
            node_id,
            OutcomeKind::Exception,
            format!("{}: {}", type_name, message),
        )
    }

    pub fn for_item(mut self, item: u64) -> Self {
        self.work_item = Some(item);
        self
    }

    pub fn at(mut self, phase: CallPhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.kind == OutcomeKind::Ok
    }

    /// Exit code reported for `nonZeroExit` outcomes, 0 for `ok`.
    pub fn exit_code(&self) -> Option<i32> {
        match self.kind {
            OutcomeKind::Ok => Some(0),
            OutcomeKind::NonZeroExit => self.detail.parse().ok(),
            _ => None,
        }
    }
}

/// Name of an error's variant or type as printed by `Debug`, e.g. `Connect` for
/// `Connect(Os { .. })`.
pub fn error_type_name<E: fmt::Debug>(error: &E) -> String {
    let debug = format!("{:?}", error);
    debug
        .split(|c: char| c == '(' || c == ' ' || c == '{')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_zero_is_ok() {
        assert!(Outcome::exited("n", 0).is_ok());
        let failed = Outcome::exited("n", 3);
        assert_eq!(failed.kind, OutcomeKind::NonZeroExit);
        assert_eq!(failed.exit_code(), Some(3));
    }

    #[test]
    fn exception_detail_keeps_message_verbatim() {
        let outcome = Outcome::exception("n", "Remote", "channel closed: \"eof\"").for_item(7);
        assert_eq!(outcome.detail, "Remote: channel closed: \"eof\"");
        assert_eq!(outcome.work_item, Some(7));
        assert_eq!(outcome.exit_code(), None);
    }

    #[test]
    fn type_name_from_debug() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(error_type_name(&err), "Custom");
        assert_eq!(error_type_name(&std::fmt::Error), "Error");
    }
}
