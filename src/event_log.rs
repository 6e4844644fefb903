//! Append-only JSON-lines event log.
//!
//! Every state transition in a job is appended here as one self-contained JSON object per
//! line. External progress and reporting tools read this file back, so the record layout
//! (`dateTime`, `instanceId`, `type`, `args`) must stay stable.
//!
//! All writers share one `EventLog` handle; appends are serialized by a single mutex and
//! each line is written and flushed in one go, so a crash leaves a truncated but valid log.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Operation,
    /// Work item state change; named `frameState` in the file for existing readers.
    #[serde(rename = "frameState")]
    StateChange,
    Stdout,
    Stderr,
    Returncode,
    Exception,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "dateTime")]
    pub date_time: DateTime<Utc>,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub args: Value,
}

enum Sink {
    File(File),
    Memory(Vec<EventRecord>),
}

#[derive(Clone)]
pub struct EventLog {
    sink: Arc<Mutex<Sink>>,
}

impl EventLog {
    /// Creates (truncating) the log file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::with_sink(Sink::File(file)))
    }

    /// A log that keeps records in memory, readable through [`EventLog::records`].
    pub fn in_memory() -> Self {
        Self::with_sink(Sink::Memory(Vec::new()))
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn append(&self, instance_id: &str, kind: EventType, args: Value) {
        let record = EventRecord {
            date_time: Utc::now(),
            instance_id: instance_id.to_string(),
            kind,
            args,
        };
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match &mut *sink {
            Sink::File(file) => {
                // serde_json escapes control characters, so the line holds exactly one record.
                let line = match serde_json::to_string(&record) {
                    Ok(mut line) => {
                        line.push('\n');
                        line
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode event record");
                        return;
                    }
                };
                if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                    tracing::warn!(error = %e, "Failed to append to event log");
                }
            }
            Sink::Memory(records) => records.push(record),
        }
    }

    /// Records appended so far. Empty unless the log was created with [`EventLog::in_memory`].
    pub fn records(&self) -> Vec<EventRecord> {
        match &*self.sink.lock().unwrap_or_else(PoisonError::into_inner) {
            Sink::Memory(records) => records.clone(),
            _ => Vec::new(),
        }
    }

    pub fn operation(&self, instance_id: &str, op: &str, value: Value) {
        let mut args = Map::new();
        args.insert(op.to_string(), value);
        self.append(instance_id, EventType::Operation, Value::Object(args));
    }

    pub fn item_state(&self, instance_id: &str, item: u64, state: &str, rc: i64) {
        self.append(
            instance_id,
            EventType::StateChange,
            json!({ "frameNum": item, "state": state, "rc": rc }),
        );
    }

    pub fn stdout(&self, instance_id: &str, line: &str) {
        self.append(instance_id, EventType::Stdout, Value::from(line));
    }

    pub fn stderr(&self, instance_id: &str, line: &str) {
        self.append(instance_id, EventType::Stderr, Value::from(line));
    }

    pub fn returncode(&self, instance_id: &str, code: i32) {
        self.append(instance_id, EventType::Returncode, Value::from(code));
    }

    pub fn exception(&self, instance_id: &str, type_name: &str, message: &str) {
        self.append(
            instance_id,
            EventType::Exception,
            json!({ "type": type_name, "msg": message }),
        );
    }

    pub fn timeout(&self, instance_id: &str, limit_secs: f64) {
        self.append(instance_id, EventType::Timeout, Value::from(limit_secs));
    }
}
