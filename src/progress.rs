//! Cheap-to-poll progress snapshot.
//!
//! The progress file is overwritten (never appended) on each state change so that an external
//! process can report progress without replaying the whole event log.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDetail {
    pub frame_num: u64,
    pub state: String,
    pub attempts: u32,
    pub last_date_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub n_frames_finished: u64,
    pub n_frames_wanted: u64,
    pub n_workers_working: usize,
    #[serde(default)]
    pub frame_details: Vec<ItemDetail>,
}

pub struct ProgressFile {
    path: Option<PathBuf>,
    details: Mutex<BTreeMap<u64, ItemDetail>>,
}

impl ProgressFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            details: Mutex::new(BTreeMap::new()),
        }
    }

    /// Tracks details but never touches the filesystem.
    pub fn disabled() -> Self {
        Self {
            path: None,
            details: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn note_item(&self, item: u64, state: &str, attempts: u32) {
        let mut details = self.details.lock().unwrap_or_else(PoisonError::into_inner);
        details.insert(
            item,
            ItemDetail {
                frame_num: item,
                state: state.to_string(),
                attempts,
                last_date_time: Utc::now(),
            },
        );
    }

    pub fn snapshot(&self, finished: u64, wanted: u64, working: usize) -> Progress {
        let details = self.details.lock().unwrap_or_else(PoisonError::into_inner);
        Progress {
            n_frames_finished: finished,
            n_frames_wanted: wanted,
            n_workers_working: working,
            frame_details: details.values().cloned().collect(),
        }
    }

    /// Replaces the progress file with a fresh snapshot.
    ///
    /// The snapshot goes to a sibling temp file first and is renamed over the old one, so a
    /// reader never observes a half-written file.
    pub fn save(&self, finished: u64, wanted: u64, working: usize) {
        let path = match &self.path {
            Some(path) => path,
            None => return,
        };
        // Holding the lock across the write keeps concurrent savers off the temp file.
        let details = self.details.lock().unwrap_or_else(PoisonError::into_inner);
        let progress = Progress {
            n_frames_finished: finished,
            n_frames_wanted: wanted,
            n_workers_working: working,
            frame_details: details.values().cloned().collect(),
        };
        let tmp_path = path.with_extension("json.tmp");
        let result = File::create(&tmp_path)
            .and_then(|mut file| {
                let bytes = serde_json::to_vec(&progress).map_err(std::io::Error::from)?;
                file.write_all(&bytes)?;
                file.sync_all()
            })
            .and_then(|_| std::fs::rename(&tmp_path, path));
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Failed to save progress");
        }
    }
}
