//! Crawl checkpoint: everything needed to continue an interrupted run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::frontier::FrontierSnapshot;
use crate::json_utils::{JsonError, read_json_file, write_json_atomic};
use crate::metrics::CounterSnapshot;
use crate::models::ThreadRecord;
use crate::orchestration::assembler::PendingThread;
use crate::writer::IndexEntry;

pub const STATE_FILE: &str = "crawl_state.json";
pub const STATE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("checkpoint {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: JsonError,
    },

    #[error("checkpoint was written for {found}, not {expected}")]
    BaseMismatch { expected: String, found: String },

    #[error("checkpoint version {found} is not supported (expected {expected})")]
    Version { expected: u32, found: u32 },

    #[error("failed to remove checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlState {
    pub version: u32,
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub saved_at: DateTime<Utc>,
    pub frontier: FrontierSnapshot,
    pub pending_threads: Vec<PendingThread>,
    /// Threads already exported, keyed by thread id.
    pub written_threads: BTreeMap<String, IndexEntry>,
    /// Assembled threads whose media was interrupted; written first on resume.
    #[serde(default)]
    pub deferred_threads: Vec<ThreadRecord>,
    pub counters: CounterSnapshot,
}

impl CrawlState {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            base_url: base_url.into(),
            saved_at: Utc::now(),
            frontier: FrontierSnapshot::default(),
            pending_threads: Vec::new(),
            written_threads: BTreeMap::new(),
            deferred_threads: Vec::new(),
            counters: CounterSnapshot::default(),
        }
    }

    pub fn path(out_dir: &Path) -> PathBuf {
        out_dir.join(STATE_FILE)
    }

    pub fn save(&self, out_dir: &Path) -> Result<PathBuf, StateError> {
        let path = Self::path(out_dir);
        write_json_atomic(&path, self).map_err(|source| StateError::Json {
            path: path.clone(),
            source,
        })?;
        info!(
            "Checkpoint saved: {} pending, {} visited, {} threads written",
            self.frontier.pending.len(),
            self.frontier.visited.len(),
            self.written_threads.len()
        );
        Ok(path)
    }

    /// Load the checkpoint in `out_dir`, if any. A checkpoint for another base URL
    /// or format version is an error rather than silently ignored.
    pub fn load(out_dir: &Path, expected_base: &str) -> Result<Option<Self>, StateError> {
        let path = Self::path(out_dir);
        if !path.exists() {
            return Ok(None);
        }

        let state: CrawlState = read_json_file(&path).map_err(|source| StateError::Json {
            path: path.clone(),
            source,
        })?;

        if state.version != STATE_VERSION {
            return Err(StateError::Version {
                expected: STATE_VERSION,
                found: state.version,
            });
        }
        if normalize_base(&state.base_url) != normalize_base(expected_base) {
            return Err(StateError::BaseMismatch {
                expected: expected_base.to_string(),
                found: state.base_url,
            });
        }

        info!(
            "Resuming from checkpoint saved at {}: {} pending, {} visited",
            state.saved_at,
            state.frontier.pending.len(),
            state.frontier.visited.len()
        );
        Ok(Some(state))
    }

    /// Remove the checkpoint after a run that finished normally.
    pub fn clear(out_dir: &Path) -> Result<(), StateError> {
        let path = Self::path(out_dir);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => {
                warn!("Could not remove checkpoint {}: {}", path.display(), source);
                Err(StateError::Io { path, source })
            }
        }
    }
}

fn normalize_base(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}
