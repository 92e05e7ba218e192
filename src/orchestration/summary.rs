//! Run outcome and fatal errors of a crawl.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::canonical::Rejection;
use crate::config::ConfigError;
use crate::json_utils::{JsonError, write_json_atomic};
use crate::metrics::ErrorRecord;
use crate::network::TransportError;
use crate::state::StateError;
use crate::writer::PersistenceError;

pub const SUMMARY_FILE: &str = "run_summary.json";

/// Errors that stop a whole run. Everything else ends up in [`RunSummary::errors`].
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot resume: {0}")]
    State(#[from] StateError),

    #[error("HTTP client setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("base URL cannot be crawled: {0}")]
    Seed(#[from] Rejection),

    #[error("output failed: {0}")]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
    /// The run stopped on a cancellation request; a checkpoint was left for resume.
    pub cancelled: bool,
    pub resumed: bool,

    pub pages_visited: u64,
    pub pages_failed: u64,
    pub pages_unrecognized: u64,
    pub links_discovered: u64,
    pub links_rejected: u64,
    pub mean_fetch_ms: Option<u64>,
    /// Exponentially weighted fetch latency, dominated by the last pages of the run.
    pub recent_fetch_ms: u64,
    pub pages_pending: usize,
    /// Most finished threads ever waiting on media or the writer at once.
    #[serde(default)]
    pub peak_finalizers: usize,

    pub threads_written: u64,
    pub threads_partial: u64,

    pub media_downloaded: usize,
    pub media_reused: usize,
    pub media_failed: usize,
    pub media_bytes: u64,

    pub errors_count: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub errors: Vec<ErrorRecord>,

    pub index_path: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
}

impl RunSummary {
    pub fn path(out_dir: &Path) -> PathBuf {
        out_dir.join(SUMMARY_FILE)
    }

    pub fn write(&self, out_dir: &Path) -> Result<PathBuf, JsonError> {
        let path = Self::path(out_dir);
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn has_errors(&self) -> bool {
        self.errors_count > 0
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pages ({} failed), {} threads ({} partial), {} media files, {} errors in {}s",
            self.pages_visited,
            self.pages_failed,
            self.threads_written,
            self.threads_partial,
            self.media_downloaded,
            self.errors_count,
            self.duration_secs
        )?;
        if self.cancelled {
            write!(f, ", cancelled with {} pages pending", self.pages_pending)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_summary() {
        let dir = TempDir::new().unwrap();
        let summary = RunSummary {
            base_url: "https://forum.test/".to_string(),
            errors_count: 1,
            errors: vec![ErrorRecord {
                kind: "media_fetch".to_string(),
                url: "https://forum.test/a.png".to_string(),
                message: "HTTP 404".to_string(),
            }],
            ..RunSummary::default()
        };
        let path = summary.write(dir.path()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(raw["baseURL"], "https://forum.test/");
        assert_eq!(raw["errorsCount"], 1);
        assert_eq!(raw["errors"][0]["kind"], "media_fetch");
        assert!(summary.has_errors());
    }

    #[test]
    fn test_display_mentions_cancellation() {
        let summary = RunSummary {
            cancelled: true,
            pages_pending: 3,
            ..RunSummary::default()
        };
        assert!(summary.to_string().contains("cancelled with 3 pages pending"));
    }
}
