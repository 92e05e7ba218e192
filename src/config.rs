use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::json_utils::{JsonError, read_json_file};

// Hard limits and defaults - single source of truth

pub struct Limits;

impl Limits {
    // Crawl shape
    pub const DEFAULT_MAX_DEPTH: u32 = 10;
    pub const DEFAULT_CONCURRENCY: usize = 8;
    pub const DEFAULT_MEDIA_CONCURRENCY: usize = 4;
    pub const DEFAULT_RATE_LIMIT_MS: u64 = 500;

    // HTTP/Network config
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const MAX_ATTEMPTS: u32 = 4;
    pub const BACKOFF_BASE_MS: u64 = 500;
    pub const BACKOFF_MAX_MS: u64 = 30_000;
    pub const MAX_PAGE_BYTES: usize = 10 * 1024 * 1024; // 10MB
    pub const MAX_MEDIA_BYTES: usize = 100 * 1024 * 1024; // 100MB
    pub const POOL_IDLE_PER_HOST: usize = 16;
    pub const POOL_IDLE_TIMEOUT_SECS: u64 = 30;
    pub const MAX_REDIRECTS: usize = 5;

    // Persistence and reporting
    pub const CHECKPOINT_INTERVAL_SECS: u64 = 300;
    pub const PROGRESS_INTERVAL_MS: u64 = 1000;
    pub const WRITER_QUEUE_CAPACITY: usize = 256;
    pub const FINALIZER_BACKLOG_PER_WORKER: usize = 2;
    pub const MAX_EMBED_BYTES: u64 = 8 * 1024 * 1024; // 8MB
    pub const SLUG_MAX_LEN: usize = 80;
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("output directory {path} is not writable: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load config file: {0}")]
    File(#[from] JsonError),

    #[error("unknown ruleset {0:?}: expected a built-in name or a path to a ruleset JSON file")]
    UnknownRuleset(String),

    #[error("invalid pattern in ruleset: {0}")]
    Pattern(String),

    #[error("invalid header {0:?}: expected \"Name: value\"")]
    InvalidHeader(String),
}

/// Pre-obtained authentication material attached to every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionCredentials {
    /// Raw `Cookie` header value, e.g. `xf_session=abc; xf_user=1`.
    pub cookie: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl SessionCredentials {
    pub fn is_empty(&self) -> bool {
        self.cookie.is_none() && self.headers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchiveConfig {
    #[serde(rename = "baseURL")]
    pub base_url: String,
    pub scope_path: String,
    pub max_depth: u32,
    pub concurrency: usize,
    pub media_concurrency: usize,
    #[serde(alias = "rateLimitPerHost")]
    pub rate_limit_per_host_ms: u64,
    /// Query parameters kept during canonicalization. Empty means the ruleset's defaults.
    pub allowed_query_params: BTreeSet<String>,
    /// Built-in ruleset name or path to a ruleset JSON file.
    pub ruleset: String,
    pub output_dir: PathBuf,
    pub resume: bool,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_page_bytes: usize,
    pub max_media_bytes: usize,
    /// 0 disables periodic checkpoints; a final one is still written on cancel.
    pub checkpoint_interval_secs: u64,
    pub progress_interval_ms: u64,
    pub download_media: bool,
    /// Inline mirrored media into thread pages as `data:` URIs.
    pub embed_media: bool,
    pub session: SessionCredentials,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            scope_path: "/".to_string(),
            max_depth: Limits::DEFAULT_MAX_DEPTH,
            concurrency: Limits::DEFAULT_CONCURRENCY,
            media_concurrency: Limits::DEFAULT_MEDIA_CONCURRENCY,
            rate_limit_per_host_ms: Limits::DEFAULT_RATE_LIMIT_MS,
            allowed_query_params: BTreeSet::new(),
            ruleset: "xenforo".to_string(),
            output_dir: PathBuf::from("./archive"),
            resume: false,
            user_agent: format!("forum_mirror/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: Limits::REQUEST_TIMEOUT_SECS,
            max_attempts: Limits::MAX_ATTEMPTS,
            backoff_base_ms: Limits::BACKOFF_BASE_MS,
            backoff_max_ms: Limits::BACKOFF_MAX_MS,
            max_page_bytes: Limits::MAX_PAGE_BYTES,
            max_media_bytes: Limits::MAX_MEDIA_BYTES,
            checkpoint_interval_secs: Limits::CHECKPOINT_INTERVAL_SECS,
            progress_interval_ms: Limits::PROGRESS_INTERVAL_MS,
            download_media: true,
            embed_media: false,
            session: SessionCredentials::default(),
        }
    }
}

impl ArchiveConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(read_json_file(path)?)
    }

    /// Check the settings and return the parsed base URL.
    pub fn validate(&self) -> Result<Url, ConfigError> {
        let base = Url::parse(self.base_url.trim()).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") || base.host_str().is_none() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: "expected an http(s) URL with a host".to_string(),
            });
        }

        if self.concurrency == 0 {
            return Err(ConfigError::Zero("concurrency"));
        }
        if self.media_concurrency == 0 {
            return Err(ConfigError::Zero("mediaConcurrency"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("maxAttempts"));
        }
        if self.ruleset.trim().is_empty() {
            return Err(ConfigError::UnknownRuleset(self.ruleset.clone()));
        }

        Ok(base)
    }

    /// Create the output directory and prove it accepts writes.
    pub fn ensure_output_dir(&self) -> Result<(), ConfigError> {
        let to_err = |source| ConfigError::OutputDir {
            path: self.output_dir.clone(),
            source,
        };
        std::fs::create_dir_all(&self.output_dir).map_err(to_err)?;
        tempfile::Builder::new()
            .prefix(".write-check-")
            .tempfile_in(&self.output_dir)
            .map_err(to_err)?;
        Ok(())
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_per_host_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_secs > 0)
            .then(|| Duration::from_secs(self.checkpoint_interval_secs))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}
