//! JSON helpers shared by config loading, checkpoints and exports.
//!
//! Files written here always go through a temporary sibling and an atomic
//! rename, so a reader never observes a half-written document.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonError {
    #[error("JSON syntax error at line {line}, column {column}: {msg}")]
    Syntax {
        msg: String,
        line: usize,
        column: usize,
    },

    #[error("JSON validation error: {0}")]
    Data(String),

    #[error("Incomplete JSON: {0}")]
    UnexpectedEof(String),

    #[error("JSON serialization error: {0}")]
    Serialization(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<serde_json::Error> for JsonError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_syntax() {
            JsonError::Syntax {
                msg: e.to_string(),
                line: e.line(),
                column: e.column(),
            }
        } else if e.is_eof() {
            JsonError::UnexpectedEof(e.to_string())
        } else {
            JsonError::Data(e.to_string())
        }
    }
}

/// Deserialize, rejecting empty and `null` documents up front.
pub fn safe_deserialize<'a, T>(json: &'a str) -> Result<T, JsonError>
where
    T: Deserialize<'a>,
{
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Err(JsonError::Data("Empty JSON input".to_string()));
    }
    if trimmed == "null" {
        return Err(JsonError::Data("Null JSON input".to_string()));
    }

    serde_json::from_str(json).map_err(JsonError::from)
}

pub fn safe_serialize_pretty<T>(value: &T) -> Result<String, JsonError>
where
    T: Serialize,
{
    serde_json::to_string_pretty(value).map_err(|e| JsonError::Serialization(e.to_string()))
}

pub fn read_json_file<T>(path: &Path) -> Result<T, JsonError>
where
    T: DeserializeOwned,
{
    let text = std::fs::read_to_string(path).map_err(|source| JsonError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    safe_deserialize(&text)
}

/// Pretty-print `value` into `path` via temp file + rename.
pub fn write_json_atomic<T>(path: &Path, value: &T) -> Result<(), JsonError>
where
    T: Serialize,
{
    let mut text = safe_serialize_pretty(value)?;
    text.push('\n');
    write_bytes_atomic(path, text.as_bytes()).map_err(|source| JsonError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Write `bytes` to a `.partial-*.tmp` sibling of `path`, then rename it into place.
/// The temporary file is removed when any step fails.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".partial-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
