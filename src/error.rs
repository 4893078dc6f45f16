//! Typed errors for the recovery pipeline.
//!
//! Record-level problems ([`ParseError`]) are always absorbed by the caller and
//! logged; only storage selection and an explicitly requested, missing session
//! are meant to reach the user.

use std::path::PathBuf;

/// An underlying storage file could not be opened or read.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Neither storage layout was found.
    #[error(
        "No Cursor chat storage found. Checked:\n{}\n\nNext steps:\n  - pass --db <path/to/state.vscdb> for the global store\n  - pass --sessions-dir <dir> for per-session databases\n  - or set db_path / sessions_dir in config.toml",
        checked.iter().map(|p| format!("  - {}", p.display())).collect::<Vec<_>>().join("\n")
    )]
    NotFound { checked: Vec<PathBuf> },

    #[error("Failed to open database {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to query {}: {source}", path.display())]
    Query {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to snapshot {}: {detail}", path.display())]
    Snapshot { path: PathBuf, detail: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single record could not be recovered after exhausting the decode chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("undecodable record {key}: {reason}")]
pub struct ParseError {
    pub key: String,
    pub reason: String,
}

/// A whole composer could not be turned into a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconstructionError {
    #[error("no conversation to normalize")]
    MissingConversation,

    #[error("conversation {composer_id} has no messages")]
    Empty { composer_id: String },
}

/// Writing an exported session to its sink failed.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failures of a whole pipeline invocation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Operation cancelled before completion; nothing was saved")]
    Cancelled,

    #[error("Session '{id}' not found ({scanned} sessions scanned). Run 'cursor-chat-export list' to see all sessions.")]
    SessionNotFound { id: String, scanned: usize },
}

/// Failures writing the on-disk cache. Callers log these and carry on.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
