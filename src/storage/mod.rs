//! Read-only access to the two storage layouts Cursor has used.
//!
//! - [`SingleTableStore`]: the global `state.vscdb` with one namespaced
//!   `cursorDiskKV(key, value)` table.
//! - [`MultiFileStore`]: a directory tree of independent per-session
//!   databases whose key/value columns are discovered when each file is opened.
//!
//! Both stream typed records through the [`StorageBackend`] visitors so the
//! pipeline can load the three record kinds concurrently.

mod multi;
mod single;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use crate::error::StorageError;
use crate::records::{Bubble, Composer, MessageContext};

pub use multi::{MultiFileStore, database_files};
pub use single::{SingleTableStore, snapshot_database};

/// Receives one record at a time; returning `Break` stops the scan early.
pub type Sink<'a, T> = &'a mut dyn FnMut(T) -> ControlFlow<()>;

/// Uniform read access over either storage layout.
pub trait StorageBackend: Send + Sync {
    /// Tag recorded on every session produced from this backend.
    fn source_tag(&self) -> &'static str;

    /// Path used for the cache fingerprint.
    fn location(&self) -> &Path;

    fn for_each_bubble(&self, sink: Sink<'_, Bubble>) -> Result<(), StorageError>;

    fn for_each_composer(&self, sink: Sink<'_, Composer>) -> Result<(), StorageError>;

    fn for_each_context(&self, sink: Sink<'_, MessageContext>) -> Result<(), StorageError>;

    /// All bubbles by id; a later record with the same id replaces an earlier one.
    fn load_bubbles(&self) -> Result<HashMap<String, Bubble>, StorageError> {
        let mut out = HashMap::new();
        self.for_each_bubble(&mut |b| {
            out.insert(b.id.clone(), b);
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    fn load_composers(&self) -> Result<Vec<Composer>, StorageError> {
        let mut out = Vec::new();
        self.for_each_composer(&mut |c| {
            out.push(c);
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    /// Contexts grouped by composer id.
    fn load_message_contexts(&self) -> Result<HashMap<String, Vec<MessageContext>>, StorageError> {
        let mut out: HashMap<String, Vec<MessageContext>> = HashMap::new();
        self.for_each_context(&mut |ctx| {
            out.entry(ctx.composer_id.clone()).or_default().push(ctx);
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }
}

/// Where to look for storage.
#[derive(Debug, Clone, Default)]
pub struct StorageLocations {
    pub db_path: Option<PathBuf>,
    pub sessions_dir: Option<PathBuf>,
}

/// The storage layout chosen for a run, before anything is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Single(PathBuf),
    Multi(PathBuf),
}

impl Source {
    /// Path the cache fingerprint is taken from.
    pub fn path(&self) -> &Path {
        match self {
            Source::Single(p) | Source::Multi(p) => p,
        }
    }

    pub fn open(&self) -> Result<Box<dyn StorageBackend>, StorageError> {
        match self {
            Source::Single(db) => {
                tracing::info!(path = %db.display(), "using single-table store");
                Ok(Box::new(SingleTableStore::open(db)?))
            }
            Source::Multi(dir) => {
                let store = MultiFileStore::open(dir);
                tracing::info!(path = %dir.display(), files = store.file_count(), "using multi-file store");
                Ok(Box::new(store))
            }
        }
    }
}

/// Prefer the single-table store, fall back to the multi-file store, and
/// report every checked location when neither exists.
pub fn select_source(locations: &StorageLocations) -> Result<Source, StorageError> {
    let mut checked = Vec::new();

    if let Some(db) = &locations.db_path {
        if db.is_file() {
            return Ok(Source::Single(db.clone()));
        }
        checked.push(db.clone());
    }

    if let Some(dir) = &locations.sessions_dir {
        if dir.is_dir() {
            if !database_files(dir).is_empty() {
                return Ok(Source::Multi(dir.clone()));
            }
            tracing::debug!(path = %dir.display(), "sessions directory holds no databases");
        }
        checked.push(dir.clone());
    }

    Err(StorageError::NotFound { checked })
}

pub fn open_backend(locations: &StorageLocations) -> Result<Box<dyn StorageBackend>, StorageError> {
    select_source(locations)?.open()
}

pub(crate) fn open_read_only(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|source| StorageError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(conn)
}

/// Stored value as a string; BLOBs are converted lossily, NULL is absent.
pub(crate) fn value_as_string(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_storage_lists_checked_locations() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = tmp.path().join("state.vscdb");
        let sessions = tmp.path().join("chats");
        let locations = StorageLocations {
            db_path: Some(db.clone()),
            sessions_dir: Some(sessions.clone()),
        };
        let Err(StorageError::NotFound { checked }) = open_backend(&locations) else {
            panic!("expected NotFound");
        };
        assert_eq!(checked, vec![db, sessions]);

        let msg = StorageError::NotFound { checked: checked.clone() }.to_string();
        assert!(msg.contains("state.vscdb"));
        assert!(msg.contains("--sessions-dir"));
    }

    #[test]
    fn empty_sessions_dir_is_not_storage() {
        let tmp = tempfile::TempDir::new().unwrap();
        let locations = StorageLocations {
            db_path: None,
            sessions_dir: Some(tmp.path().to_path_buf()),
        };
        assert!(matches!(
            open_backend(&locations),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn blob_values_become_strings() {
        assert_eq!(value_as_string(ValueRef::Null), None);
        assert_eq!(
            value_as_string(ValueRef::Blob(br#"{"a":1}"#)).as_deref(),
            Some(r#"{"a":1}"#)
        );
        assert_eq!(value_as_string(ValueRef::Integer(7)).as_deref(), Some("7"));
    }
}
