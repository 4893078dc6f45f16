use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::{Connection, params};
use tempfile::NamedTempFile;

use super::{Sink, StorageBackend, open_read_only, value_as_string};
use crate::decode;
use crate::error::StorageError;
use crate::records::{
    BUBBLE_PREFIX, Bubble, COMPOSER_PREFIX, CONTEXT_PREFIX, Composer, MessageContext, key_segments,
};

const TABLE: &str = "cursorDiskKV";

/// The global `state.vscdb` store.
///
/// Reads go to a private snapshot taken when the store is opened, so the
/// concurrent loaders see one consistent image while the IDE keeps writing.
pub struct SingleTableStore {
    source: PathBuf,
    snapshot: NamedTempFile,
}

/// Copy a live database into a temporary file with SQLite's online backup.
pub fn snapshot_database(db_path: &Path) -> Result<NamedTempFile, StorageError> {
    let snapshot_err = |detail: String| StorageError::Snapshot {
        path: db_path.to_path_buf(),
        detail,
    };

    let src = open_read_only(db_path)?;
    let tmp = NamedTempFile::new().map_err(|source| StorageError::Io {
        path: db_path.to_path_buf(),
        source,
    })?;
    let mut dst = Connection::open(tmp.path())
        .map_err(|e| snapshot_err(format!("failed to open snapshot connection: {e}")))?;

    {
        let backup = Backup::new(&src, &mut dst)
            .map_err(|e| snapshot_err(format!("failed to initialize backup: {e}")))?;
        backup
            .run_to_completion(1000, Duration::from_millis(5), None)
            .map_err(|e| snapshot_err(format!("backup did not complete: {e}")))?;
    }

    drop(src);
    Ok(tmp)
}

impl SingleTableStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let snapshot = snapshot_database(path)?;
        tracing::debug!(source = %path.display(), snapshot = %snapshot.path().display(), "snapshotted database");
        Ok(Self {
            source: path.to_path_buf(),
            snapshot,
        })
    }

    /// Visit every `(key, value)` row whose key starts with `prefix`.
    fn scan_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, &str) -> ControlFlow<()>,
    ) -> Result<(), StorageError> {
        let conn = open_read_only(self.snapshot.path())?;
        let query_err = |source| StorageError::Query {
            path: self.source.clone(),
            source,
        };

        let has_table: bool = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")
            .and_then(|mut stmt| stmt.exists(params![TABLE]))
            .map_err(query_err)?;
        if !has_table {
            tracing::warn!(path = %self.source.display(), "no {TABLE} table; nothing to read");
            return Ok(());
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT key, value FROM {TABLE} WHERE key LIKE ?1 ORDER BY rowid"
            ))
            .map_err(query_err)?;
        let mut rows = stmt
            .query(params![format!("{prefix}%")])
            .map_err(query_err)?;

        while let Some(row) = rows.next().map_err(query_err)? {
            let Ok(key) = row.get::<_, String>(0) else {
                continue;
            };
            let Some(value) = row.get_ref(1).ok().and_then(value_as_string) else {
                continue;
            };
            if visit(&key, &value).is_break() {
                break;
            }
        }
        Ok(())
    }
}

/// Decode a `bubbleId:<chatId>:<bubbleId>` row.
pub(crate) fn bubble_from_row(key: &str, raw: &str) -> Option<Bubble> {
    let segments = key_segments(key, BUBBLE_PREFIX)?;
    let chat_id = segments.first().copied().unwrap_or_default();
    let fallback_id = segments.last().copied().unwrap_or(key);
    match decode::decode_value(key, raw) {
        Ok((decoded, _)) => Bubble::from_decoded(decoded, fallback_id, chat_id),
        Err(e) => {
            tracing::debug!(error = %e, "skipping bubble");
            None
        }
    }
}

/// Decode a `composerData:<composerId>` row.
pub(crate) fn composer_from_row(key: &str, raw: &str) -> Option<Composer> {
    let fallback_id = key.strip_prefix(COMPOSER_PREFIX).unwrap_or(key);
    let value = decode::decode_json_value(key, raw);
    if value.is_none() {
        tracing::debug!(key, "skipping undecodable composer");
    }
    Composer::from_json(value?, fallback_id)
}

/// Decode a `messageRequestContext:<composerId>:<contextId>` row.
pub(crate) fn context_from_row(key: &str, raw: &str) -> Option<MessageContext> {
    let segments = key_segments(key, CONTEXT_PREFIX)?;
    let composer_id = segments.first().copied()?;
    let context_id = segments.get(1).copied().unwrap_or_default();
    let value = decode::decode_json_value(key, raw);
    if value.is_none() {
        tracing::debug!(key, "skipping undecodable message context");
    }
    MessageContext::from_json(value?, composer_id, context_id)
}

impl StorageBackend for SingleTableStore {
    fn source_tag(&self) -> &'static str {
        "cursor-global"
    }

    fn location(&self) -> &Path {
        &self.source
    }

    fn for_each_bubble(&self, sink: Sink<'_, Bubble>) -> Result<(), StorageError> {
        self.scan_prefix(BUBBLE_PREFIX, &mut |key: &str, value: &str| match bubble_from_row(key, value) {
            Some(b) => sink(b),
            None => ControlFlow::Continue(()),
        })
    }

    fn for_each_composer(&self, sink: Sink<'_, Composer>) -> Result<(), StorageError> {
        self.scan_prefix(COMPOSER_PREFIX, &mut |key: &str, value: &str| {
            match composer_from_row(key, value) {
                Some(c) => sink(c),
                None => ControlFlow::Continue(()),
            }
        })
    }

    fn for_each_context(&self, sink: Sink<'_, MessageContext>) -> Result<(), StorageError> {
        self.scan_prefix(CONTEXT_PREFIX, &mut |key: &str, value: &str| {
            match context_from_row(key, value) {
                Some(c) => sink(c),
                None => ControlFlow::Continue(()),
            }
        })
    }
}
