//! On-disk cache of normalized sessions.
//!
//! Layout under the cache directory:
//!
//! ```text
//! index.json            fingerprint + one summary per session
//! sessions/<file>.json  one payload per session
//! ```
//!
//! The index is valid only while the source's modification time is exactly
//! the one recorded; a directory source must also list the same database
//! files with the same modification times. Anything unreadable is reported
//! as a miss.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::CacheError;
use crate::normalize::Session;
use crate::storage::database_files;

const INDEX_FILE: &str = "index.json";
const SESSIONS_DIR: &str = "sessions";

/// Source path and its modification time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub db_path: PathBuf,
    pub modified_secs: u64,
    pub modified_nanos: u32,
    /// Directory sources only: SHA-256 over every database file's relative
    /// path and modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<String>,
}

impl Fingerprint {
    /// Fingerprint a database file, or a directory by its newest database
    /// file plus a digest of the whole listing.
    pub fn of(path: &Path) -> Result<Self, CacheError> {
        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        let meta = fs::metadata(path).map_err(io_err)?;
        let mut modified = since_epoch(meta.modified().map_err(io_err)?);
        let mut listing = None;

        if meta.is_dir() {
            let mut hasher = Sha256::new();
            let mut newest = None;
            for file in database_files(path) {
                let Ok(stamp) = fs::metadata(&file).and_then(|m| m.modified()) else {
                    continue;
                };
                let stamp = since_epoch(stamp);
                let relative = file.strip_prefix(path).unwrap_or(file.as_path());
                let name = relative.to_string_lossy();
                hasher.update((name.len() as u64).to_le_bytes());
                hasher.update(name.as_bytes());
                hasher.update(stamp.as_secs().to_le_bytes());
                hasher.update(stamp.subsec_nanos().to_le_bytes());
                newest = newest.max(Some(stamp));
            }
            if let Some(newest) = newest {
                modified = newest;
            }
            listing = Some(hex::encode(hasher.finalize()));
        }

        Ok(Self {
            db_path: path.to_path_buf(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
            listing,
        })
    }
}

fn since_epoch(time: SystemTime) -> Duration {
    time.duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Summary of one cached session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndexEntry {
    pub id: String,
    pub name: String,
    pub workspace: String,
    pub source: String,
    pub message_count: usize,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Payload file name under `sessions/`.
    pub file: String,
}

impl CacheIndexEntry {
    fn for_session(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.metadata.name.clone(),
            workspace: session.workspace.clone(),
            source: session.source.clone(),
            message_count: session.messages.len(),
            updated_at: session.last_activity(),
            file: payload_file_name(&session.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndex {
    pub fingerprint: Fingerprint,
    pub sessions: Vec<CacheIndexEntry>,
}

/// Session ids are used as file names when they are plain; anything else is hashed.
fn payload_file_name(id: &str) -> String {
    let plain = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if plain {
        format!("{id}.json")
    } else {
        format!("{}.json", hex::encode(Sha256::digest(id.as_bytes())))
    }
}

pub struct CacheManager {
    dir: PathBuf,
}

impl CacheManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn sessions_dir(&self) -> PathBuf {
        self.dir.join(SESSIONS_DIR)
    }

    /// True only if the index records exactly `db_path` and its current mtime.
    pub fn is_cache_valid(&self, db_path: &Path) -> bool {
        let Some(index) = self.load_index() else {
            return false;
        };
        if index.fingerprint.db_path != db_path {
            tracing::debug!(cached = %index.fingerprint.db_path.display(), "cache is for another source");
            return false;
        }
        match Fingerprint::of(db_path) {
            Ok(current) => current == index.fingerprint,
            Err(e) => {
                tracing::debug!(error = %e, "cannot fingerprint source");
                false
            }
        }
    }

    pub fn load_index(&self) -> Option<CacheIndex> {
        read_json(&self.index_path())
    }

    /// Every indexed session, or `None` if any payload is missing or corrupt.
    pub fn load_all_sessions(&self) -> Option<Vec<Session>> {
        let index = self.load_index()?;
        index
            .sessions
            .iter()
            .map(|entry| self.read_payload(entry))
            .collect()
    }

    pub fn load_session(&self, id: &str) -> Option<Session> {
        let index = self.load_index()?;
        let entry = index.sessions.iter().find(|e| e.id == id)?;
        self.read_payload(entry)
    }

    fn read_payload(&self, entry: &CacheIndexEntry) -> Option<Session> {
        let session: Session = read_json(&self.sessions_dir().join(&entry.file))?;
        (session.id == entry.id).then_some(session)
    }

    /// Replace the cache with `sessions`, fingerprinted against `db_path`.
    pub fn save_sessions(&self, sessions: &[Session], db_path: &Path) -> Result<(), CacheError> {
        let fingerprint = Fingerprint::of(db_path)?;
        let previous = self.load_index();

        for session in sessions {
            self.write_payload(session)?;
        }
        let index = CacheIndex {
            fingerprint,
            sessions: sessions.iter().map(CacheIndexEntry::for_session).collect(),
        };

        if let Some(previous) = previous {
            for stale in previous
                .sessions
                .iter()
                .filter(|old| !index.sessions.iter().any(|e| e.file == old.file))
            {
                remove_if_present(&self.sessions_dir().join(&stale.file))?;
            }
        }

        write_atomic(&self.index_path(), &serde_json::to_vec_pretty(&index)?)?;
        tracing::debug!(count = sessions.len(), dir = %self.dir.display(), "cache saved");
        Ok(())
    }

    /// Upsert one session. Starts a fresh index when the existing one belongs
    /// to another source or an older snapshot.
    pub fn save_session_and_update_index(
        &self,
        session: &Session,
        db_path: &Path,
    ) -> Result<(), CacheError> {
        let fingerprint = Fingerprint::of(db_path)?;
        let mut index = match self.load_index() {
            Some(index) if index.fingerprint == fingerprint => index,
            _ => CacheIndex {
                fingerprint,
                sessions: Vec::new(),
            },
        };

        self.write_payload(session)?;
        let entry = CacheIndexEntry::for_session(session);
        match index.sessions.iter_mut().find(|e| e.id == session.id) {
            Some(existing) => *existing = entry,
            None => index.sessions.push(entry),
        }
        write_atomic(&self.index_path(), &serde_json::to_vec_pretty(&index)?)
    }

    /// Remove every indexed payload and the index. Returns how many payloads went.
    pub fn clear_cache(&self) -> Result<usize, CacheError> {
        let Some(index) = self.load_index() else {
            remove_if_present(&self.index_path())?;
            return Ok(0);
        };
        let mut removed = 0;
        for entry in &index.sessions {
            if remove_if_present(&self.sessions_dir().join(&entry.file))? {
                removed += 1;
            }
        }
        remove_if_present(&self.index_path())?;
        // Leaves the directory alone if anything else lives there.
        let _ = fs::remove_dir(self.sessions_dir());
        Ok(removed)
    }

    fn write_payload(&self, session: &Session) -> Result<(), CacheError> {
        let path = self.sessions_dir().join(payload_file_name(&session.id));
        write_atomic(&path, &serde_json::to_vec(session)?)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "cache read failed");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt cache file");
            None
        }
    }
}

/// Write through a temp file in the target directory, then rename into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(parent).map_err(io_err)?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool, CacheError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
