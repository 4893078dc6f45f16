use std::collections::HashSet;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde_json::Value;
use walkdir::WalkDir;

use super::single::{bubble_from_row, composer_from_row, context_from_row};
use super::{Sink, StorageBackend, open_read_only, value_as_string};
use crate::decode::{self, Decoded};
use crate::error::StorageError;
use crate::records::{
    BUBBLE_PREFIX, Bubble, COMPOSER_PREFIX, CONTEXT_PREFIX, Composer, Header, MessageContext,
    millis_from_value,
};

const DB_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3", "vscdb"];
const KEY_COLUMNS: &[&str] = &["key", "id", "name", "k"];
const VALUE_COLUMNS: &[&str] = &["value", "data", "blob", "content", "v"];

/// A table and the two columns guessed to hold its keys and values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableShape {
    table: String,
    key_column: String,
    value_column: String,
}

/// Everything recovered from one database file.
#[derive(Debug, Default)]
struct FileRecords {
    bubbles: Vec<Bubble>,
    composers: Vec<Composer>,
    contexts: Vec<MessageContext>,
}

/// Database files under `root`, sorted. Unreadable entries are skipped.
pub fn database_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|x| x.to_str())
                .is_some_and(|x| DB_EXTENSIONS.contains(&x))
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// A directory of independent per-session databases.
pub struct MultiFileStore {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl MultiFileStore {
    /// Discover database files under `root`.
    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            files: database_files(root),
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Session id implied by a file's location: its parent directory name,
    /// or the file stem when it sits directly under the root.
    fn session_id_for(&self, file: &Path) -> String {
        let parent = file.parent().filter(|p| *p != self.root.as_path());
        parent
            .and_then(|p| p.file_name())
            .or_else(|| file.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Decode every file in order, handing each file's records to `visit`.
    fn scan(
        &self,
        visit: &mut dyn FnMut(FileRecords) -> ControlFlow<()>,
    ) -> Result<(), StorageError> {
        for file in &self.files {
            let records = match self.read_file(file) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable session database");
                    continue;
                }
            };
            if visit(records).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn read_file(&self, file: &Path) -> Result<FileRecords, StorageError> {
        let conn = open_read_only(file)?;
        let session_id = self.session_id_for(file);
        let mut records = FileRecords::default();
        let mut meta: Option<Value> = None;

        for shape in discover_tables(&conn, file)? {
            read_table(&conn, file, &shape, &mut |key: &str, raw: &str| {
                classify_row(key, raw, &session_id, &mut records, &mut meta);
            })?;
        }

        if records.composers.is_empty() && !records.bubbles.is_empty() {
            records
                .composers
                .push(synthesize_composer(&session_id, &records.bubbles, meta.as_ref()));
        }
        tracing::debug!(
            file = %file.display(),
            bubbles = records.bubbles.len(),
            composers = records.composers.len(),
            "read session database"
        );
        Ok(records)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Pick the key and value columns out of a table's column names.
fn guess_key_value(columns: &[String]) -> Option<(String, String)> {
    let find = |candidates: &[&str]| {
        candidates.iter().find_map(|c| {
            columns
                .iter()
                .find(|col| col.eq_ignore_ascii_case(c))
                .cloned()
        })
    };
    match (find(KEY_COLUMNS), find(VALUE_COLUMNS)) {
        (Some(k), Some(v)) if k != v => Some((k, v)),
        _ if columns.len() == 2 => Some((columns[0].clone(), columns[1].clone())),
        _ => None,
    }
}

fn discover_tables(conn: &Connection, file: &Path) -> Result<Vec<TableShape>, StorageError> {
    let query_err = |source| StorageError::Query {
        path: file.to_path_buf(),
        source,
    };
    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
        .and_then(|mut stmt| {
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<_, _>>()
        })
        .map_err(query_err)?;

    let mut shapes = Vec::new();
    for table in tables {
        let columns: Vec<String> = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))
            .and_then(|mut stmt| {
                stmt.query_map([], |row| row.get::<_, String>(1))?
                    .collect::<Result<_, _>>()
            })
            .map_err(query_err)?;
        match guess_key_value(&columns) {
            Some((key_column, value_column)) => shapes.push(TableShape {
                table,
                key_column,
                value_column,
            }),
            None => tracing::trace!(table, ?columns, "no key/value pair in table"),
        }
    }
    Ok(shapes)
}

fn read_table(
    conn: &Connection,
    file: &Path,
    shape: &TableShape,
    visit: &mut dyn FnMut(&str, &str),
) -> Result<(), StorageError> {
    let query_err = |source| StorageError::Query {
        path: file.to_path_buf(),
        source,
    };
    let sql = format!(
        "SELECT {}, {} FROM {}",
        quote_ident(&shape.key_column),
        quote_ident(&shape.value_column),
        quote_ident(&shape.table)
    );
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let mut rows = stmt.query([]).map_err(query_err)?;
    while let Some(row) = rows.next().map_err(query_err)? {
        let Some(key) = row.get_ref(0).ok().and_then(value_as_string) else {
            continue;
        };
        let Some(raw) = row.get_ref(1).ok().and_then(value_as_string) else {
            continue;
        };
        visit(&key, &raw);
    }
    Ok(())
}

/// Route one row to the right record kind.
///
/// Namespaced keys are handled exactly like the single-table store; any
/// other row is classified by the shape of its decoded value.
fn classify_row(
    key: &str,
    raw: &str,
    session_id: &str,
    records: &mut FileRecords,
    meta: &mut Option<Value>,
) {
    if key.starts_with(BUBBLE_PREFIX) {
        records.bubbles.extend(bubble_from_row(key, raw));
        return;
    }
    if key.starts_with(COMPOSER_PREFIX) {
        records.composers.extend(composer_from_row(key, raw));
        return;
    }
    if key.starts_with(CONTEXT_PREFIX) {
        records.contexts.extend(context_from_row(key, raw));
        return;
    }

    // Row keys are only unique within one file.
    let row_id = format!("{session_id}:{key}");
    let decoded = match decode::decode_value(key, raw) {
        Ok((decoded, _)) => decoded,
        Err(e) => {
            tracing::debug!(error = %e, "skipping row");
            return;
        }
    };

    match decoded {
        plain @ Decoded::PlainText { .. } => {
            records
                .bubbles
                .extend(Bubble::from_decoded(plain, &row_id, session_id));
        }
        Decoded::Json(Value::Array(items)) => {
            for (i, item) in items.into_iter().enumerate() {
                if Bubble::looks_like(&item) {
                    let fallback = format!("{row_id}#{i}");
                    records
                        .bubbles
                        .extend(Bubble::from_json(item, &fallback, session_id));
                }
            }
        }
        Decoded::Json(value) => {
            if Composer::looks_like(&value) {
                records.composers.extend(Composer::from_json(value, session_id));
            } else if Bubble::looks_like(&value) {
                records
                    .bubbles
                    .extend(Bubble::from_json(value, &row_id, session_id));
            } else if meta.is_none() && (value.get("name").is_some() || value.get("createdAt").is_some()) {
                *meta = Some(value);
            }
        }
    }
}

/// Composer for a file that stores messages without a header list.
fn synthesize_composer(session_id: &str, bubbles: &[Bubble], meta: Option<&Value>) -> Composer {
    let field = |name: &str| meta.and_then(|m| m.get(name));
    let mut seen = HashSet::new();
    let headers = bubbles
        .iter()
        .filter(|b| seen.insert(b.id.clone()))
        .map(|b| Header {
            bubble_id: b.id.clone(),
            actor: Some(b.actor),
        })
        .collect();
    Composer {
        id: session_id.to_string(),
        name: field("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        created_at: field("createdAt")
            .and_then(millis_from_value)
            .or_else(|| bubbles.iter().filter_map(|b| b.timestamp).min()),
        updated_at: field("lastUpdatedAt")
            .or_else(|| field("updatedAt"))
            .and_then(millis_from_value)
            .or_else(|| bubbles.iter().filter_map(|b| b.timestamp).max()),
        headers,
    }
}

impl StorageBackend for MultiFileStore {
    fn source_tag(&self) -> &'static str {
        "cursor-sessions"
    }

    fn location(&self) -> &Path {
        &self.root
    }

    fn for_each_bubble(&self, sink: Sink<'_, Bubble>) -> Result<(), StorageError> {
        self.scan(&mut |records: FileRecords| {
            for b in records.bubbles {
                sink(b)?;
            }
            ControlFlow::Continue(())
        })
    }

    fn for_each_composer(&self, sink: Sink<'_, Composer>) -> Result<(), StorageError> {
        self.scan(&mut |records: FileRecords| {
            for c in records.composers {
                sink(c)?;
            }
            ControlFlow::Continue(())
        })
    }

    fn for_each_context(&self, sink: Sink<'_, MessageContext>) -> Result<(), StorageError> {
        self.scan(&mut |records: FileRecords| {
            for c in records.contexts {
                sink(c)?;
            }
            ControlFlow::Continue(())
        })
    }
}
