use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cursor_chat_export::cache::CacheManager;
use cursor_chat_export::error::{PipelineError, StorageError};
use cursor_chat_export::normalize::Role;
use cursor_chat_export::pipeline::{CancelToken, Pipeline};
use cursor_chat_export::storage::StorageLocations;
use cursor_chat_export::utils::RunConfig;
use rusqlite::{Connection, params};
use serde_json::json;
use tempfile::TempDir;

fn global_store(path: &Path, rows: &[(String, String)]) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE cursorDiskKV (key TEXT UNIQUE ON CONFLICT REPLACE, value BLOB);")
        .unwrap();
    for (k, v) in rows {
        conn.execute("INSERT INTO cursorDiskKV (key, value) VALUES (?1, ?2)", params![k, v])
            .unwrap();
    }
}

fn row(key: &str, value: serde_json::Value) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn config(tmp: &TempDir, db: Option<PathBuf>, sessions: Option<PathBuf>) -> RunConfig {
    RunConfig {
        locations: StorageLocations {
            db_path: db,
            sessions_dir: sessions,
        },
        workspace_storage: Some(tmp.path().join("workspaceStorage")),
        cache_dir: Some(tmp.path().join("cache")),
        sequential: false,
        timeout: None,
    }
}

fn fixture_rows() -> Vec<(String, String)> {
    vec![
        row(
            "composerData:comp-1",
            json!({
                "composerId": "comp-1",
                "name": "Say hi",
                "createdAt": 500,
                "lastUpdatedAt": 9000,
                "fullConversationHeadersOnly": [{"bubbleId": "b1", "type": 1}]
            }),
        ),
        row(
            "bubbleId:comp-1:b1",
            json!({"bubbleId": "b1", "text": "hi", "timestamp": 1000, "type": 1}),
        ),
        // Second conversation: base64 composer, rich-text answer, a missing bubble.
        (
            "composerData:comp-2".to_string(),
            STANDARD.encode(
                json!({
                    "composerId": "comp-2",
                    "name": "Explain",
                    "lastUpdatedAt": 5000,
                    "fullConversationHeadersOnly": [
                        {"bubbleId": "q", "type": 1},
                        {"bubbleId": "gone", "type": 2},
                        {"bubbleId": "a", "type": 2}
                    ]
                })
                .to_string(),
            ),
        ),
        row(
            "bubbleId:comp-2:q",
            json!({"bubbleId": "q", "text": "what is this?", "timestamp": 2000, "type": 1}),
        ),
        row(
            "bubbleId:comp-2:a",
            json!({
                "bubbleId": "a",
                "timestamp": 3000,
                "type": 2,
                "richText": json!({"root": {"children": [
                    {"type": "paragraph", "children": [{"type": "text", "text": "A fixture."}]}
                ]}}).to_string(),
                "codeBlocks": [{"languageId": "rust", "content": "fn main() {}"}]
            }),
        ),
        row(
            "messageRequestContext:comp-2:a",
            json!({"bubbleId": "a", "projectLayouts": [json!({"rootPath": "/work/app/src"}).to_string()]}),
        ),
        // Garbage is skipped, not fatal.
        ("bubbleId:comp-2:junk".to_string(), "\u{1}\u{2}not json at all".to_string()),
        // A composer with nothing recoverable is dropped.
        row(
            "composerData:empty",
            json!({"composerId": "empty", "fullConversationHeadersOnly": [{"bubbleId": "nope", "type": 1}]}),
        ),
    ]
}

fn workspace_storage(tmp: &TempDir) {
    let dir = tmp.path().join("workspaceStorage/abc123");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("workspace.json"), r#"{"folder": "file:///work/app"}"#).unwrap();
}

#[test]
fn reconstructs_global_store() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("state.vscdb");
    global_store(&db, &fixture_rows());
    workspace_storage(&tmp);
    let cfg = config(&tmp, Some(db.clone()), None);

    let sessions = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();
    let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["comp-1", "comp-2"]);

    let first = &sessions[0];
    assert_eq!(first.source, "cursor-global");
    assert_eq!(first.messages.len(), 1);
    assert_eq!(
        serde_json::to_value(&first.messages[0]).unwrap(),
        json!({"actor": "user", "content": "hi", "timestamp": "1970-01-01T00:00:01Z"})
    );

    let second = &sessions[1];
    assert_eq!(second.workspace, "/work/app");
    let roles: Vec<Role> = second.messages.iter().map(|m| m.actor).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(
        second.messages[1].content,
        "A fixture.\n\n```rust\nfn main() {}\n```"
    );

    let cache = CacheManager::new(tmp.path().join("cache"));
    assert!(cache.is_cache_valid(&db));
}

#[test]
fn sequential_matches_concurrent() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("state.vscdb");
    global_store(&db, &fixture_rows());
    let mut cfg = config(&tmp, Some(db), None);
    cfg.cache_dir = None;

    let concurrent = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();
    cfg.sequential = true;
    let sequential = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();
    assert_eq!(concurrent, sequential);
}

#[test]
fn cache_is_used_until_the_source_changes() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("state.vscdb");
    global_store(&db, &fixture_rows());
    let cfg = config(&tmp, Some(db.clone()), None);

    let built = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();

    // Tamper with the cached copy; a valid cache must be served as-is.
    let cache = CacheManager::new(tmp.path().join("cache"));
    let mut index = cache.load_index().unwrap();
    index.sessions.truncate(1);
    fs::write(
        tmp.path().join("cache/index.json"),
        serde_json::to_vec(&index).unwrap(),
    )
    .unwrap();
    let cached = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();
    assert_eq!(cached.len(), 1);

    // Touching the source invalidates it.
    let later = std::time::SystemTime::now() + std::time::Duration::from_secs(120);
    fs::File::options()
        .write(true)
        .open(&db)
        .unwrap()
        .set_modified(later)
        .unwrap();
    let rebuilt = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();
    assert_eq!(rebuilt, built);
}

#[test]
fn find_session_and_missing_id() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("state.vscdb");
    global_store(&db, &fixture_rows());
    let cfg = config(&tmp, Some(db.clone()), None);
    let pipeline = Pipeline::new(&cfg, CancelToken::new());

    let session = pipeline.find_session("comp-2").unwrap();
    assert_eq!(session.metadata.name, "Explain");
    let cache = CacheManager::new(tmp.path().join("cache"));
    assert_eq!(cache.load_session("comp-2").unwrap(), session);

    let err = pipeline.find_session("does-not-exist").unwrap_err();
    assert!(matches!(
        err,
        PipelineError::SessionNotFound { ref id, scanned: 2 } if id == "does-not-exist"
    ));
}

#[test]
fn cancelled_run_saves_nothing() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("state.vscdb");
    global_store(&db, &fixture_rows());
    let cfg = config(&tmp, Some(db), None);

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = Pipeline::new(&cfg, cancel).sessions().unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(!tmp.path().join("cache/index.json").exists());
}

#[test]
fn missing_storage_reports_locations() {
    let tmp = TempDir::new().unwrap();
    let cfg = config(
        &tmp,
        Some(tmp.path().join("nope.vscdb")),
        Some(tmp.path().join("chats")),
    );
    let err = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap_err();
    let PipelineError::Storage(StorageError::NotFound { checked }) = &err else {
        panic!("expected NotFound, got {err}");
    };
    assert_eq!(checked.len(), 2);
}

#[test]
fn reads_per_session_databases() {
    let tmp = TempDir::new().unwrap();
    let chats = tmp.path().join("chats");
    let session_dir = chats.join("workspace-hash/session-a");
    fs::create_dir_all(&session_dir).unwrap();

    let conn = Connection::open(session_dir.join("store.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE meta (key TEXT, value TEXT);
         CREATE TABLE blobs (id TEXT, data BLOB);",
    )
    .unwrap();
    conn.execute(
        "INSERT INTO meta VALUES ('0', ?1)",
        params![json!({"name": "Per-session chat", "createdAt": 100}).to_string()],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO blobs VALUES ('m1', ?1)",
        params!["please refactor this$0b7e3c4a-5d6f-4a8b-9c0d-1e2f3a4b5c6d"],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO blobs VALUES ('m2', ?1)",
        params![json!({"role": "assistant", "content": [{"type": "text", "text": "Done."}], "timestamp": 200}).to_string()],
    )
    .unwrap();
    drop(conn);

    let cfg = config(&tmp, Some(tmp.path().join("absent.vscdb")), Some(chats));
    let sessions = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    let s = &sessions[0];
    assert_eq!(s.id, "session-a");
    assert_eq!(s.source, "cursor-sessions");
    assert_eq!(s.metadata.name, "Per-session chat");
    let contents: Vec<&str> = s.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["please refactor this", "Done."]);
    assert_eq!(s.messages[0].actor, Role::User);
    assert_eq!(s.messages[1].actor, Role::Assistant);
}

#[test]
fn find_session_on_cold_cache_keeps_full_listing() {
    let tmp = TempDir::new().unwrap();
    let db = tmp.path().join("state.vscdb");
    global_store(&db, &fixture_rows());
    let cfg = config(&tmp, Some(db), None);

    let found = Pipeline::new(&cfg, CancelToken::new()).find_session("comp-2").unwrap();
    assert_eq!(found.id, "comp-2");

    let listed = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();
    let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["comp-1", "comp-2"]);
}

fn blob_store(path: &Path, rows: &[(&str, serde_json::Value)]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let conn = Connection::open(path).unwrap();
    conn.execute_batch("CREATE TABLE blobs (id TEXT, data BLOB);").unwrap();
    for (k, v) in rows {
        conn.execute("INSERT INTO blobs VALUES (?1, ?2)", params![k, v.to_string()])
            .unwrap();
    }
}

#[test]
fn session_files_sharing_row_keys_stay_separate() {
    let tmp = TempDir::new().unwrap();
    let chats = tmp.path().join("chats");
    blob_store(
        &chats.join("sess-a/store.db"),
        &[("1", json!({"role": "user", "content": "question in A", "timestamp": 1000}))],
    );
    blob_store(
        &chats.join("sess-b/store.db"),
        &[("1", json!({"role": "user", "content": "question in B", "timestamp": 2000}))],
    );

    let cfg = config(&tmp, None, Some(chats));
    let sessions = Pipeline::new(&cfg, CancelToken::new()).sessions().unwrap();
    let got: Vec<(&str, &str)> = sessions
        .iter()
        .map(|s| (s.id.as_str(), s.messages[0].content.as_str()))
        .collect();
    assert_eq!(got, vec![("sess-b", "question in B"), ("sess-a", "question in A")]);
}
