//! Mapping conversations to the workspace folder they were held in.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use url::Url;

use crate::records::MessageContext;

/// One entry of `workspaceStorage/<id>/workspace.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub folder: PathBuf,
}

#[derive(Deserialize)]
struct WorkspaceFile {
    folder: Option<String>,
}

/// `file://` URIs become paths; anything else is taken as a path already.
fn path_from_location(location: &str) -> Option<PathBuf> {
    if location.starts_with("file:") {
        Url::parse(location).ok()?.to_file_path().ok()
    } else if location.is_empty() || location.contains("://") {
        None
    } else {
        Some(PathBuf::from(location))
    }
}

/// Read every `*/workspace.json` under a `workspaceStorage` directory.
///
/// Entries without a local folder (remote or multi-root workspaces) are skipped.
pub fn load_workspaces(storage_dir: &Path) -> Vec<Workspace> {
    let Ok(entries) = fs::read_dir(storage_dir) else {
        tracing::debug!(path = %storage_dir.display(), "no workspace storage");
        return Vec::new();
    };

    let mut out: Vec<Workspace> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| {
            let raw = fs::read_to_string(e.path().join("workspace.json")).ok()?;
            let parsed: WorkspaceFile = serde_json::from_str(&raw).ok()?;
            Some(Workspace {
                id: e.file_name().to_string_lossy().into_owned(),
                folder: path_from_location(parsed.folder.as_deref()?)?,
            })
        })
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    tracing::debug!(count = out.len(), "loaded workspaces");
    out
}

/// Workspace folder for a conversation, or an empty string.
///
/// The first context whose project root equals or sits under a known folder
/// decides; among several matching folders the deepest one is used.
pub fn associate(composer_id: &str, contexts: &[MessageContext], workspaces: &[Workspace]) -> String {
    for ctx in contexts {
        for root in ctx.project_roots.iter().filter_map(|r| path_from_location(r)) {
            let best = workspaces
                .iter()
                .filter(|w| root.starts_with(&w.folder))
                .max_by_key(|w| w.folder.components().count());
            if let Some(ws) = best {
                tracing::trace!(composer = composer_id, workspace = %ws.id, "associated workspace");
                return ws.folder.to_string_lossy().into_owned();
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(roots: &[&str]) -> MessageContext {
        MessageContext {
            composer_id: "c".into(),
            bubble_id: "b".into(),
            project_roots: roots.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    fn ws(id: &str, folder: &str) -> Workspace {
        Workspace {
            id: id.into(),
            folder: PathBuf::from(folder),
        }
    }

    #[test]
    fn loads_workspace_json_files() {
        let tmp = tempfile::tempdir().unwrap();
        for (id, body) in [
            ("aaa", r#"{"folder": "file:///home/me/proj%20one"}"#),
            ("bbb", r#"{"workspace": "file:///home/me/multi.code-workspace"}"#),
            ("ccc", r#"{"folder": "vscode-remote://ssh-remote+box/srv"}"#),
        ] {
            let dir = tmp.path().join(id);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("workspace.json"), body).unwrap();
        }
        fs::write(tmp.path().join("stray.json"), "{}").unwrap();

        let loaded = load_workspaces(tmp.path());
        assert_eq!(loaded, vec![ws("aaa", "/home/me/proj one")]);
        assert!(load_workspaces(&tmp.path().join("missing")).is_empty());
    }

    #[test]
    fn matches_equal_or_nested_roots() {
        let table = vec![ws("1", "/home/me/app"), ws("2", "/home/me/app/packages/web")];
        assert_eq!(associate("c", &[ctx(&["/home/me/app"])], &table), "/home/me/app");
        assert_eq!(
            associate("c", &[ctx(&["/home/me/app/packages/web/src"])], &table),
            "/home/me/app/packages/web"
        );
        assert_eq!(
            associate("c", &[ctx(&["file:///home/me/app/lib"])], &table),
            "/home/me/app"
        );
    }

    #[test]
    fn no_match_is_empty() {
        let table = vec![ws("1", "/home/me/app")];
        assert_eq!(associate("c", &[ctx(&["/home/me/application"])], &table), "");
        assert_eq!(associate("c", &[], &table), "");
        assert_eq!(associate("c", &[ctx(&["/home/me/app"])], &[]), "");
    }

    #[test]
    fn first_matching_context_wins() {
        let table = vec![ws("1", "/a"), ws("2", "/b")];
        let contexts = [ctx(&["/elsewhere"]), ctx(&["/b/x"]), ctx(&["/a"])];
        assert_eq!(associate("c", &contexts, &table), "/b");
    }
}
