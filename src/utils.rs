use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StorageLocations;

/// Settings for one invocation.
/// This decouples the pipeline from how the arguments were parsed (CLI/Config file).
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub locations: StorageLocations,
    pub workspace_storage: Option<PathBuf>,
    /// `None` disables the cache.
    pub cache_dir: Option<PathBuf>,
    pub sequential: bool,
    pub timeout: Option<Duration>,
}

/// Cursor's per-user data directory.
pub fn cursor_user_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        dirs::data_dir().map(|d| d.join("Cursor/User"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        dirs::config_dir().map(|c| c.join("Cursor/User"))
    }
}

pub fn default_db_path() -> Option<PathBuf> {
    cursor_user_dir().map(|d| d.join("globalStorage/state.vscdb"))
}

pub fn default_workspace_storage() -> Option<PathBuf> {
    cursor_user_dir().map(|d| d.join("workspaceStorage"))
}

pub fn default_sessions_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".cursor/chats"))
}

pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|c| c.join("cursor-chat-export"))
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("cursor-chat-export/config.toml"))
}

/// At most `n` leading characters, for log lines and file names.
pub fn short_id(id: &str, n: usize) -> &str {
    id.char_indices().nth(n).map_or(id, |(i, _)| &id[..i])
}
