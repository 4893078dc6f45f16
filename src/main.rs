use clap::{Parser, Subcommand};
use cursor_chat_export::cache::CacheManager;
use cursor_chat_export::exporter::{self, Format};
use cursor_chat_export::pipeline::{CancelToken, Pipeline};
use cursor_chat_export::storage::StorageLocations;
use cursor_chat_export::utils::{self, RunConfig, short_id};
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Recover and export AI chat history from Cursor's local storage.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the global store (state.vscdb).
    /// Auto-detected if omitted.
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Directory of per-session databases, used when no global store exists.
    #[arg(long, global = true, value_name = "DIR")]
    sessions_dir: Option<PathBuf>,

    /// Cursor's workspaceStorage directory, for workspace association.
    #[arg(long, global = true, value_name = "DIR")]
    workspace_storage: Option<PathBuf>,

    /// Where reconstructed sessions are cached.
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/cursor-chat-export/config.toml
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Always rebuild from storage; neither read nor write the cache.
    #[arg(long, global = true)]
    no_cache: bool,

    /// Load records on the calling thread only.
    #[arg(long, global = true)]
    sequential: bool,

    /// Give up after this many seconds.
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// List recovered sessions, most recent first.
    List,
    /// Print one session.
    Show {
        id: String,
        #[arg(long, value_enum)]
        format: Option<Format>,
    },
    /// Export one session, or all of them.
    Export {
        id: Option<String>,
        #[arg(long, value_enum)]
        format: Option<Format>,
        /// Write one file per session here instead of to stdout.
        #[arg(long, short, value_name = "DIR")]
        output: Option<PathBuf>,
    },
    /// Delete the session cache.
    ClearCache,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    db_path: Option<PathBuf>,
    sessions_dir: Option<PathBuf>,
    workspace_storage: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    format: Option<Format>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        utils::default_config_path().filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_tracing(cli: &Cli) {
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => EnvFilter::new("error"),
        (false, 0) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        (false, 1) => EnvFilter::new("cursor_chat_export=debug"),
        (false, _) => EnvFilter::new("cursor_chat_export=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    // CLI > config file > auto-detect
    let file_cfg = load_file_config(cli.config.as_deref())?;
    let config = RunConfig {
        locations: StorageLocations {
            db_path: cli.db.or(file_cfg.db_path).or_else(utils::default_db_path),
            sessions_dir: cli
                .sessions_dir
                .or(file_cfg.sessions_dir)
                .or_else(utils::default_sessions_dir),
        },
        workspace_storage: cli
            .workspace_storage
            .or(file_cfg.workspace_storage)
            .or_else(utils::default_workspace_storage),
        cache_dir: if cli.no_cache {
            None
        } else {
            cli.cache_dir
                .or(file_cfg.cache_dir)
                .or_else(utils::default_cache_dir)
        },
        sequential: cli.sequential,
        timeout: cli.timeout.map(Duration::from_secs),
    };
    let default_format = file_cfg.format.unwrap_or_default();

    let cancel = config
        .timeout
        .map(CancelToken::with_timeout)
        .unwrap_or_default();
    let pipeline = Pipeline::new(&config, cancel);

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match cli.command {
        Command::List => {
            let sessions = pipeline.sessions()?;
            for s in &sessions {
                let updated = s
                    .last_activity()
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                writeln!(
                    out,
                    "{:<8}  {:<16}  {:>4}  {}{}",
                    short_id(&s.id, 8),
                    updated,
                    s.messages.len(),
                    s.metadata.name,
                    if s.workspace.is_empty() {
                        String::new()
                    } else {
                        format!("  [{}]", s.workspace)
                    }
                )?;
            }
            if sessions.is_empty() {
                eprintln!("No sessions found.");
            }
        }
        Command::Show { id, format } => {
            let session = pipeline.find_session(&id)?;
            exporter::write_sessions(&mut out, &[session], format.unwrap_or(default_format))
                .wrap_err("Failed to write session")?;
        }
        Command::Export { id, format, output } => {
            let format = format.unwrap_or(default_format);
            let sessions = match id {
                Some(id) => vec![pipeline.find_session(&id)?],
                None => pipeline.sessions()?,
            };
            match output {
                Some(dir) => {
                    let written = exporter::export_to_dir(&dir, &sessions, format)
                        .wrap_err_with(|| format!("Failed to export to {}", dir.display()))?;
                    if !cli.quiet {
                        eprintln!("Exported {} session(s) to {}", written.len(), dir.display());
                    }
                }
                None => exporter::write_sessions(&mut out, &sessions, format)
                    .wrap_err("Failed to write sessions")?,
            }
        }
        Command::ClearCache => {
            let dir = config
                .cache_dir
                .as_deref()
                .ok_or_else(|| eyre!("No cache directory configured.\nUse --cache-dir to specify one."))?;
            let removed = CacheManager::new(dir)
                .clear_cache()
                .wrap_err_with(|| format!("Failed to clear cache in {}", dir.display()))?;
            if !cli.quiet {
                eprintln!("Removed {} cached session(s).", removed);
            }
        }
    }

    out.flush()?;
    Ok(())
}
