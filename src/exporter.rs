use crate::error::ExportError;
use crate::normalize::Session;
use crate::utils::short_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// One JSON session per line.
    Jsonl,
    /// Pretty-printed JSON array.
    Json,
    Yaml,
    /// YAML frontmatter followed by one section per message.
    #[default]
    Markdown,
}

impl Format {
    pub fn extension(self) -> &'static str {
        match self {
            Format::Jsonl => "jsonl",
            Format::Json => "json",
            Format::Yaml => "yaml",
            Format::Markdown => "md",
        }
    }
}

#[derive(Serialize)]
struct Frontmatter<'a> {
    id: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    workspace: &'a str,
    source: &'a str,
    message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

fn title_of(session: &Session) -> &str {
    let name = session.metadata.name.trim();
    if name.is_empty() { "Untitled" } else { name }
}

pub fn write_markdown<W: Write>(writer: &mut W, session: &Session) -> Result<(), ExportError> {
    let fm = Frontmatter {
        id: &session.id,
        title: title_of(session),
        workspace: &session.workspace,
        source: &session.source,
        message_count: session.messages.len(),
        created_at: session.metadata.created_at,
        updated_at: session.last_activity(),
    };

    writeln!(writer, "---")?;
    write!(writer, "{}", serde_yaml::to_string(&fm)?)?;
    writeln!(writer, "---")?;
    writeln!(writer)?;

    for msg in &session.messages {
        writeln!(writer, "## {}", msg.actor.heading())?;
        writeln!(writer)?;
        writeln!(writer, "{}", msg.content.trim_end())?;
        writeln!(writer)?;
    }
    Ok(())
}

/// Write `sessions` to one sink.
pub fn write_sessions<W: Write>(writer: &mut W, sessions: &[Session], format: Format) -> Result<(), ExportError> {
    match format {
        Format::Jsonl => {
            for session in sessions {
                serde_json::to_writer(&mut *writer, session)?;
                writeln!(writer)?;
            }
        }
        Format::Json => {
            serde_json::to_writer_pretty(&mut *writer, sessions)?;
            writeln!(writer)?;
        }
        Format::Yaml => serde_yaml::to_writer(&mut *writer, sessions)?,
        Format::Markdown => {
            for (i, session) in sessions.iter().enumerate() {
                if i > 0 {
                    writeln!(writer)?;
                }
                write_markdown(writer, session)?;
            }
        }
    }
    Ok(())
}

fn write_single<W: Write>(writer: &mut W, session: &Session, format: Format) -> Result<(), ExportError> {
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(&mut *writer, session)?;
            writeln!(writer)?;
            Ok(())
        }
        Format::Yaml => Ok(serde_yaml::to_writer(&mut *writer, session)?),
        other => write_sessions(writer, std::slice::from_ref(session), other),
    }
}

/// Write one file per session into `target_dir`. Returns the written paths.
pub fn export_to_dir(target_dir: &Path, sessions: &[Session], format: Format) -> Result<Vec<PathBuf>, ExportError> {
    fs::create_dir_all(target_dir)?;
    let mut written = Vec::with_capacity(sessions.len());

    for session in sessions {
        let stem = allocate_filename(&session.id, title_of(session), target_dir, format);
        let path = target_dir.join(format!("{}.{}", stem, format.extension()));
        let mut writer = BufWriter::new(File::create(&path)?);
        write_single(&mut writer, session, format)?;
        writer.flush()?;
        tracing::debug!(session = %short_id(&session.id, 8), path = %path.display(), "exported");
        written.push(path);
    }
    Ok(written)
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

/// Id of the session an existing export belongs to.
fn existing_owner(path: &Path, format: Format) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    match format {
        Format::Markdown => {
            let mut lines = reader.lines();
            if lines.next()?.ok()?.trim() != "---" {
                return None;
            }
            let mut bytes_read = 0usize;
            for line in lines {
                let line = line.ok()?;
                bytes_read += line.len() + 1;
                if bytes_read > 2048 || line.trim() == "---" {
                    break;
                }
                if let Some(rest) = line.strip_prefix("id:") {
                    return Some(rest.trim().trim_matches('\'').trim_matches('"').to_string());
                }
            }
            None
        }
        Format::Jsonl => {
            let mut first = String::new();
            reader.read_line(&mut first).ok()?;
            serde_json::from_str::<IdOnly>(&first).ok().map(|m| m.id)
        }
        Format::Json => serde_json::from_reader::<_, IdOnly>(reader).ok().map(|m| m.id),
        Format::Yaml => serde_yaml::from_reader::<_, IdOnly>(reader).ok().map(|m| m.id),
    }
}

// Pick a file stem for the given id+title pair.
// For each prefix length [8, 12, full id]:
//   - file absent -> claim it
//   - file present and owned by this id -> reuse it
//   - file present and owned by another id -> try a longer prefix
fn allocate_filename(id: &str, title: &str, target_dir: &Path, format: Format) -> String {
    let raw_slug = slug::slugify(title);
    let slug = raw_slug[..raw_slug.len().min(60)]
        .trim_end_matches('-')
        .to_string();
    let stem_for = |prefix: &str| {
        if slug.is_empty() {
            prefix.to_string()
        } else {
            format!("{}_{}", prefix, slug)
        }
    };

    for len in [8usize, 12] {
        let stem = stem_for(short_id(id, len));
        let path = target_dir.join(format!("{}.{}", stem, format.extension()));
        match path.try_exists() {
            Ok(false) => return stem,
            Ok(true) if existing_owner(&path, format).as_deref() == Some(id) => return stem,
            Ok(true) => {}
            Err(_) => return stem,
        }
    }

    // Full-id fallback
    stem_for(id)
}
