/// Typed views over the records Cursor keeps in its `cursorDiskKV` table.
///
/// Nothing here is a full schema. Every field is optional and read through
/// a tolerant deserializer: a field with an unexpected type is treated as
/// absent instead of failing the whole record.
///
/// Key layout:
/// ```text
/// bubbleId:<chatId>:<bubbleId>                 one message
/// composerData:<composerId>                    conversation metadata + header list
/// messageRequestContext:<composerId>:<ctxId>   per-message environment snapshot
/// codeBlockDiff:<chatId>:<diffId>              ignored
/// ```
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::decode::{self, Decoded};

pub const BUBBLE_PREFIX: &str = "bubbleId:";
pub const COMPOSER_PREFIX: &str = "composerData:";
pub const CONTEXT_PREFIX: &str = "messageRequestContext:";

/// Actor code of a user message.
pub const ACTOR_USER: i64 = 1;
/// Actor code of an assistant message.
pub const ACTOR_ASSISTANT: i64 = 2;

// ---------------------------------------------------------------------------
// Tolerant field helpers
// ---------------------------------------------------------------------------

/// Deserialize `T`, yielding `None` when the value has the wrong shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Like [`lenient`] for lists: drops elements that do not fit.
fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// Epoch milliseconds from a number, a numeric string, or an RFC 3339 string.
///
/// Values outside the representable date range count as absent.
pub fn millis_from_value(value: &Value) -> Option<i64> {
    let millis = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }?;
    DateTime::<Utc>::from_timestamp_millis(millis).map(|_| millis)
}

fn lenient_millis<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(millis_from_value(&value))
}

/// Map textual roles onto actor codes.
fn actor_from_role(role: &str) -> Option<i64> {
    match role.to_ascii_lowercase().as_str() {
        "user" | "human" => Some(ACTOR_USER),
        "assistant" | "ai" | "bot" | "model" => Some(ACTOR_ASSISTANT),
        _ => None,
    }
}

/// Text of a `content` field: a string, or a list of `{text}` parts.
fn content_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.as_str().or_else(|| p.get("text").and_then(Value::as_str)))
                .collect();
            (!joined.is_empty()).then(|| joined.join("\n"))
        }
        _ => None,
    }
}

/// Split a namespaced key into its segments after the prefix.
pub fn key_segments<'a>(key: &'a str, prefix: &str) -> Option<Vec<&'a str>> {
    key.strip_prefix(prefix).map(|rest| rest.split(':').collect())
}

// ---------------------------------------------------------------------------
// Bubble
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub content: String,
}

impl CodeBlock {
    pub fn to_markdown(&self) -> String {
        format!(
            "```{}\n{}\n```",
            self.language.as_deref().unwrap_or(""),
            self.content.trim_end_matches('\n')
        )
    }
}

/// One message.
#[derive(Debug, Clone, PartialEq)]
pub struct Bubble {
    pub id: String,
    pub chat_id: String,
    pub text: Option<String>,
    /// Rich-text document, either an object or JSON encoded in a string.
    pub rich_text: Option<Value>,
    pub code_blocks: Vec<CodeBlock>,
    /// Epoch milliseconds, when the record carries one.
    pub timestamp: Option<i64>,
    pub actor: i64,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawCodeBlock {
    #[serde(deserialize_with = "lenient", alias = "code")]
    content: Option<String>,
    #[serde(deserialize_with = "lenient", alias = "language")]
    language_id: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawBubble {
    #[serde(deserialize_with = "lenient")]
    bubble_id: Option<String>,
    #[serde(rename = "type", deserialize_with = "lenient")]
    kind: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    role: Option<String>,
    #[serde(deserialize_with = "lenient")]
    text: Option<String>,
    #[serde(deserialize_with = "lenient")]
    rich_text: Option<Value>,
    #[serde(deserialize_with = "lenient")]
    content: Option<Value>,
    #[serde(deserialize_with = "lenient_vec")]
    code_blocks: Vec<RawCodeBlock>,
    #[serde(deserialize_with = "lenient_millis")]
    timestamp: Option<i64>,
    #[serde(deserialize_with = "lenient_millis")]
    created_at: Option<i64>,
}

impl Bubble {
    /// Build a bubble from a decoded value.
    ///
    /// `fallback_id` is used when the record does not name itself, usually
    /// the last segment of its storage key.
    pub fn from_decoded(decoded: Decoded, fallback_id: &str, chat_id: &str) -> Option<Self> {
        match decoded {
            Decoded::PlainText { text, id } => Some(Self {
                id: id.unwrap_or_else(|| fallback_id.to_string()),
                chat_id: chat_id.to_string(),
                text: Some(text),
                rich_text: None,
                code_blocks: Vec::new(),
                timestamp: None,
                actor: ACTOR_USER,
            }),
            Decoded::Json(value) => Self::from_json(value, fallback_id, chat_id),
        }
    }

    pub fn from_json(value: Value, fallback_id: &str, chat_id: &str) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let raw: RawBubble = serde_json::from_value(value).ok()?;
        let actor = raw
            .kind
            .or_else(|| raw.role.as_deref().and_then(actor_from_role))
            .unwrap_or(ACTOR_USER);
        let text = raw
            .text
            .or_else(|| raw.content.as_ref().and_then(content_text));
        let code_blocks = raw
            .code_blocks
            .into_iter()
            .filter_map(|cb| {
                let content = cb.content.filter(|c| !c.trim().is_empty())?;
                Some(CodeBlock {
                    language: cb.language_id.filter(|l| !l.is_empty()),
                    content,
                })
            })
            .collect();

        Some(Self {
            id: raw
                .bubble_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| fallback_id.to_string()),
            chat_id: chat_id.to_string(),
            text,
            rich_text: raw.rich_text.filter(|v| !v.is_null()),
            code_blocks,
            timestamp: raw.timestamp.or(raw.created_at),
            actor,
        })
    }

    /// Whether a decoded value plausibly is a message rather than some other record.
    pub fn looks_like(value: &Value) -> bool {
        let has_body = ["text", "richText", "content", "codeBlocks"]
            .iter()
            .any(|f| value.get(f).is_some());
        let has_actor = value.get("type").and_then(Value::as_i64).is_some()
            || value.get("role").and_then(Value::as_str).is_some();
        has_body && has_actor
    }
}

// ---------------------------------------------------------------------------
// Composer
// ---------------------------------------------------------------------------

/// One entry of a composer's ordered message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub bubble_id: String,
    /// Actor code; when absent the bubble's own code applies.
    pub actor: Option<i64>,
}

/// One conversation's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Composer {
    pub id: String,
    pub name: String,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub headers: Vec<Header>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawHeader {
    #[serde(deserialize_with = "lenient")]
    bubble_id: Option<String>,
    #[serde(rename = "type", deserialize_with = "lenient")]
    kind: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawComposer {
    #[serde(deserialize_with = "lenient")]
    composer_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(deserialize_with = "lenient_millis")]
    created_at: Option<i64>,
    #[serde(deserialize_with = "lenient_millis")]
    last_updated_at: Option<i64>,
    #[serde(deserialize_with = "lenient_vec")]
    full_conversation_headers_only: Vec<RawHeader>,
}

impl Composer {
    pub fn from_json(value: Value, fallback_id: &str) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let raw: RawComposer = serde_json::from_value(value).ok()?;
        let headers = raw
            .full_conversation_headers_only
            .into_iter()
            .filter_map(|h| {
                let bubble_id = h.bubble_id.filter(|id| !id.is_empty())?;
                Some(Header {
                    bubble_id,
                    actor: h.kind,
                })
            })
            .collect();
        Some(Self {
            id: raw
                .composer_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| fallback_id.to_string()),
            name: raw.name.unwrap_or_default(),
            created_at: raw.created_at,
            updated_at: raw.last_updated_at,
            headers,
        })
    }

    pub fn looks_like(value: &Value) -> bool {
        value.get("fullConversationHeadersOnly").is_some() || value.get("composerId").is_some()
    }
}

// ---------------------------------------------------------------------------
// Message context
// ---------------------------------------------------------------------------

/// Per-message environment snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageContext {
    pub composer_id: String,
    pub bubble_id: String,
    pub git_status: Option<String>,
    pub open_files: Vec<String>,
    /// Root paths of the project layouts recorded with the message.
    pub project_roots: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawContext {
    #[serde(deserialize_with = "lenient")]
    bubble_id: Option<String>,
    #[serde(deserialize_with = "lenient", alias = "gitStatus")]
    git_status_raw: Option<String>,
    #[serde(deserialize_with = "lenient_vec", alias = "recentlyViewedFiles")]
    open_files: Vec<Value>,
    #[serde(deserialize_with = "lenient_vec")]
    project_layouts: Vec<Value>,
}

fn file_path_of(value: &Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get("relativePath").and_then(Value::as_str))
        .or_else(|| value.get("path").and_then(Value::as_str))
        .map(str::to_string)
}

/// Root path of one project layout entry, which may itself be JSON in a string.
fn layout_root(value: &Value) -> Option<String> {
    let obj = match value {
        Value::String(s) => match decode::decode_json_value("projectLayout", s) {
            Some(v) => v,
            None => return (!s.trim().is_empty()).then(|| s.trim().to_string()),
        },
        other => other.clone(),
    };
    obj.get("rootPath")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

impl MessageContext {
    pub fn from_json(value: Value, composer_id: &str, fallback_bubble_id: &str) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        let raw: RawContext = serde_json::from_value(value).ok()?;
        Some(Self {
            composer_id: composer_id.to_string(),
            bubble_id: raw
                .bubble_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| fallback_bubble_id.to_string()),
            git_status: raw.git_status_raw.filter(|s| !s.trim().is_empty()),
            open_files: raw.open_files.iter().filter_map(file_path_of).collect(),
            project_roots: raw.project_layouts.iter().filter_map(layout_root).collect(),
        })
    }
}
