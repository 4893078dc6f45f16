//! Joining bubbles, composers and message contexts into ordered conversations.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::decode::is_readable_text;
use crate::records::{Bubble, Composer, MessageContext};
use crate::richtext::extract_rich_text;

/// Placeholder some stores write for messages without content.
pub const NO_TEXT_PLACEHOLDER: &str = "no extractable text content";

/// Shortest string the broad field scan accepts.
const MIN_FIELD_CHARS: usize = 10;

static TEXT_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""text"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("static regex")
});

static ANY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#""(?:content|value|message|text|thinking|tool|name|description)"\s*:\s*"((?:[^"\\]|\\.)*)""#,
    )
    .expect("static regex")
});

/// One message resolved from a header and its bubble.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMessage {
    pub bubble_id: String,
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub actor: i64,
    pub context: Option<MessageContext>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedConversation {
    pub composer_id: String,
    pub name: String,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    pub messages: Vec<ResolvedMessage>,
}

/// Undo JSON string escaping on a captured literal body.
fn unescape(body: &str) -> Option<String> {
    serde_json::from_str::<String>(&format!("\"{body}\"")).ok()
}

/// Concatenate every `"text": "..."` literal in `raw`, without parsing it.
pub fn scan_text_fields(raw: &str) -> Option<String> {
    let joined: String = TEXT_FIELD
        .captures_iter(raw)
        .filter_map(|c| unescape(c.get(1)?.as_str()))
        .collect();
    let joined = joined.trim();
    (!joined.is_empty()).then(|| joined.to_string())
}

/// Collect longer string literals from any of the usual content-bearing fields.
pub fn scan_content_fields(raw: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for caps in ANY_FIELD.captures_iter(raw) {
        let Some(text) = caps.get(1).and_then(|m| unescape(m.as_str())) else {
            continue;
        };
        let text = text.trim();
        if text.chars().count() < MIN_FIELD_CHARS || !is_readable_text(text) {
            continue;
        }
        if parts.last().map(String::as_str) != Some(text) {
            parts.push(text.to_string());
        }
    }
    (!parts.is_empty()).then(|| parts.join("\n\n"))
}

/// Text of one message.
///
/// Uses the plain `text` field when present, else the rich-text document,
/// else the two permissive scans over the raw rich text. Code blocks are
/// appended as fenced Markdown whichever tier produced the text.
pub fn message_text(bubble: &Bubble) -> String {
    let base = bubble
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .or_else(|| {
            let rich = bubble.rich_text.as_ref()?;
            extract_rich_text(rich).or_else(|| {
                let raw = match rich {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                scan_text_fields(&raw).or_else(|| scan_content_fields(&raw))
            })
        })
        .unwrap_or_default();

    let mut parts: Vec<String> = Vec::with_capacity(1 + bubble.code_blocks.len());
    if !base.is_empty() {
        parts.push(base);
    }
    parts.extend(bubble.code_blocks.iter().map(|cb| cb.to_markdown()));
    parts.join("\n\n")
}

/// Rebuild one composer's conversation.
///
/// Headers whose bubble is missing are skipped, as are messages without
/// text. The result is stably sorted by timestamp, so equal timestamps keep
/// header order.
pub fn reconstruct(
    composer: &Composer,
    bubbles: &HashMap<String, Bubble>,
    contexts: &[MessageContext],
) -> ReconstructedConversation {
    let mut messages = Vec::with_capacity(composer.headers.len());

    for header in &composer.headers {
        let Some(bubble) = bubbles.get(&header.bubble_id) else {
            tracing::trace!(composer = %composer.id, bubble = %header.bubble_id, "bubble not found");
            continue;
        };
        let text = message_text(bubble);
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == NO_TEXT_PLACEHOLDER {
            continue;
        }
        messages.push(ResolvedMessage {
            bubble_id: header.bubble_id.clone(),
            text,
            timestamp: bubble.timestamp.or(composer.created_at).unwrap_or(0),
            actor: header.actor.unwrap_or(bubble.actor),
            context: contexts
                .iter()
                .find(|c| c.bubble_id == header.bubble_id)
                .cloned(),
        });
    }

    messages.sort_by_key(|m| m.timestamp);

    ReconstructedConversation {
        composer_id: composer.id.clone(),
        name: composer.name.clone(),
        created_at: composer.created_at,
        updated_at: composer.updated_at,
        messages,
    }
}

/// Rebuild every composer, dropping the ones that end up empty.
pub fn reconstruct_all(
    composers: &[Composer],
    bubbles: &HashMap<String, Bubble>,
    contexts: &HashMap<String, Vec<MessageContext>>,
) -> Vec<ReconstructedConversation> {
    composers
        .iter()
        .map(|c| {
            let ctx = contexts.get(&c.id).map(Vec::as_slice).unwrap_or_default();
            reconstruct(c, bubbles, ctx)
        })
        .filter(|conv| {
            if conv.messages.is_empty() {
                tracing::debug!(composer = %conv.composer_id, "no recoverable messages");
                false
            } else {
                true
            }
        })
        .collect()
}
