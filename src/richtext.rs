//! Flattening of the rich-text document stored on a message.
//!
//! The document is an editor state tree: `{"root": {"children": [...]}}`
//! whose nodes carry a `type` and either `text` or further `children`.
//! Redacted reasoning nodes hold opaque payloads that are run back through
//! the decoder.

use serde_json::Value;

use crate::decode::{self, ReasoningOutcome};

/// Node types rendered inline with their neighbours; everything else is a block.
const INLINE_TYPES: &[&str] = &["text", "linebreak", "tab", "mention", "link", "autolink", "hashtag"];

/// Node types wrapped in a block labeled with the node type.
const LABELED_TYPES: &[&str] = &["thinking", "tool", "tool_call", "function_call"];

/// Flatten a rich-text value to plain text.
///
/// Accepts the document as an object or as JSON encoded in a string. Tries a
/// `root` document, a bare element with `children`, a single node, then an
/// array of nodes. Returns `None` when no shape matches or nothing readable
/// comes out.
pub fn extract_rich_text(value: &Value) -> Option<String> {
    let owned;
    let doc = match value {
        Value::String(s) => {
            owned = decode::decode_json_value("richText", s)?;
            &owned
        }
        other => other,
    };

    let text = if let Some(root) = doc.get("root").filter(|r| r.get("children").is_some()) {
        flatten_node(root)
    } else if doc.get("children").is_some_and(Value::is_array) {
        flatten_node(doc)
    } else if doc.get("type").is_some() {
        flatten_node(doc)
    } else if let Some(nodes) = doc.as_array() {
        join_parts(nodes)
    } else {
        return None;
    };

    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn node_type(node: &Value) -> &str {
    node.get("type").and_then(Value::as_str).unwrap_or_default()
}

fn is_inline(node: &Value) -> bool {
    INLINE_TYPES.contains(&node_type(node))
}

fn children_of(node: &Value) -> &[Value] {
    node.get("children")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Concatenate sibling nodes; blocks are separated by a blank line.
fn join_parts(nodes: &[Value]) -> String {
    let mut out = String::new();
    let mut prev_inline = true;
    for node in nodes {
        let part = flatten_node(node);
        if part.is_empty() {
            continue;
        }
        let inline = is_inline(node);
        if !out.is_empty() && !(inline && prev_inline) {
            out.push_str("\n\n");
        }
        out.push_str(&part);
        prev_inline = inline;
    }
    out
}

fn fenced(label: &str, body: &str) -> String {
    format!("```{label}\n{}\n```", body.trim_end_matches('\n'))
}

/// String fields a node may carry its own text in.
fn own_text(node: &Value) -> String {
    ["text", "content", "value"]
        .iter()
        .filter_map(|f| node.get(*f).and_then(Value::as_str))
        .collect::<Vec<_>>()
        .concat()
}

fn flatten_node(node: &Value) -> String {
    match node_type(node) {
        "text" => node
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        "linebreak" => "\n".to_string(),
        "tab" => "\t".to_string(),
        "code" => {
            let language = node
                .get("language")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let body = join_parts(children_of(node));
            if body.trim().is_empty() {
                String::new()
            } else {
                fenced(language, &body)
            }
        }
        kind if LABELED_TYPES.contains(&kind) => {
            let body = join_parts(children_of(node));
            let body = if body.trim().is_empty() {
                own_text(node)
            } else {
                body
            };
            if body.trim().is_empty() {
                String::new()
            } else {
                fenced(kind, &body)
            }
        }
        "redacted_reasoning" => flatten_reasoning(node),
        _ => {
            let own = own_text(node);
            let children = join_parts(children_of(node));
            match (own.is_empty(), children.is_empty()) {
                (true, _) => children,
                (false, true) => own,
                (false, false) => format!("{own}\n\n{children}"),
            }
        }
    }
}

fn flatten_reasoning(node: &Value) -> String {
    let from_children = join_parts(children_of(node));
    let payload = if from_children.trim().is_empty() {
        ["data", "content", "value"]
            .iter()
            .find_map(|f| node.get(*f).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string()
    } else {
        from_children
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return String::new();
    }

    let outcome = decode::decode_reasoning(payload);
    let label = format!("redacted_reasoning ({})", outcome.describe());
    match &outcome {
        ReasoningOutcome::Text(text) => fenced(&label, text),
        _ => fenced(&label, payload),
    }
}
