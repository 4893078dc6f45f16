//! Content-based session deduplication.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::normalize::Session;

/// SHA-256 over the ordered (actor, content, timestamp) triples.
///
/// Identity fields (id, workspace, composer id) do not take part. Each field is
/// length-prefixed so adjacent values cannot run into each other.
pub fn content_hash(session: &Session) -> String {
    let mut hasher = Sha256::new();
    for msg in &session.messages {
        for field in [
            msg.actor.heading(),
            msg.content.as_str(),
            &msg.timestamp.to_rfc3339(),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// Keep the first session for each content hash, in input order.
pub fn deduplicate(sessions: Vec<Session>) -> Vec<Session> {
    let before = sessions.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<Session> = sessions
        .into_iter()
        .filter(|s| {
            let fresh = seen.insert(content_hash(s));
            if !fresh {
                tracing::debug!(session = %s.id, "dropping duplicate session");
            }
            fresh
        })
        .collect();
    if kept.len() < before {
        tracing::info!(removed = before - kept.len(), "deduplicated sessions");
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{Role, SessionMessage, SessionMetadata, millis_to_utc};

    fn session(id: &str, workspace: &str, msgs: &[(Role, &str, i64)]) -> Session {
        Session {
            id: id.into(),
            workspace: workspace.into(),
            source: "cursor-global".into(),
            messages: msgs
                .iter()
                .map(|(actor, content, ts)| SessionMessage {
                    timestamp: millis_to_utc(*ts),
                    actor: *actor,
                    content: content.to_string(),
                })
                .collect(),
            metadata: SessionMetadata {
                name: id.into(),
                composer_id: id.into(),
                message_count: msgs.len(),
                created_at: None,
                updated_at: None,
            },
        }
    }

    const BASE: &[(Role, &str, i64)] = &[(Role::User, "hi", 1000), (Role::Assistant, "hello", 2000)];

    #[test]
    fn identical_content_collapses_regardless_of_identity() {
        let out = deduplicate(vec![session("a", "/x", BASE), session("b", "/y", BASE)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "a");
    }

    #[test]
    fn any_field_difference_keeps_both() {
        let variants: [&[(Role, &str, i64)]; 3] = [
            &[(Role::User, "hi", 1000), (Role::User, "hello", 2000)],
            &[(Role::User, "hi", 1000), (Role::Assistant, "hello!", 2000)],
            &[(Role::User, "hi", 1000), (Role::Assistant, "hello", 2001)],
        ];
        for other in variants {
            let out = deduplicate(vec![session("a", "", BASE), session("b", "", other)]);
            assert_eq!(out.len(), 2);
        }
    }

    #[test]
    fn field_boundaries_matter() {
        let a = session("a", "", &[(Role::User, "ab", 0), (Role::User, "c", 0)]);
        let b = session("b", "", &[(Role::User, "a", 0), (Role::User, "bc", 0)]);
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
