//! The canonical session shape handed to exporters and the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReconstructionError;
use crate::reconstruct::ReconstructedConversation;
use crate::records::ACTOR_ASSISTANT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Unknown actor codes are treated as the user.
    pub fn from_actor(actor: i64) -> Self {
        if actor == ACTOR_ASSISTANT {
            Role::Assistant
        } else {
            Role::User
        }
    }

    pub fn heading(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub timestamp: DateTime<Utc>,
    pub actor: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub name: String,
    pub composer_id: String,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One normalized conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub workspace: String,
    pub source: String,
    pub messages: Vec<SessionMessage>,
    pub metadata: SessionMetadata,
}

impl Session {
    /// Most recent activity, used to order listings.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .updated_at
            .or_else(|| self.messages.last().map(|m| m.timestamp))
            .or(self.metadata.created_at)
    }
}

/// Out-of-range values clamp to the nearest representable instant.
pub fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(if millis < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// Turn a reconstructed conversation into a [`Session`].
///
/// `workspace` and `source` are stored verbatim.
pub fn normalize(
    conversation: Option<&ReconstructedConversation>,
    workspace: &str,
    source: &str,
) -> Result<Session, ReconstructionError> {
    let conv = conversation.ok_or(ReconstructionError::MissingConversation)?;
    if conv.messages.is_empty() {
        return Err(ReconstructionError::Empty {
            composer_id: conv.composer_id.clone(),
        });
    }

    let messages: Vec<SessionMessage> = conv
        .messages
        .iter()
        .map(|m| SessionMessage {
            timestamp: millis_to_utc(m.timestamp),
            actor: Role::from_actor(m.actor),
            content: m.text.clone(),
        })
        .collect();

    Ok(Session {
        id: conv.composer_id.clone(),
        workspace: workspace.to_string(),
        source: source.to_string(),
        metadata: SessionMetadata {
            name: conv.name.clone(),
            composer_id: conv.composer_id.clone(),
            message_count: messages.len(),
            created_at: conv.created_at.map(millis_to_utc),
            updated_at: conv.updated_at.map(millis_to_utc),
        },
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruct::ResolvedMessage;
    use serde_json::json;

    fn conversation(messages: Vec<ResolvedMessage>) -> ReconstructedConversation {
        ReconstructedConversation {
            composer_id: "comp-1".into(),
            name: "Fix the build".into(),
            created_at: Some(1_000),
            updated_at: Some(5_000),
            messages,
        }
    }

    fn message(text: &str, ts: i64, actor: i64) -> ResolvedMessage {
        ResolvedMessage {
            bubble_id: "b".into(),
            text: text.into(),
            timestamp: ts,
            actor,
            context: None,
        }
    }

    #[test]
    fn out_of_range_millis_clamp_in_order() {
        assert_eq!(millis_to_utc(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(millis_to_utc(i64::MIN), DateTime::<Utc>::MIN_UTC);
        assert!(millis_to_utc(5_000) < millis_to_utc(i64::MAX));
    }

    #[test]
    fn maps_roles_and_timestamps() {
        let conv = conversation(vec![message("hi", 1000, 1), message("hello", 2000, 2), message("?", 3000, 7)]);
        let session = normalize(Some(&conv), "/work/app", "cursor-global").unwrap();

        assert_eq!(session.id, "comp-1");
        assert_eq!(session.workspace, "/work/app");
        assert_eq!(session.source, "cursor-global");
        assert_eq!(session.metadata.message_count, 3);
        let roles: Vec<Role> = session.messages.iter().map(|m| m.actor).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);

        let first = serde_json::to_value(&session.messages[0]).unwrap();
        assert_eq!(
            first,
            json!({"timestamp": "1970-01-01T00:00:01Z", "actor": "user", "content": "hi"})
        );
    }

    #[test]
    fn rejects_missing_and_empty() {
        assert!(matches!(
            normalize(None, "", "x"),
            Err(ReconstructionError::MissingConversation)
        ));
        assert!(matches!(
            normalize(Some(&conversation(Vec::new())), "", "x"),
            Err(ReconstructionError::Empty { composer_id }) if composer_id == "comp-1"
        ));
    }

    #[test]
    fn session_survives_json() {
        let session = normalize(Some(&conversation(vec![message("hi", 1000, 1)])), "", "s").unwrap();
        let text = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&text).unwrap();
        assert_eq!(back, session);
        assert_eq!(back.last_activity(), Some(millis_to_utc(5_000)));
    }
}
