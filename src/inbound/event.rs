//! Canonical inbound events and their persisted intake records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix of provider message ids synthesized for expired continuations.
pub const TIMEOUT_ID_PREFIX: &str = "timeout:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    ButtonReply,
    ListReply,
    FormReply,
    Timeout,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::ButtonReply => "button_reply",
            Self::ListReply => "list_reply",
            Self::FormReply => "form_reply",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "button_reply" => Ok(Self::ButtonReply),
            "list_reply" => Ok(Self::ListReply),
            "form_reply" => Ok(Self::FormReply),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Kind-specific event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Text {
        body: String,
    },
    ButtonReply {
        id: String,
        title: String,
    },
    ListReply {
        id: String,
        title: String,
        #[serde(default)]
        description: Option<String>,
    },
    FormReply {
        /// Session token echoed back by the provider.
        token: String,
        /// Generated field name → submitted value.
        fields: serde_json::Map<String, serde_json::Value>,
    },
    Timeout {
        continuation_id: Uuid,
        session_id: Uuid,
        node_id: String,
    },
}

/// A provider-agnostic event addressed to one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub conversation_id: String,
    /// Provider message id, or `timeout:<continuation id>` for synthetic events.
    pub provider_message_id: String,
    pub payload: EventPayload,
}

impl InboundEvent {
    pub fn text(conversation_id: &str, provider_message_id: &str, body: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            provider_message_id: provider_message_id.to_string(),
            payload: EventPayload::Text {
                body: body.to_string(),
            },
        }
    }

    pub fn timeout(
        conversation_id: &str,
        continuation_id: Uuid,
        session_id: Uuid,
        node_id: &str,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            provider_message_id: format!("{TIMEOUT_ID_PREFIX}{continuation_id}"),
            payload: EventPayload::Timeout {
                continuation_id,
                session_id,
                node_id: node_id.to_string(),
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Text { .. } => EventKind::Text,
            EventPayload::ButtonReply { .. } => EventKind::ButtonReply,
            EventPayload::ListReply { .. } => EventKind::ListReply,
            EventPayload::FormReply { .. } => EventKind::FormReply,
            EventPayload::Timeout { .. } => EventKind::Timeout,
        }
    }

    /// The human-visible reply value: text body or the chosen option title.
    pub fn reply_text(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Text { body } => Some(body),
            EventPayload::ButtonReply { title, .. } | EventPayload::ListReply { title, .. } => {
                Some(title)
            }
            EventPayload::FormReply { .. } | EventPayload::Timeout { .. } => None,
        }
    }

    /// The edge discriminator an interactive reply selects.
    pub fn discriminator(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::ButtonReply { id, .. } | EventPayload::ListReply { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.payload, EventPayload::Timeout { .. })
    }
}

/// Processing state of a recorded inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// Recorded, not yet handled by the interpreter.
    Pending,
    Processed,
    /// Refused before reaching the interpreter (e.g. form token mismatch).
    Rejected,
    /// Handling raised an error; the message is in `error`.
    Failed,
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for EventOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event outcome: {other}")),
        }
    }
}

/// Durable intake record, keyed by (conversation id, provider message id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEventRecord {
    pub event: InboundEvent,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub outcome: EventOutcome,
    pub error: Option<String>,
    /// Form field names that had no mapping for the session's flow version.
    pub unmapped: Vec<String>,
}

impl InboundEventRecord {
    pub fn pending(event: InboundEvent) -> Self {
        Self {
            event,
            received_at: Utc::now(),
            processed_at: None,
            outcome: EventOutcome::Pending,
            error: None,
            unmapped: Vec::new(),
        }
    }
}

/// Result of offering an event to intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeOutcome {
    Accepted,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_events_use_continuation_id() {
        let cid = Uuid::new_v4();
        let event = InboundEvent::timeout("whatsapp:1", cid, Uuid::new_v4(), "wait");
        assert_eq!(event.provider_message_id, format!("timeout:{cid}"));
        assert_eq!(event.kind(), EventKind::Timeout);
        assert!(event.reply_text().is_none());
    }

    #[test]
    fn interactive_reply_exposes_title_and_id() {
        let event = InboundEvent {
            conversation_id: "whatsapp:1".into(),
            provider_message_id: "wamid.1".into(),
            payload: EventPayload::ButtonReply {
                id: "btn_yes".into(),
                title: "Yes".into(),
            },
        };
        assert_eq!(event.reply_text(), Some("Yes"));
        assert_eq!(event.discriminator(), Some("btn_yes"));
    }

    #[test]
    fn payload_json_is_tagged_by_kind() {
        let payload = EventPayload::Text { body: "hi".into() };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "text");
        let back: EventPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }
}
