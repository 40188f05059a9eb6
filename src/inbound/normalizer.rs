//! Event Normalizer: provider payloads to canonical inbound events.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::NormalizeError;
use crate::session::model::Session;

use super::event::{EventPayload, InboundEvent};
use super::whatsapp;

/// Maps provider addresses to internal conversation ids and back.
#[async_trait]
pub trait ConversationResolver: Send + Sync {
    /// Conversation id for a sender address, or `None` to drop the message.
    async fn conversation_for(&self, provider_address: &str) -> Option<String>;

    /// Provider address to deliver to for a conversation.
    async fn address_for(&self, conversation_id: &str) -> Option<String>;
}

/// Default resolver: `whatsapp:<digits>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhatsAppConversations;

const WHATSAPP_PREFIX: &str = "whatsapp:";

#[async_trait]
impl ConversationResolver for WhatsAppConversations {
    async fn conversation_for(&self, provider_address: &str) -> Option<String> {
        whatsapp::normalize_phone(provider_address).map(|d| format!("{WHATSAPP_PREFIX}{d}"))
    }

    async fn address_for(&self, conversation_id: &str) -> Option<String> {
        conversation_id
            .strip_prefix(WHATSAPP_PREFIX)
            .and_then(whatsapp::normalize_phone)
    }
}

/// Turns webhook bodies into addressed events.
pub struct Normalizer {
    resolver: Arc<dyn ConversationResolver>,
}

impl Normalizer {
    pub fn new(resolver: Arc<dyn ConversationResolver>) -> Self {
        Self { resolver }
    }

    pub async fn normalize(&self, body: &Value) -> Result<Vec<InboundEvent>, NormalizeError> {
        let messages = whatsapp::parse_webhook(body)?;
        let mut events = Vec::with_capacity(messages.len());

        for message in messages {
            let Some(conversation_id) = self.resolver.conversation_for(&message.from).await else {
                warn!(message_id = %message.id, "No conversation for sender, dropping message");
                continue;
            };
            events.push(InboundEvent {
                conversation_id,
                provider_message_id: message.id,
                payload: message.payload,
            });
        }

        debug!(count = events.len(), "Normalized webhook payload");
        Ok(events)
    }

    /// Parse raw bytes, as received by the HTTP handler.
    pub async fn normalize_bytes(&self, body: &[u8]) -> Result<Vec<InboundEvent>, NormalizeError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| NormalizeError::Malformed(format!("invalid JSON: {e}")))?;
        self.normalize(&value).await
    }
}

/// How a form reply relates to the conversation's active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormTokenCheck {
    /// Not a form reply.
    NotForm,
    Matched,
    Rejected(String),
}

/// Form replies must carry the token of the conversation's active session.
pub fn check_form_token(event: &InboundEvent, active: Option<&Session>) -> FormTokenCheck {
    let EventPayload::FormReply { token, .. } = &event.payload else {
        return FormTokenCheck::NotForm;
    };
    match active {
        Some(session) if session.token == *token => FormTokenCheck::Matched,
        Some(_) => FormTokenCheck::Rejected("form token does not match the active session".into()),
        None => FormTokenCheck::Rejected("no active session for form reply".into()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn resolves_sender_to_conversation() {
        let normalizer = Normalizer::new(Arc::new(WhatsAppConversations));
        let body = json!({"entry": [{"changes": [{"value": {"messages": [
            {"from": "+351 912 345 678", "id": "wamid.1", "type": "text", "text": {"body": "hi"}}
        ]}}]}]});

        let events = normalizer.normalize(&body).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].conversation_id, "whatsapp:351912345678");
        assert_eq!(events[0].provider_message_id, "wamid.1");
    }

    #[tokio::test]
    async fn invalid_json_bytes_are_malformed() {
        let normalizer = Normalizer::new(Arc::new(WhatsAppConversations));
        let err = normalizer.normalize_bytes(b"{not json").await.unwrap_err();
        assert!(matches!(err, NormalizeError::Malformed(_)));
    }

    #[tokio::test]
    async fn default_resolver_round_trips() {
        let resolver = WhatsAppConversations;
        let id = resolver.conversation_for("15550001").await.unwrap();
        assert_eq!(resolver.address_for(&id).await.as_deref(), Some("15550001"));
        assert_eq!(resolver.address_for("telegram:42").await, None);
    }

    #[test]
    fn form_token_must_match_active_session() {
        let session = Session::new("whatsapp:1", Uuid::new_v4(), 1);
        let form = |token: &str| InboundEvent {
            conversation_id: "whatsapp:1".into(),
            provider_message_id: "wamid.f".into(),
            payload: EventPayload::FormReply {
                token: token.into(),
                fields: serde_json::Map::new(),
            },
        };

        assert_eq!(
            check_form_token(&form(&session.token), Some(&session)),
            FormTokenCheck::Matched
        );
        assert!(matches!(
            check_form_token(&form("stale"), Some(&session)),
            FormTokenCheck::Rejected(_)
        ));
        assert!(matches!(check_form_token(&form("x"), None), FormTokenCheck::Rejected(_)));
        assert_eq!(
            check_form_token(&InboundEvent::text("whatsapp:1", "m", "hi"), Some(&session)),
            FormTokenCheck::NotForm
        );
    }
}
