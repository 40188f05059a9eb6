//! Message Dispatcher: outbound send boundary.
//!
//! The interpreter only sees [`MessageDispatcher`]. Concrete senders live in
//! submodules; [`RetryingDispatcher`] wraps any of them with bounded retries.

pub mod retry;
pub mod whatsapp;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::DispatchError;
use crate::flow::model::{Button, ListSection, MediaType};

pub use retry::RetryingDispatcher;
pub use whatsapp::WhatsAppDispatcher;

/// A form field as sent to the provider: generated name plus display label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedField {
    pub name: String,
    pub label: String,
    pub required: bool,
}

/// Fully rendered outbound message: variables substituted, form fields named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderedMessage {
    Text {
        body: String,
    },
    Media {
        media_type: MediaType,
        url: String,
        caption: Option<String>,
    },
    Buttons {
        body: String,
        buttons: Vec<Button>,
    },
    List {
        body: String,
        button_text: String,
        sections: Vec<ListSection>,
    },
    Form {
        body: String,
        cta: String,
        /// Session token the provider echoes back in the reply.
        flow_token: String,
        fields: Vec<RenderedField>,
    },
}

impl RenderedMessage {
    /// Short human-readable summary for logs.
    pub fn preview(&self) -> &str {
        match self {
            Self::Text { body }
            | Self::Buttons { body, .. }
            | Self::List { body, .. }
            | Self::Form { body, .. } => body,
            Self::Media { url, .. } => url,
        }
    }
}

/// Sends rendered messages to a conversation. Returns the provider delivery id.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn send(
        &self,
        conversation_id: &str,
        message: &RenderedMessage,
    ) -> Result<String, DispatchError>;
}

/// Transport credentials for one account.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: SecretString,
    pub phone_number_id: String,
}

/// Per-account credential source.
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    async fn credentials_for(&self, conversation_id: &str) -> Option<Credentials>;
}

/// One set of credentials for every conversation.
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }

    pub fn from_provider(config: &ProviderConfig) -> Self {
        Self(Credentials {
            access_token: config.access_token.clone(),
            phone_number_id: config.phone_number_id.clone(),
        })
    }
}

#[async_trait]
impl CredentialLookup for StaticCredentials {
    async fn credentials_for(&self, _conversation_id: &str) -> Option<Credentials> {
        Some(self.0.clone())
    }
}

/// Dry-run dispatcher: logs and reports success.
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl MessageDispatcher for LogDispatcher {
    async fn send(
        &self,
        conversation_id: &str,
        message: &RenderedMessage,
    ) -> Result<String, DispatchError> {
        let delivery_id = format!("dry-run:{}", Uuid::new_v4());
        info!(
            conversation_id,
            delivery_id = %delivery_id,
            preview = message.preview(),
            "Dry-run send"
        );
        Ok(delivery_id)
    }
}
