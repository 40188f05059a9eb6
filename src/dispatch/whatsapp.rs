//! WhatsApp Cloud API sender.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::DispatchError;
use crate::inbound::ConversationResolver;

use super::{CredentialLookup, MessageDispatcher, RenderedMessage};

/// Posts messages to `{api_base}/{phone_number_id}/messages`.
pub struct WhatsAppDispatcher {
    client: reqwest::Client,
    api_base: String,
    /// WhatsApp Flow id used for form messages.
    form_flow_id: Option<String>,
    credentials: Arc<dyn CredentialLookup>,
    resolver: Arc<dyn ConversationResolver>,
}

impl WhatsAppDispatcher {
    pub fn new(
        config: &ProviderConfig,
        credentials: Arc<dyn CredentialLookup>,
        resolver: Arc<dyn ConversationResolver>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            form_flow_id: config.form_flow_id.clone(),
            credentials,
            resolver,
        }
    }

    /// Build the Cloud API request body for one message.
    pub fn build_payload(&self, to: &str, message: &RenderedMessage) -> Value {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
        });

        match message {
            RenderedMessage::Text { body } => {
                payload["type"] = json!("text");
                payload["text"] = json!({ "preview_url": false, "body": body });
            }
            RenderedMessage::Media {
                media_type,
                url,
                caption,
            } => {
                let kind = serde_json::to_value(media_type)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_else(|| "document".to_string());
                let mut media = json!({ "link": url });
                // Audio messages cannot carry a caption.
                if kind != "audio"
                    && let Some(caption) = caption
                {
                    media["caption"] = json!(caption);
                }
                payload["type"] = json!(kind);
                payload[kind.as_str()] = media;
            }
            RenderedMessage::Buttons { body, buttons } => {
                let buttons: Vec<Value> = buttons
                    .iter()
                    .map(|b| json!({ "type": "reply", "reply": { "id": b.id, "title": b.title } }))
                    .collect();
                payload["type"] = json!("interactive");
                payload["interactive"] = json!({
                    "type": "button",
                    "body": { "text": body },
                    "action": { "buttons": buttons },
                });
            }
            RenderedMessage::List {
                body,
                button_text,
                sections,
            } => {
                let sections: Vec<Value> = sections
                    .iter()
                    .map(|s| {
                        let rows: Vec<Value> = s
                            .rows
                            .iter()
                            .map(|r| {
                                let mut row = json!({ "id": r.id, "title": r.title });
                                if let Some(d) = &r.description {
                                    row["description"] = json!(d);
                                }
                                row
                            })
                            .collect();
                        let mut section = json!({ "rows": rows });
                        if let Some(t) = &s.title {
                            section["title"] = json!(t);
                        }
                        section
                    })
                    .collect();
                payload["type"] = json!("interactive");
                payload["interactive"] = json!({
                    "type": "list",
                    "body": { "text": body },
                    "action": { "button": button_text, "sections": sections },
                });
            }
            RenderedMessage::Form {
                body,
                cta,
                flow_token,
                fields,
            } => {
                let mut parameters = json!({
                    "flow_message_version": "3",
                    "flow_token": flow_token,
                    "flow_cta": cta,
                    "flow_action": "navigate",
                    "flow_action_payload": {
                        "screen": "FORM",
                        "data": { "fields": fields },
                    },
                });
                if let Some(flow_id) = &self.form_flow_id {
                    parameters["flow_id"] = json!(flow_id);
                }
                payload["type"] = json!("interactive");
                payload["interactive"] = json!({
                    "type": "flow",
                    "body": { "text": body },
                    "action": { "name": "flow", "parameters": parameters },
                });
            }
        }

        payload
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl MessageDispatcher for WhatsAppDispatcher {
    async fn send(
        &self,
        conversation_id: &str,
        message: &RenderedMessage,
    ) -> Result<String, DispatchError> {
        let missing = || DispatchError::MissingCredentials {
            conversation_id: conversation_id.to_string(),
        };
        let credentials = self
            .credentials
            .credentials_for(conversation_id)
            .await
            .ok_or_else(missing)?;
        if credentials.phone_number_id.is_empty() {
            return Err(missing());
        }
        let to = self
            .resolver
            .address_for(conversation_id)
            .await
            .ok_or_else(missing)?;

        let payload = self.build_payload(&to, message);
        let url = format!("{}/{}/messages", self.api_base, credentials.phone_number_id);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(credentials.access_token.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(|e| DispatchError::RequestFailed {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(resp.headers());
            warn!(conversation_id, ?retry_after, "WhatsApp rate limited send");
            return Err(DispatchError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| DispatchError::InvalidResponse(e.to_string()))?;
        let delivery_id = body
            .get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::InvalidResponse(format!("no message id in {body}")))?
            .to_string();

        debug!(conversation_id, delivery_id = %delivery_id, "WhatsApp message sent");
        Ok(delivery_id)
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, http::StatusCode, routing::post};
    use secrecy::SecretString;

    use super::*;
    use crate::dispatch::{Credentials, RenderedField, StaticCredentials};
    use crate::flow::model::{Button, MediaType};
    use crate::inbound::WhatsAppConversations;

    fn dispatcher(api_base: &str) -> WhatsAppDispatcher {
        let config = ProviderConfig {
            api_base: api_base.to_string(),
            access_token: SecretString::from("token".to_string()),
            phone_number_id: "PN1".into(),
            form_flow_id: Some("FLOW42".into()),
        };
        WhatsAppDispatcher::new(
            &config,
            Arc::new(StaticCredentials::new(Credentials {
                access_token: config.access_token.clone(),
                phone_number_id: config.phone_number_id.clone(),
            })),
            Arc::new(WhatsAppConversations),
        )
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn builds_button_payload() {
        let d = dispatcher("http://unused");
        let payload = d.build_payload(
            "15550001",
            &RenderedMessage::Buttons {
                body: "Continue?".into(),
                buttons: vec![Button { id: "yes".into(), title: "Yes".into() }],
            },
        );
        assert_eq!(payload["type"], "interactive");
        assert_eq!(payload["interactive"]["type"], "button");
        assert_eq!(payload["interactive"]["action"]["buttons"][0]["reply"]["id"], "yes");
    }

    #[test]
    fn builds_form_payload_with_token_and_fields() {
        let d = dispatcher("http://unused");
        let payload = d.build_payload(
            "15550001",
            &RenderedMessage::Form {
                body: "Sign up".into(),
                cta: "Open".into(),
                flow_token: "tok".into(),
                fields: vec![RenderedField {
                    name: "full_name_ab12cd".into(),
                    label: "Full Name".into(),
                    required: true,
                }],
            },
        );
        let params = &payload["interactive"]["action"]["parameters"];
        assert_eq!(params["flow_token"], "tok");
        assert_eq!(params["flow_id"], "FLOW42");
        assert_eq!(
            params["flow_action_payload"]["data"]["fields"][0]["name"],
            "full_name_ab12cd"
        );
    }

    #[test]
    fn audio_media_drops_caption() {
        let d = dispatcher("http://unused");
        let payload = d.build_payload(
            "1",
            &RenderedMessage::Media {
                media_type: MediaType::Audio,
                url: "https://cdn/x.ogg".into(),
                caption: Some("listen".into()),
            },
        );
        assert_eq!(payload["type"], "audio");
        assert!(payload["audio"].get("caption").is_none());
    }

    #[tokio::test]
    async fn send_returns_provider_message_id() {
        let router = Router::new().route(
            "/PN1/messages",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["to"], "15550001");
                Json(json!({"messages": [{"id": "wamid.out.1"}]}))
            }),
        );
        let base = serve(router).await;

        let id = dispatcher(&base)
            .send("whatsapp:15550001", &RenderedMessage::Text { body: "Hi".into() })
            .await
            .unwrap();
        assert_eq!(id, "wamid.out.1");
    }

    #[tokio::test]
    async fn provider_errors_are_classified() {
        let router = Router::new()
            .route("/PN1/messages", post(|| async { (StatusCode::BAD_REQUEST, "bad") }));
        let base = serve(router).await;
        let err = dispatcher(&base)
            .send("whatsapp:1", &RenderedMessage::Text { body: "Hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { status: 400, .. }));
        assert!(!err.is_transient());

        let err = dispatcher(&base)
            .send("telegram:1", &RenderedMessage::Text { body: "Hi".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MissingCredentials { .. }));
    }
}
