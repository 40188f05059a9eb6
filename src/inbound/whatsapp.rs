//! WhatsApp Cloud API webhook shapes.
//!
//! Payloads look like `entry[].changes[].value.messages[]`. Status updates
//! live next to `messages` under `value.statuses` and are ignored here.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::NormalizeError;

use super::event::EventPayload;

/// A provider message before conversation resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderMessage {
    /// Sender address (phone number).
    pub from: String,
    /// Provider message id (`wamid...`).
    pub id: String,
    pub payload: EventPayload,
}

/// Extract every supported message from a webhook body.
///
/// Unsupported message types and non-message changes yield nothing; a body
/// without an `entry` array is malformed.
pub fn parse_webhook(body: &Value) -> Result<Vec<ProviderMessage>, NormalizeError> {
    let entries = body
        .get("entry")
        .and_then(Value::as_array)
        .ok_or_else(|| NormalizeError::Malformed("missing entry array".into()))?;

    let mut out = Vec::new();
    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for change in changes {
            let Some(messages) = change
                .get("value")
                .and_then(|v| v.get("messages"))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for message in messages {
                if let Some(parsed) = parse_message(message) {
                    out.push(parsed);
                }
            }
        }
    }
    Ok(out)
}

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn parse_message(message: &Value) -> Option<ProviderMessage> {
    let (Some(from), Some(id)) = (str_at(message, "from"), str_at(message, "id")) else {
        warn!("Skipping webhook message without sender or id");
        return None;
    };
    let msg_type = str_at(message, "type").unwrap_or("").to_ascii_lowercase();

    let payload = match msg_type.as_str() {
        "text" => EventPayload::Text {
            body: message
                .get("text")
                .and_then(|t| str_at(t, "body"))
                .unwrap_or("")
                .to_string(),
        },
        // Template quick-reply buttons.
        "button" => {
            let button = message.get("button")?;
            let title = str_at(button, "text").unwrap_or("").to_string();
            EventPayload::ButtonReply {
                id: str_at(button, "payload").unwrap_or(&title).to_string(),
                title,
            }
        }
        "interactive" => parse_interactive(message.get("interactive")?)?,
        other => {
            debug!(message_id = id, msg_type = other, "Ignoring unsupported message type");
            return None;
        }
    };

    Some(ProviderMessage {
        from: from.to_string(),
        id: id.to_string(),
        payload,
    })
}

fn parse_interactive(interactive: &Value) -> Option<EventPayload> {
    match str_at(interactive, "type")? {
        "button_reply" => {
            let reply = interactive.get("button_reply")?;
            Some(EventPayload::ButtonReply {
                id: str_at(reply, "id")?.to_string(),
                title: str_at(reply, "title").unwrap_or("").to_string(),
            })
        }
        "list_reply" => {
            let reply = interactive.get("list_reply")?;
            Some(EventPayload::ListReply {
                id: str_at(reply, "id")?.to_string(),
                title: str_at(reply, "title").unwrap_or("").to_string(),
                description: str_at(reply, "description").map(String::from),
            })
        }
        kind @ ("nfm_reply" | "form_reply") => {
            let reply = interactive.get(kind)?;
            parse_form_reply(reply)
        }
        other => {
            debug!(interactive_type = other, "Ignoring unsupported interactive reply");
            None
        }
    }
}

/// `response_json` is a stringified object holding `flow_token` plus the
/// submitted generated-name → value pairs.
fn parse_form_reply(reply: &Value) -> Option<EventPayload> {
    let response = match reply.get("response_json")? {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Form reply response_json is not valid JSON");
                return None;
            }
        },
        inline @ Value::Object(_) => inline.clone(),
        _ => return None,
    };

    let Value::Object(mut fields) = response else {
        return None;
    };
    let token = match fields.remove("flow_token") {
        Some(Value::String(t)) => t,
        _ => {
            warn!("Form reply without flow_token");
            return None;
        }
    };

    Some(EventPayload::FormReply { token, fields })
}

/// Check `X-Hub-Signature-256` (`sha256=<hex hmac>`) against the raw body.
pub fn verify_signature(
    app_secret: &SecretString,
    signature_header: Option<&str>,
    body: &[u8],
) -> Result<(), NormalizeError> {
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return Err(NormalizeError::BadSignature);
    }
    let expected = hex::decode(signature).map_err(|_| NormalizeError::BadSignature)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(app_secret.expose_secret().as_bytes())
        .map_err(|_| NormalizeError::BadSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| NormalizeError::BadSignature)
}

/// Digits of a phone number, or `None` if there are none.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}
