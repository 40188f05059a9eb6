//! Provider webhook endpoints.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::{ApiError, AppState};
use crate::inbound::IntakeOutcome;
use crate::inbound::whatsapp::verify_signature;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub fn webhook_routes(state: AppState) -> Router {
    Router::new()
        .route("/webhook", get(verify_subscription).post(receive))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct Handshake {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /webhook: echo the challenge when the verify token matches.
async fn verify_subscription(
    State(state): State<AppState>,
    Query(handshake): Query<Handshake>,
) -> impl IntoResponse {
    let expected = state.webhook.verify_token.as_deref();
    match (handshake.mode.as_deref(), handshake.verify_token.as_deref(), expected) {
        (Some("subscribe"), Some(given), Some(expected)) if given == expected => {
            info!("Webhook subscription verified");
            (StatusCode::OK, handshake.challenge.unwrap_or_default())
        }
        _ => {
            warn!("Webhook subscription handshake refused");
            (StatusCode::FORBIDDEN, String::new())
        }
    }
}

/// POST /webhook: verify, normalize and durably record, then process in the
/// background. Downstream failures never change the response.
async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(secret) = &state.webhook.app_secret {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if let Err(e) = verify_signature(secret, header, &body) {
            warn!("Webhook signature rejected");
            return Err(e.into());
        }
    }

    let events = state.normalizer.normalize_bytes(&body).await?;

    let mut accepted = Vec::new();
    let mut duplicates = 0usize;
    for event in events {
        match state.engine.record(&event).await? {
            IntakeOutcome::Accepted => accepted.push(event),
            IntakeOutcome::Duplicate => duplicates += 1,
        }
    }

    let count = accepted.len();
    if !accepted.is_empty() {
        let engine = state.engine.clone();
        tokio::spawn(async move {
            for event in accepted {
                if let Err(e) = engine.process(&event).await {
                    error!(
                        conversation_id = %event.conversation_id,
                        message_id = %event.provider_message_id,
                        error = %e,
                        "Background processing failed"
                    );
                }
            }
        });
    }

    Ok((
        StatusCode::OK,
        Json(json!({ "accepted": count, "duplicates": duplicates })),
    ))
}
