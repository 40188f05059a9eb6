//! HTTP surface: provider webhook, health and the builder/admin API.

pub mod admin;
pub mod webhook;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::config::WebhookConfig;
use crate::engine::Engine;
use crate::error::{DatabaseError, Error, FlowError, NormalizeError};
use crate::inbound::Normalizer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub normalizer: Arc<Normalizer>,
    pub webhook: Arc<WebhookConfig>,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(webhook::webhook_routes(state.clone()))
        .merge(admin::admin_routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "convo-flow"
    }))
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Engine error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Flow(e) => match e {
                FlowError::NotFound { .. }
                | FlowError::VersionNotFound { .. }
                | FlowError::NodeNotFound { .. }
                | FlowError::EdgeNotFound { .. } => StatusCode::NOT_FOUND,
                FlowError::NotPublished { .. }
                | FlowError::Disabled { .. }
                | FlowError::DuplicateNode { .. }
                | FlowError::SessionConflict { .. } => StatusCode::CONFLICT,
            },
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Normalize(NormalizeError::Malformed(_)) => StatusCode::BAD_REQUEST,
            Error::Normalize(NormalizeError::BadSignature) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = match &self.0 {
            Error::Validation(v) => json!({
                "error": "graph failed validation",
                "violations": v.violations.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }),
            e => json!({ "error": e.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use super::*;
    use crate::config::EngineConfig;
    use crate::dispatch::LogDispatcher;
    use crate::inbound::WhatsAppConversations;
    use crate::store::LibSqlBackend;

    async fn test_router(app_secret: Option<&str>) -> Router {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let engine = Arc::new(Engine::new(db, Arc::new(LogDispatcher), EngineConfig::default()));
        router(AppState {
            engine,
            normalizer: Arc::new(Normalizer::new(Arc::new(WhatsAppConversations))),
            webhook: Arc::new(WebhookConfig {
                app_secret: app_secret.map(|s| SecretString::from(s.to_string())),
                verify_token: None,
            }),
        })
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = test_router(None).await;
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_without_signature_is_unauthorized_when_secret_set() {
        let app = test_router(Some("secret")).await;
        let resp = app
            .oneshot(
                Request::post("/webhook")
                    .body(Body::from(r#"{"entry": []}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_webhook_batch_is_accepted_without_secret() {
        let app = test_router(None).await;
        let resp = app
            .oneshot(
                Request::post("/webhook")
                    .body(Body::from(r#"{"entry": []}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn errors_map_to_statuses() {
        let id = uuid::Uuid::nil();
        let status = |e: Error| ApiError(e).status();

        assert_eq!(status(FlowError::NotFound { id }.into()), StatusCode::NOT_FOUND);
        assert_eq!(status(FlowError::Disabled { id }.into()), StatusCode::CONFLICT);
        assert_eq!(
            status(crate::error::ValidationError { violations: vec![] }.into()),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status(NormalizeError::Malformed("x".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(DatabaseError::Query("boom".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
