use std::sync::Arc;

use anyhow::Context;

use convo_flow::config::{EngineConfig, ProviderConfig, WebhookConfig};
use convo_flow::dispatch::{
    LogDispatcher, MessageDispatcher, RetryingDispatcher, StaticCredentials, WhatsAppDispatcher,
};
use convo_flow::engine::{self, Engine};
use convo_flow::inbound::{Normalizer, WhatsAppConversations};
use convo_flow::server::{self, AppState};
use convo_flow::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env();
    config.validate()?;
    let provider = ProviderConfig::from_env()?;
    let webhook = WebhookConfig::from_env();

    eprintln!("💬 convo-flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", config.port);
    eprintln!("   Admin API: http://0.0.0.0:{}/api/flows", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Dispatcher ───────────────────────────────────────────────────────
    let resolver = Arc::new(WhatsAppConversations);
    let dispatcher: Arc<dyn MessageDispatcher> = match &provider {
        Some(provider) => {
            let whatsapp = Arc::new(WhatsAppDispatcher::new(
                provider,
                Arc::new(StaticCredentials::from_provider(provider)),
                resolver.clone(),
            ));
            Arc::new(RetryingDispatcher::new(
                whatsapp,
                config.dispatch_max_attempts,
                config.dispatch_backoff,
            ))
        }
        None => {
            eprintln!("   WHATSAPP_ACCESS_TOKEN not set, messages are only logged (dry run)");
            Arc::new(LogDispatcher)
        }
    };
    if webhook.app_secret.is_none() {
        tracing::warn!("WHATSAPP_APP_SECRET not set, webhook signatures are not verified");
    }

    // ── Engine + sweep ───────────────────────────────────────────────────
    let engine = Arc::new(Engine::new(Arc::clone(&db), dispatcher, config.clone()));
    let _sweep_handle = engine::spawn_sweeper(Arc::clone(&engine), config.sweep_interval);

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = server::router(AppState {
        engine,
        normalizer: Arc::new(Normalizer::new(resolver)),
        webhook: Arc::new(webhook),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
