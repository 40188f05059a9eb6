//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Engine and server configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port for the webhook + admin HTTP server.
    pub port: u16,
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// How often the sweep scans for expired continuations.
    pub sweep_interval: Duration,
    /// Inbound event records stuck in `pending` longer than this are replayed by the sweep.
    pub stale_event_after: Duration,
    /// Maximum nodes executed for one event before the session is failed.
    pub max_steps_per_event: usize,
    /// Attempts per send inside the dispatch layer (including the first).
    pub dispatch_max_attempts: u32,
    /// Base backoff between dispatch attempts (doubles each attempt).
    pub dispatch_backoff: Duration,
    /// Delay before a session parked on a failed send is retried by the sweep.
    pub dispatch_retry_after: Duration,
    /// Failed send rounds tolerated before the session is ended as `error`.
    pub max_dispatch_rounds: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/convo-flow.db"),
            sweep_interval: Duration::from_secs(5),
            stale_event_after: Duration::from_secs(60),
            max_steps_per_event: 64,
            dispatch_max_attempts: 3,
            dispatch_backoff: Duration::from_millis(250),
            dispatch_retry_after: Duration::from_secs(30),
            max_dispatch_rounds: 5,
        }
    }
}

impl EngineConfig {
    /// Build from `CONVO_FLOW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("CONVO_FLOW_PORT").unwrap_or(defaults.port),
            db_path: std::env::var("CONVO_FLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            sweep_interval: env_parse("CONVO_FLOW_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            stale_event_after: env_parse("CONVO_FLOW_STALE_EVENT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_event_after),
            max_steps_per_event: env_parse("CONVO_FLOW_MAX_STEPS")
                .unwrap_or(defaults.max_steps_per_event),
            dispatch_max_attempts: env_parse("CONVO_FLOW_DISPATCH_ATTEMPTS")
                .unwrap_or(defaults.dispatch_max_attempts),
            dispatch_backoff: env_parse("CONVO_FLOW_DISPATCH_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch_backoff),
            dispatch_retry_after: env_parse("CONVO_FLOW_DISPATCH_RETRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dispatch_retry_after),
            max_dispatch_rounds: env_parse("CONVO_FLOW_MAX_DISPATCH_ROUNDS")
                .unwrap_or(defaults.max_dispatch_rounds),
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.max_steps_per_event == 0 {
            return Err(invalid("CONVO_FLOW_MAX_STEPS", "must be at least 1"));
        }
        if self.dispatch_max_attempts == 0 {
            return Err(invalid("CONVO_FLOW_DISPATCH_ATTEMPTS", "must be at least 1"));
        }
        if self.max_dispatch_rounds == 0 {
            return Err(invalid("CONVO_FLOW_MAX_DISPATCH_ROUNDS", "must be at least 1"));
        }
        if self.sweep_interval.is_zero() {
            return Err(invalid("CONVO_FLOW_SWEEP_INTERVAL_SECS", "must be positive"));
        }
        Ok(())
    }
}

/// WhatsApp Cloud API settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Graph API base, e.g. `https://graph.facebook.com/v21.0`.
    pub api_base: String,
    pub access_token: SecretString,
    pub phone_number_id: String,
    /// WhatsApp Flow used to render form messages.
    pub form_flow_id: Option<String>,
}

impl ProviderConfig {
    /// Returns `Ok(None)` when no access token is configured (dry-run mode).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(access_token) = std::env::var("WHATSAPP_ACCESS_TOKEN") else {
            return Ok(None);
        };
        let phone_number_id = std::env::var("WHATSAPP_PHONE_NUMBER_ID")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("WHATSAPP_PHONE_NUMBER_ID".into()))?;
        let api_base = std::env::var("WHATSAPP_API_BASE")
            .unwrap_or_else(|_| "https://graph.facebook.com/v21.0".to_string());

        Ok(Some(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: SecretString::from(access_token),
            phone_number_id,
            form_flow_id: std::env::var("WHATSAPP_FORM_FLOW_ID")
                .ok()
                .filter(|s| !s.is_empty()),
        }))
    }
}

/// Inbound webhook settings.
#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    /// App secret for `X-Hub-Signature-256` verification. `None` disables the check.
    pub app_secret: Option<SecretString>,
    /// Token expected in the `GET /webhook` subscription handshake.
    pub verify_token: Option<String>,
}

impl WebhookConfig {
    pub fn from_env() -> Self {
        Self {
            app_secret: std::env::var("WHATSAPP_APP_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            verify_token: std::env::var("WHATSAPP_VERIFY_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.port, 8080);
        assert!(config.dispatch_max_attempts >= 1);
        assert!(config.max_steps_per_event > 0);
    }

    #[test]
    fn zero_limits_fail_validation() {
        assert!(EngineConfig::default().validate().is_ok());

        let config = EngineConfig {
            max_steps_per_event: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "CONVO_FLOW_MAX_STEPS"
        ));
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // Unset keys and unparsable values both fall back.
        assert_eq!(env_parse::<u16>("CONVO_FLOW_TEST_DEFINITELY_UNSET"), None);
    }
}
