//! # Configuration Management
//!
//! This module loads and manages application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with the `APP__` prefix)
//! - A few well-known deployment variables (`HOST`, `PORT`, `GEMINI_API_KEY`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST`, `PORT`, `GEMINI_API_KEY`
//! 2. Environment variables (`APP__SERVER__HOST`, `APP__SESSION__IDLE_THRESHOLD_SECS`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)
//!
//! The double underscore separates nesting levels, so field names that contain
//! a single underscore (`idle_threshold_secs`) stay intact.
//!
//! ## Rust Concepts Used:
//! - **Serde**: every section round-trips through JSON, which is what lets
//!   `update_from_json` patch any subset of fields at runtime
//! - **Conversion methods**: the sections expose typed policies (`RetryPolicy`,
//!   `BurstPolicy`, `ProactiveSettings`) so the rest of the crate never sees raw
//!   millisecond counts

use crate::live::RetryPolicy;
use crate::scheduler::{BurstPolicy, ProactiveSettings};
use crate::services::Character;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Shown in place of secrets by [`AppConfig::redacted`].
pub const REDACTED_SECRET: &str = "********";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, upstream, session, ...)
/// keeps each consumer dependent only on the part it reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,
    pub proactive: ProactiveConfig,
    pub performance: PerformanceConfig,
    /// Characters the in-memory catalog starts with
    #[serde(default)]
    pub characters: Vec<Character>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where the realtime voice model and the text model live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Empty leaves the text generator disabled and live sessions unable to connect
    pub api_key: String,
    pub live_endpoint: String,
    pub live_model: String,
    pub voice: String,
    pub text_endpoint: String,
    pub text_model: String,
}

/// Per-connection pacing, retry and context settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub auth_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
    pub idle_threshold_secs: u64,
    /// How many transcript entries are replayed after each relink
    pub context_window: usize,
    /// Replayed entries are cut to this many characters
    pub replay_entry_chars: usize,
    pub burst_arousal_threshold: f64,
    pub burst_max_follow_ups: u32,
    pub burst_cooldown_secs: u64,
    pub burst_delay_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub send_attempts: u32,
    pub send_retry_delay_ms: u64,
    /// Memories recalled into the opening instructions
    pub memory_top_k: usize,
    /// Memories recalled when the user asks "do you remember..."
    pub recall_top_k: usize,
    pub search_max_results: usize,
    pub news_max_results: usize,
}

/// Delayed proactive messages after synchronous exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProactiveConfig {
    pub arousal_threshold: f64,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    pub history_limit: usize,
    pub lock_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig::default(),
            session: SessionConfig::default(),
            proactive: ProactiveConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 50,
            },
            characters: Vec::new(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            live_endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            live_model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Kore".to_string(),
            text_endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            text_model: "gemini-2.5-flash".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: 10,
            idle_check_interval_secs: 10,
            idle_threshold_secs: 30,
            context_window: 20,
            replay_entry_chars: 150,
            burst_arousal_threshold: 0.7,
            burst_max_follow_ups: 3,
            burst_cooldown_secs: 30,
            burst_delay_ms: 800,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 500,
            send_attempts: 3,
            send_retry_delay_ms: 500,
            memory_top_k: 5,
            recall_top_k: 8,
            search_max_results: 5,
            news_max_results: 6,
        }
    }
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            arousal_threshold: 0.65,
            min_delay_secs: 8,
            max_delay_secs: 25,
            history_limit: 20,
            lock_sweep_interval_secs: 300,
        }
    }
}

impl SessionConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            reconnect_attempts: self.reconnect_attempts,
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            send_attempts: self.send_attempts,
            send_delay: Duration::from_millis(self.send_retry_delay_ms),
        }
    }

    pub fn burst_policy(&self) -> BurstPolicy {
        BurstPolicy {
            arousal_threshold: self.burst_arousal_threshold,
            max_bursts: self.burst_max_follow_ups,
            cooldown: Duration::from_secs(self.burst_cooldown_secs),
            delay: Duration::from_millis(self.burst_delay_ms),
        }
    }
}

impl ProactiveConfig {
    pub fn settings(&self, memory_top_k: usize) -> ProactiveSettings {
        ProactiveSettings {
            arousal_threshold: self.arousal_threshold,
            min_delay: Duration::from_secs(self.min_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            history_limit: self.history_limit,
            memory_top_k,
        }
    }
}

/// Recursively overlay `patch` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}

impl AppConfig {
    /// Load configuration from all available sources.
    ///
    /// ## Error Handling:
    /// Returns `Err` if a source cannot be parsed or a value has the wrong type;
    /// `main` reports it and exits before the server binds.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").prefix_separator("__").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("upstream.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration makes sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let session = &self.session;
        if session.auth_timeout_secs == 0 || session.idle_check_interval_secs == 0 {
            return Err(anyhow!("Session timers must be greater than 0"));
        }
        if session.context_window == 0 || session.replay_entry_chars == 0 {
            return Err(anyhow!("Context replay window must be greater than 0"));
        }
        if session.reconnect_attempts == 0 || session.send_attempts == 0 {
            return Err(anyhow!("Retry attempts must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&session.burst_arousal_threshold) {
            return Err(anyhow!("Burst arousal threshold must be within 0.0..=1.0"));
        }

        let proactive = &self.proactive;
        if !(0.0..=1.0).contains(&proactive.arousal_threshold) {
            return Err(anyhow!("Proactive arousal threshold must be within 0.0..=1.0"));
        }
        if proactive.min_delay_secs > proactive.max_delay_secs {
            return Err(anyhow!("Proactive min delay cannot exceed max delay"));
        }
        if proactive.lock_sweep_interval_secs == 0 {
            return Err(anyhow!("Lock sweep interval must be greater than 0"));
        }

        if let Some(character) = self.characters.iter().find(|c| !(1..=10).contains(&c.familiarity_level)) {
            return Err(anyhow!(
                "Character {} has familiarity {} (expected 1-10)",
                character.id,
                character.familiarity_level
            ));
        }

        Ok(())
    }

    /// Update configuration from a partial JSON document.
    ///
    /// Any subset of fields may be present; nested objects are merged, so
    /// `{"session": {"idle_threshold_secs": 45}}` leaves every other field alone.
    /// The result is validated before it replaces `self`.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(anyhow!("Configuration update must be a JSON object"));
        }

        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, patch);
        let mut updated: AppConfig = serde_json::from_value(current)?;
        // a config read back from GET carries the mask, not the key
        if updated.upstream.api_key == REDACTED_SECRET {
            updated.upstream.api_key = self.upstream.api_key.clone();
        }

        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Configuration as shown over HTTP, with secrets masked.
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        if !shown.upstream.api_key.is_empty() {
            shown.upstream.api_key = REDACTED_SECRET.to_string();
        }
        shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.auth_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.retry_policy(), RetryPolicy::default());
        assert_eq!(config.session.burst_policy(), BurstPolicy::default());
        assert_eq!(config.proactive.settings(5), ProactiveSettings::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.proactive.min_delay_secs = 30;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.burst_arousal_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.proactive.lock_sweep_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "session": {"idle_threshold_secs": 45}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.session.idle_threshold_secs, 45);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.session.idle_check_interval_secs, 10);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"performance": {"max_concurrent_sessions": 0}}"#).is_err());
        assert_eq!(config.performance.max_concurrent_sessions, 50);

        assert!(config.update_from_json(r#"{"server": {"port": "not a port"}}"#).is_err());
        assert!(config.update_from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_redacted_masks_api_key() {
        let mut config = AppConfig::default();
        config.upstream.api_key = "secret".to_string();
        assert_eq!(config.redacted().upstream.api_key, "********");
        assert_eq!(config.upstream.api_key, "secret");
    }

    #[test]
    fn test_masked_key_in_update_keeps_stored_key() {
        let mut config = AppConfig::default();
        config.upstream.api_key = "secret".to_string();

        let round_trip = serde_json::to_string(&config.redacted()).unwrap();
        assert!(config.update_from_json(&round_trip).is_ok());
        assert_eq!(config.upstream.api_key, "secret");

        assert!(config.update_from_json(r#"{"upstream": {"api_key": "rotated"}}"#).is_ok());
        assert_eq!(config.upstream.api_key, "rotated");
    }
}
