//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every live session.
//!
//! ## What lives here:
//! - **config**: the current [`AppConfig`], replaceable at runtime through `PUT /api/v1/config`
//! - **metrics**: process-wide counters reported by `/api/v1/metrics`
//! - **services**: the collaborator bundle every session talks to
//! - **connector**: how live sessions dial the upstream realtime model
//! - **proactive**: the delayed proactive-message scheduler and its lock registry
//!
//! ## Thread Safety Pattern:
//! Mutable pieces sit behind `Arc<RwLock<T>>`. Locks are held only for the
//! duration of a read or an increment and never across an `.await`, so a
//! poisoned lock still holds consistent data and is recovered rather than
//! propagated.

use crate::config::AppConfig;
use crate::live::Connector;
use crate::scheduler::{LockRegistry, ProactiveScheduler};
use crate::services::Services;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// State shared by every request handler and every session.
///
/// Cloning is cheap: every field is either `Copy` or reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Sessions take a snapshot when they start; updates apply to the next session
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub services: Services,
    pub connector: Arc<dyn Connector>,
    pub proactive: Arc<ProactiveScheduler>,
}

/// Counters collected across all sessions since startup.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    /// Sessions that completed the auth handshake
    pub sessions_opened: u64,

    /// Sessions refused during the handshake (timeout, bad auth, unknown character)
    pub sessions_rejected: u64,

    /// Open WebSocket connections, authenticated or not
    pub active_sessions: u32,

    pub upstream_reconnects: u64,

    /// Reclassifications of a character's emotion
    pub emotion_updates: u64,

    pub burst_follow_ups: u64,

    pub idle_prompts: u64,
}

impl AppState {
    /// Create the shared state.
    ///
    /// The proactive scheduler is built here so that it shares the collaborator
    /// bundle with live sessions and reads its settings from the same config.
    pub fn new(config: AppConfig, services: Services, connector: Arc<dyn Connector>) -> Self {
        let settings = config.proactive.settings(config.session.memory_top_k);
        let proactive = Arc::new(ProactiveScheduler::new(
            services.clone(),
            Arc::new(LockRegistry::default()),
            settings,
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            services,
            connector,
            proactive,
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so a session holding its
    /// snapshot never blocks an update.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Count a new connection unless `max` are already open.
    pub fn try_acquire_session(&self, max: usize) -> bool {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions as usize >= max {
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Underflow-safe: a release without a matching acquire is ignored.
    pub fn release_session(&self) {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn record_session_opened(&self) {
        self.metrics_mut().sessions_opened += 1;
    }

    pub fn record_session_rejected(&self) {
        self.metrics_mut().sessions_rejected += 1;
    }

    pub fn record_reconnect(&self) {
        self.metrics_mut().upstream_reconnects += 1;
    }

    pub fn record_emotion_update(&self) {
        self.metrics_mut().emotion_updates += 1;
    }

    pub fn record_burst(&self) {
        self.metrics_mut().burst_follow_ups += 1;
    }

    pub fn record_idle_prompt(&self) {
        self.metrics_mut().idle_prompts += 1;
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
