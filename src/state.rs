//! # Application State Management
//!
//! Shared state handed to every connection handler: the loaded
//! configuration, the decoded secret store, and coarse session metrics.
//! Everything mutable is behind atomics so handlers never block each other.

use crate::auth::SecretStore;
use crate::config::AppConfig;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters updated by the WebSocket endpoint as sessions come and go.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    sessions_started: AtomicU64,
    sessions_active: AtomicU64,
}

impl SessionMetrics {
    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn sessions_active(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }
}

/// The application state shared across all connection handlers.
#[derive(Clone)]
pub struct AppState {
    config: AppConfig,
    secrets: Arc<SecretStore>,
    pub metrics: Arc<SessionMetrics>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, secrets: SecretStore) -> Self {
        Self {
            config,
            secrets: Arc::new(secrets),
            metrics: Arc::new(SessionMetrics::default()),
            started_at: Utc::now(),
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.clone()
    }

    pub fn secrets(&self) -> Arc<SecretStore> {
        self.secrets.clone()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether another session may be accepted under the configured limit.
    pub fn can_accept_session(&self) -> bool {
        (self.metrics.sessions_active() as usize) < self.config.session.max_concurrent_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(AppConfig::default(), SecretStore::default())
    }

    #[test]
    fn test_metrics_track_session_lifecycle() {
        let state = state();
        assert_eq!(state.metrics.sessions_active(), 0);
        state.metrics.session_started();
        state.metrics.session_started();
        assert_eq!(state.metrics.sessions_started(), 2);
        assert_eq!(state.metrics.sessions_active(), 2);
        state.metrics.session_ended();
        assert_eq!(state.metrics.sessions_active(), 1);
        assert_eq!(state.metrics.sessions_started(), 2);
    }

    #[test]
    fn test_session_limit_enforced() {
        let mut config = AppConfig::default();
        config.session.max_concurrent_sessions = 1;
        let state = AppState::new(config, SecretStore::default());
        assert!(state.can_accept_session());
        state.metrics.session_started();
        assert!(!state.can_accept_session());
    }
}
