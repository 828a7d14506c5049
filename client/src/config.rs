//! Client configuration.

use std::time::Duration;

/// Rebalancing client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Store path under which groups live.
    pub root_path: String,
    /// Session expiry timeout requested from the store.
    pub session_timeout: Duration,
    /// Maximum time to establish a session.
    pub connect_timeout: Duration,
    /// Minimum spacing between two coordinator rounds.
    pub min_rebalance_interval: Duration,
    /// Poll interval while waiting on a resource barrier.
    pub barrier_poll_interval: Duration,
    /// Pause between retries after a connection loss.
    pub retry_interval: Duration,
    /// Default bound on `stop()` when none is given.
    pub stop_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            root_path: "/rebalancer".to_string(),
            session_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(20),
            min_rebalance_interval: Duration::from_secs(5),
            barrier_poll_interval: Duration::from_millis(100),
            retry_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("REBALANCER_ROOT") {
            config.root_path = root;
        }

        if let Ok(ms) = std::env::var("REBALANCER_SESSION_TIMEOUT_MS") {
            if let Ok(ms) = ms.parse() {
                config.session_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(ms) = std::env::var("REBALANCER_MIN_REBALANCE_INTERVAL_MS") {
            if let Ok(ms) = ms.parse() {
                config.min_rebalance_interval = Duration::from_millis(ms);
            }
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.root_path.starts_with('/') {
            return Err("Root path must be absolute".to_string());
        }

        if self.session_timeout.is_zero() {
            return Err("Session timeout cannot be 0".to_string());
        }

        if self.connect_timeout.is_zero() {
            return Err("Connect timeout cannot be 0".to_string());
        }

        if self.barrier_poll_interval.is_zero() || self.retry_interval.is_zero() {
            return Err("Poll and retry intervals cannot be 0".to_string());
        }

        Ok(())
    }
}

/// Per-start options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Restart from `NoSession` after a fatal failure instead of terminating.
    pub auto_recovery_on_error: bool,
    /// Pause before a recovery attempt.
    pub recovery_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_recovery_on_error: false,
            recovery_delay: Duration::from_secs(1),
        }
    }
}

impl ClientOptions {
    /// Options with auto-recovery enabled.
    pub fn with_auto_recovery() -> Self {
        Self {
            auto_recovery_on_error: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_rebalance_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_config() {
        let mut config = ClientConfig::default();
        config.root_path = "relative".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.session_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_options() {
        assert!(!ClientOptions::default().auto_recovery_on_error);
        assert!(ClientOptions::with_auto_recovery().auto_recovery_on_error);
    }
}
