use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Result, RuntimeError};

/// Runtime settings.
///
/// `Default` gives the built-in values; [`RuntimeConfig::from_env`] overlays
/// `WEFT_*` environment variables and a TOML file overlays whatever keys it
/// sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// When false, the first failed published delivery is returned from
    /// `run_until_idle` / `stop_when_idle`.
    pub ignore_unhandled_errors: bool,
    /// Default timeout for `send_message`; none when unset.
    pub send_timeout_ms: Option<u64>,
    /// Warn when the envelope backlog grows past this. 0 disables.
    pub queue_warn_threshold: usize,
    /// `EnvFilter` directive used by `telemetry::init_from_config`.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ignore_unhandled_errors: true,
            send_timeout_ms: None,
            queue_warn_threshold: 10_000,
            log_filter: "info".to_string(),
        }
    }
}

fn env_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

impl RuntimeConfig {
    /// Built-in values overlaid with `WEFT_IGNORE_UNHANDLED_ERRORS`,
    /// `WEFT_SEND_TIMEOUT_MS`, `WEFT_QUEUE_WARN_THRESHOLD` and `WEFT_LOG`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ignore) = env_var("WEFT_IGNORE_UNHANDLED_ERRORS") {
            config.ignore_unhandled_errors = ignore;
        }
        if let Some(ms) = env_var::<u64>("WEFT_SEND_TIMEOUT_MS") {
            config.send_timeout_ms = Some(ms).filter(|ms| *ms > 0);
        }
        if let Some(threshold) = env_var("WEFT_QUEUE_WARN_THRESHOLD") {
            config.queue_warn_threshold = threshold;
        }
        if let Some(filter) = env_var::<String>("WEFT_LOG").filter(|s| !s.is_empty()) {
            config.log_filter = filter;
        }
        config
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&raw)?;
        info!(target: "runtime", path = %path.display(), "Loaded runtime config");
        Ok(config)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_ignore_unhandled_errors(mut self, ignore: bool) -> Self {
        self.ignore_unhandled_errors = ignore;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overlays_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            ignore_unhandled_errors = false
            send_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert!(!config.ignore_unhandled_errors);
        assert_eq!(config.send_timeout(), Some(Duration::from_millis(250)));
        assert!(!config.log_filter.is_empty());
    }

    #[test]
    fn default_ignores_environment() {
        std::env::set_var("WEFT_QUEUE_WARN_THRESHOLD", "7");
        std::env::set_var("WEFT_SEND_TIMEOUT_MS", "40");
        let from_env = RuntimeConfig::from_env();
        let default = RuntimeConfig::default();
        std::env::remove_var("WEFT_QUEUE_WARN_THRESHOLD");
        std::env::remove_var("WEFT_SEND_TIMEOUT_MS");

        assert_eq!(from_env.queue_warn_threshold, 7);
        assert_eq!(from_env.send_timeout(), Some(Duration::from_millis(40)));
        assert_eq!(default.queue_warn_threshold, 10_000);
        assert_eq!(default.send_timeout(), None);
        assert!(default.ignore_unhandled_errors);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = RuntimeConfig::from_toml_str("send_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }
}
