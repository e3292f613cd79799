//! Per-database configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server statuses worth another attempt.
pub const DEFAULT_RETRY_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Database configuration, loadable from JSON or from environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// Whether writes are journaled and synched with a server
    pub synch_enabled: bool,
    /// Endpoint receiving synch requests
    pub synch_url: String,
    /// Whether the first synch arms a recurring synch timer
    pub auto_synch: bool,
    /// Spacing of automatic synchs
    pub throttle_ms: u64,
    /// Freshness window after which an unforced synch is no longer skipped
    pub poll_ms: u64,
    /// Request timeout
    pub timeout_ms: u64,
    /// Retries after the first attempt
    pub retry_count: u32,
    /// Delay between attempts
    pub retry_wait_ms: u64,
    /// Statuses that are retried
    pub retry_statuses: Vec<u16>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            synch_enabled: false,
            synch_url: "/api/webdb/synch".to_string(),
            auto_synch: true,
            throttle_ms: 120_000,
            poll_ms: 3_600_000,
            timeout_ms: 5_000,
            retry_count: 1,
            retry_wait_ms: 2_000,
            retry_statuses: DEFAULT_RETRY_STATUSES.to_vec(),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from `STASH_*` environment variables. Unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(enabled) = parse_flag(&lookup, "STASH_SYNCH")? {
            config.synch_enabled = enabled;
        }
        if let Some(url) = lookup("STASH_SYNCH_URL") {
            config.synch_url = url;
        }
        if let Some(auto) = parse_flag(&lookup, "STASH_SYNCH_AUTO")? {
            config.auto_synch = auto;
        }
        if let Some(ms) = parse(&lookup, "STASH_THROTTLE_MS")? {
            config.throttle_ms = ms;
        }
        if let Some(ms) = parse(&lookup, "STASH_POLL_MS")? {
            config.poll_ms = ms;
        }
        if let Some(ms) = parse(&lookup, "STASH_TIMEOUT_MS")? {
            config.timeout_ms = ms;
        }
        if let Some(count) = parse(&lookup, "STASH_RETRY_COUNT")? {
            config.retry_count = count;
        }
        if let Some(ms) = parse(&lookup, "STASH_RETRY_WAIT_MS")? {
            config.retry_wait_ms = ms;
        }

        Ok(config)
    }

    pub fn with_synch_enabled(mut self, enabled: bool) -> Self {
        self.synch_enabled = enabled;
        self
    }

    pub fn with_synch_url(mut self, url: impl Into<String>) -> Self {
        self.synch_url = url.into();
        self
    }

    pub fn with_auto_synch(mut self, auto: bool) -> Self {
        self.auto_synch = auto;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle_ms = millis(throttle);
        self
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll_ms = millis(poll);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = millis(timeout);
        self
    }

    pub fn with_retries(mut self, count: u32, wait: Duration) -> Self {
        self.retry_count = count;
        self.retry_wait_ms = millis(wait);
        self
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    /// Whether a failed attempt with this status may be retried.
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_flag<F>(lookup: &F, var: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { var, value }),
        },
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}")]
    Invalid { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults() {
        let config = DatabaseConfig::default();
        assert!(!config.synch_enabled);
        assert!(config.auto_synch);
        assert_eq!(config.throttle(), Duration::from_secs(120));
        assert_eq!(config.poll(), Duration::from_secs(3600));
        assert_eq!(config.retry_count, 1);
        assert!(config.is_retryable(503));
        assert!(!config.is_retryable(404));
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = DatabaseConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DatabaseConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = DatabaseConfig::from_lookup(lookup(&[
            ("STASH_SYNCH", "true"),
            ("STASH_SYNCH_URL", "http://localhost:8080/synch"),
            ("STASH_SYNCH_AUTO", "0"),
            ("STASH_TIMEOUT_MS", " 250 "),
            ("STASH_RETRY_COUNT", "3"),
        ]))
        .unwrap();
        assert!(config.synch_enabled);
        assert!(!config.auto_synch);
        assert_eq!(config.synch_url, "http://localhost:8080/synch");
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.retry_count, 3);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = DatabaseConfig::from_lookup(lookup(&[("STASH_POLL_MS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "STASH_POLL_MS", .. }));

        let err = DatabaseConfig::from_lookup(lookup(&[("STASH_SYNCH", "maybe")])).unwrap_err();
        assert_eq!(err.to_string(), "invalid value 'maybe' for STASH_SYNCH");
    }

    #[test]
    fn deserializes_partial_json() {
        let config: DatabaseConfig =
            serde_json::from_str(r#"{"synchEnabled": true, "retryWaitMs": 10}"#).unwrap();
        assert!(config.synch_enabled);
        assert_eq!(config.retry_wait(), Duration::from_millis(10));
        assert_eq!(config.timeout_ms, 5_000);
    }
}
