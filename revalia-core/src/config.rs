//! Engine configuration.
//!
//! Plain values only: everything here serializes with serde and can be
//! loaded from TOML, JSON or `REVALIA_*` environment variables. Options that
//! carry typed values or closures (fallback data, dynamic refresh intervals)
//! are attached at the engine or subscription level instead.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Retry backoff exponent cap when no explicit maximum is configured.
const DEFAULT_MAX_BACKOFF_EXPONENT: u32 = 8;

/// Revalidation, deduping and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwrConfig {
    /// Window during which duplicate revalidations of one key collapse.
    pub deduping_interval_ms: u64,
    /// Minimum gap between two focus revalidations of one subscriber.
    pub focus_throttle_interval_ms: u64,
    /// Base retry delay.
    pub error_retry_interval_ms: u64,
    /// Cap on the exponential part of the retry delay.
    pub error_retry_max_interval_ms: Option<u64>,
    /// Maximum number of retries. `None` retries without bound.
    pub error_retry_count: Option<u32>,
    /// Add up to one base interval of random delay to each retry.
    pub error_retry_jitter: bool,
    pub should_retry_on_error: bool,
    /// Polling period. 0 disables polling.
    pub refresh_interval_ms: u64,
    pub refresh_when_hidden: bool,
    pub refresh_when_offline: bool,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    pub revalidate_if_stale: bool,
    /// Force (or suppress) the mount revalidation regardless of cache state.
    pub revalidate_on_mount: Option<bool>,
    pub keep_previous_data: bool,
}

impl Default for SwrConfig {
    fn default() -> Self {
        Self {
            deduping_interval_ms: 2_000,
            focus_throttle_interval_ms: 5_000,
            error_retry_interval_ms: 5_000,
            error_retry_max_interval_ms: None,
            error_retry_count: None,
            error_retry_jitter: true,
            should_retry_on_error: true,
            refresh_interval_ms: 0,
            refresh_when_hidden: false,
            refresh_when_offline: false,
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            revalidate_if_stale: true,
            revalidate_on_mount: None,
            keep_previous_data: false,
        }
    }
}

impl SwrConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deduping_interval(&self) -> Duration {
        Duration::from_millis(self.deduping_interval_ms)
    }

    pub fn focus_throttle_interval(&self) -> Duration {
        Duration::from_millis(self.focus_throttle_interval_ms)
    }

    pub fn error_retry_interval(&self) -> Duration {
        Duration::from_millis(self.error_retry_interval_ms)
    }

    /// Effective retry cap: the configured maximum, or base × 2^8.
    pub fn error_retry_max_interval(&self) -> Duration {
        match self.error_retry_max_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.error_retry_interval() * (1u32 << DEFAULT_MAX_BACKOFF_EXPONENT),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn with_deduping_interval(mut self, duration: Duration) -> Self {
        self.deduping_interval_ms = duration_ms(duration);
        self
    }

    pub fn with_focus_throttle_interval(mut self, duration: Duration) -> Self {
        self.focus_throttle_interval_ms = duration_ms(duration);
        self
    }

    pub fn with_error_retry_interval(mut self, duration: Duration) -> Self {
        self.error_retry_interval_ms = duration_ms(duration);
        self
    }

    pub fn with_error_retry_max_interval(mut self, duration: Duration) -> Self {
        self.error_retry_max_interval_ms = Some(duration_ms(duration));
        self
    }

    pub fn with_error_retry_count(mut self, count: Option<u32>) -> Self {
        self.error_retry_count = count;
        self
    }

    pub fn with_error_retry_jitter(mut self, enabled: bool) -> Self {
        self.error_retry_jitter = enabled;
        self
    }

    pub fn with_retry_on_error(mut self, enabled: bool) -> Self {
        self.should_retry_on_error = enabled;
        self
    }

    pub fn with_refresh_interval(mut self, duration: Duration) -> Self {
        self.refresh_interval_ms = duration_ms(duration);
        self
    }

    pub fn with_refresh_when_hidden(mut self, enabled: bool) -> Self {
        self.refresh_when_hidden = enabled;
        self
    }

    pub fn with_refresh_when_offline(mut self, enabled: bool) -> Self {
        self.refresh_when_offline = enabled;
        self
    }

    pub fn with_revalidate_on_focus(mut self, enabled: bool) -> Self {
        self.revalidate_on_focus = enabled;
        self
    }

    pub fn with_revalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.revalidate_on_reconnect = enabled;
        self
    }

    pub fn with_revalidate_if_stale(mut self, enabled: bool) -> Self {
        self.revalidate_if_stale = enabled;
        self
    }

    pub fn with_revalidate_on_mount(mut self, value: Option<bool>) -> Self {
        self.revalidate_on_mount = value;
        self
    }

    pub fn with_keep_previous_data(mut self, enabled: bool) -> Self {
        self.keep_previous_data = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - error_retry_interval_ms > 0
    /// - error_retry_max_interval_ms >= error_retry_interval_ms
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.error_retry_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "error_retry_interval_ms".to_string(),
                value: self.error_retry_interval_ms.to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        if let Some(max) = self.error_retry_max_interval_ms {
            if max < self.error_retry_interval_ms {
                return Err(ConfigError::InvalidValue {
                    field: "error_retry_max_interval_ms".to_string(),
                    value: max.to_string(),
                    reason: "must be >= error_retry_interval_ms".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SwrConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SwrConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `REVALIA_DEDUPING_INTERVAL_MS`
    /// - `REVALIA_FOCUS_THROTTLE_INTERVAL_MS`
    /// - `REVALIA_ERROR_RETRY_INTERVAL_MS`
    /// - `REVALIA_ERROR_RETRY_MAX_INTERVAL_MS`
    /// - `REVALIA_ERROR_RETRY_COUNT`
    /// - `REVALIA_REFRESH_INTERVAL_MS`
    /// - `REVALIA_REFRESH_WHEN_HIDDEN`, `REVALIA_REFRESH_WHEN_OFFLINE`
    /// - `REVALIA_REVALIDATE_ON_FOCUS`, `REVALIA_REVALIDATE_ON_RECONNECT`
    /// - `REVALIA_REVALIDATE_IF_STALE`, `REVALIA_KEEP_PREVIOUS_DATA`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            deduping_interval_ms: parse_var(&lookup, "REVALIA_DEDUPING_INTERVAL_MS")?
                .unwrap_or(defaults.deduping_interval_ms),
            focus_throttle_interval_ms: parse_var(&lookup, "REVALIA_FOCUS_THROTTLE_INTERVAL_MS")?
                .unwrap_or(defaults.focus_throttle_interval_ms),
            error_retry_interval_ms: parse_var(&lookup, "REVALIA_ERROR_RETRY_INTERVAL_MS")?
                .unwrap_or(defaults.error_retry_interval_ms),
            error_retry_max_interval_ms: parse_var(&lookup, "REVALIA_ERROR_RETRY_MAX_INTERVAL_MS")?
                .or(defaults.error_retry_max_interval_ms),
            error_retry_count: parse_var(&lookup, "REVALIA_ERROR_RETRY_COUNT")?
                .or(defaults.error_retry_count),
            refresh_interval_ms: parse_var(&lookup, "REVALIA_REFRESH_INTERVAL_MS")?
                .unwrap_or(defaults.refresh_interval_ms),
            refresh_when_hidden: parse_var(&lookup, "REVALIA_REFRESH_WHEN_HIDDEN")?
                .unwrap_or(defaults.refresh_when_hidden),
            refresh_when_offline: parse_var(&lookup, "REVALIA_REFRESH_WHEN_OFFLINE")?
                .unwrap_or(defaults.refresh_when_offline),
            revalidate_on_focus: parse_var(&lookup, "REVALIA_REVALIDATE_ON_FOCUS")?
                .unwrap_or(defaults.revalidate_on_focus),
            revalidate_on_reconnect: parse_var(&lookup, "REVALIA_REVALIDATE_ON_RECONNECT")?
                .unwrap_or(defaults.revalidate_on_reconnect),
            revalidate_if_stale: parse_var(&lookup, "REVALIA_REVALIDATE_IF_STALE")?
                .unwrap_or(defaults.revalidate_if_stale),
            keep_previous_data: parse_var(&lookup, "REVALIA_KEEP_PREVIOUS_DATA")?
                .unwrap_or(defaults.keep_previous_data),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<F, V>(lookup: &F, name: &str) -> Result<Option<V>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    V: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw.clone(),
                reason: "could not be parsed".to_string(),
            }),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SwrConfig::default();
        assert_eq!(config.deduping_interval(), Duration::from_secs(2));
        assert_eq!(config.focus_throttle_interval(), Duration::from_secs(5));
        assert_eq!(config.error_retry_count, None);
        assert!(config.revalidate_on_focus);
        assert!(!config.refresh_when_hidden);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_interval_defaults_to_capped_exponent() {
        let config = SwrConfig::default().with_error_retry_interval(Duration::from_millis(100));
        assert_eq!(config.error_retry_max_interval(), Duration::from_millis(25_600));
    }

    #[test]
    fn test_validate_rejects_zero_retry_interval() {
        let config = SwrConfig {
            error_retry_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_small_max_interval() {
        let config = SwrConfig::default()
            .with_error_retry_interval(Duration::from_millis(500))
            .with_error_retry_max_interval(Duration::from_millis(100));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "error_retry_max_interval_ms"
        ));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = SwrConfig::from_toml_str(
            r#"
            deduping_interval_ms = 500
            refresh_interval_ms = 1000
            error_retry_count = 3
            "#,
        )
        .expect("valid toml");
        assert_eq!(config.deduping_interval_ms, 500);
        assert_eq!(config.refresh_interval(), Duration::from_secs(1));
        assert_eq!(config.error_retry_count, Some(3));
        assert!(config.revalidate_on_reconnect);
    }

    #[test]
    fn test_from_toml_rejects_unknown_fields() {
        assert!(matches!(
            SwrConfig::from_toml_str("dedupe = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_json() {
        let config = SwrConfig::from_json_str(r#"{"revalidate_on_focus": false}"#)
            .expect("valid json");
        assert!(!config.revalidate_on_focus);
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "keep_previous_data = true").expect("write");
        let config = SwrConfig::from_path(file.path()).expect("load");
        assert!(config.keep_previous_data);
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("REVALIA_DEDUPING_INTERVAL_MS", "100"),
            ("REVALIA_ERROR_RETRY_COUNT", "2"),
            ("REVALIA_REFRESH_WHEN_HIDDEN", "true"),
        ]
        .into_iter()
        .collect();
        let config =
            SwrConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).expect("env");
        assert_eq!(config.deduping_interval_ms, 100);
        assert_eq!(config.error_retry_count, Some(2));
        assert!(config.refresh_when_hidden);
        assert_eq!(config.focus_throttle_interval_ms, 5_000);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = SwrConfig::from_lookup(|name| {
            (name == "REVALIA_REFRESH_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
