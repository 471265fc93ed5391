//! Per-plugin configuration section.

use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::time::Duration;

use super::validation::{ConfigError, split_list};

/// Key holding the implementation identifier.
pub const NAME_KEY: &str = "name";
/// Key holding the polling interval in whole seconds.
pub const INTERVAL_KEY: &str = "interval";

/// Opaque key/value settings scoped to one plugin section.
///
/// Construction guarantees `name` is present and `interval` is a positive
/// integer. Every other key is plugin-specific and validated by the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    section: String,
    interval: NonZeroU64,
    interval_ms: i64,
    values: BTreeMap<String, String>,
}

impl PluginConfig {
    /// Build and validate a section.
    pub fn new(
        section: impl Into<String>,
        values: BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let section = section.into();

        match values.get(NAME_KEY) {
            Some(name) if !name.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::MissingKey {
                    section,
                    key: NAME_KEY,
                });
            }
        }

        let raw_interval = values.get(INTERVAL_KEY).ok_or_else(|| ConfigError::MissingKey {
            section: section.clone(),
            key: INTERVAL_KEY,
        })?;
        let interval = raw_interval
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(NonZeroU64::new)
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "section '{}': interval must be a positive integer number of seconds, got '{}'",
                    section, raw_interval
                ))
            })?;

        // Schedules are kept as epoch milliseconds in an i64.
        let interval_ms = i64::try_from(interval.get())
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "section '{}': interval {} is out of range (at most {} seconds)",
                    section,
                    interval,
                    i64::MAX / 1000
                ))
            })?;

        Ok(Self {
            section,
            interval,
            interval_ms,
            values,
        })
    }

    /// Convenience constructor from key/value pairs.
    pub fn from_pairs<K, V>(
        section: impl Into<String>,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, ConfigError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(section, values)
    }

    /// Configured section name (unique registry key).
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Implementation identifier used to resolve the collector.
    pub fn name(&self) -> &str {
        self.values.get(NAME_KEY).map(|s| s.trim()).unwrap_or_default()
    }

    /// Polling interval in seconds.
    pub fn interval(&self) -> NonZeroU64 {
        self.interval
    }

    /// Polling interval in milliseconds.
    pub fn interval_millis(&self) -> i64 {
        self.interval_ms
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.interval.get())
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whitespace-separated list for `key`; empty when the key is absent.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key).map(split_list).unwrap_or_default()
    }

    /// Parse `key` into `T`, returning `default` when absent.
    pub fn get_parsed_or<T>(&self, key: &str, default: T) -> Result<T, String>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| format!("invalid value '{}' for '{}': {}", raw, key, e)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
