//! Agent configuration structures.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use super::plugin::PluginConfig;
use super::validation::{ConfigError, expand_env_vars, split_list};

// =============================================================================
// Constants
// =============================================================================

/// Name of the section holding agent-wide settings.
pub const MAIN_SECTION: &str = "main";

/// Default submission request timeout (10 seconds).
pub const DEFAULT_SUBMISSION_TIMEOUT: Duration = Duration::from_secs(10);

fn default_submission_timeout() -> Duration {
    DEFAULT_SUBMISSION_TIMEOUT
}

// =============================================================================
// Schedule Mode
// =============================================================================

/// How a plugin's next run time advances after each trigger.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ScheduleMode {
    /// `next_sched += interval`: keeps phase, never bursts to catch up.
    #[default]
    PhaseFixed,
    /// `next_sched = now + interval`: realigns to wall clock after delays.
    DriftCorrected,
}

// =============================================================================
// Main Section
// =============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum NameList {
    List(Vec<String>),
    Joined(String),
}

fn deserialize_name_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<NameList>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(NameList::List(items)) => items
            .iter()
            .flat_map(|item| split_list(item))
            .collect(),
        Some(NameList::Joined(raw)) => split_list(&raw),
    })
}

/// Agent-wide settings from the `main` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    /// Metrics backend endpoint.
    pub submission_url: String,

    /// Basic-auth user for the backend.
    #[serde(default)]
    pub submission_username: Option<String>,

    /// Basic-auth password for the backend.
    #[serde(default)]
    pub submission_password: Option<String>,

    /// Per-request timeout for submissions (default: 10s).
    #[serde(default = "default_submission_timeout", with = "humantime_serde")]
    pub submission_timeout: Duration,

    /// Section names of the plugins to run, in start order.
    #[serde(default, deserialize_with = "deserialize_name_list")]
    pub plugins_enabled: Vec<String>,

    /// Result channel capacity; 0 keeps it unbounded.
    #[serde(default)]
    pub channel_capacity: usize,

    /// Scheduling policy for every plugin.
    #[serde(default)]
    pub schedule: ScheduleMode,
}

// =============================================================================
// Agent Configuration
// =============================================================================

/// Top-level agent configuration: `main` plus one section per plugin.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent-wide settings.
    pub main: MainConfig,

    /// Every other top-level key, keyed by section name.
    #[serde(flatten)]
    pub sections: BTreeMap<String, serde_yaml::Mapping>,
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(content)?;
        config.expand_credentials();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// Checks the submission endpoint and every enabled plugin section. Runs
    /// to completion before any worker is started.
    ///
    /// # Errors
    /// Returns the first `ConfigError` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.main.submission_url).map_err(|e| {
            ConfigError::ValidationError(format!(
                "invalid submission_url '{}': {}",
                self.main.submission_url, e
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::ValidationError(format!(
                "submission_url must be http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.main.submission_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "submission_timeout must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for section in &self.main.plugins_enabled {
            if !seen.insert(section) {
                return Err(ConfigError::ValidationError(format!(
                    "plugin '{}' is enabled more than once",
                    section
                )));
            }
            self.plugin_config(section)?;
        }

        Ok(())
    }

    /// Resolve one plugin section into a validated [`PluginConfig`].
    ///
    /// # Errors
    /// `MissingSection` if absent, `MissingKey` if `name`/`interval` are
    /// missing, `ValidationError` for non-scalar values or a bad interval.
    pub fn plugin_config(&self, section: &str) -> Result<PluginConfig, ConfigError> {
        if section == MAIN_SECTION {
            return Err(ConfigError::ValidationError(
                "'main' cannot be enabled as a plugin".to_string(),
            ));
        }

        let mapping = self
            .sections
            .get(section)
            .ok_or_else(|| ConfigError::MissingSection(section.to_string()))?;

        let mut values = BTreeMap::new();
        for (key, value) in mapping {
            let key = scalar_to_string(key).ok_or_else(|| {
                ConfigError::ValidationError(format!("section '{}': non-scalar key", section))
            })?;
            let value = value_to_string(value).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "section '{}': value for '{}' must be a scalar or a list of scalars",
                    section, key
                ))
            })?;
            values.insert(key, value);
        }

        PluginConfig::new(section, values)
    }

    /// All enabled plugin sections, in configured order.
    pub fn plugin_configs(&self) -> Result<Vec<PluginConfig>, ConfigError> {
        self.main
            .plugins_enabled
            .iter()
            .map(|section| self.plugin_config(section))
            .collect()
    }

    /// Result channel capacity, `None` when unbounded.
    pub fn channel_capacity(&self) -> Option<usize> {
        match self.main.channel_capacity {
            0 => None,
            n => Some(n),
        }
    }

    fn expand_credentials(&mut self) {
        self.main.submission_url = expand_env_vars(&self.main.submission_url);
        if let Some(user) = &mut self.main.submission_username {
            *user = expand_env_vars(user);
        }
        if let Some(password) = &mut self.main.submission_password {
            *password = expand_env_vars(password);
        }
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

fn value_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Sequence(items) => {
            let parts: Option<Vec<String>> = items.iter().map(scalar_to_string).collect();
            parts.map(|p| p.join("\n"))
        }
        other => scalar_to_string(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const VALID: &str = r#"
main:
  submission_url: "https://metrics.example.com/collectd"
  submission_username: agent
  submission_password: "${TITHE_UNSET_PASSWORD_VAR:-s3cret}"
  plugins_enabled: "ping web"
  channel_capacity: 64
  schedule: drift_corrected
ping:
  name: ping
  interval: 30
  hosts:
    - 1.1.1.1
    - 8.8.8.8
web:
  name: httpcheck
  interval: 60
  sites_https: example.com
unused:
  name: system
"#;

    #[test]
    fn test_load_valid_config() {
        let config = AgentConfig::from_yaml_str(VALID).unwrap();

        assert_eq!(config.main.plugins_enabled, ["ping", "web"]);
        assert_eq!(config.main.submission_password.as_deref(), Some("s3cret"));
        assert_eq!(config.main.submission_timeout, DEFAULT_SUBMISSION_TIMEOUT);
        assert_eq!(config.main.schedule, ScheduleMode::DriftCorrected);
        assert_eq!(config.channel_capacity(), Some(64));

        let plugins = config.plugin_configs().unwrap();
        assert_eq!(plugins.len(), 2);
        assert_eq!(plugins[0].name(), "ping");
        assert_eq!(plugins[0].interval().get(), 30);
        assert_eq!(plugins[0].get_list("hosts"), ["1.1.1.1", "8.8.8.8"]);
        assert_eq!(plugins[1].section(), "web");
        assert_eq!(plugins[1].name(), "httpcheck");
    }

    #[test]
    fn test_enabled_list_as_sequence() {
        let yaml = r#"
main:
  submission_url: "http://localhost:8080/"
  plugins_enabled: [a, b]
a: { name: system, interval: 10 }
b: { name: system, interval: 20 }
"#;
        let config = AgentConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.main.plugins_enabled, ["a", "b"]);
        assert_eq!(config.channel_capacity(), None);
        assert_eq!(config.main.schedule, ScheduleMode::PhaseFixed);
    }

    #[test]
    fn test_missing_section_is_fatal() {
        let yaml = r#"
main:
  submission_url: "http://localhost/"
  plugins_enabled: "ghost"
"#;
        let err = AgentConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection(ref s) if s == "ghost"));
    }

    #[test]
    fn test_missing_name_is_fatal() {
        let yaml = r#"
main:
  submission_url: "http://localhost/"
  plugins_enabled: "p"
p:
  interval: 10
"#;
        let err = AgentConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { key: "name", .. }));
    }

    #[test]
    fn test_duplicate_enabled_plugin_is_rejected() {
        let yaml = r#"
main:
  submission_url: "http://localhost/"
  plugins_enabled: "p p"
p: { name: system, interval: 10 }
"#;
        let err = AgentConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_bad_submission_url() {
        let yaml = r#"
main:
  submission_url: "ftp://localhost/"
"#;
        assert!(AgentConfig::from_yaml_str(yaml).is_err());

        let yaml = r#"
main:
  submission_url: "not a url"
"#;
        assert!(AgentConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_nested_mapping_value_is_rejected() {
        let yaml = r#"
main:
  submission_url: "http://localhost/"
  plugins_enabled: "p"
p:
  name: system
  interval: 10
  nested: { a: 1 }
"#;
        let err = AgentConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tithe.yaml");
        std::fs::write(&path, VALID).unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.main.plugins_enabled.len(), 2);

        let missing = AgentConfig::load(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::IoError(_)));
    }

    #[test]
    fn test_schedule_mode_from_str() {
        assert_eq!(
            ScheduleMode::from_str("phase_fixed").unwrap(),
            ScheduleMode::PhaseFixed
        );
        assert_eq!(
            ScheduleMode::from_str("DRIFT_CORRECTED").unwrap(),
            ScheduleMode::DriftCorrected
        );
        assert!(ScheduleMode::from_str("cron").is_err());
    }
}
