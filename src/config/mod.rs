//! Configuration module for the Tithe agent.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Submission endpoint and credentials (`main` section)
//! - The ordered list of enabled plugin sections
//! - One opaque key/value section per plugin

mod app;
mod plugin;
mod validation;

pub use app::{AgentConfig, DEFAULT_SUBMISSION_TIMEOUT, MAIN_SECTION, MainConfig, ScheduleMode};
pub use plugin::{INTERVAL_KEY, NAME_KEY, PluginConfig};
pub use validation::{ConfigError, expand_env_vars, parse_duration, split_list};
