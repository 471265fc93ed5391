//! Metric sample data model.
//!
//! A [`MetricSample`] is one labeled set of numeric readings produced by a
//! collection cycle. Samples are immutable once built; the only way to create
//! one is through [`SampleBuilder`], which appends `(ds_name, ds_type, value)`
//! triples so the three vectors always have the same length.

use std::num::NonZeroU64;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Host label used when the local host name cannot be determined.
const FALLBACK_HOST: &str = "localhost";

/// Data source kind for a single value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DsType {
    /// Instantaneous reading (temperature, latency, up/down).
    Gauge,
    /// Monotonically increasing counter (bytes sent, queries served).
    Counter,
}

/// An immutable set of readings from one collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    plugin: String,
    plugin_instance: Option<String>,
    type_: Option<String>,
    type_instance: Option<String>,
    host: Option<String>,
    ds_names: Vec<String>,
    ds_types: Vec<DsType>,
    values: Vec<f64>,
    interval: NonZeroU64,
    time: DateTime<Utc>,
}

impl MetricSample {
    /// Start building a sample for `plugin` reported every `interval` seconds.
    pub fn builder(plugin: impl Into<String>, interval: NonZeroU64) -> SampleBuilder {
        SampleBuilder {
            plugin: plugin.into(),
            plugin_instance: None,
            type_: None,
            type_instance: None,
            host: None,
            ds_names: Vec::new(),
            ds_types: Vec::new(),
            values: Vec::new(),
            interval,
            time: None,
        }
    }

    /// Source identifier.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn plugin_instance(&self) -> Option<&str> {
        self.plugin_instance.as_deref()
    }

    /// Metric family; defaults to the plugin name.
    pub fn type_name(&self) -> &str {
        self.type_.as_deref().unwrap_or(&self.plugin)
    }

    pub fn type_instance(&self) -> Option<&str> {
        self.type_instance.as_deref()
    }

    /// Origin label; defaults to the local host name.
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or_else(|| local_hostname())
    }

    pub fn ds_names(&self) -> &[String] {
        &self.ds_names
    }

    pub fn ds_types(&self) -> &[DsType] {
        &self.ds_types
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Reporting interval in seconds.
    pub fn interval(&self) -> NonZeroU64 {
        self.interval
    }

    /// When the readings were taken.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Number of values carried by this sample (never zero).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always `false`: empty samples cannot be built.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Builder for [`MetricSample`].
#[derive(Debug, Clone)]
pub struct SampleBuilder {
    plugin: String,
    plugin_instance: Option<String>,
    type_: Option<String>,
    type_instance: Option<String>,
    host: Option<String>,
    ds_names: Vec<String>,
    ds_types: Vec<DsType>,
    values: Vec<f64>,
    interval: NonZeroU64,
    time: Option<DateTime<Utc>>,
}

impl SampleBuilder {
    /// Set the plugin instance label.
    pub fn plugin_instance(mut self, instance: impl Into<String>) -> Self {
        self.plugin_instance = Some(instance.into());
        self
    }

    /// Set the metric family.
    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_ = Some(type_name.into());
        self
    }

    /// Set the sub-entity label.
    pub fn type_instance(mut self, instance: impl Into<String>) -> Self {
        self.type_instance = Some(instance.into());
        self
    }

    /// Override the origin host label.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Override the sample timestamp (defaults to build time).
    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Append one reading.
    pub fn value(mut self, ds_name: impl Into<String>, ds_type: DsType, value: f64) -> Self {
        self.push(ds_name, ds_type, value);
        self
    }

    /// Append a gauge reading.
    pub fn gauge(self, ds_name: impl Into<String>, value: f64) -> Self {
        self.value(ds_name, DsType::Gauge, value)
    }

    /// Append a counter reading.
    pub fn counter(self, ds_name: impl Into<String>, value: f64) -> Self {
        self.value(ds_name, DsType::Counter, value)
    }

    /// Append one reading in place (for loops).
    pub fn push(&mut self, ds_name: impl Into<String>, ds_type: DsType, value: f64) {
        self.ds_names.push(ds_name.into());
        self.ds_types.push(ds_type);
        self.values.push(value);
    }

    /// Finish the sample. Returns `None` if no values were added.
    pub fn build(self) -> Option<MetricSample> {
        if self.values.is_empty() {
            return None;
        }
        Some(MetricSample {
            plugin: self.plugin,
            plugin_instance: self.plugin_instance,
            type_: self.type_,
            type_instance: self.type_instance,
            host: self.host,
            ds_names: self.ds_names,
            ds_types: self.ds_types,
            values: self.values,
            interval: self.interval,
            time: self.time.unwrap_or_else(Utc::now),
        })
    }
}

/// Local host name, resolved once per process.
pub fn local_hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        sysinfo::System::host_name()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| FALLBACK_HOST.to_string())
    })
}
