//! Host load, uptime and memory collector backed by `sysinfo`.
//!
//! Emits three samples per cycle:
//! - type `load`: `shortterm`, `midterm`, `longterm` gauges
//! - type `uptime`: seconds since boot
//! - type `memory`: `used`, `available`, `total` in bytes
//!
//! The optional `include` key limits output to a subset of
//! `load uptime memory`.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::collector::{CollectionError, Collector, PluginInitError, sample_for};
use crate::config::PluginConfig;
use crate::sample::MetricSample;

/// Implementation identifier.
pub const IDENTIFIER: &str = "system";

const KINDS: [&str; 3] = ["load", "uptime", "memory"];

/// System statistics collector.
pub struct SystemCollector {
    config: PluginConfig,
    system: System,
    load: bool,
    uptime: bool,
    memory: bool,
}

impl std::fmt::Debug for SystemCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCollector")
            .field("section", &self.config.section())
            .field("load", &self.load)
            .field("uptime", &self.uptime)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl SystemCollector {
    /// Build from a plugin section.
    pub fn from_config(config: &PluginConfig) -> Result<Self, PluginInitError> {
        let include = config.get_list("include");
        if let Some(bad) = include.iter().find(|k| !KINDS.contains(&k.as_str())) {
            return Err(PluginInitError::invalid(
                config.section(),
                format!("unknown 'include' entry '{bad}', expected one of {KINDS:?}"),
            ));
        }
        let wants = |kind: &str| include.is_empty() || include.iter().any(|k| k == kind);

        Ok(Self {
            config: config.clone(),
            system: System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            ),
            load: wants("load"),
            uptime: wants("uptime"),
            memory: wants("memory"),
        })
    }
}

#[async_trait::async_trait]
impl Collector for SystemCollector {
    async fn collect(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        let mut samples = Vec::with_capacity(KINDS.len());

        if self.load {
            let load = System::load_average();
            samples.extend(
                sample_for(IDENTIFIER, &self.config)
                    .type_name("load")
                    .gauge("shortterm", load.one)
                    .gauge("midterm", load.five)
                    .gauge("longterm", load.fifteen)
                    .build(),
            );
        }

        if self.uptime {
            samples.extend(
                sample_for(IDENTIFIER, &self.config)
                    .type_name("uptime")
                    .gauge("value", System::uptime() as f64)
                    .build(),
            );
        }

        if self.memory {
            self.system.refresh_memory();
            samples.extend(
                sample_for(IDENTIFIER, &self.config)
                    .type_name("memory")
                    .gauge("used", self.system.used_memory() as f64)
                    .gauge("available", self.system.available_memory() as f64)
                    .gauge("total", self.system.total_memory() as f64)
                    .build(),
            );
        }

        tracing::debug!(plugin = %self.config.section(), count = samples.len(), "System stats collected");
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> PluginConfig {
        let mut all = vec![("name", "system"), ("interval", "10")];
        all.extend_from_slice(pairs);
        PluginConfig::from_pairs("host", all).unwrap()
    }

    #[tokio::test]
    async fn test_collect_all_kinds() {
        let mut collector = SystemCollector::from_config(&config(&[])).unwrap();
        let samples = collector.collect().await.unwrap();

        let types: Vec<&str> = samples.iter().map(|s| s.type_name()).collect();
        assert_eq!(types, ["load", "uptime", "memory"]);

        // Section name differs from the identifier.
        assert!(samples.iter().all(|s| s.plugin() == "system"));
        assert!(samples.iter().all(|s| s.plugin_instance() == Some("host")));

        let memory = &samples[2];
        assert_eq!(memory.ds_names(), ["used", "available", "total"]);
        assert!(memory.values()[2] >= memory.values()[0]);
    }

    #[tokio::test]
    async fn test_include_filters_output() {
        let mut collector = SystemCollector::from_config(&config(&[("include", "memory")])).unwrap();
        let samples = collector.collect().await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].type_name(), "memory");
    }

    #[test]
    fn test_unknown_include_is_rejected() {
        let err = SystemCollector::from_config(&config(&[("include", "disk")])).unwrap_err();
        assert!(err.to_string().contains("disk"));
    }
}
