//! ICMP ping collector.
//!
//! Shells out to the system `ping` binary once per host per cycle, all hosts
//! concurrently, and reports every reply latency plus the packet loss
//! percentage. Using the binary avoids needing raw-socket privileges.
//!
//! Keys:
//! - `hosts`: whitespace/newline separated targets (required)
//! - `binary`: ping executable (default `ping`)
//! - `count`: echo requests per host, also used as the `-w` deadline
//!   (default `interval - 1`, at least 1)

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use tokio::process::Command;

use crate::collector::{CollectionError, Collector, PluginInitError, sample_for};
use crate::config::PluginConfig;
use crate::sample::MetricSample;

/// Implementation identifier.
pub const IDENTIFIER: &str = "ping";

const DEFAULT_BINARY: &str = "ping";

fn loss_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([\d.]+)% packet loss").expect("failed to compile loss regex"))
}

fn latency_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=(\S+)\s").expect("failed to compile latency regex"))
}

/// Parsed output of one ping run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingOutput {
    /// Round-trip times in milliseconds, in reply order.
    pub latencies: Vec<f64>,
    /// Packet loss percentage from the summary, if present.
    pub loss: Option<f64>,
}

/// Parse the stdout of `ping`.
///
/// The loss summary is only searched for in the last three lines.
pub fn parse_ping_output(stdout: &str) -> PingOutput {
    let lines: Vec<&str> = stdout.trim().lines().collect();

    let loss = lines
        .iter()
        .rev()
        .take(3)
        .rev()
        .find_map(|line| loss_regex().captures(line))
        .and_then(|caps| caps[1].parse::<f64>().ok());

    let latencies = lines
        .iter()
        .filter_map(|line| latency_regex().captures(line))
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .collect();

    PingOutput { latencies, loss }
}

/// Ping collector.
#[derive(Debug)]
pub struct PingCollector {
    config: PluginConfig,
    hosts: Vec<String>,
    binary: String,
    count: u64,
}

impl PingCollector {
    /// Build from a plugin section.
    pub fn from_config(config: &PluginConfig) -> Result<Self, PluginInitError> {
        let section = config.section();

        let hosts = config.get_list("hosts");
        if hosts.is_empty() {
            return Err(PluginInitError::invalid(section, "'hosts' must list at least one host"));
        }

        let binary = config
            .get("binary")
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BINARY)
            .to_string();

        let default_count = config.interval().get().saturating_sub(1).max(1);
        let count = config
            .get_parsed_or("count", default_count)
            .map_err(|e| PluginInitError::invalid(section, e))?;
        if count == 0 {
            return Err(PluginInitError::invalid(section, "'count' must be at least 1"));
        }

        Ok(Self {
            config: config.clone(),
            hosts,
            binary,
            count,
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    async fn ping(&self, host: &str) -> Result<PingOutput, CollectionError> {
        let count = self.count.to_string();
        let output = Command::new(&self.binary)
            .args(["-c", &count, "-w", &count, host])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let parsed = parse_ping_output(&String::from_utf8_lossy(&output.stdout));

        // ping exits non-zero on packet loss; only treat it as a failure when
        // nothing usable was printed.
        if parsed.loss.is_none() && parsed.latencies.is_empty() {
            return Err(CollectionError::CommandFailed {
                command: format!("{} {}", self.binary, host),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(parsed)
    }

    fn samples_for(&self, host: &str, output: &PingOutput) -> Vec<MetricSample> {
        let base = sample_for(IDENTIFIER, &self.config)
            .type_name(IDENTIFIER)
            .type_instance(host);

        let mut lat = base.clone();
        for latency in &output.latencies {
            lat = lat.gauge("lat", *latency);
        }

        let loss = output
            .loss
            .or_else(|| output.latencies.is_empty().then_some(100.0));
        let loss = loss.and_then(|pct| base.gauge("loss", pct).build());

        lat.build().into_iter().chain(loss).collect()
    }
}

#[async_trait::async_trait]
impl Collector for PingCollector {
    async fn collect(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        let start = Instant::now();
        let results = futures::future::join_all(self.hosts.iter().map(|h| self.ping(h))).await;

        let mut samples = Vec::new();
        let mut failures = 0usize;
        for (host, result) in self.hosts.iter().zip(results) {
            match result {
                Ok(output) => samples.extend(self.samples_for(host, &output)),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(plugin = %self.config.section(), host = %host, error = %e, "Ping failed");
                }
            }
        }

        if samples.is_empty() && failures > 0 {
            return Err(CollectionError::Other(format!(
                "all {failures} ping targets failed"
            )));
        }

        tracing::debug!(
            plugin = %self.config.section(),
            hosts = self.hosts.len(),
            count = samples.len(),
            duration_ms = start.elapsed().as_millis(),
            "Ping cycle finished"
        );
        Ok(samples)
    }
}
