//! TCP/UDP connection check collector.
//!
//! Each configured check connects to a host/port and optionally sends a
//! payload and matches the reply against a regex. A check reports `1` on
//! success and `0` on any failure (refused, timeout, unexpected reply).
//!
//! Checks are listed one per line under `checks`:
//!
//! ```text
//! host;ip_version;proto;port;timeout_secs[;send[;expect_regex]]
//! ```
//!
//! UDP checks must supply both `send` and `expect_regex`. The payload
//! understands `\r`, `\n`, `\t` and `\\` escapes, since checks are
//! newline separated.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use regex::Regex;
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::collector::{CollectionError, Collector, PluginInitError, sample_for};
use crate::config::PluginConfig;
use crate::sample::{DsType, MetricSample};

/// Implementation identifier.
pub const IDENTIFIER: &str = "conncheck";

/// Maximum reply size read for regex matching.
const MAX_REPLY_BYTES: usize = 4096;

/// Transport protocol of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Proto {
    Tcp,
    Udp,
}

/// A single parsed check.
#[derive(Debug, Clone)]
pub struct ConnCheck {
    pub host: String,
    pub ip_version: u8,
    pub proto: Proto,
    pub port: u16,
    pub timeout: Duration,
    pub send: Option<String>,
    pub expect: Option<Regex>,
}

impl ConnCheck {
    /// Parse one `host;ipver;proto;port;timeout[;send[;expect]]` line.
    pub fn parse(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.trim().split(';').collect();
        if fields.len() < 5 {
            return Err(format!("expected at least 5 ';'-separated fields: {line}"));
        }

        let host = fields[0].trim();
        if host.is_empty() {
            return Err(format!("empty host: {line}"));
        }

        let ip_version = match fields[1].trim().parse::<u8>() {
            Ok(v @ (4 | 6)) => v,
            _ => return Err(format!("ip version must be 4 or 6: {line}")),
        };

        let proto: Proto = fields[2]
            .trim()
            .parse()
            .map_err(|_| format!("protocol must be tcp or udp: {line}"))?;

        let port = fields[3]
            .trim()
            .parse::<u16>()
            .map_err(|_| format!("port is not a valid number: {line}"))?;

        let timeout = fields[4]
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| format!("timeout must be a positive number of seconds: {line}"))?;

        let send = fields.get(5).map(|s| unescape(s)).filter(|s| !s.is_empty());
        let expect = match fields.get(6).filter(|s| !s.is_empty()) {
            Some(pattern) => {
                Some(Regex::new(pattern).map_err(|e| format!("invalid regex in {line}: {e}"))?)
            }
            None => None,
        };

        if proto == Proto::Udp && (send.is_none() || expect.is_none()) {
            return Err(format!("udp checks need both a payload and a reply regex: {line}"));
        }

        Ok(Self {
            host: host.to_string(),
            ip_version,
            proto,
            port,
            timeout,
            send,
            expect,
        })
    }

    /// Data source name: `host:ipver:proto:port` with dots replaced.
    pub fn ds_name(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.host.replace('.', "_"),
            self.ip_version,
            self.proto,
            self.port
        )
    }

    async fn resolve(&self) -> Result<SocketAddr, CollectionError> {
        let want_v4 = self.ip_version == 4;
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .find(|addr| addr.is_ipv4() == want_v4)
            .ok_or_else(|| {
                CollectionError::Other(format!(
                    "no IPv{} address for {}",
                    self.ip_version, self.host
                ))
            })
    }

    /// Run the check. `Ok(true)` means healthy.
    pub async fn probe(&self) -> Result<bool, CollectionError> {
        let addr = timeout(self.timeout, self.resolve())
            .await
            .map_err(|_| CollectionError::Timeout)??;

        match self.proto {
            Proto::Tcp => self.probe_tcp(addr).await,
            Proto::Udp => self.probe_udp(addr).await,
        }
    }

    async fn probe_tcp(&self, addr: SocketAddr) -> Result<bool, CollectionError> {
        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CollectionError::Timeout)??;

        if let Some(payload) = &self.send {
            timeout(self.timeout, stream.write_all(payload.as_bytes()))
                .await
                .map_err(|_| CollectionError::Timeout)??;
        }

        let Some(expect) = &self.expect else {
            return Ok(true);
        };

        let mut buf = vec![0u8; MAX_REPLY_BYTES];
        let n = timeout(self.timeout, stream.read(&mut buf))
            .await
            .map_err(|_| CollectionError::Timeout)??;
        Ok(expect.is_match(&String::from_utf8_lossy(&buf[..n])))
    }

    async fn probe_udp(&self, addr: SocketAddr) -> Result<bool, CollectionError> {
        let bind = if addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;

        if let Some(payload) = &self.send {
            socket.send(payload.as_bytes()).await?;
        }

        let mut buf = vec![0u8; MAX_REPLY_BYTES];
        let n = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| CollectionError::Timeout)??;

        Ok(self
            .expect
            .as_ref()
            .is_none_or(|re| re.is_match(&String::from_utf8_lossy(&buf[..n]))))
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => {
                if other != '\\' {
                    out.push('\\');
                }
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Connection check collector.
#[derive(Debug)]
pub struct ConnCheckCollector {
    config: PluginConfig,
    checks: Vec<ConnCheck>,
}

impl ConnCheckCollector {
    /// Build from a plugin section.
    ///
    /// Malformed lines are skipped with a warning; at least one valid check
    /// is required.
    pub fn from_config(config: &PluginConfig) -> Result<Self, PluginInitError> {
        let raw = config
            .get("checks")
            .ok_or_else(|| PluginInitError::invalid(config.section(), "missing 'checks'"))?;

        let checks: Vec<ConnCheck> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match ConnCheck::parse(line) {
                Ok(check) => Some(check),
                Err(e) => {
                    tracing::warn!(plugin = %config.section(), error = %e, "Skipping invalid check");
                    None
                }
            })
            .collect();

        if checks.is_empty() {
            return Err(PluginInitError::invalid(
                config.section(),
                "no valid checks configured",
            ));
        }

        Ok(Self {
            config: config.clone(),
            checks,
        })
    }

    pub fn checks(&self) -> &[ConnCheck] {
        &self.checks
    }
}

#[async_trait::async_trait]
impl Collector for ConnCheckCollector {
    async fn collect(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        let start = Instant::now();
        let outcomes = futures::future::join_all(self.checks.iter().map(|c| c.probe())).await;

        let mut builder = sample_for(IDENTIFIER, &self.config);
        for (check, outcome) in self.checks.iter().zip(outcomes) {
            let healthy = match outcome {
                Ok(healthy) => healthy,
                Err(e) => {
                    tracing::debug!(check = %check.ds_name(), error = %e, "Connection check failed");
                    false
                }
            };
            builder.push(check.ds_name(), DsType::Gauge, f64::from(u8::from(healthy)));
        }

        tracing::debug!(
            plugin = %self.config.section(),
            checks = self.checks.len(),
            duration_ms = start.elapsed().as_millis(),
            "Connection checks finished"
        );
        Ok(builder.build().into_iter().collect())
    }
}
