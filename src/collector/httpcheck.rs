//! HTTP/HTTPS site health collector.
//!
//! Fetches `https://<site>` for every entry in `sites_https` and
//! `http://<site>` for every entry in `sites_http`. A site reports `1` when
//! it answers with status 200 and `0` otherwise, including connection errors
//! and timeouts.
//!
//! Optional keys:
//! - `timeout`: per-request timeout, humantime format (default `10s`)
//! - `max_workers`: concurrent requests per cycle (default 8)

use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Client, StatusCode};

use crate::collector::{CollectionError, Collector, PluginInitError, sample_for};
use crate::config::{PluginConfig, parse_duration};
use crate::sample::{DsType, MetricSample};

/// Implementation identifier.
pub const IDENTIFIER: &str = "httpcheck";

/// Default request timeout (10 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of concurrent requests.
const DEFAULT_MAX_WORKERS: usize = 8;

/// One site to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub site: String,
    pub https: bool,
}

impl Site {
    pub fn url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{scheme}://{}", self.site)
    }

    /// Data source name, e.g. `https.example_com`.
    pub fn ds_name(&self) -> String {
        let prefix = if self.https { "https." } else { "http." };
        format!("{prefix}{}", self.site.replace('.', "_"))
    }
}

/// Site health collector.
pub struct HttpCheckCollector {
    config: PluginConfig,
    sites: Vec<Site>,
    client: Client,
    max_workers: usize,
}

impl std::fmt::Debug for HttpCheckCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCheckCollector")
            .field("section", &self.config.section())
            .field("sites", &self.sites)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl HttpCheckCollector {
    /// Build from a plugin section.
    ///
    /// # Errors
    /// `InvalidConfig` when no sites are listed or an optional key is malformed.
    pub fn from_config(config: &PluginConfig) -> Result<Self, PluginInitError> {
        let section = config.section();

        let sites: Vec<Site> = config
            .get_list("sites_https")
            .into_iter()
            .map(|site| Site { site, https: true })
            .chain(
                config
                    .get_list("sites_http")
                    .into_iter()
                    .map(|site| Site { site, https: false }),
            )
            .collect();
        if sites.is_empty() {
            return Err(PluginInitError::invalid(
                section,
                "at least one of 'sites_https' or 'sites_http' must list a site",
            ));
        }

        let timeout = match config.get("timeout") {
            Some(raw) => {
                parse_duration(raw).map_err(|e| PluginInitError::invalid(section, e.to_string()))?
            }
            None => DEFAULT_TIMEOUT,
        };

        let max_workers = config
            .get_parsed_or("max_workers", DEFAULT_MAX_WORKERS)
            .map_err(|e| PluginInitError::invalid(section, e))?
            .max(1);

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PluginInitError::Unavailable {
                plugin: section.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            config: config.clone(),
            sites,
            client,
            max_workers,
        })
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    async fn check(client: &Client, site: &Site) -> bool {
        let url = site.url();
        match client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                if status != StatusCode::OK {
                    tracing::debug!(url = %url, status = status.as_u16(), "Unexpected HTTP status");
                }
                status == StatusCode::OK
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "HTTP check failed");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl Collector for HttpCheckCollector {
    async fn collect(&mut self) -> Result<Vec<MetricSample>, CollectionError> {
        let start = Instant::now();
        let client = self.client.clone();

        let results: Vec<bool> = futures::stream::iter(self.sites.clone())
            .map(move |site| {
                let client = client.clone();
                async move { Self::check(&client, &site).await }
            })
            .buffered(self.max_workers)
            .collect()
            .await;

        let mut builder = sample_for(IDENTIFIER, &self.config);
        for (site, healthy) in self.sites.iter().zip(results) {
            builder.push(site.ds_name(), DsType::Gauge, f64::from(u8::from(healthy)));
        }

        tracing::debug!(
            plugin = %self.config.section(),
            sites = self.sites.len(),
            duration_ms = start.elapsed().as_millis(),
            "HTTP checks finished"
        );
        Ok(builder.build().into_iter().collect())
    }
}
