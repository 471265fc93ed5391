//! Submission clients.
//!
//! [`HttpSubmitClient`] speaks the collectd `write_http` JSON format: one
//! JSON array per batch, one object per sample.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;

use crate::config::MainConfig;
use crate::sample::{DsType, MetricSample};
use crate::submit::SubmissionError;

/// Delivers a batch of samples to a backend.
///
/// Called only from the delivery worker thread, so implementations may block.
pub trait SubmitClient: Send + 'static {
    /// Submit one batch in a single request.
    fn submit(&mut self, batch: &[MetricSample]) -> Result<(), SubmissionError>;
}

/// One collectd `write_http` JSON record.
#[derive(Debug, Serialize)]
struct WireRecord<'a> {
    values: &'a [f64],
    dstypes: &'a [DsType],
    dsnames: &'a [String],
    /// Epoch seconds with millisecond precision.
    time: f64,
    interval: u64,
    host: &'a str,
    plugin: &'a str,
    plugin_instance: &'a str,
    #[serde(rename = "type")]
    type_: &'a str,
    type_instance: &'a str,
}

impl<'a> From<&'a MetricSample> for WireRecord<'a> {
    fn from(sample: &'a MetricSample) -> Self {
        Self {
            values: sample.values(),
            dstypes: sample.ds_types(),
            dsnames: sample.ds_names(),
            time: sample.time().timestamp_millis() as f64 / 1000.0,
            interval: sample.interval().get(),
            host: sample.host(),
            plugin: sample.plugin(),
            plugin_instance: sample.plugin_instance().unwrap_or_default(),
            type_: sample.type_name(),
            type_instance: sample.type_instance().unwrap_or_default(),
        }
    }
}

/// Encode a batch as a collectd `write_http` JSON array.
pub fn encode_batch(batch: &[MetricSample]) -> Result<Vec<u8>, SubmissionError> {
    let records: Vec<WireRecord<'_>> = batch.iter().map(WireRecord::from).collect();
    Ok(serde_json::to_vec(&records)?)
}

/// HTTP POST client with optional basic auth.
pub struct HttpSubmitClient {
    url: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
    // Built on first use so the blocking runtime lives on the delivery thread.
    client: Option<Client>,
}

impl std::fmt::Debug for HttpSubmitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSubmitClient")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HttpSubmitClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            timeout,
            client: None,
        }
    }

    /// Set HTTP basic auth credentials.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    /// Build from the `main` config section.
    pub fn from_config(config: &MainConfig) -> Self {
        let client = Self::new(&config.submission_url, config.submission_timeout);
        match config.submission_username.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => client.with_basic_auth(user, config.submission_password.clone()),
            None => client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn client(&mut self) -> Result<&Client, SubmissionError> {
        if self.client.is_none() {
            let client = Client::builder().timeout(self.timeout).build()?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| SubmissionError::Other("http client unavailable".to_string()))
    }
}

impl SubmitClient for HttpSubmitClient {
    fn submit(&mut self, batch: &[MetricSample]) -> Result<(), SubmissionError> {
        let body = encode_batch(batch)?;
        let url = self.url.clone();
        let auth = self.username.clone().map(|u| (u, self.password.clone()));

        let mut request = self
            .client()?
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some((username, password)) = auth {
            request = request.basic_auth(username, password);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(SubmissionError::Status(status.as_u16()));
        }
        Ok(())
    }
}
