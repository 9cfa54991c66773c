use std::time::Duration;

use log::info;
use reqwest::Client;
use url::Url;

use crate::config::{InfluxConfig, SinkConfig};
use crate::error::SinkError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the InfluxDB 1.x API
pub struct InfluxClient {
    http: Client,
    base: Url,
    username: String,
    password: String,
}

impl InfluxClient {
    /// Create a client for the configured server
    ///
    /// # Arguments
    /// * `config` - Server, port and credentials
    ///
    /// # Returns
    /// Result containing the client; nothing is sent until `ping` or a write
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        info!(
            "connecting to the influxDB server:{}:{}",
            config.server, config.port
        );
        let base = Url::parse(&format!("http://{}:{}", config.server, config.port))?;
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(InfluxClient {
            http,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// `GET /ping`; any 2xx means the server is up
    pub async fn ping(&self) -> Result<(), SinkError> {
        let response = self
            .http
            .get(self.base.join("ping")?)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        check_status(response).await
    }

    /// `POST /write` with one or more line-protocol lines
    ///
    /// # Arguments
    /// * `sink` - Database and retention policy to write into
    /// * `body` - Newline-separated line-protocol lines
    ///
    /// # Returns
    /// Result indicating success, or `SinkError::Status` for a non-2xx answer
    pub async fn write_lines(&self, sink: &SinkConfig, body: String) -> Result<(), SinkError> {
        let response = self
            .http
            .post(write_url(&self.base, sink)?)
            .basic_auth(&self.username, Some(&self.password))
            .body(body)
            .send()
            .await?;
        check_status(response).await
    }
}

pub(crate) fn write_url(base: &Url, sink: &SinkConfig) -> Result<Url, SinkError> {
    let mut url = base.join("write")?;
    url.query_pairs_mut()
        .append_pair("db", &sink.database)
        .append_pair("rp", &sink.retention_policy)
        .append_pair("precision", "ns");
    Ok(url)
}

async fn check_status(response: reqwest::Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Status {
        status: status.as_u16(),
        body,
    })
}
