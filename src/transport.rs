//! HTTP transport abstraction for the ingestion API.
//!
//! The batch sender talks to the network through the [`Transport`] trait so
//! environment-specific clients (or test doubles) can be substituted.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::ClientConfig;
use crate::event::EventEnvelope;
use crate::{Error, Result};

pub(crate) const SDK_NAME: &str = "traceline";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One serialized ingestion request: the batch plus client metadata.
#[derive(Debug, Serialize)]
pub struct BatchRequest<'a> {
    pub batch: &'a [EventEnvelope],
    pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchMetadata {
    pub sdk_name: &'static str,
    pub sdk_version: &'static str,
    pub sdk_integration: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
}

impl BatchMetadata {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        Self {
            sdk_name: SDK_NAME,
            sdk_version: SDK_VERSION,
            sdk_integration: config.sdk_integration.clone(),
            debug: config.debug,
        }
    }
}

/// Raw response handed back by a transport, before interpretation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    /// Parsed `Retry-After` header, when the server sent one.
    pub retry_after: Option<Duration>,
}

/// Injected fetch abstraction.
///
/// Implementations perform exactly one HTTP POST per call and return the
/// raw status/body. Classification of the outcome belongs to the sender,
/// not the transport; only genuine I/O failures are errors here.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, body: serde_json::Value) -> Result<RawResponse>;
}

/// Production transport over reqwest with basic-auth key pair.
pub struct HttpTransport {
    http: reqwest::Client,
    ingestion_url: String,
    public_key: String,
    secret_key: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            http,
            ingestion_url: format!(
                "{}/api/public/ingestion",
                config.base_url.trim_end_matches('/')
            ),
            public_key: config.public_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, body: serde_json::Value) -> Result<RawResponse> {
        let response = self
            .http
            .post(&self.ingestion_url)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .header("content-type", "application/json")
            .header("x-traceline-sdk-name", SDK_NAME)
            .header("x-traceline-sdk-version", SDK_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        Ok(RawResponse {
            status,
            body,
            retry_after,
        })
    }
}
