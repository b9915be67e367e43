//! Client configuration for the ingestion pipeline.

use std::env;
use std::time::Duration;

use crate::{Error, Result};

pub const DEFAULT_BASE_URL: &str = "https://ingest.traceline.dev";
pub const DEFAULT_FLUSH_AT: usize = 15;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FETCH_RETRY_COUNT: u32 = 3;
pub const DEFAULT_FETCH_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration consumed by the queue, scheduler, sender, and retry loop.
///
/// There is no process-wide singleton: each [`crate::TracelineClient`] owns
/// its own config, queue, timers, and property store.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the ingestion API.
    pub base_url: String,
    /// Public API key, sent as the basic-auth username.
    pub public_key: String,
    /// Secret API key, sent as the basic-auth password.
    pub secret_key: String,
    /// Queue length that triggers an immediate flush.
    pub flush_at: usize,
    /// Interval between timer-driven flushes.
    pub flush_interval: Duration,
    /// Number of retries after the initial delivery attempt.
    pub fetch_retry_count: u32,
    /// Base delay for exponential backoff between retries.
    pub fetch_retry_delay: Duration,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Trace-level sample rate in `[0, 1]`. `None` disables sampling.
    pub sample_rate: Option<f64>,
    /// Master switch; when false every producer call is a no-op.
    pub enabled: bool,
    /// Elevates enqueue/flush logging to debug level.
    pub debug: bool,
    /// Integration label reported in batch metadata.
    pub sdk_integration: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            public_key: String::new(),
            secret_key: String::new(),
            flush_at: DEFAULT_FLUSH_AT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            fetch_retry_count: DEFAULT_FETCH_RETRY_COUNT,
            fetch_retry_delay: DEFAULT_FETCH_RETRY_DELAY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sample_rate: None,
            enabled: true,
            debug: false,
            sdk_integration: "DEFAULT".to_string(),
        }
    }
}

impl ClientConfig {
    /// Build a config from `TRACELINE_*` environment variables.
    ///
    /// `TRACELINE_PUBLIC_KEY` and `TRACELINE_SECRET_KEY` are required;
    /// `TRACELINE_BASE_URL` and `TRACELINE_SAMPLE_RATE` are optional.
    pub fn from_env() -> Result<Self> {
        let public_key = env::var("TRACELINE_PUBLIC_KEY")
            .map_err(|_| Error::Config("TRACELINE_PUBLIC_KEY is not set".to_string()))?;
        let secret_key = env::var("TRACELINE_SECRET_KEY")
            .map_err(|_| Error::Config("TRACELINE_SECRET_KEY is not set".to_string()))?;

        let mut config = Self {
            public_key,
            secret_key,
            ..Default::default()
        };

        if let Ok(url) = env::var("TRACELINE_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(rate) = env::var("TRACELINE_SAMPLE_RATE") {
            match rate.parse::<f64>() {
                Ok(r) => config.sample_rate = Some(r),
                Err(_) => {
                    return Err(Error::Config(format!(
                        "TRACELINE_SAMPLE_RATE is not a number: {}",
                        rate
                    )));
                }
            }
        }

        Ok(config)
    }

    /// Validate hard constraints. Sample-rate range problems are not hard
    /// errors; the sampler warns and fails open at decision time.
    pub fn validate(&self) -> Result<()> {
        if self.flush_at == 0 {
            return Err(Error::Config("flush_at must be at least 1".to_string()));
        }
        if self.base_url.is_empty() {
            return Err(Error::Config("base_url must not be empty".to_string()));
        }
        Ok(())
    }
}
