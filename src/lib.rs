//! # traceline
//!
//! Client-side observability SDK for LLM applications.
//!
//! Applications emit structured trace and observation events (spans,
//! generations, events, scores) describing language-model calls and the
//! surrounding application logic. The SDK accumulates those events in an
//! in-memory queue, flushes them in size- or time-triggered batches, retries
//! failed deliveries with exponential backoff, and shuts down
//! deterministically without dropping queued work.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use traceline::TracelineClient;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), traceline::Error> {
//!     let client = TracelineClient::builder()
//!         .public_key("pk-tl-...")
//!         .secret_key("sk-tl-...")
//!         .build()?;
//!
//!     let trace = client
//!         .trace()
//!         .name("user-request")
//!         .input(json!({"query": "What is 2 + 2?"}))
//!         .create();
//!
//!     let generation = trace
//!         .generation()
//!         .name("llm-completion")
//!         .model("gpt-4o")
//!         .create();
//!
//!     generation.update().output(json!({"content": "4"})).apply();
//!
//!     // Producer calls never block on network I/O; shutdown drains the
//!     // queue and waits for all in-flight deliveries.
//!     client.shutdown_async().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery contract
//!
//! At-least-once, FIFO by enqueue order. A batch that fails with a retryable
//! error (network, timeout, 5xx, 429) is retried in place with exponential
//! backoff up to `fetch_retry_count` retries; a non-retryable failure (4xx)
//! resolves the batch immediately. Either way every envelope's completion
//! channel fires exactly once.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

mod backoff;
mod bus;
mod client;
mod config;
mod event;
mod queue;
mod retry;
mod sampler;
mod sender;
mod storage;
mod transport;
mod worker;

pub use backoff::ExponentialBackoff;
pub use bus::{FlushSummary, Notification, NotificationBus};
pub use client::{
    ClientBuilder, EventBuilder, GenerationBuilder, ObservationHandle, ObservationKind,
    ObservationUpdateBuilder, ScoreBuilder, SpanBuilder, TraceBuilder, TraceHandle,
    TraceUpdateBuilder, TracelineClient,
};
pub use config::ClientConfig;
pub use event::{DeliveryError, DeliveryReceipt, EnvelopeMethod, EventEnvelope, IngestionRoute};
pub use sampler::is_in_sample;
pub use storage::{MemoryStore, NoopStore, PersistedProperty, PropertyStore};
pub use transport::{BatchRequest, HttpTransport, RawResponse, Transport};

/// Error type for traceline operations.
///
/// Producer-facing calls never surface these synchronously; delivery
/// failures reach the caller only through [`TracelineClient::flush_async`],
/// [`TracelineClient::shutdown_async`], or per-envelope completion channels.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Ingestion API returned an error response.
    #[error("API error (status {status:?}): {message}")]
    Api {
        message: String,
        status: Option<u16>,
    },

    /// Authentication with the ingestion API failed.
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Network connectivity or request failed.
    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Ingestion API rate limit exceeded.
    #[error("Rate limit exceeded (retry after {retry_after:?})")]
    RateLimit {
        retry_after: Option<std::time::Duration>,
    },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted after the client shut down.
    #[error("Client has been shut down")]
    ClientShutdown,
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::RateLimit { .. } => true,
            Error::Api {
                status: Some(500..=599),
                ..
            } => true,
            _ => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => *status,
            Error::RateLimit { .. } => Some(429),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Error::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
