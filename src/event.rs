//! Event envelopes: the unit of work in the ingestion queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Logical ingestion endpoint for one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestionRoute {
    TraceCreate,
    SpanCreate,
    SpanUpdate,
    GenerationCreate,
    GenerationUpdate,
    EventCreate,
    ScoreCreate,
    SdkLog,
}

impl IngestionRoute {
    /// Create-vs-update semantics for this route.
    pub fn method(self) -> EnvelopeMethod {
        match self {
            IngestionRoute::SpanUpdate | IngestionRoute::GenerationUpdate => EnvelopeMethod::Patch,
            _ => EnvelopeMethod::Post,
        }
    }
}

/// HTTP-method semantics of an envelope (create vs. update).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvelopeMethod {
    Post,
    Patch,
}

/// Terminal failure reported to a per-envelope completion channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    pub message: String,
    pub status: Option<u16>,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<&crate::Error> for DeliveryError {
    fn from(err: &crate::Error) -> Self {
        Self {
            message: err.to_string(),
            status: err.status_code(),
        }
    }
}

/// Receiver half of a per-envelope completion channel.
///
/// Resolves exactly once with the envelope's fate: `Ok(())` on delivery,
/// `Err(DeliveryError)` on a non-retryable failure or retry exhaustion.
pub type DeliveryReceipt = oneshot::Receiver<std::result::Result<(), DeliveryError>>;

pub(crate) type CompletionSender = oneshot::Sender<std::result::Result<(), DeliveryError>>;

/// One queued unit of work bound for the ingestion API.
///
/// The `timestamp` is an ordering hint for the server only; local ordering
/// is FIFO by enqueue. The completion channel does not survive queue
/// persistence; restored envelopes carry `None`.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub route: IngestionRoute,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
    #[serde(skip)]
    pub(crate) completion: Option<CompletionSender>,
}

impl EventEnvelope {
    pub fn new(route: IngestionRoute, body: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            route,
            timestamp: Utc::now(),
            body,
            completion: None,
        }
    }

    pub fn method(&self) -> EnvelopeMethod {
        self.route.method()
    }

    /// Attach a completion channel, returning the receiver.
    pub fn completion_channel(&mut self) -> DeliveryReceipt {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    /// Resolve the completion channel, if any. Dropped receivers are fine.
    pub(crate) fn resolve(&mut self, result: std::result::Result<(), DeliveryError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}
