//! Batch sender: turns one drained batch into a single ingestion request
//! and interprets the response.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::bus::{FlushSummary, Notification, NotificationBus};
use crate::config::ClientConfig;
use crate::event::{DeliveryError, EventEnvelope};
use crate::retry::{self, Attempt, RetryPolicy};
use crate::transport::{BatchMetadata, BatchRequest, RawResponse, Transport};
use crate::{Error, Result};

/// Per-item failure extracted from a multi-status response.
#[derive(Debug, Clone)]
struct ItemFailure {
    status: Option<u16>,
    message: String,
}

/// Final per-item view of one delivered batch. Envelopes absent from
/// `failures` succeeded.
#[derive(Debug, Default)]
struct BatchReport {
    failures: HashMap<String, ItemFailure>,
}

pub(crate) struct BatchSender {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    metadata: BatchMetadata,
}

impl BatchSender {
    pub fn new(transport: Arc<dyn Transport>, config: &ClientConfig) -> Self {
        Self {
            transport,
            policy: RetryPolicy::new(config.fetch_retry_count, config.fetch_retry_delay),
            metadata: BatchMetadata::from_config(config),
        }
    }

    /// Deliver one batch, resolving every envelope's completion exactly once
    /// and emitting a single flush notification for the finalized outcome.
    ///
    /// Returns the terminal error when the whole batch failed, so
    /// `flush_async` callers can observe it; per-envelope fates are already
    /// settled by then either way.
    pub async fn deliver(&self, mut batch: Vec<EventEnvelope>, bus: &NotificationBus) -> Result<()> {
        debug_assert!(!batch.is_empty());
        let batch_size = batch.len();

        let body = match serde_json::to_value(BatchRequest {
            batch: &batch,
            metadata: self.metadata.clone(),
        }) {
            Ok(body) => body,
            Err(e) => {
                let error = Error::Json(e);
                let delivery_error = DeliveryError::from(&error);
                for envelope in &mut batch {
                    envelope.resolve(Err(delivery_error.clone()));
                }
                bus.emit(Notification::Flush(FlushSummary {
                    batch_size,
                    delivered: 0,
                    failed: batch_size,
                }));
                return Err(error);
            }
        };

        let result = retry::run_with_retry(&self.policy, |attempt| {
            let transport = self.transport.clone();
            let body = body.clone();
            async move {
                debug!(attempt, batch_size, "Sending event batch");
                match transport.execute(body).await {
                    Ok(response) => interpret_response(response),
                    Err(e) if e.is_retryable() => Attempt::Retryable {
                        retry_after: e.retry_after(),
                        error: e,
                    },
                    Err(e) => Attempt::Fatal(e),
                }
            }
        })
        .await;

        match result {
            Ok(report) => {
                let failed = report.failures.len();
                for envelope in &mut batch {
                    match report.failures.get(&envelope.id) {
                        Some(failure) => envelope.resolve(Err(DeliveryError {
                            message: failure.message.clone(),
                            status: failure.status,
                        })),
                        None => envelope.resolve(Ok(())),
                    }
                }
                bus.emit(Notification::Flush(FlushSummary {
                    batch_size,
                    delivered: batch_size - failed,
                    failed,
                }));
                Ok(())
            }
            Err(e) => {
                let delivery_error = DeliveryError::from(&e);
                for envelope in &mut batch {
                    envelope.resolve(Err(delivery_error.clone()));
                }
                bus.emit(Notification::Flush(FlushSummary {
                    batch_size,
                    delivered: 0,
                    failed: batch_size,
                }));
                Err(e)
            }
        }
    }
}

/// Multi-status (207) response body: the route accepts partial failure.
#[derive(Debug, Deserialize)]
struct MultiStatusBody {
    #[serde(default)]
    successes: Vec<MultiStatusItem>,
    #[serde(default)]
    errors: Vec<MultiStatusError>,
}

#[derive(Debug, Deserialize)]
struct MultiStatusItem {
    #[allow(dead_code)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct MultiStatusError {
    id: String,
    status: Option<u16>,
    message: Option<String>,
    error: Option<String>,
}

fn interpret_response(response: RawResponse) -> Attempt<BatchReport> {
    match response.status {
        207 => match serde_json::from_str::<MultiStatusBody>(&response.body) {
            Ok(multi) => {
                let failures = multi
                    .errors
                    .into_iter()
                    .map(|e| {
                        let message = e
                            .message
                            .or(e.error)
                            .unwrap_or_else(|| "unknown ingestion error".to_string());
                        (
                            e.id,
                            ItemFailure {
                                status: e.status,
                                message,
                            },
                        )
                    })
                    .collect();
                Attempt::Done(BatchReport { failures })
            }
            Err(e) => Attempt::Fatal(Error::Json(e)),
        },
        200..=299 => Attempt::Done(BatchReport::default()),
        401 | 403 => Attempt::Fatal(Error::Auth {
            message: truncate(&response.body),
        }),
        429 => Attempt::Retryable {
            error: Error::RateLimit {
                retry_after: response.retry_after,
            },
            retry_after: response.retry_after,
        },
        status @ 500..=599 => Attempt::Retryable {
            retry_after: response.retry_after,
            error: Error::Api {
                message: truncate(&response.body),
                status: Some(status),
            },
        },
        status => Attempt::Fatal(Error::Api {
            message: truncate(&response.body),
            status: Some(status),
        }),
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::IngestionRoute;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        responses: Mutex<Vec<Result<RawResponse>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<RawResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn execute(&self, _body: serde_json::Value) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(RawResponse {
                    status: 200,
                    body: String::new(),
                    retry_after: None,
                })
            } else {
                responses.remove(0)
            }
        }
    }

    fn ok(status: u16, body: &str) -> Result<RawResponse> {
        Ok(RawResponse {
            status,
            body: body.to_string(),
            retry_after: None,
        })
    }

    fn config(retries: u32) -> ClientConfig {
        ClientConfig {
            fetch_retry_count: retries,
            fetch_retry_delay: std::time::Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn batch_of(n: usize) -> Vec<EventEnvelope> {
        (0..n)
            .map(|i| EventEnvelope::new(IngestionRoute::EventCreate, json!({"n": i})))
            .collect()
    }

    #[tokio::test]
    async fn test_success_resolves_all_envelopes() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(200, "{}")]));
        let sender = BatchSender::new(transport.clone(), &config(3));
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();

        let mut batch = batch_of(2);
        let receipts: Vec<_> = batch.iter_mut().map(|e| e.completion_channel()).collect();

        sender.deliver(batch, &bus).await.unwrap();

        for receipt in receipts {
            assert_eq!(receipt.await.unwrap(), Ok(()));
        }
        match rx.recv().await.unwrap() {
            Notification::Flush(s) => {
                assert_eq!(s.batch_size, 2);
                assert_eq!(s.delivered, 2);
                assert_eq!(s.failed, 0);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_resolves_per_item() {
        let mut batch = batch_of(2);
        let bad_id = batch[1].id.clone();
        let body = format!(
            r#"{{"successes":[{{"id":"{}"}}],"errors":[{{"id":"{}","status":400,"message":"invalid score"}}]}}"#,
            batch[0].id, bad_id
        );

        let transport = Arc::new(ScriptedTransport::new(vec![ok(207, &body)]));
        let sender = BatchSender::new(transport, &config(3));
        let bus = NotificationBus::new();

        let ok_receipt = batch[0].completion_channel();
        let bad_receipt = batch[1].completion_channel();

        sender.deliver(batch, &bus).await.unwrap();

        assert_eq!(ok_receipt.await.unwrap(), Ok(()));
        let err = bad_receipt.await.unwrap().unwrap_err();
        assert_eq!(err.status, Some(400));
        assert!(err.message.contains("invalid score"));
    }

    #[tokio::test]
    async fn test_4xx_fails_without_consuming_retries() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(400, "bad request")]));
        let sender = BatchSender::new(transport.clone(), &config(3));
        let bus = NotificationBus::new();

        let mut batch = batch_of(1);
        let receipt = batch[0].completion_channel();

        let result = sender.deliver(batch, &bus).await;
        assert!(matches!(
            result,
            Err(Error::Api {
                status: Some(400),
                ..
            })
        ));
        assert_eq!(transport.calls(), 1);
        assert!(receipt.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_5xx_retries_then_exhausts() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(503, "down"),
            ok(503, "down"),
            ok(503, "down"),
        ]));
        let sender = BatchSender::new(transport.clone(), &config(2));
        let bus = NotificationBus::new();

        let mut batch = batch_of(1);
        let receipt = batch[0].completion_channel();

        let result = sender.deliver(batch, &bus).await;
        assert!(result.is_err());
        assert_eq!(transport.calls(), 3);
        let err = receipt.await.unwrap().unwrap_err();
        assert_eq!(err.status, Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn test_5xx_then_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(500, "oops"), ok(200, "{}")]));
        let sender = BatchSender::new(transport.clone(), &config(3));
        let bus = NotificationBus::new();

        let mut batch = batch_of(1);
        let receipt = batch[0].completion_channel();

        sender.deliver(batch, &bus).await.unwrap();
        assert_eq!(transport.calls(), 2);
        assert_eq!(receipt.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(401, "bad key")]));
        let sender = BatchSender::new(transport.clone(), &config(5));
        let bus = NotificationBus::new();

        let result = sender.deliver(batch_of(1), &bus).await;
        assert!(matches!(result, Err(Error::Auth { .. })));
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let body = "é".repeat(400);
        let truncated = truncate(&body);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 515);
    }
}
