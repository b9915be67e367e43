//! End-to-end pipeline behavior: batching, retries, partial failures,
//! notifications, and deterministic shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use traceline::{
    EventEnvelope, IngestionRoute, Notification, RawResponse, TracelineClient, Transport,
};

fn client_for(server: &MockServer) -> traceline::ClientBuilder {
    TracelineClient::builder()
        .base_url(server.uri())
        .public_key("pk")
        .secret_key("sk")
        .fetch_retry_delay(Duration::from_millis(5))
        .flush_interval(Duration::from_secs(3600))
}

/// Transport double that records batch sizes and always succeeds.
struct RecordingTransport {
    calls: AtomicU32,
    batches: std::sync::Mutex<Vec<Vec<serde_json::Value>>>,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            batches: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn batches(&self) -> Vec<Vec<serde_json::Value>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn execute(&self, body: serde_json::Value) -> traceline::Result<RawResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let batch = body["batch"].as_array().cloned().unwrap_or_default();
        self.batches.lock().unwrap().push(batch);
        Ok(RawResponse {
            status: 200,
            body: String::new(),
            retry_after: None,
        })
    }
}

/// Transport double that holds every request for a fixed delay before
/// succeeding.
struct SlowTransport {
    delay: Duration,
}

#[async_trait]
impl Transport for SlowTransport {
    async fn execute(&self, _body: serde_json::Value) -> traceline::Result<RawResponse> {
        tokio::time::sleep(self.delay).await;
        Ok(RawResponse {
            status: 200,
            body: String::new(),
            retry_after: None,
        })
    }
}

/// Subscriber layer counting ERROR-level log events.
struct ErrorCount(Arc<AtomicU32>);

impl<S: tracing::Subscriber> Layer<S> for ErrorCount {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn flush_at_one_sends_single_event_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .and(header("authorization", "Basic cGs6c2s="))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).flush_at(1).build().unwrap();
    client.trace().name("solo").create();
    client.flush_async().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["batch"].as_array().unwrap().len(), 1);
    assert_eq!(body["batch"][0]["type"], "trace-create");
    assert_eq!(body["batch"][0]["body"]["name"], "solo");
    assert_eq!(body["metadata"]["sdk_name"], "traceline");

    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn fifo_order_is_preserved_within_and_across_batches() {
    let transport = RecordingTransport::new();
    let client = TracelineClient::builder()
        .flush_at(2)
        .flush_interval(Duration::from_secs(3600))
        .transport(transport.clone())
        .build()
        .unwrap();

    for i in 0..5 {
        client.submit(EventEnvelope::new(
            IngestionRoute::EventCreate,
            json!({"seq": i}),
        ));
    }
    client.flush_async().await.unwrap();

    let sent: Vec<i64> = transport
        .batches()
        .iter()
        .flatten()
        .map(|e| e["body"]["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(sent, vec![0, 1, 2, 3, 4]);
    for batch in transport.batches() {
        assert!(batch.len() <= 2);
    }

    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn retry_count_bounds_network_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3) // initial attempt + 2 retries
        .mount(&server)
        .await;

    let client = client_for(&server)
        .flush_at(100)
        .fetch_retry_count(2)
        .build()
        .unwrap();

    for i in 0..10 {
        client.submit(EventEnvelope::new(
            IngestionRoute::EventCreate,
            json!({"seq": i}),
        ));
    }

    tokio_test::assert_err!(client.flush_async().await);

    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn exhausted_batch_logs_exactly_one_error() {
    let errors = Arc::new(AtomicU32::new(0));
    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(ErrorCount(errors.clone())),
    );

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server)
        .flush_at(100)
        .fetch_retry_count(2)
        .build()
        .unwrap();

    for i in 0..5 {
        client.submit(EventEnvelope::new(
            IngestionRoute::EventCreate,
            json!({"seq": i}),
        ));
    }
    tokio_test::assert_err!(client.flush_async().await);

    // One consolidated error per exhausted batch, never one per attempt.
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn non_retryable_4xx_fails_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .respond_with(ResponseTemplate::new(400).set_body_string("malformed batch"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server)
        .flush_at(100)
        .fetch_retry_count(5)
        .build()
        .unwrap();

    let mut envelope = EventEnvelope::new(IngestionRoute::TraceCreate, json!({}));
    let receipt = envelope.completion_channel();
    client.submit(envelope);

    assert!(client.flush_async().await.is_err());
    let err = receipt.await.unwrap().unwrap_err();
    assert_eq!(err.status, Some(400));

    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn partial_failure_resolves_each_envelope_individually() {
    let server = MockServer::start().await;

    let mut good = EventEnvelope::new(IngestionRoute::TraceCreate, json!({"name": "good"}));
    let mut bad = EventEnvelope::new(IngestionRoute::ScoreCreate, json!({"name": "bad"}));
    let good_receipt = good.completion_channel();
    let bad_receipt = bad.completion_channel();

    let multi_status = json!({
        "successes": [{"id": good.id, "status": 201}],
        "errors": [{"id": bad.id, "status": 422, "message": "score value out of range"}],
    });
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .respond_with(ResponseTemplate::new(207).set_body_json(multi_status))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server).flush_at(100).build().unwrap();
    client.submit(good);
    client.submit(bad);
    client.flush_async().await.unwrap();

    assert_eq!(good_receipt.await.unwrap(), Ok(()));
    let err = bad_receipt.await.unwrap().unwrap_err();
    assert_eq!(err.status, Some(422));
    assert!(err.message.contains("out of range"));

    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn transient_failure_then_success_delivers_batch_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server)
        .flush_at(100)
        .fetch_retry_count(3)
        .build()
        .unwrap();

    let mut envelope = EventEnvelope::new(IngestionRoute::GenerationCreate, json!({}));
    let receipt = envelope.completion_channel();
    client.submit(envelope);

    client.flush_async().await.unwrap();
    assert_eq!(receipt.await.unwrap(), Ok(()));

    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn empty_queue_flush_resolves_without_notification() {
    let transport = RecordingTransport::new();
    let client = TracelineClient::builder()
        .transport(transport.clone())
        .build()
        .unwrap();
    let mut notifications = client.notifications();

    client.flush_async().await.unwrap();

    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        notifications.try_recv(),
        Err(TryRecvError::Empty)
    ));

    client.shutdown_async().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_drains_everything_in_flush_at_batches() {
    let transport = RecordingTransport::new();
    let client = TracelineClient::builder()
        .flush_at(2)
        .flush_interval(Duration::from_secs(3600))
        .transport(transport.clone())
        .build()
        .unwrap();
    let mut notifications = client.notifications();

    // Producer calls are synchronous, so on the single-threaded test
    // runtime nothing flushes until shutdown forces the final drain.
    for i in 0..101 {
        client.submit(EventEnvelope::new(
            IngestionRoute::EventCreate,
            json!({"seq": i}),
        ));
    }

    client.shutdown_async().await.unwrap();

    let mut flushes = 0;
    let mut saw_shutdown = false;
    while let Ok(notification) = notifications.try_recv() {
        match notification {
            Notification::Flush(summary) => {
                assert!(summary.batch_size <= 2);
                assert_eq!(summary.failed, 0);
                flushes += 1;
            }
            Notification::Shutdown => saw_shutdown = true,
        }
    }
    assert_eq!(flushes, 51); // ceil(101 / 2)
    assert!(saw_shutdown);

    let delivered: usize = transport.batches().iter().map(|b| b.len()).sum();
    assert_eq!(delivered, 101);

    // Nothing fires after shutdown resolves.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(
        notifications.try_recv(),
        Err(TryRecvError::Empty | TryRecvError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn concurrent_shutdowns_resolve_only_after_the_final_drain() {
    let client = TracelineClient::builder()
        .flush_at(100)
        .flush_interval(Duration::from_secs(3600))
        .transport(Arc::new(SlowTransport {
            delay: Duration::from_millis(500),
        }))
        .build()
        .unwrap();
    let mut notifications = client.notifications();

    let mut envelope = EventEnvelope::new(IngestionRoute::EventCreate, json!({"seq": 0}));
    let receipt = envelope.completion_channel();
    client.submit(envelope);

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.shutdown_async().await }
    });
    // Let the first caller reach the slow in-flight delivery, then join it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.shutdown_async().await.unwrap();

    // The joining caller resolved only after the final drain, so the
    // delivery and every notification are already observable.
    assert_eq!(receipt.await.unwrap(), Ok(()));
    let mut saw_flush = false;
    let mut saw_shutdown = false;
    while let Ok(notification) = notifications.try_recv() {
        match notification {
            Notification::Flush(summary) => {
                assert_eq!(summary.delivered, 1);
                saw_flush = true;
            }
            Notification::Shutdown => saw_shutdown = true,
        }
    }
    assert!(saw_flush);
    assert!(saw_shutdown);

    // And nothing fires afterwards, for either caller.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(
        notifications.try_recv(),
        Err(TryRecvError::Empty | TryRecvError::Closed)
    ));
    tokio_test::assert_ok!(first.await.unwrap());
}

#[tokio::test]
async fn unreachable_endpoint_shuts_down_cleanly() {
    // Nothing listens on this port; every send is a connection error.
    let client = TracelineClient::builder()
        .base_url("http://127.0.0.1:9")
        .public_key("pk")
        .secret_key("sk")
        .flush_at(100)
        .flush_interval(Duration::from_secs(3600))
        .fetch_retry_count(1)
        .fetch_retry_delay(Duration::from_millis(5))
        .request_timeout(Duration::from_millis(250))
        .build()
        .unwrap();

    for i in 0..10 {
        client.submit(EventEnvelope::new(
            IngestionRoute::EventCreate,
            json!({"seq": i}),
        ));
    }

    // Resolves despite total delivery failure; the error was logged and
    // every envelope resolved.
    client.shutdown_async().await.unwrap();
    assert_eq!(client.pending_events(), 0);
}

#[tokio::test]
async fn interval_timer_flushes_without_reaching_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1..)
        .mount(&server)
        .await;

    let client = client_for(&server)
        .flush_at(100)
        .flush_interval(Duration::from_millis(50))
        .build()
        .unwrap();

    client.trace().name("timer-flushed").create();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(client.pending_events(), 0);
    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn sampled_out_traces_never_reach_the_wire() {
    let transport = RecordingTransport::new();
    let client = TracelineClient::builder()
        .sample_rate(0.0)
        .transport(transport.clone())
        .build()
        .unwrap();

    let trace = client.trace().name("invisible").create();
    trace.span().name("also-invisible").create();
    client.flush_async().await.unwrap();

    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    client.shutdown_async().await.unwrap();
}

#[tokio::test]
async fn full_producer_surface_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/public/ingestion"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_for(&server).flush_at(100).build().unwrap();

    let trace = client
        .trace()
        .name("user-request")
        .user_id("user-1")
        .session_id("session-1")
        .input(json!({"query": "weather?"}))
        .tag("production")
        .create();

    let span = trace.span().name("retrieve").create();
    let generation = trace
        .generation()
        .name("completion")
        .model("gpt-4o")
        .parent_observation_id(span.id())
        .input(json!({"messages": []}))
        .create();
    generation
        .update()
        .output(json!({"content": "sunny"}))
        .usage(json!({"input": 12, "output": 3}))
        .end_now()
        .apply();
    span.end();
    trace.event().name("cache-miss").level("DEBUG").create();
    trace.score().name("quality").value(0.9).create();
    trace.update().output(json!({"answer": "sunny"})).apply();

    client.shutdown_async().await.unwrap();

    let requests: Vec<Request> = server.received_requests().await.unwrap();
    let types: Vec<String> = requests
        .iter()
        .flat_map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["batch"]
                .as_array()
                .unwrap()
                .iter()
                .map(|e| e["type"].as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        })
        .collect();

    assert_eq!(
        types,
        vec![
            "trace-create",
            "span-create",
            "generation-create",
            "generation-update",
            "span-update",
            "event-create",
            "score-create",
            "trace-create",
        ]
    );
}
