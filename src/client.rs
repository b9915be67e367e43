//! Client surface: producer API, lifecycle, and the builder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{Notification, NotificationBus};
use crate::config::ClientConfig;
use crate::event::{DeliveryError, EventEnvelope, IngestionRoute};
use crate::queue::EventQueue;
use crate::sampler;
use crate::sender::BatchSender;
use crate::storage::{NoopStore, PersistedProperty, PropertyStore};
use crate::transport::{HttpTransport, Transport};
use crate::worker::Pipeline;
use crate::Result;

struct Inner {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn PropertyStore>,
    opted_out: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Flipped to true once the shutdown sequence has fully completed and
    // the bus is closed; late shutdown callers wait on it.
    shutdown_done: watch::Sender<bool>,
}

/// Client for the traceline ingestion API.
///
/// Cheap to clone; all clones share one queue, one flush worker, and one
/// property store. Producer calls (`trace`, `span`, `generation`, `event`,
/// `score`) are synchronous with respect to enqueue and never block on
/// network I/O; only [`flush_async`](Self::flush_async) and
/// [`shutdown_async`](Self::shutdown_async) suspend the caller.
#[derive(Clone)]
pub struct TracelineClient {
    inner: Arc<Inner>,
}

impl TracelineClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Build a client from `TRACELINE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        ClientBuilder::default()
            .config(ClientConfig::from_env()?)
            .build()
    }

    fn config(&self) -> &ClientConfig {
        &self.inner.pipeline.config
    }

    /// Subscribe to internal notifications (flush outcomes, shutdown).
    pub fn notifications(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.inner.pipeline.bus.subscribe()
    }

    /// Number of envelopes currently queued.
    pub fn pending_events(&self) -> usize {
        self.inner.pipeline.queue.len()
    }

    // ---- producers -------------------------------------------------------

    pub fn trace(&self) -> TraceBuilder {
        TraceBuilder::new(self.clone())
    }

    pub fn span(&self) -> SpanBuilder {
        SpanBuilder::new(self.clone(), None)
    }

    pub fn generation(&self) -> GenerationBuilder {
        GenerationBuilder::new(self.clone(), None)
    }

    pub fn event(&self) -> EventBuilder {
        EventBuilder::new(self.clone(), None)
    }

    pub fn score(&self) -> ScoreBuilder {
        ScoreBuilder::new(self.clone(), None)
    }

    // ---- lifecycle -------------------------------------------------------

    /// Fire-and-forget flush trigger; returns immediately.
    pub fn flush(&self) {
        self.inner.pipeline.trigger_flush();
    }

    /// Flush and wait until every envelope queued as of this call has been
    /// fully resolved: delivered, retried to exhaustion, or permanently
    /// failed. Does not resolve early while a retry backoff is pending.
    ///
    /// An empty queue resolves immediately without emitting a flush
    /// notification.
    pub async fn flush_async(&self) -> Result<()> {
        self.inner.pipeline.flush_cycle().await
    }

    /// Fire-and-forget shutdown. Prefer [`shutdown_async`](Self::shutdown_async).
    pub fn shutdown(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            let _ = client.shutdown_async().await;
        });
    }

    /// Stop the flush timer, force a final drain of everything enqueued up
    /// to this point, await all in-flight retries, then disable the client.
    ///
    /// Idempotent. After this resolves no further producer calls enqueue
    /// anything and no bus notifications fire. Delivery failures during the
    /// final drain were already logged and resolved per envelope; they do
    /// not fail shutdown.
    pub async fn shutdown_async(&self) -> Result<()> {
        let pipeline = &self.inner.pipeline;
        if !pipeline.begin_shutdown() {
            // Another caller owns the shutdown sequence. Wait for it, so
            // every caller observes the no-notifications-after-resolve
            // guarantee, not just the first.
            let mut done = self.inner.shutdown_done.subscribe();
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            return Ok(());
        }

        // Wake the worker so it observes the flag and exits; in-flight
        // network requests are awaited, not cancelled.
        pipeline.trigger_flush();
        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if let Err(e) = pipeline.flush_cycle().await {
            debug!(error = %e, "Final flush completed with delivery failures");
        }

        pipeline.bus.emit(Notification::Shutdown);
        pipeline.bus.close();
        self.inner.shutdown_done.send_replace(true);
        Ok(())
    }

    // ---- opt-out ---------------------------------------------------------

    /// Persistently disable event collection. Every producer call becomes a
    /// no-op until [`opt_in`](Self::opt_in).
    pub fn opt_out(&self) {
        self.inner.opted_out.store(true, Ordering::SeqCst);
        self.inner
            .store
            .set_item(PersistedProperty::OptedOut, "true".to_string());
    }

    pub fn opt_in(&self) {
        self.inner.opted_out.store(false, Ordering::SeqCst);
        self.inner
            .store
            .set_item(PersistedProperty::OptedOut, "false".to_string());
    }

    pub fn is_opted_out(&self) -> bool {
        self.inner.opted_out.load(Ordering::SeqCst)
    }

    // ---- admission -------------------------------------------------------

    /// Enqueue a raw envelope, bypassing trace-level sampling. Admission
    /// still honors the enabled flag, opt-out, and shutdown; a rejected
    /// envelope resolves its completion channel with a "disabled" error
    /// instead of throwing.
    pub fn submit(&self, mut envelope: EventEnvelope) {
        if !self.accepting() {
            envelope.resolve(Err(DeliveryError {
                message: "client is disabled or shut down".to_string(),
                status: None,
            }));
            return;
        }

        if self.config().debug {
            debug!(id = %envelope.id, route = ?envelope.route, "Enqueueing event");
        }
        let len = self.inner.pipeline.queue.enqueue(envelope);
        if len >= self.config().flush_at {
            self.inner.pipeline.trigger_flush();
        }
    }

    fn accepting(&self) -> bool {
        self.config().enabled && !self.is_opted_out() && !self.inner.pipeline.is_shut_down()
    }

    /// Sampled enqueue: the whole trace keyed by `trace_id` is kept or
    /// dropped together, never re-rolled per event.
    fn submit_for_trace(&self, trace_id: &str, mut envelope: EventEnvelope) {
        if !sampler::is_in_sample(trace_id, self.config().sample_rate) {
            envelope.resolve(Err(DeliveryError {
                message: "trace not in sample".to_string(),
                status: None,
            }));
            return;
        }
        self.submit(envelope);
    }
}

/// Builder for [`TracelineClient`].
///
/// Must be built inside a tokio runtime; construction spawns the background
/// flush worker.
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    store: Option<Arc<dyn PropertyStore>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn public_key(mut self, key: impl Into<String>) -> Self {
        self.config.public_key = key.into();
        self
    }

    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.config.secret_key = key.into();
        self
    }

    pub fn flush_at(mut self, flush_at: usize) -> Self {
        self.config.flush_at = flush_at;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn fetch_retry_count(mut self, count: u32) -> Self {
        self.config.fetch_retry_count = count;
        self
    }

    pub fn fetch_retry_delay(mut self, delay: Duration) -> Self {
        self.config.fetch_retry_delay = delay;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.config.sample_rate = Some(rate);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Storage backend for queue persistence and opt-out state. Defaults to
    /// a no-op store.
    pub fn store(mut self, store: Arc<dyn PropertyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Substitute the HTTP transport (tests, custom environments).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<TracelineClient> {
        self.config.validate()?;

        let store: Arc<dyn PropertyStore> =
            self.store.unwrap_or_else(|| Arc::new(NoopStore::new()));
        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(&self.config)?),
        };

        let queue = EventQueue::new(store.clone());
        queue.restore();

        let opted_out = store
            .get_item(PersistedProperty::OptedOut)
            .map(|v| v == "true")
            .unwrap_or(false);

        let sender = BatchSender::new(transport, &self.config);
        let pipeline = Arc::new(Pipeline::new(
            self.config,
            queue,
            sender,
            NotificationBus::new(),
        ));

        let worker = tokio::spawn(pipeline.clone().run());
        let (shutdown_done, _) = watch::channel(false);

        Ok(TracelineClient {
            inner: Arc::new(Inner {
                pipeline,
                store,
                opted_out: AtomicBool::new(opted_out),
                worker: Mutex::new(Some(worker)),
                shutdown_done,
            }),
        })
    }
}

// ---- bodies --------------------------------------------------------------

#[derive(Debug, Default, Serialize)]
struct TraceBody {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
struct ObservationBody {
    id: String,
    trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_observation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ScoreBody {
    id: String,
    trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    observation_id: Option<String>,
    name: String,
    value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

fn to_body<T: Serialize>(body: &T) -> serde_json::Value {
    // Body structs contain only JSON-representable fields; serialization
    // cannot fail for them.
    serde_json::to_value(body).unwrap_or(serde_json::Value::Null)
}

// ---- handles -------------------------------------------------------------

/// Handle to a created trace; spawns nested observations and updates.
#[derive(Clone)]
pub struct TraceHandle {
    client: TracelineClient,
    id: String,
}

impl TraceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn update(&self) -> TraceUpdateBuilder {
        TraceUpdateBuilder {
            client: self.client.clone(),
            body: TraceBody {
                id: self.id.clone(),
                ..Default::default()
            },
        }
    }

    pub fn span(&self) -> SpanBuilder {
        SpanBuilder::new(self.client.clone(), Some(self.id.clone()))
    }

    pub fn generation(&self) -> GenerationBuilder {
        GenerationBuilder::new(self.client.clone(), Some(self.id.clone()))
    }

    pub fn event(&self) -> EventBuilder {
        EventBuilder::new(self.client.clone(), Some(self.id.clone()))
    }

    pub fn score(&self) -> ScoreBuilder {
        ScoreBuilder::new(self.client.clone(), Some(self.id.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    Span,
    Generation,
}

/// Handle to a created span or generation.
#[derive(Clone)]
pub struct ObservationHandle {
    client: TracelineClient,
    trace_id: String,
    id: String,
    kind: ObservationKind,
}

impl ObservationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn kind(&self) -> ObservationKind {
        self.kind
    }

    pub fn update(&self) -> ObservationUpdateBuilder {
        ObservationUpdateBuilder {
            client: self.client.clone(),
            kind: self.kind,
            body: ObservationBody {
                id: self.id.clone(),
                trace_id: self.trace_id.clone(),
                ..Default::default()
            },
        }
    }

    /// Mark the observation as ended now.
    pub fn end(&self) {
        self.update().end_now().apply();
    }
}

// ---- producer builders ---------------------------------------------------

pub struct TraceBuilder {
    client: TracelineClient,
    body: TraceBody,
}

impl TraceBuilder {
    fn new(client: TracelineClient) -> Self {
        Self {
            client,
            body: TraceBody {
                id: uuid::Uuid::new_v4().to_string(),
                ..Default::default()
            },
        }
    }

    /// Supply a caller-controlled trace id (e.g. a request id).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.body.id = id.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.body.name = Some(name.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.body.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.body.session_id = Some(session_id.into());
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.body.input = Some(input);
        self
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.body.output = Some(output);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.body.metadata = Some(metadata);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.body.tags.push(tag.into());
        self
    }

    pub fn create(self) -> TraceHandle {
        let id = self.body.id.clone();
        let envelope = EventEnvelope::new(IngestionRoute::TraceCreate, to_body(&self.body));
        self.client.submit_for_trace(&id, envelope);
        TraceHandle {
            client: self.client,
            id,
        }
    }
}

pub struct TraceUpdateBuilder {
    client: TracelineClient,
    body: TraceBody,
}

impl TraceUpdateBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.body.name = Some(name.into());
        self
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.body.output = Some(output);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.body.metadata = Some(metadata);
        self
    }

    /// Enqueue the update. Trace updates are upserts on the create route.
    pub fn apply(self) {
        let id = self.body.id.clone();
        let envelope = EventEnvelope::new(IngestionRoute::TraceCreate, to_body(&self.body));
        self.client.submit_for_trace(&id, envelope);
    }
}

macro_rules! observation_setters {
    () => {
        pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
            self.body.trace_id = trace_id.into();
            self
        }

        pub fn id(mut self, id: impl Into<String>) -> Self {
            self.body.id = id.into();
            self
        }

        pub fn parent_observation_id(mut self, id: impl Into<String>) -> Self {
            self.body.parent_observation_id = Some(id.into());
            self
        }

        pub fn name(mut self, name: impl Into<String>) -> Self {
            self.body.name = Some(name.into());
            self
        }

        pub fn input(mut self, input: serde_json::Value) -> Self {
            self.body.input = Some(input);
            self
        }

        pub fn output(mut self, output: serde_json::Value) -> Self {
            self.body.output = Some(output);
            self
        }

        pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
            self.body.metadata = Some(metadata);
            self
        }

        pub fn level(mut self, level: impl Into<String>) -> Self {
            self.body.level = Some(level.into());
            self
        }

        pub fn status_message(mut self, message: impl Into<String>) -> Self {
            self.body.status_message = Some(message.into());
            self
        }
    };
}

fn observation_base(trace_id: Option<String>) -> ObservationBody {
    ObservationBody {
        id: uuid::Uuid::new_v4().to_string(),
        // Standalone observations without an explicit trace get a fresh
        // trace id so sampling still has a stable key.
        trace_id: trace_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        start_time: Some(Utc::now()),
        ..Default::default()
    }
}

pub struct SpanBuilder {
    client: TracelineClient,
    body: ObservationBody,
}

impl SpanBuilder {
    fn new(client: TracelineClient, trace_id: Option<String>) -> Self {
        Self {
            client,
            body: observation_base(trace_id),
        }
    }

    observation_setters!();

    pub fn create(self) -> ObservationHandle {
        let (id, trace_id) = (self.body.id.clone(), self.body.trace_id.clone());
        let envelope = EventEnvelope::new(IngestionRoute::SpanCreate, to_body(&self.body));
        self.client.submit_for_trace(&trace_id, envelope);
        ObservationHandle {
            client: self.client,
            trace_id,
            id,
            kind: ObservationKind::Span,
        }
    }
}

pub struct GenerationBuilder {
    client: TracelineClient,
    body: ObservationBody,
}

impl GenerationBuilder {
    fn new(client: TracelineClient, trace_id: Option<String>) -> Self {
        Self {
            client,
            body: observation_base(trace_id),
        }
    }

    observation_setters!();

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.body.model = Some(model.into());
        self
    }

    /// Token usage as opaque JSON, e.g. `{"input": 50, "output": 45}`.
    pub fn usage(mut self, usage: serde_json::Value) -> Self {
        self.body.usage = Some(usage);
        self
    }

    pub fn create(self) -> ObservationHandle {
        let (id, trace_id) = (self.body.id.clone(), self.body.trace_id.clone());
        let envelope = EventEnvelope::new(IngestionRoute::GenerationCreate, to_body(&self.body));
        self.client.submit_for_trace(&trace_id, envelope);
        ObservationHandle {
            client: self.client,
            trace_id,
            id,
            kind: ObservationKind::Generation,
        }
    }
}

pub struct EventBuilder {
    client: TracelineClient,
    body: ObservationBody,
}

impl EventBuilder {
    fn new(client: TracelineClient, trace_id: Option<String>) -> Self {
        Self {
            client,
            body: observation_base(trace_id),
        }
    }

    observation_setters!();

    /// Enqueue the point-in-time event, returning its id.
    pub fn create(self) -> String {
        let (id, trace_id) = (self.body.id.clone(), self.body.trace_id.clone());
        let envelope = EventEnvelope::new(IngestionRoute::EventCreate, to_body(&self.body));
        self.client.submit_for_trace(&trace_id, envelope);
        id
    }
}

pub struct ObservationUpdateBuilder {
    client: TracelineClient,
    kind: ObservationKind,
    body: ObservationBody,
}

impl ObservationUpdateBuilder {
    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.body.output = Some(output);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.body.metadata = Some(metadata);
        self
    }

    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.body.level = Some(level.into());
        self
    }

    pub fn status_message(mut self, message: impl Into<String>) -> Self {
        self.body.status_message = Some(message.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.body.model = Some(model.into());
        self
    }

    pub fn usage(mut self, usage: serde_json::Value) -> Self {
        self.body.usage = Some(usage);
        self
    }

    pub fn end_now(mut self) -> Self {
        self.body.end_time = Some(Utc::now());
        self
    }

    pub fn apply(self) {
        let route = match self.kind {
            ObservationKind::Span => IngestionRoute::SpanUpdate,
            ObservationKind::Generation => IngestionRoute::GenerationUpdate,
        };
        let trace_id = self.body.trace_id.clone();
        let envelope = EventEnvelope::new(route, to_body(&self.body));
        self.client.submit_for_trace(&trace_id, envelope);
    }
}

pub struct ScoreBuilder {
    client: TracelineClient,
    body: ScoreBody,
}

impl ScoreBuilder {
    fn new(client: TracelineClient, trace_id: Option<String>) -> Self {
        Self {
            client,
            body: ScoreBody {
                id: uuid::Uuid::new_v4().to_string(),
                trace_id: trace_id.unwrap_or_default(),
                observation_id: None,
                name: String::new(),
                value: 0.0,
                comment: None,
            },
        }
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.body.trace_id = trace_id.into();
        self
    }

    pub fn observation_id(mut self, id: impl Into<String>) -> Self {
        self.body.observation_id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.body.name = name.into();
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.body.value = value;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.body.comment = Some(comment.into());
        self
    }

    /// Enqueue the score, returning its id.
    pub fn create(self) -> String {
        if self.body.trace_id.is_empty() {
            warn!("Dropping score without a trace id");
            return self.body.id;
        }
        let (id, trace_id) = (self.body.id.clone(), self.body.trace_id.clone());
        let envelope = EventEnvelope::new(IngestionRoute::ScoreCreate, to_body(&self.body));
        self.client.submit_for_trace(&trace_id, envelope);
        id
    }
}
