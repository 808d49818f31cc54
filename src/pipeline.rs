//! Per-request resolution pipeline
//!
//! `Parsing -> Resolving -> Admitting -> Validating -> Dispatching -> Transforming -> Done`,
//! with a terminal failure reachable from every stage. Each stage only reads
//! the state it is handed, so a caller may safely replay a request from the
//! start.
use bytes::Bytes;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Method, StatusCode};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::cache::{CachePolicy, CacheStats, CacheStatus, LookupCache};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, ResponseBody, RetryPolicy};
use crate::error::{GatewayError, ResourceKind, StoreError, UpstreamFault, Window};
use crate::metrics::{MetricsCollector, RecordSink, RequestRecord};
use crate::model::{Consumer, Deployment, PricingPlan, FREE_PLAN_SLUG};
use crate::origin::{OriginConnector, OriginRequest};
use crate::pool::ConnectionPool;
use crate::rate_limit::RateLimiter;
use crate::routing::RoutingIdentifier;
use crate::schema::SchemaRegistry;
use crate::store::Store;
use crate::stream::StreamWriter;

/// Value of the `x-gateway` response header
pub const GATEWAY_NAME: &str = concat!("tollgate/", env!("CARGO_PKG_VERSION"));

const X_REQUEST_ID: &str = "x-request-id";
const X_GATEWAY: &str = "x-gateway";
const X_CACHE: &str = "x-cache";

/// Transport-neutral inbound request
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Path with optional query string
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Transport-neutral response; the body streams from the origin
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Instant by which the body must be fully written
    pub deadline: Instant,
}

impl GatewayResponse {
    pub fn request_id(&self) -> Option<&str> {
        self.headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok())
    }
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Parsing,
    Resolving,
    Admitting,
    Validating,
    Dispatching,
    Transforming,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::Resolving => "resolving",
            Stage::Admitting => "admitting",
            Stage::Validating => "validating",
            Stage::Dispatching => "dispatching",
            Stage::Transforming => "transforming",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure together with the stage it happened in
#[derive(Debug, Clone, Error)]
#[error("{stage} failed: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    pub error: GatewayError,
}

impl PipelineFailure {
    fn at(stage: Stage) -> impl Fn(GatewayError) -> PipelineFailure {
        move |error| PipelineFailure { stage, error }
    }

    /// JSON error response carrying the kind and its fields
    pub fn to_response(&self, request_id: &str, deadline: Instant) -> GatewayResponse {
        let status = StatusCode::from_u16(self.error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = self.error.to_body();
        body["requestId"] = Value::String(request_id.to_string());
        body["stage"] = Value::String(self.stage.as_str().to_string());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(secs) = self.error.retry_after_secs() {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        stamp(&mut headers, request_id);

        GatewayResponse {
            status,
            headers,
            body: ResponseBody::full(Bytes::from(body.to_string())),
            deadline,
        }
    }
}

fn stamp(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(X_REQUEST_ID), value);
    }
    headers.insert(HeaderName::from_static(X_GATEWAY), HeaderValue::from_static(GATEWAY_NAME));
}

/// What the pipeline learned so far; read after an abort
#[derive(Debug, Default)]
struct Trace {
    stage: Stage,
    deployment_id: Option<String>,
    consumer_id: Option<String>,
    tool_name: Option<String>,
    cached: bool,
    attempts: u32,
}

type StoreLookup<V> = BoxFuture<'static, Result<Option<Arc<V>>, StoreError>>;

/// Populate closure for a cache backed by one store method
fn store_lookup<V, F, Fut>(
    store: &Arc<dyn Store>,
    key: &str,
    fetch: F,
) -> impl Fn() -> StoreLookup<V> + Send + Sync + 'static
where
    V: Send + Sync + 'static,
    F: Fn(Arc<dyn Store>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<V>, StoreError>> + Send + 'static,
{
    let store = Arc::clone(store);
    let key = key.to_string();
    move || {
        let lookup = fetch(Arc::clone(&store), key.clone());
        async move { lookup.await.map(|found| found.map(Arc::new)) }.boxed()
    }
}

/// Resolves, admits, validates and dispatches tool calls
pub struct ResolutionPipeline {
    store: Arc<dyn Store>,
    deployments: LookupCache<Arc<Deployment>>,
    consumers: LookupCache<Arc<Consumer>>,
    plans: LookupCache<Arc<PricingPlan>>,
    rate_limiter: RateLimiter,
    schemas: SchemaRegistry,
    dispatcher: Dispatcher,
    retry_policy: RetryPolicy,
    stream_writer: StreamWriter,
    records: RecordSink,
    metrics: Option<Arc<MetricsCollector>>,
    builtin_free_plan: Arc<PricingPlan>,
    request_deadline: Duration,
    request_counter: AtomicU64,
}

impl ResolutionPipeline {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        connector: Arc<dyn OriginConnector>,
        records: RecordSink,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let cache = &config.cache;
        let pool = Arc::new(ConnectionPool::new(connector, &config.pool));
        let mut dispatcher = Dispatcher::new(pool, &config.dispatch, &config.pool);
        if let Some(metrics) = &metrics {
            dispatcher = dispatcher.with_metrics(Arc::clone(metrics));
        }
        let rate_limiter = RateLimiter::new(&config.rate_limiting);
        let builtin_free_plan = Arc::new(rate_limiter.free_plan().clone());

        Self {
            store,
            deployments: LookupCache::new(
                "deployments",
                CachePolicy::from_config(cache, cache.deployment_ttl),
            ),
            consumers: LookupCache::new(
                "consumers",
                CachePolicy::from_config(cache, cache.consumer_ttl),
            ),
            plans: LookupCache::new("plans", CachePolicy::from_config(cache, cache.plan_ttl)),
            rate_limiter,
            schemas: SchemaRegistry::new(CachePolicy::from_config(cache, cache.schema_ttl)),
            dispatcher,
            retry_policy: RetryPolicy::from_config(&config.dispatch),
            stream_writer: StreamWriter::new(config.dispatch.chunk_size),
            records,
            metrics,
            builtin_free_plan,
            request_deadline: config.server.request_deadline,
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stream_writer(&self) -> StreamWriter {
        self.stream_writer
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn deployment_cache_stats(&self) -> CacheStats {
        self.deployments.stats()
    }

    /// Forget a deployment so the next request reads it from the store
    pub fn invalidate_deployment(&self, id: &str) {
        self.deployments.invalidate(id);
    }

    pub fn invalidate_consumer(&self, id: &str) {
        self.consumers.invalidate(id);
    }

    /// Run one request to completion or terminal failure.
    ///
    /// Cancelling `cancel`, or passing the request deadline, drops the work in
    /// progress; a connection leased at that point is closed, not pooled.
    pub async fn handle(&self, request: InboundRequest, cancel: CancellationToken) -> GatewayResponse {
        let started = Instant::now();
        let deadline = started + self.request_deadline;
        let request_id = self.request_id(&request.headers);
        if let Some(metrics) = &self.metrics {
            metrics.record_request();
        }

        let trace = Mutex::new(Trace::default());
        let outcome = tokio::select! {
            outcome = self.run(&request, &request_id, deadline, &trace) => outcome,
            _ = cancel.cancelled() => {
                let stage = trace.lock().stage;
                Err(PipelineFailure {
                    stage,
                    error: GatewayError::Aborted("client disconnected".into()),
                })
            }
            _ = sleep_until(deadline) => {
                let (stage, attempts_made) = {
                    let trace = trace.lock();
                    (trace.stage, trace.attempts)
                };
                Err(PipelineFailure {
                    stage,
                    error: GatewayError::Upstream {
                        attempts_made,
                        last_fault: UpstreamFault::Timeout,
                    },
                })
            }
        };
        self.complete(
            &request,
            request_id,
            started,
            deadline,
            trace.into_inner(),
            outcome,
        )
    }

    /// Answer a request that cannot enter the pipeline, e.g. an oversized body
    pub fn reject(&self, request: &InboundRequest, error: GatewayError) -> GatewayResponse {
        let started = Instant::now();
        let request_id = self.request_id(&request.headers);
        if let Some(metrics) = &self.metrics {
            metrics.record_request();
        }
        self.complete(
            request,
            request_id,
            started,
            started + self.request_deadline,
            Trace::default(),
            Err(PipelineFailure {
                stage: Stage::Parsing,
                error,
            }),
        )
    }

    /// Render the outcome and emit its access record
    fn complete(
        &self,
        request: &InboundRequest,
        request_id: String,
        started: Instant,
        deadline: Instant,
        mut trace: Trace,
        outcome: Result<GatewayResponse, PipelineFailure>,
    ) -> GatewayResponse {
        let (response, error, failed_stage) = match outcome {
            Ok(response) => (response, None, None),
            Err(failure) => {
                if let GatewayError::Upstream { attempts_made, .. } = &failure.error {
                    trace.attempts = trace.attempts.max(*attempts_made);
                }
                self.report_failure(&request_id, request, &failure);
                (
                    failure.to_response(&request_id, deadline),
                    Some(failure.error.kind().to_string()),
                    Some(failure.stage),
                )
            }
        };

        self.records.emit(RequestRecord {
            request_id,
            deployment_id: trace.deployment_id,
            consumer_id: trace.consumer_id,
            tool_name: trace.tool_name,
            duration_ms: started.elapsed().as_millis() as u64,
            status: response.status.as_u16(),
            cached: trace.cached,
            retries: trace.attempts.saturating_sub(1),
            error,
            failed_stage,
            timestamp: Utc::now(),
        });
        if let Some(metrics) = &self.metrics {
            metrics.record_request_done();
        }
        response
    }

    async fn run(
        &self,
        request: &InboundRequest,
        request_id: &str,
        deadline: Instant,
        trace: &Mutex<Trace>,
    ) -> Result<GatewayResponse, PipelineFailure> {
        // Parsing
        let routing =
            RoutingIdentifier::parse(&request.path).map_err(PipelineFailure::at(Stage::Parsing))?;
        let arguments: Value = if request.body.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(&request.body).map_err(|e| PipelineFailure {
                stage: Stage::Parsing,
                error: GatewayError::MalformedRequest(format!("body is not valid JSON: {}", e)),
            })?
        };
        {
            let mut trace = trace.lock();
            trace.deployment_id = Some(routing.deployment_id().to_string());
            trace.tool_name = Some(routing.tool_name().to_string());
            trace.stage = Stage::Resolving;
        }

        // Resolving
        let fail = PipelineFailure::at(Stage::Resolving);
        let (deployment, consumer) = tokio::join!(
            self.resolve_deployment(routing.deployment_id()),
            self.resolve_consumer(routing.consumer_slug()),
        );
        let (deployment, deployment_status) = deployment.map_err(&fail)?;
        let consumer = consumer.map_err(&fail)?;
        {
            let mut trace = trace.lock();
            trace.cached = deployment_status.is_cached();
            trace.consumer_id = Some(consumer.id.clone());
        }
        let tool_name = routing.tool_name();
        if deployment.tool(tool_name).is_none() {
            return Err(fail(GatewayError::NotFound {
                kind: ResourceKind::Tool,
                id: tool_name.to_string(),
            }));
        }
        let plan = self.resolve_plan(&consumer.plan_slug).await.map_err(&fail)?;
        trace.lock().stage = Stage::Admitting;

        // Admitting
        let admission = self.rate_limiter.admit(&consumer.id, &plan);
        if !admission.allowed {
            return Err(PipelineFailure {
                stage: Stage::Admitting,
                error: GatewayError::RateLimited {
                    retry_after_ms: admission.retry_after_ms.unwrap_or_default(),
                    window: admission.denied_by.unwrap_or(Window::Minute),
                },
            });
        }
        trace.lock().stage = Stage::Validating;

        // Validating
        let arguments = self
            .schemas
            .validate(&deployment, tool_name, arguments)
            .await
            .map_err(PipelineFailure::at(Stage::Validating))?;
        trace.lock().stage = Stage::Dispatching;

        // Dispatching
        let fail = PipelineFailure::at(Stage::Dispatching);
        let origin_request =
            OriginRequest::tool_call(&deployment, tool_name, arguments.as_value(), request_id)
                .map_err(&fail)?;
        let budget = deployment
            .timeout_budget()
            .min(deadline.saturating_duration_since(Instant::now()));
        let result = self
            .dispatcher
            .call(&origin_request, budget, &self.retry_policy)
            .await
            .map_err(&fail)?;
        {
            let mut trace = trace.lock();
            trace.attempts = result.attempts;
            trace.stage = Stage::Transforming;
        }

        // Transforming
        let mut headers = result.headers;
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        stamp(&mut headers, request_id);
        headers.insert(
            HeaderName::from_static(X_CACHE),
            HeaderValue::from_static(if deployment_status.is_cached() { "HIT" } else { "MISS" }),
        );
        trace.lock().stage = Stage::Done;

        debug!(
            "Request {} dispatched {} to {} after {} attempt(s) -> {}",
            request_id,
            routing,
            origin_request.host,
            result.attempts,
            result.status
        );
        Ok(GatewayResponse {
            status: result.status,
            headers,
            body: result.body,
            deadline,
        })
    }

    async fn resolve_deployment(&self, id: &str) -> Result<(Arc<Deployment>, CacheStatus), GatewayError> {
        let lookup = self
            .deployments
            .get(
                id,
                store_lookup(&self.store, id, |store, id| async move {
                    store.fetch_deployment(&id).await
                }),
            )
            .await
            .map_err(GatewayError::StoreUnavailable)?;
        self.observe_cache(self.deployments.name(), lookup.status);
        let status = lookup.status;
        lookup
            .value
            .map(|deployment| (deployment, status))
            .ok_or_else(|| GatewayError::NotFound {
                kind: ResourceKind::Deployment,
                id: id.to_string(),
            })
    }

    /// No consumer segment means the anonymous consumer
    async fn resolve_consumer(&self, slug: Option<&str>) -> Result<Arc<Consumer>, GatewayError> {
        let Some(id) = slug else {
            return Ok(Arc::new(Consumer::anonymous()));
        };
        let lookup = self
            .consumers
            .get(
                id,
                store_lookup(&self.store, id, |store, id| async move {
                    store.fetch_consumer(&id).await
                }),
            )
            .await
            .map_err(GatewayError::StoreUnavailable)?;
        self.observe_cache(self.consumers.name(), lookup.status);
        lookup.value.ok_or_else(|| GatewayError::NotFound {
            kind: ResourceKind::Consumer,
            id: id.to_string(),
        })
    }

    /// The consumer's plan, else the stored free plan, else the built-in one
    async fn resolve_plan(&self, slug: &str) -> Result<Arc<PricingPlan>, GatewayError> {
        if let Some(plan) = self.lookup_plan(slug).await? {
            return Ok(plan);
        }
        if slug != FREE_PLAN_SLUG {
            warn!("Unknown pricing plan '{}', applying the free plan", slug);
            if let Some(plan) = self.lookup_plan(FREE_PLAN_SLUG).await? {
                return Ok(plan);
            }
        }
        Ok(Arc::clone(&self.builtin_free_plan))
    }

    async fn lookup_plan(&self, slug: &str) -> Result<Option<Arc<PricingPlan>>, GatewayError> {
        let lookup = self
            .plans
            .get(
                slug,
                store_lookup(&self.store, slug, |store, slug| async move {
                    store.fetch_plan(&slug).await
                }),
            )
            .await
            .map_err(GatewayError::StoreUnavailable)?;
        self.observe_cache(self.plans.name(), lookup.status);
        Ok(lookup.value)
    }

    fn observe_cache(&self, cache: &str, status: CacheStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(cache, status);
        }
    }

    fn report_failure(&self, request_id: &str, request: &InboundRequest, failure: &PipelineFailure) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(failure.error.kind(), failure.stage);
            if matches!(failure.error, GatewayError::RateLimited { .. }) {
                metrics.record_rate_limited();
            }
        }
        if failure.error.status_code() >= 500 {
            warn!(
                "Request {} {} {} failed during {}: {}",
                request_id, request.method, request.path, failure.stage, failure.error
            );
        } else {
            debug!(
                "Request {} {} {} rejected during {}: {}",
                request_id, request.method, request.path, failure.stage, failure.error
            );
        }
    }

    /// Reuse a sane inbound `x-request-id`, otherwise mint `req-{nanos}-{counter}`
    pub fn request_id(&self, headers: &HeaderMap) -> String {
        if let Some(inbound) = headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
            if !inbound.is_empty() && inbound.len() <= 128 {
                return inbound.to_string();
            }
        }
        let counter = self.request_counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "req-{:016x}-{:08x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            counter
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, ServerConfig};
    use crate::metrics::MetricsCollector;
    use crate::model::{ToolDefinition, ANONYMOUS_CONSUMER_ID};
    use crate::store::InMemoryStore;
    use crate::test_support::{CountingStore, Script, ScriptedConnector};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct Harness {
        pipeline: Arc<ResolutionPipeline>,
        store: Arc<CountingStore>,
        connector: Arc<ScriptedConnector>,
        records: mpsc::Receiver<RequestRecord>,
        metrics: Arc<MetricsCollector>,
    }

    fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        let mut tools = HashMap::new();
        tools.insert(
            "search".to_string(),
            ToolDefinition {
                name: "search".into(),
                description: Some("Full text search".into()),
                input_schema: Some(json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                })),
            },
        );
        tools.insert(
            "echo".to_string(),
            ToolDefinition {
                name: "echo".into(),
                description: None,
                input_schema: None,
            },
        );
        store.put_deployment(Deployment {
            id: "d1".into(),
            version: "1".into(),
            origin_base_url: "http://origin.test:8080/tools".into(),
            tools,
            default_timeout_ms: 5_000,
        });
        store.put_consumer(Consumer {
            id: "c1".into(),
            plan_slug: "pro".into(),
        });
        store.put_consumer(Consumer {
            id: "c2".into(),
            plan_slug: "gold".into(),
        });
        store.put_plan(PricingPlan {
            slug: "pro".into(),
            requests_per_minute: 1000,
            requests_per_day: 100_000,
        });
        store
    }

    fn harness_with(config: Config, store: CountingStore, scripts: Vec<Script>) -> Harness {
        let store = Arc::new(store);
        let connector = Arc::new(ScriptedConnector::new(scripts));
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let (sink, records) = RecordSink::channel(1024, Some(metrics.clone()));
        let pipeline = Arc::new(ResolutionPipeline::new(
            &config,
            store.clone(),
            connector.clone(),
            sink,
            Some(metrics.clone()),
        ));
        Harness {
            pipeline,
            store,
            connector,
            records,
            metrics,
        }
    }

    fn harness(scripts: Vec<Script>) -> Harness {
        harness_with(Config::default(), CountingStore::new(seeded_store()), scripts)
    }

    async fn call(harness: &Harness, path: &str, body: Value) -> GatewayResponse {
        harness
            .pipeline
            .handle(
                InboundRequest::post(path, body.to_string()),
                CancellationToken::new(),
            )
            .await
    }

    async fn json_body(response: GatewayResponse) -> Value {
        let bytes = response.body.into_bytes().await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_identical_requests_share_lookups() {
        let config = Config {
            pool: PoolConfig {
                max_connections_per_host: 128,
                ..PoolConfig::default()
            },
            ..Config::default()
        };
        let store = CountingStore::new(seeded_store()).with_delay(Duration::from_millis(20));
        let harness = harness_with(config, store, vec![]);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let pipeline = Arc::clone(&harness.pipeline);
                tokio::spawn(async move {
                    let response = pipeline
                        .handle(
                            InboundRequest::post("/@c1/d1/search", r#"{"query":"rust"}"#),
                            CancellationToken::new(),
                        )
                        .await;
                    let status = response.status;
                    let cache = response.headers["x-cache"].clone();
                    response.body.into_bytes().await.unwrap();
                    (status, cache)
                })
            })
            .collect();

        let mut hits = 0;
        for handle in handles {
            let (status, cache) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            if cache == "HIT" {
                hits += 1;
            }
        }
        assert_eq!(hits, 99);
        assert_eq!(harness.store.deployment_lookups.load(Ordering::SeqCst), 1);
        assert_eq!(harness.store.consumer_lookups.load(Ordering::SeqCst), 1);
        assert_eq!(harness.store.plan_lookups.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.pipeline.rate_limiter().usage("c1").unwrap().minute_count,
            100
        );

        let stats = harness.pipeline.deployment_cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hits + stats.coalesced, 99);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_transforms_headers_and_emits_record() {
        let mut harness = harness(vec![Script::ok(200, r#"{"hits":3}"#)
            .with_headers(vec![("set-cookie", "a=b"), ("etag", "\"abc\"")])]);

        let response = call(&harness, "/@c1/d1/search", json!({"query": "rust"})).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers["content-type"], "application/json");
        assert_eq!(response.headers["etag"], "\"abc\"");
        assert_eq!(response.headers["x-gateway"], GATEWAY_NAME);
        assert_eq!(response.headers["x-cache"], "MISS");
        assert!(response.headers.get("set-cookie").is_none());
        let request_id = response.request_id().unwrap().to_string();
        assert!(request_id.starts_with("req-"));
        assert_eq!(json_body(response).await, json!({"hits": 3}));

        let sent = harness.connector.requests();
        assert_eq!(sent[0].path_and_query, "/tools/search");
        assert_eq!(&sent[0].body[..], br#"{"query":"rust"}"#);

        let record = harness.records.try_recv().unwrap();
        assert_eq!(record.request_id, request_id);
        assert_eq!(record.deployment_id.as_deref(), Some("d1"));
        assert_eq!(record.consumer_id.as_deref(), Some("c1"));
        assert_eq!(record.tool_name.as_deref(), Some("search"));
        assert_eq!(record.status, 200);
        assert!(!record.cached);
        assert_eq!(record.retries, 0);
        assert!(record.error.is_none());

        let response = call(&harness, "/@c1/d1/search", json!({"query": "again"})).await;
        assert_eq!(response.headers["x-cache"], "HIT");
        assert!(harness.records.try_recv().unwrap().cached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_content_type_and_inbound_request_id() {
        let harness = harness(vec![Script::Respond {
            status: 201,
            headers: vec![],
            chunks: vec![Bytes::from_static(b"{}")],
            delay: Duration::ZERO,
            fail_after: None,
        }]);
        let mut request = InboundRequest::post("/d1/echo", "[1,2]");
        request
            .headers
            .insert("x-request-id", HeaderValue::from_static("trace-42"));

        let response = harness
            .pipeline
            .handle(request, CancellationToken::new())
            .await;
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.headers["content-type"], "application/json");
        assert_eq!(response.request_id(), Some("trace-42"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_path_and_body() {
        let mut harness = harness(vec![]);

        let response = call(&harness, "/d1", json!({})).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "malformed_request");
        assert_eq!(body["stage"], "parsing");

        let response = harness
            .pipeline
            .handle(
                InboundRequest::post("/d1/search", "{not json"),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);

        let record = harness.records.try_recv().unwrap();
        assert_eq!(record.failed_stage, Some(Stage::Parsing));
        assert_eq!(record.error.as_deref(), Some("malformed_request"));
        assert_eq!(harness.store.deployment_lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_records_are_not_found() {
        let harness = harness(vec![]);

        for _ in 0..3 {
            let response = call(&harness, "/ghost/search", json!({})).await;
            assert_eq!(response.status, StatusCode::NOT_FOUND);
            let body = json_body(response).await;
            assert_eq!(body["resource"], "deployment");
            assert_eq!(body["id"], "ghost");
        }
        // Absence is cached
        assert_eq!(harness.store.deployment_lookups.load(Ordering::SeqCst), 1);

        let response = call(&harness, "/@nobody/d1/search", json!({"query": "a"})).await;
        assert_eq!(json_body(response).await["resource"], "consumer");

        let response = call(&harness, "/d1/missing", json!({})).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["resource"], "tool");
    }

    #[tokio::test(start_paused = true)]
    async fn test_anonymous_consumer_is_rate_limited_on_free_plan() {
        let mut harness = harness(vec![]);

        for _ in 0..10 {
            let response = call(&harness, "/d1/echo", json!({})).await;
            assert_eq!(response.status, StatusCode::OK);
            response.body.into_bytes().await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let response = call(&harness, "/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers["retry-after"], "30");
        let body = json_body(response).await;
        assert_eq!(body["retryAfterMs"], 30_000);
        assert_eq!(body["window"], "minute");
        // No origin call for a denied request
        assert_eq!(harness.connector.requests().len(), 10);

        let records: Vec<_> = std::iter::from_fn(|| harness.records.try_recv().ok()).collect();
        assert_eq!(records.len(), 11);
        assert_eq!(records[10].consumer_id.as_deref(), Some(ANONYMOUS_CONSUMER_ID));
        assert_eq!(records[10].failed_stage, Some(Stage::Admitting));
        assert_eq!(harness.metrics.snapshot().rate_limited_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_plan_falls_back_to_free() {
        let harness = harness(vec![]);
        for _ in 0..10 {
            call(&harness, "/@c2/d1/echo", json!({}))
                .await
                .body
                .into_bytes()
                .await
                .unwrap();
        }
        let response = call(&harness, "/@c2/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        // "gold" then "free" were both looked up once, and both absences cached
        assert_eq!(harness.store.plan_lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_lists_violations() {
        let harness = harness(vec![]);
        let response = call(&harness, "/@c1/d1/search", json!({"query": 7})).await;
        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["violations"][0]["path"], "/query");
        assert_eq!(body["stage"], "validating");
        assert!(harness.connector.requests().is_empty());
        assert_eq!(harness.pipeline.schemas().cached_schemas(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_retries_surface_in_record() {
        let mut harness = harness(vec![
            Script::status(503),
            Script::status(503),
            Script::ok(200, "{}"),
        ]);
        let response = call(&harness, "/@c1/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::OK);
        response.body.into_bytes().await.unwrap();
        assert_eq!(harness.records.try_recv().unwrap().retries, 2);

        harness.connector.push(Script::status(500));
        harness.connector.push(Script::status(502));
        harness.connector.push(Script::status(503));
        let response = call(&harness, "/@c1/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(response).await["attemptsMade"], 3);
        let record = harness.records.try_recv().unwrap();
        assert_eq!(record.retries, 2);
        assert_eq!(record.failed_stage, Some(Stage::Dispatching));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_and_closes_connection() {
        let harness = harness(vec![Script::Hang]);
        let cancel = CancellationToken::new();
        let task = {
            let pipeline = Arc::clone(&harness.pipeline);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pipeline
                    .handle(InboundRequest::post("/@c1/d1/echo", "{}"), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let response = task.await.unwrap();
        assert_eq!(response.status.as_u16(), 499);
        assert_eq!(json_body(response).await["stage"], "dispatching");

        let host = crate::origin::OriginHost::new("origin.test", 8080);
        let stats = harness.pipeline.dispatcher().pool().stats(&host).unwrap();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.closed_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline_bounds_dispatch() {
        let config = Config {
            server: ServerConfig {
                request_deadline: Duration::from_secs(1),
                ..ServerConfig::default()
            },
            ..Config::default()
        };
        let harness = harness_with(
            config,
            CountingStore::new(seeded_store()),
            vec![Script::Hang, Script::Hang, Script::Hang],
        );

        let started = Instant::now();
        let response = call(&harness, "/@c1/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_fault_is_retried_once() {
        let harness = harness(vec![]);
        harness.store.fail_transiently(1);
        let response = call(&harness, "/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(harness.store.deployment_lookups.load(Ordering::SeqCst), 2);

        harness.pipeline.invalidate_deployment("d1");
        harness.store.fail_transiently(2);
        let response = call(&harness, "/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "store_unavailable");
    }

    #[tokio::test]
    async fn test_reject_renders_and_records() {
        let mut harness = harness(vec![]);
        let request = InboundRequest::post("/d1/echo", "{}");
        let response = harness.pipeline.reject(
            &request,
            GatewayError::MalformedRequest("request body exceeds 16 bytes".into()),
        );
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        let record = harness.records.try_recv().unwrap();
        assert_eq!(record.status, 400);
        assert_eq!(record.failed_stage, Some(Stage::Parsing));
        assert_eq!(harness.metrics.snapshot().requests_in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_deployment_is_reloaded() {
        let harness = harness(vec![]);
        call(&harness, "/d1/echo", json!({})).await;
        harness.store.inner().remove_deployment("d1");

        // Still served from cache until invalidated
        assert_eq!(call(&harness, "/d1/echo", json!({})).await.status, StatusCode::OK);
        harness.pipeline.invalidate_deployment("d1");
        assert_eq!(
            call(&harness, "/d1/echo", json!({})).await.status,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_named_anonymous_has_its_own_windows() {
        let harness = harness(vec![]);
        harness.store.inner().put_consumer(Consumer {
            id: "anonymous".into(),
            plan_slug: FREE_PLAN_SLUG.into(),
        });

        for _ in 0..10 {
            let response = call(&harness, "/@anonymous/d1/echo", json!({})).await;
            assert_eq!(response.status, StatusCode::OK);
            response.body.into_bytes().await.unwrap();
        }
        assert_eq!(
            call(&harness, "/@anonymous/d1/echo", json!({})).await.status,
            StatusCode::TOO_MANY_REQUESTS
        );

        let response = call(&harness, "/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_consumer_skips_negative_entry() {
        let harness = harness(vec![]);
        assert_eq!(
            call(&harness, "/@c3/d1/echo", json!({})).await.status,
            StatusCode::NOT_FOUND
        );
        harness.store.inner().put_consumer(Consumer {
            id: "c3".into(),
            plan_slug: "pro".into(),
        });

        // The absence is still cached
        assert_eq!(
            call(&harness, "/@c3/d1/echo", json!({})).await.status,
            StatusCode::NOT_FOUND
        );
        harness.pipeline.invalidate_consumer("c3");
        let response = call(&harness, "/@c3/d1/echo", json!({})).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(harness.store.consumer_lookups.load(Ordering::SeqCst), 2);
    }
}
