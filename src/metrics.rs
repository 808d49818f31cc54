//! Metrics collection and per-request access records
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cache::CacheStatus;
use crate::pipeline::Stage;

/// Log target of access records
pub const ACCESS_LOG_TARGET: &str = "tollgate::access";

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Metrics collector for the gateway
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Registry,

    // Request metrics
    /// Total number of requests
    requests_total: IntCounter,
    /// Number of requests in flight
    requests_in_flight: IntGauge,
    /// Request duration histogram
    request_duration: Histogram,
    /// Responses by status group
    responses_total: IntCounterVec,
    /// Failures by error kind
    errors_total: IntCounterVec,

    // Upstream metrics
    /// Total number of upstream attempts
    upstream_requests_total: IntCounter,
    /// Failed upstream attempts
    upstream_errors_total: IntCounter,
    /// Attempts after the first
    upstream_retries_total: IntCounter,
    /// Time to response head per attempt
    upstream_duration: Histogram,

    // Admission and lookup metrics
    rate_limited_total: IntCounter,
    cache_lookups_total: IntCounterVec,
    /// Access records lost to a full buffer
    records_dropped_total: IntCounter,
}

impl MetricsCollector {
    /// Create a collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a collector registering into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let requests_total = IntCounter::with_opts(Opts::new(
            "tollgate_requests_total",
            "Total number of tool calls received",
        ))?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_in_flight = IntGauge::with_opts(Opts::new(
            "tollgate_requests_in_flight",
            "Number of tool calls currently being processed",
        ))?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tollgate_request_duration_seconds",
                "Tool call duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let responses_total = IntCounterVec::new(
            Opts::new(
                "tollgate_responses_total",
                "Responses by HTTP status group",
            ),
            &["status_group"],
        )?;
        registry.register(Box::new(responses_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("tollgate_errors_total", "Failed tool calls by error kind"),
            &["kind", "stage"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let upstream_requests_total = IntCounter::with_opts(Opts::new(
            "tollgate_upstream_requests_total",
            "Total number of attempts sent to origins",
        ))?;
        registry.register(Box::new(upstream_requests_total.clone()))?;

        let upstream_errors_total = IntCounter::with_opts(Opts::new(
            "tollgate_upstream_errors_total",
            "Origin attempts that failed, timed out or returned 5xx",
        ))?;
        registry.register(Box::new(upstream_errors_total.clone()))?;

        let upstream_retries_total = IntCounter::with_opts(Opts::new(
            "tollgate_upstream_retries_total",
            "Origin attempts made after a failed attempt",
        ))?;
        registry.register(Box::new(upstream_retries_total.clone()))?;

        let upstream_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tollgate_upstream_duration_seconds",
                "Origin time to response head in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(upstream_duration.clone()))?;

        let rate_limited_total = IntCounter::with_opts(Opts::new(
            "tollgate_rate_limited_total",
            "Tool calls denied by the rate limiter",
        ))?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new("tollgate_cache_lookups_total", "Cache lookups by outcome"),
            &["cache", "status"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let records_dropped_total = IntCounter::with_opts(Opts::new(
            "tollgate_records_dropped_total",
            "Access records dropped because the record buffer was full",
        ))?;
        registry.register(Box::new(records_dropped_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_in_flight,
            request_duration,
            responses_total,
            errors_total,
            upstream_requests_total,
            upstream_errors_total,
            upstream_retries_total,
            upstream_duration,
            rate_limited_total,
            cache_lookups_total,
            records_dropped_total,
        })
    }

    /// Record a new request
    pub fn record_request(&self) {
        self.requests_total.inc();
        self.requests_in_flight.inc();
    }

    /// Record that a request left the pipeline
    pub fn record_request_done(&self) {
        self.requests_in_flight.dec();
    }

    /// Record a completed response, grouped by status class to limit cardinality
    pub fn record_response(&self, status_code: u16, duration: Duration) {
        self.request_duration.observe(duration.as_secs_f64());
        let status_group = match status_code {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };
        self.responses_total.with_label_values(&[status_group]).inc();
    }

    pub fn record_error(&self, kind: &str, stage: Stage) {
        self.errors_total
            .with_label_values(&[kind, stage.as_str()])
            .inc();
    }

    pub fn record_upstream_request(&self) {
        self.upstream_requests_total.inc();
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors_total.inc();
    }

    pub fn record_retry(&self) {
        self.upstream_retries_total.inc();
    }

    pub fn record_upstream_duration(&self, duration: Duration) {
        self.upstream_duration.observe(duration.as_secs_f64());
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }

    pub fn record_cache_lookup(&self, cache: &str, status: CacheStatus) {
        self.cache_lookups_total
            .with_label_values(&[cache, status.as_str()])
            .inc();
    }

    pub fn record_dropped_record(&self) {
        self.records_dropped_total.inc();
    }

    /// Get the metrics registry for Prometheus exposition
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors_total = self
            .registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == "tollgate_errors_total")
            .flat_map(|family| family.get_metric().iter())
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum();
        MetricsSnapshot {
            requests_total: self.requests_total.get(),
            requests_in_flight: self.requests_in_flight.get(),
            errors_total,
            upstream_requests_total: self.upstream_requests_total.get(),
            upstream_errors_total: self.upstream_errors_total.get(),
            upstream_retries_total: self.upstream_retries_total.get(),
            rate_limited_total: self.rate_limited_total.get(),
            records_dropped_total: self.records_dropped_total.get(),
        }
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Snapshot of current metrics values
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_in_flight: i64,
    pub errors_total: u64,
    pub upstream_requests_total: u64,
    pub upstream_errors_total: u64,
    pub upstream_retries_total: u64,
    pub rate_limited_total: u64,
    pub records_dropped_total: u64,
}

impl MetricsSnapshot {
    /// Calculate request success rate
    pub fn request_success_rate(&self) -> f64 {
        if self.requests_total == 0 {
            return 100.0;
        }
        let success_requests = self.requests_total.saturating_sub(self.errors_total);
        (success_requests as f64 / self.requests_total as f64) * 100.0
    }

    /// Calculate upstream error rate
    pub fn upstream_error_rate(&self) -> f64 {
        if self.upstream_requests_total == 0 {
            return 0.0;
        }
        (self.upstream_errors_total as f64 / self.upstream_requests_total as f64) * 100.0
    }
}

/// One line of the access log, emitted for every finished request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub request_id: String,
    pub deployment_id: Option<String>,
    pub consumer_id: Option<String>,
    pub tool_name: Option<String>,
    pub duration_ms: u64,
    pub status: u16,
    /// Deployment lookup was answered without a store call
    pub cached: bool,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<Stage>,
    pub timestamp: DateTime<Utc>,
}

/// Fire-and-forget sender of access records
#[derive(Clone)]
pub struct RecordSink {
    tx: mpsc::Sender<RequestRecord>,
    dropped: Arc<AtomicU64>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RecordSink {
    /// Bounded sink plus the receiving end for [`drain_records`]
    pub fn channel(
        capacity: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> (Self, mpsc::Receiver<RequestRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                metrics,
            },
            rx,
        )
    }

    /// Queue a record; never waits, drops the record if the buffer is full
    pub fn emit(&self, record: RequestRecord) {
        if let Err(err) = self.tx.try_send(record) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_dropped_record();
            }
            match err {
                mpsc::error::TrySendError::Full(record) => {
                    debug!("Record buffer full, dropped {} ({} total)", record.request_id, dropped)
                }
                mpsc::error::TrySendError::Closed(record) => {
                    debug!("Record drain stopped, dropped {}", record.request_id)
                }
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Log every record as a JSON line and fold it into the metrics.
///
/// Returns when every [`RecordSink`] has been dropped.
pub async fn drain_records(
    mut rx: mpsc::Receiver<RequestRecord>,
    metrics: Option<Arc<MetricsCollector>>,
) -> u64 {
    let mut drained = 0;
    while let Some(record) = rx.recv().await {
        drained += 1;
        if let Some(metrics) = &metrics {
            metrics.record_response(record.status, Duration::from_millis(record.duration_ms));
        }
        match serde_json::to_string(&record) {
            Ok(line) => info!(target: ACCESS_LOG_TARGET, "{}", line),
            Err(e) => warn!("Failed to serialize access record {}: {}", record.request_id, e),
        }
    }
    debug!("Access record drain finished after {} records", drained);
    drained
}
