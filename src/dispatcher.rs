//! Origin dispatch with bounded retries inside a time budget
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use http::header::HeaderName;
use http::{HeaderMap, StatusCode};
use log::{debug, warn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::config::{DispatchConfig, PoolConfig};
use crate::error::{GatewayError, UpstreamFault};
use crate::metrics::MetricsCollector;
use crate::origin::{ByteStream, OriginRequest};
use crate::pool::{AcquireError, ConnectionPool, PooledConnection};

/// Upstream response headers passed through to the caller
pub const FORWARDED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "cache-control",
    "etag",
    "x-ratelimit-remaining",
];

/// Keep only allow-listed headers, preserving repeated values
pub fn filter_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        for value in upstream.get_all(*name) {
            filtered.append(HeaderName::from_static(name), value.clone());
        }
    }
    filtered
}

/// Retry policy of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Request scoped retry bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub next_delay: Duration,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            next_delay: policy.base_delay,
        }
    }

    /// Delay before the next attempt (`base * 2^attempt`), then advance
    pub fn backoff(&mut self, policy: &RetryPolicy) -> Duration {
        let delay = self.next_delay;
        self.attempt += 1;
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.next_delay = policy.base_delay.saturating_mul(factor);
        delay
    }
}

/// Streaming body of a tool call.
///
/// The pooled connection goes back to the pool once the last chunk has been
/// read. An upstream error, or dropping the body early, closes it instead.
pub struct ResponseBody {
    stream: Option<ByteStream>,
    lease: Option<PooledConnection>,
}

impl ResponseBody {
    fn upstream(stream: ByteStream, lease: PooledConnection) -> Self {
        Self {
            stream: Some(stream),
            lease: Some(lease),
        }
    }

    /// Body fully buffered in memory
    pub fn full(bytes: Bytes) -> Self {
        let stream = if bytes.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(bytes) }).boxed()
        };
        Self {
            stream: Some(stream),
            lease: None,
        }
    }

    /// Read the rest of the body into memory
    pub async fn into_bytes(mut self) -> Result<Bytes, UpstreamFault> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, UpstreamFault>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(None);
        };
        match stream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(fault))) => {
                this.stream = None;
                // Dropping the lease closes the broken connection
                this.lease = None;
                Poll::Ready(Some(Err(fault)))
            }
            Poll::Ready(None) => {
                this.stream = None;
                if let Some(lease) = this.lease.take() {
                    lease.release();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Successful (status < 500) outcome of [`Dispatcher::call`]
pub struct ToolCallResult {
    pub status: StatusCode,
    /// Allow-listed upstream headers
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub attempts: u32,
}

impl ToolCallResult {
    /// Number of attempts after the first
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

enum AttemptError {
    Exhausted,
    Fault(UpstreamFault),
}

/// Sends origin requests over the pool, retrying failed attempts
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    acquire_timeout: Duration,
    attempt_timeout_ratio: f64,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Dispatcher {
    pub fn new(pool: Arc<ConnectionPool>, dispatch: &DispatchConfig, pool_config: &PoolConfig) -> Self {
        Self {
            pool,
            acquire_timeout: pool_config.acquire_timeout,
            attempt_timeout_ratio: dispatch.attempt_timeout_ratio,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Call the origin, retrying 5xx responses, faults and attempt timeouts.
    ///
    /// The whole call, backoff included, stays inside `budget`. A response
    /// below 500 is returned immediately, without retry.
    pub async fn call(
        &self,
        request: &OriginRequest,
        budget: Duration,
        policy: &RetryPolicy,
    ) -> Result<ToolCallResult, GatewayError> {
        let deadline = Instant::now() + budget;
        let max_attempts = policy.max_attempts.max(1);
        let mut retry = RetryState::new(policy);
        let mut attempts_made = 0;
        let mut last_fault = UpstreamFault::Timeout;

        while attempts_made < max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_fault = UpstreamFault::Timeout;
                break;
            }
            attempts_made += 1;
            let last_attempt = attempts_made == max_attempts;

            match self.attempt(request, deadline, last_attempt).await {
                Ok(result) if result.status.as_u16() < 500 => {
                    return Ok(ToolCallResult {
                        attempts: attempts_made,
                        ..result
                    });
                }
                Ok(result) => {
                    last_fault = UpstreamFault::Status(result.status.as_u16());
                }
                Err(AttemptError::Exhausted) => {
                    return Err(GatewayError::PoolExhausted {
                        host: request.host.to_string(),
                    });
                }
                Err(AttemptError::Fault(fault)) => last_fault = fault,
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_upstream_error();
            }
            warn!(
                "Attempt {}/{} to {}{} failed: {}",
                attempts_made, max_attempts, request.host, request.path_and_query, last_fault
            );

            if last_attempt {
                break;
            }
            let delay = retry.backoff(policy);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if delay >= remaining {
                debug!(
                    "Backoff of {:?} would exceed the remaining budget of {:?}",
                    delay, remaining
                );
                break;
            }
            if let Some(metrics) = &self.metrics {
                metrics.record_retry();
            }
            sleep(delay).await;
        }

        Err(GatewayError::Upstream {
            attempts_made,
            last_fault,
        })
    }

    async fn attempt(
        &self,
        request: &OriginRequest,
        deadline: Instant,
        last_attempt: bool,
    ) -> Result<ToolCallResult, AttemptError> {
        let started = Instant::now();
        let remaining = deadline.saturating_duration_since(started);

        let mut lease = match timeout(
            remaining,
            self.pool.acquire(&request.host, self.acquire_timeout.min(remaining)),
        )
        .await
        {
            Ok(Ok(lease)) => lease,
            Ok(Err(AcquireError::Exhausted)) => return Err(AttemptError::Exhausted),
            Ok(Err(AcquireError::Connect(fault))) => return Err(AttemptError::Fault(fault)),
            Err(_) => return Err(AttemptError::Fault(UpstreamFault::Timeout)),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt_timeout = if last_attempt {
            remaining
        } else {
            remaining.mul_f64(self.attempt_timeout_ratio)
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_upstream_request();
        }
        // On timeout or fault the lease is dropped here, closing the connection
        let response = match timeout(attempt_timeout, lease.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(fault)) => return Err(AttemptError::Fault(fault)),
            Err(_) => return Err(AttemptError::Fault(UpstreamFault::Timeout)),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_upstream_duration(started.elapsed());
        }

        debug!(
            "{} {}{} -> {}",
            request.method, request.host, request.path_and_query, response.status
        );
        Ok(ToolCallResult {
            status: response.status,
            headers: filter_headers(&response.headers),
            body: ResponseBody::upstream(response.body, lease),
            attempts: 0,
        })
    }
}
