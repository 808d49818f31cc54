//! Scripted origin and counting store shared by unit tests
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{StoreError, UpstreamFault};
use crate::model::{Consumer, Deployment, PricingPlan};
use crate::origin::{OriginConnection, OriginConnector, OriginHost, OriginRequest, OriginResponse};
use crate::store::{InMemoryStore, Store};

/// What the fake origin does with the next request
#[derive(Clone)]
pub enum Script {
    Respond {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<Bytes>,
        /// Delay before the response head
        delay: Duration,
        /// Yield an i/o fault after this many chunks
        fail_after: Option<usize>,
    },
    Fail(UpstreamFault),
    Hang,
}

impl Script {
    pub fn ok(status: u16, body: &'static str) -> Self {
        Script::Respond {
            status,
            headers: vec![("content-type", "application/json")],
            chunks: if body.is_empty() {
                Vec::new()
            } else {
                vec![Bytes::from_static(body.as_bytes())]
            },
            delay: Duration::ZERO,
            fail_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self::ok(status, "")
    }

    pub fn chunked(chunks: Vec<Bytes>) -> Self {
        Script::Respond {
            status: 200,
            headers: vec![("content-type", "application/octet-stream")],
            chunks,
            delay: Duration::ZERO,
            fail_after: None,
        }
    }

    pub fn with_headers(mut self, extra: Vec<(&'static str, &'static str)>) -> Self {
        if let Script::Respond { headers, .. } = &mut self {
            headers.extend(extra);
        }
        self
    }

    pub fn delayed(mut self, by: Duration) -> Self {
        if let Script::Respond { delay, .. } = &mut self {
            *delay = by;
        }
        self
    }

    pub fn failing_after(mut self, count: usize) -> Self {
        if let Script::Respond { fail_after, .. } = &mut self {
            *fail_after = Some(count);
        }
        self
    }
}

struct Shared {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<OriginRequest>>,
    epoch: AtomicU64,
}

/// Connector whose connections answer from a shared script queue.
///
/// An exhausted queue answers `200 {}`.
pub struct ScriptedConnector {
    shared: Arc<Shared>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            shared: Arc::new(Shared {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
                epoch: AtomicU64::new(0),
            }),
            connects: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, script: Script) {
        self.shared.scripts.lock().push_back(script);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<OriginRequest> {
        self.shared.requests.lock().clone()
    }

    pub fn remaining_scripts(&self) -> usize {
        self.shared.scripts.lock().len()
    }

    /// Mark every connection opened so far as closed by the peer
    pub fn close_all(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Refuse the next `count` connects
    pub fn fail_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl OriginConnector for ScriptedConnector {
    async fn connect(&self, host: &OriginHost) -> Result<Box<dyn OriginConnection>, UpstreamFault> {
        let refused = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(UpstreamFault::Connect(format!("{} refused", host)));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            shared: Arc::clone(&self.shared),
            epoch: self.shared.epoch.load(Ordering::SeqCst),
        }))
    }
}

struct ScriptedConnection {
    shared: Arc<Shared>,
    epoch: u64,
}

#[async_trait]
impl OriginConnection for ScriptedConnection {
    async fn send(&mut self, request: &OriginRequest) -> Result<OriginResponse, UpstreamFault> {
        self.shared.requests.lock().push(request.clone());
        let script = self
            .shared
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::ok(200, "{}"));

        match script {
            Script::Fail(fault) => Err(fault),
            Script::Hang => {
                futures::future::pending::<()>().await;
                Err(UpstreamFault::Timeout)
            }
            Script::Respond {
                status,
                headers,
                chunks,
                delay,
                fail_after,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.append(name, HeaderValue::from_static(value));
                }
                let mut items: Vec<Result<Bytes, UpstreamFault>> = chunks.into_iter().map(Ok).collect();
                if let Some(count) = fail_after {
                    items.truncate(count);
                    items.push(Err(UpstreamFault::Io("connection reset".into())));
                }
                Ok(OriginResponse {
                    status: StatusCode::from_u16(status).unwrap(),
                    headers: map,
                    body: stream::iter(items).boxed(),
                })
            }
        }
    }

    fn is_open(&self) -> bool {
        self.shared.epoch.load(Ordering::SeqCst) == self.epoch
    }
}

/// In-memory store that counts lookups and can inject faults
pub struct CountingStore {
    inner: InMemoryStore,
    pub deployment_lookups: AtomicUsize,
    pub consumer_lookups: AtomicUsize,
    pub plan_lookups: AtomicUsize,
    delay: Duration,
    transient_failures: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            deployment_lookups: AtomicUsize::new(0),
            consumer_lookups: AtomicUsize::new(0),
            plan_lookups: AtomicUsize::new(0),
            delay: Duration::ZERO,
            transient_failures: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `count` deployment lookups with a transient fault
    pub fn fail_transiently(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn fetch_deployment(&self, id: &str) -> Result<Option<Deployment>, StoreError> {
        self.deployment_lookups.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Transient("replica lagging".into()));
        }
        self.inner.fetch_deployment(id).await
    }

    async fn fetch_consumer(&self, id: &str) -> Result<Option<Consumer>, StoreError> {
        self.consumer_lookups.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.inner.fetch_consumer(id).await
    }

    async fn fetch_plan(&self, slug: &str) -> Result<Option<PricingPlan>, StoreError> {
        self.plan_lookups.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.inner.fetch_plan(slug).await
    }
}
