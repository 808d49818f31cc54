//! Pingora front end that runs the resolution pipeline
use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use pingora_core::{
    server::{configuration::Opt, Server, ShutdownWatch},
    services::background::{background_service, BackgroundService},
    upstreams::peer::HttpPeer,
    Error as PingoraError, ErrorType, Result as PingoraResult,
};
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::GatewayError,
    metrics::{drain_records, MetricsCollector, RecordSink, RequestRecord},
    origin::HttpConnector,
    pipeline::{InboundRequest, ResolutionPipeline},
    store::{InMemoryStore, Store},
    stream::{BodySink, StreamError},
};

/// Request context that carries information throughout the request lifecycle
#[derive(Debug)]
pub struct RequestContext {
    /// Request start time
    pub start_time: Instant,
    /// Request id assigned by the pipeline
    pub request_id: Option<String>,
    /// Status written to the client
    pub status: Option<u16>,
    /// Body bytes written to the client
    pub bytes_sent: u64,
    /// Fired when the client goes away mid-pipeline
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            request_id: None,
            status: None,
            bytes_sent: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Get request duration
    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes response chunks to the downstream session
struct SessionSink<'a> {
    session: &'a mut Session,
}

#[async_trait]
impl BodySink for SessionSink<'_> {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        self.session
            .write_response_body(Some(chunk), false)
            .await
            .map_err(|e| StreamError::Sink(e.to_string()))
    }

    async fn finish(&mut self) -> Result<(), StreamError> {
        self.session
            .write_response_body(None, true)
            .await
            .map_err(|e| StreamError::Sink(e.to_string()))
    }
}

/// Background service draining access records into the log and metrics
pub struct RecordDrain {
    rx: Mutex<Option<mpsc::Receiver<RequestRecord>>>,
    metrics: Arc<MetricsCollector>,
}

#[async_trait]
impl BackgroundService for RecordDrain {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let Some(rx) = self.rx.lock().take() else {
            warn!("Access record drain started twice");
            return;
        };
        tokio::select! {
            drained = drain_records(rx, Some(Arc::clone(&self.metrics))) => {
                info!("Access record drain stopped after {} records", drained);
            }
            _ = shutdown.changed() => {
                info!("Access record drain shutting down");
            }
        }
    }
}

/// Tool-call gateway served by Pingora
pub struct ToolGateway {
    /// Configuration
    config: Arc<Config>,
    /// Request pipeline
    pipeline: Arc<ResolutionPipeline>,
    /// Metrics collector
    metrics: Arc<MetricsCollector>,
    /// Receiving end of the access records, handed to the drain service
    records: Mutex<Option<mpsc::Receiver<RequestRecord>>>,
}

impl ToolGateway {
    /// Build a gateway over the store seeded from the `store` config section
    pub fn new(config: Arc<Config>, metrics: Arc<MetricsCollector>) -> Result<Self> {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::from_config(&config.store));
        Self::with_store(config, store, metrics)
    }

    pub fn with_store(
        config: Arc<Config>,
        store: Arc<dyn Store>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;

        let (sink, records) =
            RecordSink::channel(config.metrics.record_buffer, Some(Arc::clone(&metrics)));
        let connector = Arc::new(HttpConnector::new(config.pool.connect_timeout));
        let pipeline = Arc::new(ResolutionPipeline::new(
            &config,
            store,
            connector,
            sink,
            Some(Arc::clone(&metrics)),
        ));

        Ok(Self {
            config,
            pipeline,
            metrics,
            records: Mutex::new(Some(records)),
        })
    }

    pub fn pipeline(&self) -> &Arc<ResolutionPipeline> {
        &self.pipeline
    }

    /// Start the gateway server; blocks forever
    pub fn run(self, daemon: bool) -> Result<()> {
        info!("Starting tollgate server");

        let mut opt = Opt::default();
        opt.daemon = daemon;
        let mut server = Server::new(Some(opt))?;
        server.bootstrap();

        let records = self.records.lock().take();
        let config = Arc::clone(&self.config);
        let metrics = Arc::clone(&self.metrics);

        // Create proxy service
        let mut proxy_service = pingora_proxy::http_proxy_service(&server.configuration, self);
        proxy_service.add_tcp(&config.server.http_addr.to_string());
        proxy_service.threads = config.server.threads;
        info!("HTTP server listening on {}", config.server.http_addr);
        server.add_service(proxy_service);

        if let Some(rx) = records {
            let drain = RecordDrain {
                rx: Mutex::new(Some(rx)),
                metrics,
            };
            server.add_service(background_service("access record drain", drain));
        }

        // Add metrics service if enabled
        if config.metrics.prometheus {
            if let Some(metrics_addr) = &config.metrics.metrics_addr {
                let mut metrics_service =
                    pingora_core::services::listening::Service::prometheus_http_service();
                metrics_service.add_tcp(&metrics_addr.to_string());
                server.add_service(metrics_service);
                info!("Metrics server listening on {}", metrics_addr);
            }
        }

        info!("Serving {} deployment(s)", config.store.deployments.len());
        server.run_forever();
    }

    /// Read the whole request body, failing once it exceeds the configured cap
    async fn read_body(&self, session: &mut Session) -> PingoraResult<Result<Bytes, usize>> {
        let limit = self.config.server.max_request_body;
        let mut body = BytesMut::new();
        while let Some(chunk) = session.read_request_body().await? {
            if body.len() + chunk.len() > limit {
                return Ok(Err(limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Ok(body.freeze()))
    }
}

#[async_trait]
impl ProxyHttp for ToolGateway {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        RequestContext::new()
    }

    /// Every request is answered here; nothing is proxied by Pingora itself
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> PingoraResult<bool> {
        let header = session.req_header();
        let mut inbound = InboundRequest {
            method: header.method.clone(),
            path: header
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| header.uri.path().to_string()),
            headers: header.headers.clone(),
            body: Bytes::new(),
        };

        let response = match self.read_body(session).await? {
            Ok(body) => {
                inbound.body = body;
                let handling = self.pipeline.handle(inbound, ctx.cancel.clone());
                tokio::pin!(handling);
                tokio::select! {
                    response = &mut handling => response,
                    idle = session.read_body_or_idle(true) => {
                        if let Err(e) = idle {
                            debug!("Client went away while handling request: {}", e);
                            ctx.cancel.cancel();
                        }
                        handling.await
                    }
                }
            }
            Err(limit) => self.pipeline.reject(
                &inbound,
                GatewayError::MalformedRequest(format!("request body exceeds {} bytes", limit)),
            ),
        };

        ctx.request_id = response.request_id().map(str::to_string);
        ctx.status = Some(response.status.as_u16());

        let mut header = ResponseHeader::build(response.status, Some(response.headers.len()))?;
        for (name, value) in response.headers.iter() {
            header.append_header(name.clone(), value.clone())?;
        }
        session
            .write_response_header(Box::new(header), false)
            .await?;

        let writer = self.pipeline.stream_writer();
        let mut sink = SessionSink { session };
        match writer.forward(response.body, &mut sink, response.deadline).await {
            Ok(stats) => {
                ctx.bytes_sent = stats.bytes;
                Ok(true)
            }
            Err(e) => {
                warn!(
                    "Streaming response for {} aborted: {}",
                    ctx.request_id.as_deref().unwrap_or("-"),
                    e
                );
                Err(PingoraError::explain(
                    ErrorType::WriteError,
                    format!("response stream aborted: {}", e),
                ))
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<Box<HttpPeer>> {
        error!(
            "Request {} reached upstream selection",
            ctx.request_id.as_deref().unwrap_or("-")
        );
        Err(PingoraError::explain(
            ErrorType::InternalError,
            "tool calls are dispatched by the pipeline",
        ))
    }

    /// Log request completion
    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let status_code = ctx
            .status
            .or_else(|| session.response_written().map(|resp| resp.status.as_u16()))
            .unwrap_or(0);
        let duration = ctx.duration();

        let log_level = if status_code >= 500 || e.is_some() {
            log::Level::Warn
        } else {
            log::Level::Debug
        };
        log::log!(
            log_level,
            "Request {} completed: {} {} -> {} ({}ms, {} bytes)",
            ctx.request_id.as_deref().unwrap_or("-"),
            session.req_header().method,
            session.req_header().uri.path(),
            status_code,
            duration.as_millis(),
            ctx.bytes_sent
        );

        if let Some(error) = e {
            error!(
                "Request {} encountered error: {}",
                ctx.request_id.as_deref().unwrap_or("-"),
                error
            );
        }
    }
}
