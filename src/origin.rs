//! Origin transport: request/response types and the HTTP/1.1 connector
use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::header::{HeaderValue, ACCEPT, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyStream, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use log::debug;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::error::{GatewayError, UpstreamFault};
use crate::model::Deployment;

/// Body chunks as they arrive from the origin
pub type ByteStream = BoxStream<'static, Result<Bytes, UpstreamFault>>;

/// Host and port a pool of connections is kept for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginHost {
    host: String,
    port: u16,
}

impl OriginHost {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        Some(Self::new(url.host_str()?, url.port_or_known_default()?))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for OriginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One call to an origin, replayable across retry attempts
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub host: OriginHost,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginRequest {
    /// POST the JSON arguments to `{origin_base_url}/{tool}`
    pub fn tool_call(
        deployment: &Deployment,
        tool_name: &str,
        arguments: &serde_json::Value,
        request_id: &str,
    ) -> Result<Self, GatewayError> {
        let misconfigured = |reason: String| GatewayError::Upstream {
            attempts_made: 0,
            last_fault: UpstreamFault::Connect(reason),
        };

        let base = Url::parse(&deployment.origin_base_url)
            .map_err(|e| misconfigured(format!("invalid origin url: {}", e)))?;
        let host = OriginHost::from_url(&base)
            .ok_or_else(|| misconfigured(format!("origin url has no host: {}", base)))?;

        let mut path_and_query = format!("{}/{}", base.path().trim_end_matches('/'), tool_name);
        if let Some(query) = base.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        let body = serde_json::to_vec(arguments)
            .map_err(|e| GatewayError::MalformedRequest(format!("unserializable arguments: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"));
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert("x-request-id", value);
        }

        Ok(Self {
            method: Method::POST,
            host,
            path_and_query,
            headers,
            body: Bytes::from(body),
        })
    }
}

/// Response head plus a lazily read body
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

/// A live connection to one origin host
#[async_trait]
pub trait OriginConnection: Send {
    /// Issue one request; the connection is busy until the body is drained
    async fn send(&mut self, request: &OriginRequest) -> Result<OriginResponse, UpstreamFault>;

    /// False once the peer or the protocol state closed the connection
    fn is_open(&self) -> bool;
}

/// Opens new connections for the pool
#[async_trait]
pub trait OriginConnector: Send + Sync {
    async fn connect(&self, host: &OriginHost) -> Result<Box<dyn OriginConnection>, UpstreamFault>;
}

/// Plain HTTP/1.1 connector over TCP
pub struct HttpConnector {
    connect_timeout: Duration,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl OriginConnector for HttpConnector {
    async fn connect(&self, host: &OriginHost) -> Result<Box<dyn OriginConnection>, UpstreamFault> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((host.host(), host.port())),
        )
        .await
        .map_err(|_| UpstreamFault::Connect(format!("connect to {} timed out", host)))?
        .map_err(|e| UpstreamFault::Connect(format!("{}: {}", host, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on connection to {}: {}", host, e);
        }

        let (sender, connection) = timeout(self.connect_timeout, http1::handshake(TokioIo::new(stream)))
            .await
            .map_err(|_| UpstreamFault::Connect(format!("handshake with {} timed out", host)))?
            .map_err(|e| UpstreamFault::Connect(format!("handshake with {}: {}", host, e)))?;

        let label = host.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Connection to {} ended: {}", label, e);
            }
        });

        debug!("Opened connection to {}", host);
        Ok(Box::new(HttpConnection {
            sender,
            authority: host.to_string(),
        }))
    }
}

struct HttpConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    authority: String,
}

#[async_trait]
impl OriginConnection for HttpConnection {
    async fn send(&mut self, request: &OriginRequest) -> Result<OriginResponse, UpstreamFault> {
        self.sender
            .ready()
            .await
            .map_err(|e| UpstreamFault::Io(e.to_string()))?;

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.path_and_query.as_str())
            .header(HOST, self.authority.as_str());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let outbound = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| UpstreamFault::Io(e.to_string()))?;

        let response = self
            .sender
            .send_request(outbound)
            .await
            .map_err(|e| UpstreamFault::Io(e.to_string()))?;
        let (parts, incoming) = response.into_parts();

        let body = BodyStream::new(incoming)
            .try_filter_map(|frame| future::ready(Ok(frame.into_data().ok())))
            .map_err(|e| UpstreamFault::Io(e.to_string()))
            .boxed();

        Ok(OriginResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}
