//! Forwarding origin bodies to the client with backpressure
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::debug;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::dispatcher::ResponseBody;
use crate::error::UpstreamFault;

/// Failure while forwarding a body
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("client sink failed: {0}")]
    Sink(String),
    #[error("upstream body failed: {0}")]
    Upstream(UpstreamFault),
    #[error("response deadline passed while streaming")]
    Deadline,
}

/// Destination of a response body
#[async_trait]
pub trait BodySink: Send {
    /// Write one chunk; returns once the sink accepted it
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StreamError>;

    /// Signal the end of the body
    async fn finish(&mut self) -> Result<(), StreamError>;
}

/// Sink over a bounded channel; a full channel holds the writer back
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl BodySink for ChannelSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| StreamError::Sink("receiver dropped".into()))
    }

    async fn finish(&mut self) -> Result<(), StreamError> {
        Ok(())
    }
}

/// Totals of one forwarded body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub bytes: u64,
    pub chunks: u64,
}

/// Copies a [`ResponseBody`] into a [`BodySink`]
#[derive(Debug, Clone, Copy)]
pub struct StreamWriter {
    chunk_size: usize,
}

impl StreamWriter {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Forward every byte of `body` in order, at most `chunk_size` bytes per write.
    ///
    /// On any failure the body is dropped unfinished, which closes its
    /// upstream connection instead of returning it to the pool.
    pub async fn forward<S>(
        &self,
        mut body: ResponseBody,
        sink: &mut S,
        deadline: Instant,
    ) -> Result<StreamStats, StreamError>
    where
        S: BodySink + ?Sized,
    {
        let mut stats = StreamStats::default();
        loop {
            let frame = match timeout_at(deadline, body.next()).await {
                Ok(frame) => frame,
                Err(_) => return Err(StreamError::Deadline),
            };
            let mut frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(fault)) => return Err(StreamError::Upstream(fault)),
                None => break,
            };
            while !frame.is_empty() {
                let chunk = frame.split_to(self.chunk_size.min(frame.len()));
                let len = chunk.len() as u64;
                match timeout_at(deadline, sink.write_chunk(chunk)).await {
                    Ok(written) => written?,
                    Err(_) => return Err(StreamError::Deadline),
                }
                stats.bytes += len;
                stats.chunks += 1;
            }
        }
        match timeout_at(deadline, sink.finish()).await {
            Ok(finished) => finished?,
            Err(_) => return Err(StreamError::Deadline),
        }
        debug!("Forwarded {} bytes in {} chunks", stats.bytes, stats.chunks);
        Ok(stats)
    }
}
