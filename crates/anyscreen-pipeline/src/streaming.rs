//! `StreamingClientSink`: one MJPEG viewer.
//!
//! The sink writes multipart parts into a byte stream owned by the transport
//! (an HTTP response body, a socket, an in-memory pipe). Every write is
//! bounded by a timeout; a failed or timed-out write marks the sink inactive
//! and reports [`DeliveryError::Disconnected`], which drops this viewer and
//! nobody else.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyscreen_core::Frame;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn, Span};

use crate::jpeg::SharedJpeg;
use crate::mjpeg;
use crate::sink::{DeliveryError, Sink, SinkCounters};

/// The transport-owned byte stream a client is fed through.
pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StreamingClientSink {
    id:            String,
    writer:        tokio::sync::Mutex<Option<ClientWriter>>,
    jpeg:          Arc<SharedJpeg>,
    write_timeout: Duration,
    active:        AtomicBool,
    parts_sent:    AtomicU64,
    bytes_sent:    AtomicU64,
    last_write:    Mutex<Option<Instant>>,
    span:          Span,
}

impl StreamingClientSink {
    pub fn new(
        id: impl Into<String>,
        writer: ClientWriter,
        jpeg: Arc<SharedJpeg>,
        write_timeout: Duration,
        span: Span,
    ) -> Self {
        Self {
            id: id.into(),
            writer: tokio::sync::Mutex::new(Some(writer)),
            jpeg,
            write_timeout,
            active: AtomicBool::new(true),
            parts_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_write: Mutex::new(None),
            span,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn drop_client(&self, reason: String) -> DeliveryError {
        self.active.store(false, Ordering::Release);
        DeliveryError::Disconnected { reason }
    }
}

#[async_trait]
impl Sink for StreamingClientSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, frame: &Frame) -> Result<usize, DeliveryError> {
        if !self.is_active() {
            return Err(DeliveryError::disconnected("client inactive"));
        }

        let jpeg = match self.jpeg.get(frame).await {
            Ok(jpeg) => jpeg,
            Err(e) => {
                // Same failure for every viewer; the frame is skipped, the client
                // kept. Ok(0) is not counted as a delivery.
                warn!(parent: &self.span, "frame {} not encoded: {}", frame.id(), e);
                return Ok(0);
            }
        };
        let header = mjpeg::part_header(jpeg.len());

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(self.drop_client("client closed".into()));
        };

        let write = async {
            writer.write_all(&header).await?;
            writer.write_all(&jpeg).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                let written = header.len() + jpeg.len();
                self.parts_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
                *self.last_write.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                Ok(written)
            }
            Ok(Err(e)) => Err(self.drop_client(format!("write failed: {e}"))),
            Err(_) => Err(self.drop_client(format!("write timed out after {:?}", self.write_timeout))),
        }
    }

    async fn close(&self) {
        self.active.store(false, Ordering::Release);
        let Some(mut writer) = self.writer.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(self.write_timeout, writer.shutdown()).await.is_err() {
            debug!(parent: &self.span, "client {} shutdown timed out", self.id);
        }
        debug!(
            parent: &self.span,
            "client {} closed after {} part(s)",
            self.id,
            self.parts_sent.load(Ordering::Relaxed)
        );
    }

    fn counters(&self) -> SinkCounters {
        SinkCounters {
            parts_sent: self.parts_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            last_write: *self.last_write.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Per-viewer snapshot for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id:             String,
    pub active:         bool,
    /// Time since the last successful write, if any.
    pub last_write_age: Option<Duration>,
    pub parts_sent:     u64,
}
