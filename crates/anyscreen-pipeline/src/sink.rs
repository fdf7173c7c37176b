//! The per-consumer delivery contract.
//!
//! The [`Distributor`](crate::Distributor) only ever sees `dyn Sink` and the
//! severity carried by [`DeliveryError`]; what a sink does with a frame and
//! how it fails is its own business.

use std::time::Instant;

use anyscreen_core::{Frame, RecordingError};
use async_trait::async_trait;
use thiserror::Error;

/// Why a delivery did not happen, and how bad that is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The owning session cannot continue (e.g. the recording encoder broke).
    #[error(transparent)]
    Fatal(#[from] RecordingError),

    /// This sink is gone; drop it and keep broadcasting to the others.
    #[error("Sink disconnected: {reason}")]
    Disconnected { reason: String },
}

impl DeliveryError {
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected { reason: reason.into() }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// A consumer of frames.
///
/// `deliver` is never invoked concurrently for the same sink; the registry
/// serialises deliveries per entry. Implementations bound their own I/O with
/// a timeout so one slow sink cannot stall a whole broadcast.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Stable identifier (client address, output path, ...).
    fn id(&self) -> &str;

    /// Consume one frame and return the number of bytes written downstream
    /// (0 when nothing was written). The frame is shared read-only with
    /// other sinks.
    async fn deliver(&self, frame: &Frame) -> Result<usize, DeliveryError>;

    /// Flush and release resources. Safe to call more than once.
    async fn close(&self);

    /// Delivery counters, for sinks that keep them.
    fn counters(&self) -> SinkCounters {
        SinkCounters::default()
    }
}

/// Point-in-time delivery counters of one sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkCounters {
    /// Frames fully written.
    pub parts_sent: u64,
    pub bytes_sent: u64,
    /// Completion time of the last successful write.
    pub last_write: Option<Instant>,
}
