//! `ClientRegistry`: the concurrent set of sinks a broadcast reaches.
//!
//! The accept path adds entries while the broadcast path iterates and evicts,
//! so the set lives in a sharded [`DashMap`]. A broadcast never holds a map
//! lock while delivering: it takes a snapshot of `Arc<Registration>`s and
//! works from that.
//!
//! Each registration carries its own async delivery lock:
//!
//! ```text
//!   broadcast ─► lock(delivery) ─► active? ─► sink.deliver(frame) ─► unlock
//!   unregister ─► remove ─► active = false ─► lock(delivery) ─► return
//! ```
//!
//! `unregister` returns only after any in-flight delivery to that sink has
//! completed, and a delivery that starts afterwards sees `active == false`,
//! so a sink never receives a frame after `unregister` returns. The same lock
//! keeps deliveries to one sink from overlapping.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyscreen_core::{Frame, RegistryError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tracing::{debug, Span};

use crate::sink::{DeliveryError, Sink};

/// One registered sink.
pub struct Registration {
    seq:      u64,
    sink:     Arc<dyn Sink>,
    active:   AtomicBool,
    delivery: tokio::sync::Mutex<()>,
}

impl Registration {
    pub fn id(&self) -> &str {
        self.sink.id()
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Deliver under the per-sink lock. `None` when the sink was unregistered
    /// before its turn came. A panicking sink reads as disconnected.
    pub(crate) async fn deliver(&self, frame: &Frame) -> Option<Result<usize, DeliveryError>> {
        let _turn = self.delivery.lock().await;
        if !self.is_active() {
            return None;
        }
        let outcome = std::panic::AssertUnwindSafe(self.sink.deliver(frame))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(DeliveryError::disconnected("sink panicked during delivery")));
        Some(outcome)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

pub struct ClientRegistry {
    clients:     DashMap<String, Arc<Registration>>,
    count:       AtomicUsize,
    next_seq:    AtomicU64,
    max_clients: usize,
    span:        Span,
}

impl ClientRegistry {
    pub fn new(max_clients: usize, span: Span) -> Self {
        Self {
            clients: DashMap::new(),
            count: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            max_clients,
            span,
        }
    }

    /// A registry with no client cap.
    pub fn unbounded(span: Span) -> Self {
        Self::new(usize::MAX, span)
    }

    /// Add a sink under its [`Sink::id`]. It receives every frame broadcast
    /// after this returns.
    pub fn register(&self, sink: Arc<dyn Sink>) -> Result<(), RegistryError> {
        let id = sink.id().to_owned();

        // Reserve a slot first; len() would deadlock against the entry lock.
        let limit = self.max_clients;
        if self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_err()
        {
            return Err(RegistryError::Full { limit });
        }

        match self.clients.entry(id) {
            Entry::Occupied(e) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                Err(RegistryError::DuplicateClient(e.key().clone()))
            }
            Entry::Vacant(e) => {
                debug!(parent: &self.span, "client {} registered", e.key());
                e.insert(Arc::new(Registration {
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    sink,
                    active: AtomicBool::new(true),
                    delivery: tokio::sync::Mutex::new(()),
                }));
                Ok(())
            }
        }
    }

    /// Remove `id`, waiting out any delivery to it that is in flight.
    /// Returns the sink so the caller can close it; `None` if unknown.
    pub async fn unregister(&self, id: &str) -> Option<Arc<dyn Sink>> {
        let (_, reg) = self.clients.remove(id)?;
        self.retire(&reg).await;
        debug!(parent: &self.span, "client {} unregistered", id);
        Some(Arc::clone(&reg.sink))
    }

    /// Remove exactly this registration. A newer registration that reused
    /// the id is left alone.
    pub(crate) async fn evict(&self, reg: &Arc<Registration>) -> bool {
        let removed = self
            .clients
            .remove_if(reg.id(), |_, current| current.seq == reg.seq)
            .is_some();
        if removed {
            self.retire(reg).await;
        }
        removed
    }

    async fn retire(&self, reg: &Registration) {
        self.count.fetch_sub(1, Ordering::AcqRel);
        reg.deactivate();
        let _drained = reg.delivery.lock().await;
    }

    /// Remove everything, returning the sinks in registration order.
    pub async fn drain(&self) -> Vec<Arc<dyn Sink>> {
        let mut drained = Vec::new();
        for reg in self.snapshot() {
            if self.evict(&reg).await {
                drained.push(Arc::clone(&reg.sink));
            }
        }
        drained
    }

    /// Current registrations in registration order.
    pub fn snapshot(&self) -> Vec<Arc<Registration>> {
        let mut regs: Vec<_> = self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        regs.sort_by_key(|r| r.seq);
        regs
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}
