use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::Serialize;

use crate::dedup::Deduplicator;
use crate::protocol::{MessageKind, RelayMessage, BROADCAST_CHANNEL_NAME};

type Handler = Arc<dyn Fn(&RelayMessage) + Send + Sync>;

/// Statistics for the broadcast bus
#[derive(Debug, Default)]
pub struct BusStats {
    /// Messages accepted and fanned out
    pub published: AtomicU64,
    /// Messages dropped by the deduplicator
    pub deduplicated: AtomicU64,
    /// Handler invocations that panicked
    pub handler_panics: AtomicU64,
}

impl BusStats {
    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStatsSnapshot {
    pub published: u64,
    pub deduplicated: u64,
    pub handler_panics: u64,
}

struct BusInner {
    dedup: Deduplicator,
    /// kind -> handler_id -> handler
    handlers: DashMap<MessageKind, HashMap<u64, Handler>>,
    next_handler_id: AtomicU64,
    closed: AtomicBool,
    stats: BusStats,
}

/// In-process fan-out channel shared by the relay and every overlay
/// consumer, scoped by the fixed channel name.
///
/// Every inbound message passes the deduplicator before fan-out; a
/// rejected message triggers zero handler calls. Handlers for a kind form
/// a set: registering and removing one never disturbs the others, and a
/// panicking handler is isolated from the rest of the delivery round.
pub struct BroadcastBus {
    channel_name: &'static str,
    inner: Arc<BusInner>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self {
            channel_name: BROADCAST_CHANNEL_NAME,
            inner: Arc::new(BusInner {
                dedup: Deduplicator::new(),
                handlers: DashMap::new(),
                next_handler_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                stats: BusStats::default(),
            }),
        }
    }

    pub fn channel_name(&self) -> &'static str {
        self.channel_name
    }

    /// Register a handler for one message kind. The returned guard removes
    /// the handler when dropped; removal is synchronous, so a dropped guard
    /// is guaranteed to see no further deliveries.
    pub fn subscribe<F>(&self, kind: MessageKind, handler: F) -> BusSubscription
    where
        F: Fn(&RelayMessage) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .entry(kind)
            .or_default()
            .insert(id, Arc::new(handler));

        tracing::debug!(
            channel = %self.channel_name,
            kind = %kind,
            handler_id = id,
            "Handler registered"
        );

        BusSubscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Deliver a message to every handler registered for its kind.
    ///
    /// Returns `false` when the message was suppressed (stale timestamp or
    /// closed bus) and no handler ran.
    pub fn publish(&self, message: &RelayMessage) -> bool {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            tracing::debug!(channel = %self.channel_name, "Publish on closed bus ignored");
            return false;
        }

        let kind = message.kind();
        if !inner.dedup.accept(kind, message.timestamp) {
            inner.stats.deduplicated.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // Snapshot the handler set so registrations from inside a handler
        // cannot deadlock against the map shard.
        let handlers: Vec<Handler> = inner
            .handlers
            .get(&kind)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default();

        inner.stats.published.fetch_add(1, Ordering::Relaxed);

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                inner.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    channel = %self.channel_name,
                    kind = %kind,
                    "Broadcast handler panicked; continuing delivery"
                );
            }
        }

        tracing::trace!(
            channel = %self.channel_name,
            kind = %kind,
            handlers = handlers.len(),
            "Message fanned out"
        );

        true
    }

    /// Number of live handlers for a kind.
    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.inner
            .handlers
            .get(&kind)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Rewind all dedup watermarks. Test/debug affordance.
    pub fn reset_dedup(&self) {
        self.inner.dedup.reset();
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Tear the channel down: drop every handler and refuse further
    /// publishes. Must be called when the owning context goes away so
    /// listeners do not leak across lifecycles.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.handlers.clear();
        tracing::info!(channel = %self.channel_name, "Broadcast bus closed");
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer for a registered handler. Dropping it (or calling
/// [`BusSubscription::unsubscribe`]) removes exactly that handler.
pub struct BusSubscription {
    bus: Weak<BusInner>,
    kind: MessageKind,
    id: u64,
}

impl BusSubscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Some(mut entry) = inner.handlers.get_mut(&self.kind) {
                entry.remove(&self.id);
            }
            tracing::debug!(kind = %self.kind, handler_id = self.id, "Handler removed");
        }
    }
}
