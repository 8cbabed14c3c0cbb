//! Per-server event fan-out.
//!
//! Producers (state watcher, console tail, stats poller) call [`EventBus::emit`]
//! without knowing who is listening; each open websocket registers its own
//! listeners and removes them again by handle when it goes away.
//!
//! Emission is awaited listener by listener on the producer's task. A listener
//! that writes to a slow socket therefore holds up the producer that emitted
//! to it. That is the backpressure model for console delivery: producers must
//! tolerate blocking, nothing is buffered or dropped here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::trace;

pub const STATUS_EVENT: &str = "status";
pub const CONSOLE_OUTPUT_EVENT: &str = "console output";
pub const STATS_EVENT: &str = "stats";

type Listener = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<(SubscriptionId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` under `event`. The same closure may be registered
    /// any number of times; every registration gets its own handle.
    pub fn subscribe<F, Fut>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Listener =
            Arc::new(move |payload| -> BoxFuture<'static, ()> { Box::pin(callback(payload)) });

        self.listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, listener));

        trace!("Subscribed {:?} to {}", id, event);
        id
    }

    /// Removes exactly the listener behind `id`. Unknown handles are ignored.
    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;

        if entries.is_empty() {
            listeners.remove(event);
        }

        removed
    }

    /// Invokes every listener registered for `event`, in registration order.
    ///
    /// The listener list is snapshotted first so the lock is never held across
    /// an await; a listener removed mid-emit may still see this one payload.
    pub async fn emit(&self, event: &str, payload: impl Into<String>) {
        let snapshot: Vec<Listener> = match self.listeners.read().get(event) {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
        };

        let payload = payload.into();
        for listener in snapshot {
            listener(payload.clone()).await;
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.read().get(event).map_or(0, Vec::len)
    }
}
