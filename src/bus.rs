//! Event bus - ordered topic routing, no business logic.
//!
//! Each subscriber gets its own channel and dispatch task, so a slow or
//! failing handler never blocks delivery to the others. Publish order is
//! preserved per event kind per subscriber; nothing is guaranteed across
//! kinds. Publishing a kind nobody subscribes to is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::core::Result;
use crate::events::{Event, EventKind};

/// A component that reacts to events. Handlers hold no references to each
/// other; they only read the event and publish new ones.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name, for logs
    fn name(&self) -> &str;

    /// React to one event. Errors are logged and isolated to this handler.
    async fn handle(&self, event: Event) -> Result<()>;
}

pub struct EventBus {
    routes: RwLock<HashMap<EventKind, Vec<mpsc::UnboundedSender<Event>>>>,
    /// Wildcard subscribers receiving every event (audit feed)
    taps: RwLock<Vec<mpsc::UnboundedSender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            taps: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler for one event kind. Spawns the handler's dispatch
    /// task; must be called from within a tokio runtime.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        self.routes.write().entry(kind).or_default().push(tx);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = handler.handle(event).await {
                    warn!(handler = handler.name(), error = %e, "event handler failed");
                }
            }
        });
    }

    /// Open a wildcard receiver over every published event. Intended for
    /// audit logging and external consumers; dropping the receiver
    /// unsubscribes.
    pub fn tap(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.taps.write().push(tx);
        rx
    }

    /// Enqueue an event for every subscriber of its kind, in publish order.
    /// No event is dropped silently: an unroutable kind is an explicit no-op.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();

        // A closed tap is pruned here; routing is unaffected.
        self.taps
            .write()
            .retain(|tap| tap.send(event.clone()).is_ok());

        let routes = self.routes.read();
        match routes.get(&kind) {
            Some(subscribers) if !subscribers.is_empty() => {
                for sub in subscribers {
                    sub.send(event.clone()).ok();
                }
            }
            _ => {
                trace!(%kind, "no subscriber for event kind");
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.routes.read().get(&kind).map_or(0, |v| v.len())
    }

    pub fn tap_count(&self) -> usize {
        self.taps.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
