//! Fan-out of property change events to registered listeners.
//!
//! Delivery is synchronous and follows registration order. Each listener is
//! isolated: an error or a panic is logged and delivery continues with the
//! next listener. Every event is also pushed onto a broadcast channel for
//! async consumers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::events::ChangeEvent;

/// Default buffer size for the broadcast channel.
const DEFAULT_BUFFER_SIZE: usize = 256;

/// Receives property change events.
pub trait PropertyChangeListener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "anonymous"
    }

    fn on_property_changed(&self, event: &ChangeEvent) -> anyhow::Result<()>;
}

impl<F> PropertyChangeListener for F
where
    F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_property_changed(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Publish/subscribe notifier for [`ChangeEvent`]s
pub struct EventNotifier {
    listeners: RwLock<Vec<Arc<dyn PropertyChangeListener>>>,
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a notifier whose broadcast channel keeps `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            listeners: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Register a listener. Registering the same listener twice delivers twice.
    pub fn register(&self, listener: Arc<dyn PropertyChangeListener>) {
        debug!(listener = %listener.name(), "Registered property listener");
        self.listeners.write().push(listener);
    }

    /// Unregister a listener previously passed to [`register`](Self::register).
    ///
    /// Returns `true` if it was registered.
    pub fn unregister(&self, listener: &Arc<dyn PropertyChangeListener>) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(index) => {
                listeners.remove(index);
                debug!(listener = %listener.name(), "Unregistered property listener");
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Subscribe to events as an async stream.
    ///
    /// Events posted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    /// Deliver one event to every registered listener
    pub fn post(&self, event: &ChangeEvent) {
        // Snapshot so listeners may (un)register while being notified
        let listeners: Vec<_> = self.listeners.read().clone();

        for listener in &listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_property_changed(event)));
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        listener = %listener.name(),
                        key = %event.key,
                        error = %e,
                        "Property listener failed"
                    );
                }
                Err(panic) => {
                    let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    error!(
                        listener = %listener.name(),
                        key = %event.key,
                        panic = %panic_msg,
                        "Property listener panicked"
                    );
                }
            }
        }

        // No receivers is not an error
        let _ = self.sender.send(event.clone());
    }

    /// Deliver a batch produced by one reconciliation, in order
    pub fn post_all(&self, events: &[ChangeEvent]) {
        for event in events {
            self.post(event);
        }
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventNotifier")
            .field("listeners", &self.listener_count())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
