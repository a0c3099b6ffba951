//! Coordination service boundary
//!
//! The watcher only talks to the coordination service through
//! [`CoordinationClient`]. Watch callbacks never run watcher code directly:
//! clients push [`WatchEvent`]s onto the channel handed to them at
//! registration, and the watcher's dispatcher consumes them.

pub mod memory;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, mpsc};
use tracing::info;

use crate::Result;

/// Notification produced by an installed watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A child node was created under a watched parent
    ChildAdded { parent: String, path: String },
    /// The content of a watched node changed
    NodeChanged { path: String, data: Vec<u8> },
}

/// Channel end handed to the client when a watch is installed
pub type WatchSender = mpsc::UnboundedSender<WatchEvent>;

/// Identifier of an installed watch, used to remove it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Client for a ZooKeeper-like coordination service.
///
/// Connection management (session timeouts, retries, backoff) belongs to the
/// implementation.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Read node content. `None` if the node does not exist.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Check whether a node exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Send [`WatchEvent::ChildAdded`] for every child created under `parent`
    async fn watch_children(&self, parent: &str, tx: WatchSender) -> Result<WatchId>;

    /// Send [`WatchEvent::NodeChanged`] whenever the content of `path` changes
    async fn watch_node(&self, path: &str, tx: WatchSender) -> Result<WatchId>;

    /// Remove a watch. Unknown ids are ignored.
    async fn unwatch(&self, id: WatchId) -> Result<()>;
}

/// Establishes connections for a connection string
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn CoordinationClient>>;
}

/// Connection cache keyed by connection string.
///
/// Concurrent first-time callers for the same connection string share one
/// connection attempt; a failed attempt leaves the slot empty so the next
/// caller retries.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Arc<OnceCell<Arc<dyn CoordinationClient>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the client for `connection_string`, connecting on first use
    pub async fn get_or_connect(
        &self,
        connection_string: &str,
        factory: &dyn ClientFactory,
    ) -> Result<Arc<dyn CoordinationClient>> {
        let cell = self
            .clients
            .entry(connection_string.to_string())
            .or_default()
            .clone();

        let client = cell
            .get_or_try_init(|| async {
                info!(connection = %connection_string, "Connecting to coordination service");
                factory.connect(connection_string).await
            })
            .await?;

        Ok(client.clone())
    }

    /// Register an already connected client
    pub fn insert(&self, connection_string: impl Into<String>, client: Arc<dyn CoordinationClient>) {
        self.clients
            .insert(connection_string.into(), Arc::new(OnceCell::new_with(Some(client))));
    }

    /// Get a connected client without connecting
    pub fn get(&self, connection_string: &str) -> Option<Arc<dyn CoordinationClient>> {
        self.clients
            .get(connection_string)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of established connections
    pub fn len(&self) -> usize {
        self.clients.iter().filter(|c| c.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("connections", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PropertiesError;
    use crate::coordination::memory::MemoryCoordinator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingFactory {
        connects: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ClientFactory for CountingFactory {
        async fn connect(&self, _connection_string: &str) -> Result<Arc<dyn CoordinationClient>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(PropertiesError::coordination("connection refused"));
            }
            Ok(Arc::new(MemoryCoordinator::new()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_connection_per_string() {
        let registry = Arc::new(ClientRegistry::new());
        let factory = Arc::new(CountingFactory {
            connects: AtomicUsize::new(0),
            fail: false,
        });

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let factory = factory.clone();
                tokio::spawn(async move {
                    registry
                        .get_or_connect("zk1:2181", factory.as_ref())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut clients = Vec::new();
        for task in tasks {
            clients.push(task.await.unwrap());
        }

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

        registry
            .get_or_connect("zk2:2181", factory.as_ref())
            .await
            .unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_is_retried() {
        let registry = ClientRegistry::new();
        let failing = CountingFactory {
            connects: AtomicUsize::new(0),
            fail: true,
        };

        assert!(registry.get_or_connect("zk:2181", &failing).await.is_err());
        assert!(registry.get("zk:2181").is_none());
        assert!(registry.get_or_connect("zk:2181", &failing).await.is_err());
        assert_eq!(failing.connects.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_insert_prewired_client() {
        let registry = ClientRegistry::new();
        registry.insert("local", Arc::new(MemoryCoordinator::new()));
        assert!(registry.get("local").is_some());
        assert_eq!(registry.len(), 1);
    }
}
