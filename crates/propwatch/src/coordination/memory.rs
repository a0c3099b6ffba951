//! In-memory coordination service
//!
//! Behaves like a single-node coordination service: nodes live in a map,
//! child watches fire on creation under their parent, node watches fire on
//! every content update. Deletions do not notify. Individual paths can be
//! marked as failing to exercise error handling.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use super::{CoordinationClient, WatchEvent, WatchId, WatchSender};
use crate::location::parent_path;
use crate::{PropertiesError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Children,
    Node,
}

struct Watch {
    kind: WatchKind,
    path: String,
    tx: WatchSender,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Vec<u8>>,
    watches: HashMap<WatchId, Watch>,
    failing: HashSet<String>,
    next_id: u64,
}

/// Coordination client backed by process memory
#[derive(Default)]
pub struct MemoryCoordinator {
    state: Mutex<State>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a node, firing the matching watches
    pub fn set(&self, path: &str, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let mut state = self.state.lock();
        let created = state.nodes.insert(path.to_string(), data.clone()).is_none();

        let parent = parent_path(path);
        let mut closed = Vec::new();
        for (id, watch) in &state.watches {
            let event = match watch.kind {
                WatchKind::Children if created && watch.path == parent => WatchEvent::ChildAdded {
                    parent: parent.clone(),
                    path: path.to_string(),
                },
                WatchKind::Node if watch.path == path => WatchEvent::NodeChanged {
                    path: path.to_string(),
                    data: data.clone(),
                },
                _ => continue,
            };
            if watch.tx.send(event).is_err() {
                closed.push(*id);
            }
        }

        for id in closed {
            debug!(watch = id.0, "Dropping watch with closed receiver");
            state.watches.remove(&id);
        }
    }

    /// Remove a node without notifying watches
    pub fn delete(&self, path: &str) -> bool {
        self.state.lock().nodes.remove(path).is_some()
    }

    /// Make every call touching `path` fail
    pub fn fail_on(&self, path: &str) {
        self.state.lock().failing.insert(path.to_string());
    }

    /// Undo [`fail_on`](Self::fail_on)
    pub fn recover(&self, path: &str) {
        self.state.lock().failing.remove(path);
    }

    /// Number of installed watches
    pub fn watch_count(&self) -> usize {
        self.state.lock().watches.len()
    }

    /// Number of installed child watches on `parent`
    pub fn child_watch_count(&self, parent: &str) -> usize {
        self.state
            .lock()
            .watches
            .values()
            .filter(|w| w.kind == WatchKind::Children && w.path == parent)
            .count()
    }

    fn check(state: &State, path: &str) -> Result<()> {
        if state.failing.contains(path) {
            return Err(PropertiesError::coordination(format!(
                "injected failure for {path}"
            )));
        }
        Ok(())
    }

    fn install(&self, kind: WatchKind, path: &str, tx: WatchSender) -> Result<WatchId> {
        let mut state = self.state.lock();
        Self::check(&state, path)?;
        state.next_id += 1;
        let id = WatchId(state.next_id);
        state.watches.insert(
            id,
            Watch {
                kind,
                path: path.to_string(),
                tx,
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        Self::check(&state, path)?;
        Ok(state.nodes.get(path).cloned())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let state = self.state.lock();
        Self::check(&state, path)?;
        Ok(state.nodes.contains_key(path))
    }

    async fn watch_children(&self, parent: &str, tx: WatchSender) -> Result<WatchId> {
        self.install(WatchKind::Children, parent, tx)
    }

    async fn watch_node(&self, path: &str, tx: WatchSender) -> Result<WatchId> {
        self.install(WatchKind::Node, path, tx)
    }

    async fn unwatch(&self, id: WatchId) -> Result<()> {
        self.state.lock().watches.remove(&id);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryCoordinator")
            .field("nodes", &state.nodes.len())
            .field("watches", &state.watches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_child_watch_fires_on_create_only() {
        let zk = MemoryCoordinator::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        zk.watch_children("/app", tx).await.unwrap();

        zk.set("/app/config", "a=1");
        zk.set("/app/config", "a=2");
        zk.set("/other/config", "a=1");

        assert_eq!(
            rx.try_recv().unwrap(),
            WatchEvent::ChildAdded {
                parent: "/app".to_string(),
                path: "/app/config".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_node_watch_and_unwatch() {
        let zk = MemoryCoordinator::new();
        zk.set("/app/config", "a=1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = zk.watch_node("/app/config", tx).await.unwrap();

        zk.set("/app/config", "a=2");
        assert!(matches!(rx.try_recv().unwrap(), WatchEvent::NodeChanged { data, .. } if data == b"a=2"));

        zk.unwatch(id).await.unwrap();
        zk.set("/app/config", "a=3");
        assert!(rx.try_recv().is_err());
        assert_eq!(zk.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let zk = MemoryCoordinator::new();
        zk.fail_on("/broken");
        assert!(zk.exists("/broken").await.is_err());
        zk.recover("/broken");
        assert!(!zk.exists("/broken").await.unwrap());
    }
}
