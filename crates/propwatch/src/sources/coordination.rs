//! Coordination-service watcher
//!
//! Every configured node path ends up with a live content watch, even when
//! the node does not exist at start:
//!
//! ```text
//! Unwatched ──exists──────────────────────────────► WatchingNodeDirectly
//!     │                                                   ▲
//!     └──missing──► WatchingParentForChild ──child added──┘
//! ```
//!
//! Paths sharing a parent share one child watch. The parent watch is removed
//! once none of its awaited paths is still missing. Node deletions are not
//! tracked: a path stays in `WatchingNodeDirectly` for the watcher's lifetime.
//!
//! Client callbacks only enqueue [`WatchEvent`]s. A dispatcher task consumes
//! them; content reconciliation runs on the blocking pool so a slow listener
//! never stalls event delivery. Every content read, whether watch-driven or
//! a [`refresh`](CoordinationWatcher::refresh), takes a sequence number
//! before the content is obtained, and older content never overwrites newer
//! content for the same path. Stopping waits for in-flight reconciliations.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::coordination::{CoordinationClient, WatchEvent, WatchId, WatchSender};
use crate::events::PropertySource;
use crate::location::parent_path;
use crate::sources::{SourceReader, WatchHandle};
use crate::store::PropertyStore;
use crate::{PropertiesError, Result};

/// Watch state of a configured coordination path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchState {
    /// No watch installed
    Unwatched,
    /// The node is missing; its parent is watched for child creation
    WatchingParentForChild,
    /// A content watch is installed on the node itself
    WatchingNodeDirectly,
}

struct Shared {
    client: Arc<dyn CoordinationClient>,
    store: Arc<PropertyStore>,
    reader: SourceReader,
    paths: Vec<String>,
    states: DashMap<String, WatchState>,
    /// parent path -> configured paths still missing under it
    pending: DashMap<String, BTreeSet<String>>,
    parent_watches: DashMap<String, WatchId>,
    node_watches: DashMap<String, WatchId>,
    /// path -> sequence number of the last applied content
    applied: DashMap<String, Arc<Mutex<u64>>>,
    sequence: AtomicU64,
    /// Watch-driven reconciliations not yet joined
    in_flight: Mutex<JoinSet<()>>,
}

/// Watches coordination-service nodes and reconciles their content
#[derive(Clone)]
pub struct CoordinationWatcher {
    shared: Arc<Shared>,
}

impl CoordinationWatcher {
    pub fn new<I, S>(
        client: Arc<dyn CoordinationClient>,
        store: Arc<PropertyStore>,
        reader: SourceReader,
        paths: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let paths: Vec<String> = paths
            .into_iter()
            .map(Into::into)
            .filter(|p| seen.insert(p.clone()))
            .collect();

        let states = paths
            .iter()
            .map(|p| (p.clone(), WatchState::Unwatched))
            .collect();

        Self {
            shared: Arc::new(Shared {
                client,
                store,
                reader,
                paths,
                states,
                pending: DashMap::new(),
                parent_watches: DashMap::new(),
                node_watches: DashMap::new(),
                applied: DashMap::new(),
                sequence: AtomicU64::new(0),
                in_flight: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Configured paths, deduplicated
    pub fn paths(&self) -> &[String] {
        &self.shared.paths
    }

    /// Current state of a configured path
    pub fn state(&self, path: &str) -> Option<WatchState> {
        self.shared.states.get(path).map(|s| *s)
    }

    /// Parents currently watched for child creation
    pub fn watched_parents(&self) -> Vec<String> {
        let mut parents: Vec<String> = self
            .shared
            .parent_watches
            .iter()
            .map(|e| e.key().clone())
            .collect();
        parents.sort();
        parents
    }

    /// Install watches for every configured path and start dispatching.
    ///
    /// A path whose existence check or watch installation fails is logged
    /// and left unwatched; the other paths are unaffected.
    pub async fn start(&self) -> WatchHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut missing: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for path in &self.shared.paths {
            match self.shared.client.exists(path).await {
                Ok(true) => {
                    if let Err(e) = self.watch_directly(path, &tx).await {
                        error!(path = %path, error = %e, "Unable to watch path");
                    }
                }
                Ok(false) => {
                    missing
                        .entry(parent_path(path))
                        .or_default()
                        .insert(path.clone());
                }
                Err(e) => {
                    let e = PropertiesError::watch_install(path.as_str(), e);
                    error!(path = %path, error = %e, "Unable to watch path");
                }
            }
        }

        for (parent, awaited) in missing {
            self.watch_parent(parent, awaited, &tx).await;
        }

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let watcher = self.clone();

        let handle = tokio::spawn(async move {
            info!(paths = watcher.shared.paths.len(), "Started watching coordination paths");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("Coordination watcher shutting down");
                        break;
                    }
                    event = rx.recv() => match event {
                        Some(WatchEvent::NodeChanged { path, data }) => {
                            if watcher.shared.node_watches.contains_key(&path) {
                                let sequence = watcher.next_sequence();
                                watcher.dispatch(&path, data, sequence);
                            } else {
                                debug!(path = %path, "Ignoring change for unwatched node");
                            }
                        }
                        Some(WatchEvent::ChildAdded { parent, path }) => {
                            debug!(parent = %parent, child = %path, "Child created");
                            if watcher.shared.pending.contains_key(&parent) {
                                watcher.promote_ready(&parent, &tx).await;
                            }
                        }
                        None => break,
                    }
                }
            }

            watcher.release_watches().await;
        });

        WatchHandle::new(handle, shutdown_tx)
    }

    async fn watch_directly(&self, path: &str, tx: &WatchSender) -> Result<()> {
        let id = self
            .shared
            .client
            .watch_node(path, tx.clone())
            .await
            .map_err(|e| PropertiesError::watch_install(path, e))?;

        self.shared.node_watches.insert(path.to_string(), id);
        self.shared
            .states
            .insert(path.to_string(), WatchState::WatchingNodeDirectly);
        info!(path = %path, "Watching node");
        Ok(())
    }

    async fn watch_parent(&self, parent: String, awaited: BTreeSet<String>, tx: &WatchSender) {
        let id = match self.shared.client.watch_children(&parent, tx.clone()).await {
            Ok(id) => id,
            Err(e) => {
                let e = PropertiesError::watch_install(parent.as_str(), e);
                error!(parent = %parent, paths = ?awaited, error = %e, "Unable to watch parent path");
                return;
            }
        };

        for path in &awaited {
            self.shared
                .states
                .insert(path.clone(), WatchState::WatchingParentForChild);
        }
        info!(parent = %parent, paths = ?awaited, "Waiting for nodes to be created");
        self.shared.parent_watches.insert(parent.clone(), id);
        self.shared.pending.insert(parent.clone(), awaited);

        // A node created between the existence check and the watch install
        // would otherwise never be noticed
        self.promote_ready(&parent, tx).await;
    }

    /// Move every awaited path under `parent` that now exists to direct
    /// watching, then drop the parent watch if nothing is left to wait for.
    async fn promote_ready(&self, parent: &str, tx: &WatchSender) {
        let awaited: Vec<String> = self
            .shared
            .pending
            .get(parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for path in awaited {
            match self.shared.client.exists(&path).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(path = %path, error = %e, "Existence check failed");
                    continue;
                }
            }

            if let Err(e) = self.watch_directly(&path, tx).await {
                error!(path = %path, error = %e, "Unable to watch created node");
                continue;
            }
            if let Some(mut set) = self.shared.pending.get_mut(parent) {
                set.remove(&path);
            }
            self.fetch_and_dispatch(&path).await;
        }

        let drained = self
            .shared
            .pending
            .remove_if(parent, |_, set| set.is_empty())
            .is_some();
        if drained && let Some((_, id)) = self.shared.parent_watches.remove(parent) {
            if let Err(e) = self.shared.client.unwatch(id).await {
                warn!(parent = %parent, error = %e, "Failed to remove parent watch");
            }
            debug!(parent = %parent, "Parent watch released");
        }
    }

    async fn fetch_and_dispatch(&self, path: &str) {
        let sequence = self.next_sequence();
        match self.shared.client.read(path).await {
            Ok(Some(data)) => self.dispatch(path, data, sequence),
            Ok(None) => debug!(path = %path, "Node vanished before it could be read"),
            Err(e) => {
                let e = PropertiesError::source_read(path, e);
                error!(path = %path, error = %e, "Failed to read created node");
            }
        }
    }

    /// Re-read every configured path and reconcile it, waiting for the
    /// reconciliations to finish.
    ///
    /// Goes through the same sequencing as watch-driven changes, so a refresh
    /// racing a node change never leaves the older content in the snapshot.
    /// Missing nodes are skipped and read failures are logged per path.
    pub async fn refresh(&self) {
        for path in &self.shared.paths {
            let sequence = self.next_sequence();
            let data = match self.shared.client.read(path).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!(path = %path, "Node does not exist yet");
                    continue;
                }
                Err(e) => {
                    let e = PropertiesError::source_read(path.as_str(), e);
                    error!(path = %path, error = %e, "Failed to load node");
                    continue;
                }
            };

            let watcher = self.clone();
            let path = path.clone();
            if let Err(e) =
                tokio::task::spawn_blocking(move || watcher.apply(&path, &data, sequence)).await
            {
                error!(error = %e, "Node reconciliation task failed");
            }
        }
    }

    fn next_sequence(&self) -> u64 {
        self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reconcile node content on the blocking pool, tracked until the
    /// watcher stops
    fn dispatch(&self, path: &str, data: Vec<u8>, sequence: u64) {
        let watcher = self.clone();
        let path = path.to_string();

        let mut in_flight = self.shared.in_flight.lock();
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn_blocking(move || watcher.apply(&path, &data, sequence));
    }

    /// Apply content read under `sequence`, unless newer content for the
    /// same path was applied already. Blocking.
    fn apply(&self, path: &str, data: &[u8], sequence: u64) {
        let applied = self
            .shared
            .applied
            .entry(path.to_string())
            .or_default()
            .clone();
        let source = PropertySource::coordination(path);

        let mut last = applied.lock();
        if sequence < *last {
            debug!(source = %source, sequence, last = *last, "Skipping stale node content");
            return;
        }
        *last = sequence;

        match self.shared.reader.read_bytes(data) {
            Ok(properties) => {
                self.shared.store.reconcile(&source, &properties);
            }
            Err(e) => {
                let e = PropertiesError::source_read(source.id.as_str(), e);
                error!(source = %source, error = %e, "Failed to reload node content");
            }
        }
    }

    async fn release_watches(&self) {
        let mut ids: Vec<WatchId> = Vec::new();
        for map in [&self.shared.parent_watches, &self.shared.node_watches] {
            let keys: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((_, id)) = map.remove(&key) {
                    ids.push(id);
                }
            }
        }

        for id in ids {
            if let Err(e) = self.shared.client.unwatch(id).await {
                warn!(watch = id.0, error = %e, "Failed to remove watch");
            }
        }

        let mut in_flight = std::mem::take(&mut *self.shared.in_flight.lock());
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Node reconciliation task failed");
            }
        }

        self.shared.pending.clear();
        for mut state in self.shared.states.iter_mut() {
            *state = WatchState::Unwatched;
        }
    }
}

impl std::fmt::Debug for CoordinationWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationWatcher")
            .field("paths", &self.shared.paths)
            .field("watched_parents", &self.watched_parents())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryCoordinator;
    use crate::merger::MergePolicy;
    use crate::notifier::EventNotifier;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        zk: Arc<MemoryCoordinator>,
        store: Arc<PropertyStore>,
        events: tokio::sync::broadcast::Receiver<crate::ChangeEvent>,
    }

    fn fixture() -> Fixture {
        let notifier = Arc::new(EventNotifier::new());
        let events = notifier.subscribe();
        Fixture {
            zk: Arc::new(MemoryCoordinator::new()),
            store: Arc::new(PropertyStore::with_notifier(MergePolicy::Override, notifier)),
            events,
        }
    }

    fn watcher(f: &Fixture, paths: &[&str]) -> CoordinationWatcher {
        CoordinationWatcher::new(
            f.zk.clone(),
            f.store.clone(),
            SourceReader::default(),
            paths.iter().copied(),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_existing_node_watched_directly() {
        let mut f = fixture();
        f.zk.set("/app/config", "a=1");
        f.store
            .reconcile(&PropertySource::coordination("/app/config"), &[("a".to_string(), "1".to_string())].into());

        let w = watcher(&f, &["/app/config"]);
        assert_eq!(w.state("/app/config"), Some(WatchState::Unwatched));
        let handle = w.start().await;
        assert_eq!(w.state("/app/config"), Some(WatchState::WatchingNodeDirectly));
        assert!(w.watched_parents().is_empty());

        f.zk.set("/app/config", "a=2");
        let event = timeout(Duration::from_secs(5), f.events.recv()).await.unwrap().unwrap();
        assert_eq!((event.old_value.as_str(), event.new_value.as_str()), ("1", "2"));

        handle.stop().await;
        assert_eq!(f.zk.watch_count(), 0);
        assert_eq!(w.state("/app/config"), Some(WatchState::Unwatched));
    }

    #[tokio::test]
    async fn test_missing_node_falls_back_to_parent() {
        let mut f = fixture();
        let w = watcher(&f, &["/app/config"]);
        let handle = w.start().await;

        assert_eq!(w.state("/app/config"), Some(WatchState::WatchingParentForChild));
        assert_eq!(w.watched_parents(), vec!["/app".to_string()]);

        f.zk.set("/app/config", "a=1");
        wait_for(|| w.state("/app/config") == Some(WatchState::WatchingNodeDirectly)).await;
        wait_for(|| f.store.get("a").is_some()).await;
        assert_eq!(f.store.get("a").as_deref(), Some("1"));
        wait_for(|| w.watched_parents().is_empty()).await;
        assert_eq!(f.zk.child_watch_count("/app"), 0);

        f.zk.set("/app/config", "a=2");
        let event = timeout(Duration::from_secs(5), f.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.key, "a");
        assert_eq!((event.old_value.as_str(), event.new_value.as_str()), ("1", "2"));
        assert!(f.events.try_recv().is_err());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_siblings_share_one_parent_watch() {
        let f = fixture();
        let w = watcher(&f, &["/app/a", "/app/b", "/app/a"]);
        assert_eq!(w.paths().len(), 2);

        let handle = w.start().await;
        assert_eq!(f.zk.child_watch_count("/app"), 1);

        f.zk.set("/app/unrelated", "x=1");
        f.zk.set("/app/a", "a=1");
        wait_for(|| w.state("/app/a") == Some(WatchState::WatchingNodeDirectly)).await;
        assert_eq!(w.state("/app/b"), Some(WatchState::WatchingParentForChild));
        assert_eq!(f.zk.child_watch_count("/app"), 1);

        f.zk.set("/app/b", "b=1");
        wait_for(|| w.state("/app/b") == Some(WatchState::WatchingNodeDirectly)).await;
        wait_for(|| f.zk.child_watch_count("/app") == 0).await;
        wait_for(|| f.store.get("b").is_some()).await;
        assert!(f.store.get("x").is_none());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_failing_path_is_skipped() {
        let f = fixture();
        f.zk.set("/good/config", "g=1");
        f.zk.fail_on("/bad/config");

        let w = watcher(&f, &["/bad/config", "/good/config"]);
        let handle = w.start().await;

        assert_eq!(w.state("/bad/config"), Some(WatchState::Unwatched));
        assert_eq!(w.state("/good/config"), Some(WatchState::WatchingNodeDirectly));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_older_content_never_overwrites_newer() {
        let f = fixture();
        let w = watcher(&f, &["/app/config"]);

        let older = w.next_sequence();
        let newer = w.next_sequence();
        w.apply("/app/config", b"a=2", newer);
        w.apply("/app/config", b"a=1", older);

        assert_eq!(f.store.get("a").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_refresh_reconciles_before_returning() {
        let f = fixture();
        f.zk.set("/app/config", "a=1");
        let w = watcher(&f, &["/app/config", "/app/missing"]);

        w.refresh().await;
        assert_eq!(f.store.get("a").as_deref(), Some("1"));

        f.zk.set("/app/config", "a=2");
        w.refresh().await;
        assert_eq!(f.store.get("a").as_deref(), Some("2"));
        assert_eq!(w.state("/app/missing"), Some(WatchState::Unwatched));
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_reconciliation() {
        use std::sync::atomic::AtomicBool;

        let f = fixture();
        f.zk.set("/app/config", "a=1");
        f.store
            .reconcile(&PropertySource::coordination("/app/config"), &[("a".to_string(), "1".to_string())].into());

        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_flag, finished_flag) = (entered.clone(), finished.clone());
        f.store
            .notifier()
            .unwrap()
            .register(Arc::new(move |_: &crate::ChangeEvent| -> anyhow::Result<()> {
                entered_flag.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                finished_flag.store(true, Ordering::SeqCst);
                Ok(())
            }));

        let w = watcher(&f, &["/app/config"]);
        let handle = w.start().await;
        f.zk.set("/app/config", "a=2");
        wait_for(|| entered.load(Ordering::SeqCst)).await;

        handle.stop().await;
        assert!(finished.load(Ordering::SeqCst));

        f.zk.set("/app/config", "a=3");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.store.get("a").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_undecodable_content_leaves_snapshot() {
        let f = fixture();
        f.zk.set("/app/config", "a=1");
        f.store
            .reconcile(&PropertySource::coordination("/app/config"), &[("a".to_string(), "1".to_string())].into());

        let w = watcher(&f, &["/app/config"]);
        let handle = w.start().await;

        f.zk.set("/app/config", vec![b'a', b'=', 0xff, 0xfe]);
        f.zk.set("/app/config", "a=3");
        wait_for(|| f.store.get("a").as_deref() == Some("3")).await;

        handle.stop().await;
    }
}
