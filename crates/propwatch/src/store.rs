//! Canonical property snapshot
//!
//! Readers load the current generation lock-free through `ArcSwap`.
//! Writers are serialized so every reconciliation diffs against the latest
//! generation and publishes its result in a single pointer swap. Events are
//! delivered after the writer lock is released, so a listener may reconcile
//! again from inside its callback.

use arc_swap::ArcSwap;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::events::{ChangeEvent, PropertySource};
use crate::merger::{MergePolicy, MergedProperties};
use crate::notifier::EventNotifier;

/// Owner of the merged property snapshot
pub struct PropertyStore {
    /// Current generation (lock-free reads)
    current: ArcSwap<MergedProperties>,
    /// Serializes writers
    write_lock: Mutex<()>,
    /// Keeps each batch contiguous for listeners. Reentrant so a listener
    /// reconciling on the delivering thread does not block itself.
    delivery_lock: ReentrantMutex<()>,
    policy: MergePolicy,
    notifier: Option<Arc<EventNotifier>>,
}

impl PropertyStore {
    /// Create an empty store that does not publish events
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            current: ArcSwap::from_pointee(MergedProperties::new()),
            write_lock: Mutex::new(()),
            delivery_lock: ReentrantMutex::new(()),
            policy,
            notifier: None,
        }
    }

    /// Create an empty store that posts every change batch to `notifier`
    pub fn with_notifier(policy: MergePolicy, notifier: Arc<EventNotifier>) -> Self {
        Self {
            notifier: Some(notifier),
            ..Self::new(policy)
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn notifier(&self) -> Option<&Arc<EventNotifier>> {
        self.notifier.as_ref()
    }

    /// Current snapshot. Never a partially applied merge.
    pub fn snapshot(&self) -> Arc<MergedProperties> {
        self.current.load_full()
    }

    /// Raw (unresolved) value of a key
    pub fn get(&self, key: &str) -> Option<String> {
        self.current.load().get(key).map(str::to_string)
    }

    /// Merge the full current content of one source into the snapshot.
    ///
    /// Returns the change events for keys that already existed and now hold a
    /// different value. The events are posted to the notifier as one batch
    /// once the new generation is published.
    pub fn reconcile(
        &self,
        source: &PropertySource,
        incoming: &HashMap<String, String>,
    ) -> Vec<ChangeEvent> {
        let events = {
            let _guard = self.write_lock.lock();

            let current = self.current.load_full();
            let (next, events) = current.merge(source, incoming, self.policy);
            let inserted = next.len() - current.len();
            self.current.store(Arc::new(next));

            if events.is_empty() {
                debug!(source = %source, inserted, "Reconciled source, no changes");
            } else {
                info!(source = %source, changed = events.len(), inserted, "Reconciled source");
            }
            events
        };

        if !events.is_empty()
            && let Some(notifier) = &self.notifier
        {
            let _delivery = self.delivery_lock.lock();
            notifier.post_all(&events);
        }

        events
    }
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("policy", &self.policy)
            .field("properties", &self.current.load().len())
            .field("has_notifier", &self.notifier.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_insert_then_change_then_noop() {
        let store = PropertyStore::new(MergePolicy::Override);
        let file = PropertySource::static_file("app.properties");

        assert!(store.reconcile(&file, &props(&[("a", "1")])).is_empty());
        assert_eq!(store.get("a").as_deref(), Some("1"));

        let events = store.reconcile(&file, &props(&[("a", "2")]));
        assert_eq!(events.len(), 1);
        assert_eq!(
            (events[0].key.as_str(), events[0].old_value.as_str(), events[0].new_value.as_str()),
            ("a", "1", "2")
        );

        assert!(store.reconcile(&file, &props(&[("a", "2")])).is_empty());
    }

    #[test]
    fn test_events_posted_to_notifier() {
        let notifier = Arc::new(EventNotifier::new());
        let mut rx = notifier.subscribe();
        let store = PropertyStore::with_notifier(MergePolicy::Override, notifier);
        let file = PropertySource::static_file("app.properties");

        store.reconcile(&file, &props(&[("a", "1"), ("b", "1")]));
        store.reconcile(&file, &props(&[("a", "2"), ("b", "2")]));

        assert_eq!(rx.try_recv().unwrap().key, "a");
        assert_eq!(rx.try_recv().unwrap().key, "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let store = PropertyStore::new(MergePolicy::Override);
        let file = PropertySource::static_file("app.properties");
        store.reconcile(&file, &props(&[("a", "1")]));

        let before = store.snapshot();
        store.reconcile(&file, &props(&[("a", "2")]));

        assert_eq!(before.get("a"), Some("1"));
        assert_eq!(store.snapshot().get("a"), Some("2"));
    }

    #[test]
    fn test_listener_may_reconcile_another_source() {
        let notifier = Arc::new(EventNotifier::new());
        let store = Arc::new(PropertyStore::with_notifier(
            MergePolicy::Override,
            notifier.clone(),
        ));
        let weak = Arc::downgrade(&store);
        notifier.register(Arc::new(move |event: &ChangeEvent| -> anyhow::Result<()> {
            if event.key == "a"
                && let Some(store) = weak.upgrade()
            {
                let derived = PropertySource::static_file("derived.properties");
                store.reconcile(&derived, &props(&[("derived.a", event.new_value.as_str())]));
            }
            Ok(())
        }));

        let file = PropertySource::static_file("app.properties");
        store.reconcile(&file, &props(&[("a", "1")]));
        store.reconcile(
            &PropertySource::static_file("derived.properties"),
            &props(&[("derived.a", "1")]),
        );

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let writer = store.clone();
        thread::spawn(move || {
            let events = writer.reconcile(&file, &props(&[("a", "2")]));
            let _ = done_tx.send(events.len());
        });

        let changed = done_rx
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("reconcile from inside a listener must not block");
        assert_eq!(changed, 1);
        assert_eq!(store.get("derived.a").as_deref(), Some("2"));
    }

    #[test]
    fn test_concurrent_disjoint_reconciliations() {
        let store = Arc::new(PropertyStore::new(MergePolicy::Override));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    let source = if i % 2 == 0 {
                        PropertySource::static_file(format!("f{i}.properties"))
                    } else {
                        PropertySource::coordination(format!("/app/n{i}"))
                    };
                    let key = format!("key{i}");
                    for round in 0..50 {
                        let value = round.to_string();
                        store.reconcile(&source, &props(&[(key.as_str(), value.as_str())]));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 8);
        for i in 0..8 {
            assert_eq!(snapshot.get(&format!("key{i}")), Some("49"));
        }
    }
}
