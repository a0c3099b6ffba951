//! Properties Manager
//!
//! Central coordinator for properties from multiple sources.
//! Owns the store, the coordination client and the watchers, and exposes
//! the accessor, listener and lifecycle API to the host application.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::coordination::{ClientFactory, ClientRegistry, CoordinationClient};
use crate::events::ChangeEvent;
use crate::location::LocationSpec;
use crate::merger::MergedProperties;
use crate::notifier::{EventNotifier, PropertyChangeListener};
use crate::resolver::PlaceholderResolver;
use crate::settings::ManagerSettings;
use crate::sources::{
    CoordinationWatcher, FileWatcher, FileWatcherConfig, SourceReader, TextEncoding, WatchHandle,
    WatchState,
};
use crate::store::PropertyStore;
use crate::{PropertiesError, Result};

/// Properties manager builder
#[derive(Default)]
pub struct PropertiesManagerBuilder {
    settings: ManagerSettings,
    notifier: Option<Arc<EventNotifier>>,
    client: Option<Arc<dyn CoordinationClient>>,
    factory: Option<Arc<dyn ClientFactory>>,
    registry: Option<Arc<ClientRegistry>>,
}

impl PropertiesManagerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all settings at once
    pub fn with_settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Append a location (`classpath:`, `file:` or `zookeeper:`)
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.settings.locations.push(location.into());
        self
    }

    pub fn with_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settings
            .locations
            .extend(locations.into_iter().map(Into::into));
        self
    }

    /// Let later and higher-priority sources replace existing values
    pub fn with_override(mut self, override_existing: bool) -> Self {
        self.settings.override_existing = override_existing;
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.settings.encoding = encoding;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval_ms = u64::try_from(interval.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        self
    }

    /// Directory that `classpath:` locations resolve against
    pub fn with_resource_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.settings.resource_root = root.into();
        self
    }

    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.settings.connection_string = Some(connection_string.into());
        self
    }

    /// Wire an event notifier. Required for listeners and watching.
    pub fn with_notifier(mut self, notifier: Arc<EventNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_default_notifier(self) -> Self {
        self.with_notifier(Arc::new(EventNotifier::new()))
    }

    /// Use an already connected coordination client
    pub fn with_coordination_client(mut self, client: Arc<dyn CoordinationClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Connect through `factory` using the configured connection string
    pub fn with_client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Share a connection registry between managers
    pub fn with_client_registry(mut self, registry: Arc<ClientRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the manager and perform the initial load
    pub async fn build(self) -> Result<PropertiesManager> {
        self.settings.validate()?;
        let settings = self.settings;
        let locations = settings.location_specs()?;
        let registry = self.registry.unwrap_or_default();
        let client = resolve_client(
            &settings,
            &registry,
            self.client,
            self.factory.as_deref(),
        )
        .await?;

        let policy = settings.merge_policy();
        let store = Arc::new(match self.notifier {
            Some(notifier) => PropertyStore::with_notifier(policy, notifier),
            None => PropertyStore::new(policy),
        });
        let reader = SourceReader::new(settings.encoding);

        let coordination_paths: Vec<String> = locations
            .iter()
            .filter_map(|l| match l {
                LocationSpec::Coordination(path) => Some(path.clone()),
                _ => None,
            })
            .collect();
        let coordination = match &client {
            Some(client) if !coordination_paths.is_empty() => Some(CoordinationWatcher::new(
                client.clone(),
                store.clone(),
                reader,
                coordination_paths,
            )),
            _ => None,
        };

        let manager = PropertiesManager {
            resolver: PlaceholderResolver::new(store.clone()),
            settings,
            locations,
            store,
            reader,
            client,
            registry,
            coordination,
            watch_handles: RwLock::new(None),
        };

        manager.reload().await;
        info!(
            locations = manager.locations.len(),
            properties = manager.store.snapshot().len(),
            policy = ?manager.store.policy(),
            "Properties loaded"
        );
        Ok(manager)
    }
}

/// Pick the coordination client: an explicit client wins, then a factory
/// connection through the registry, then a client already in the registry.
async fn resolve_client(
    settings: &ManagerSettings,
    registry: &ClientRegistry,
    client: Option<Arc<dyn CoordinationClient>>,
    factory: Option<&dyn ClientFactory>,
) -> Result<Option<Arc<dyn CoordinationClient>>> {
    let connection = settings.connection_string.as_deref();

    if let Some(client) = client {
        if let Some(connection) = connection {
            registry.insert(connection, client.clone());
        }
        return Ok(Some(client));
    }

    match (connection, factory) {
        (Some(connection), Some(factory)) => {
            Ok(Some(registry.get_or_connect(connection, factory).await?))
        }
        (Some(connection), None) => Ok(registry.get(connection)),
        (None, Some(_)) => Err(PropertiesError::not_configured(
            "client factory given without a connection string",
        )),
        (None, None) => Ok(None),
    }
}

/// Live view of merged application properties
pub struct PropertiesManager {
    settings: ManagerSettings,
    locations: Vec<LocationSpec>,
    store: Arc<PropertyStore>,
    resolver: PlaceholderResolver,
    reader: SourceReader,
    client: Option<Arc<dyn CoordinationClient>>,
    registry: Arc<ClientRegistry>,
    coordination: Option<CoordinationWatcher>,
    /// `Some` while watching
    watch_handles: RwLock<Option<Vec<WatchHandle>>>,
}

impl PropertiesManager {
    /// Create a new builder
    pub fn builder() -> PropertiesManagerBuilder {
        PropertiesManagerBuilder::new()
    }

    /// Current snapshot of raw values
    pub fn properties(&self) -> Arc<MergedProperties> {
        self.store.snapshot()
    }

    /// Raw value of a key, placeholders left in place
    pub fn get(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// Value of `key` (or `${key}`) with every placeholder substituted
    pub fn resolve_property(&self, key: &str) -> Result<Option<String>> {
        self.resolver.resolve(key)
    }

    pub fn store(&self) -> &Arc<PropertyStore> {
        &self.store
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn locations(&self) -> &[LocationSpec] {
        &self.locations
    }

    pub fn client_registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    fn notifier(&self) -> Result<&Arc<EventNotifier>> {
        self.store
            .notifier()
            .ok_or_else(|| PropertiesError::not_configured("no event notifier is wired"))
    }

    /// Register a change listener
    pub fn register(&self, listener: Arc<dyn PropertyChangeListener>) -> Result<()> {
        self.notifier()?.register(listener);
        Ok(())
    }

    /// Unregister a change listener. Returns whether it was registered.
    pub fn unregister(&self, listener: &Arc<dyn PropertyChangeListener>) -> Result<bool> {
        Ok(self.notifier()?.unregister(listener))
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> Result<broadcast::Receiver<ChangeEvent>> {
        Ok(self.notifier()?.subscribe())
    }

    /// Re-read every source and reconcile it: static sources in declaration
    /// order, then coordination nodes. Failures are logged per source.
    ///
    /// Nodes are reconciled through the coordination watcher, so a reload
    /// racing a watched node change cannot reinstate older content.
    pub async fn reload(&self) {
        let root = &self.settings.resource_root;

        for location in &self.locations {
            let Some(path) = location.file_path(root) else {
                continue;
            };
            let source = location.source(root);
            match self.reader.read_file(&path) {
                Ok(properties) => {
                    self.store.reconcile(&source, &properties);
                }
                Err(e) => {
                    let e = PropertiesError::source_read(source.id.as_str(), e);
                    warn!(source = %source, error = %e, "Failed to load property file");
                }
            }
        }

        match &self.coordination {
            Some(watcher) => watcher.refresh().await,
            None => {
                for location in &self.locations {
                    if let LocationSpec::Coordination(path) = location {
                        warn!(path = %path, "No coordination client, skipping node");
                    }
                }
            }
        }
    }

    /// Start watching all sources for changes.
    ///
    /// Calling this while already watching does nothing.
    pub async fn start_watching(&self) -> Result<()> {
        self.notifier()?;

        let mut guard = self.watch_handles.write().await;
        if guard.is_some() {
            debug!("Already watching");
            return Ok(());
        }

        let has_coordination = self
            .locations
            .iter()
            .any(|l| matches!(l, LocationSpec::Coordination(_)));
        if has_coordination && self.coordination.is_none() {
            return Err(PropertiesError::not_configured(
                "coordination locations configured without a coordination client",
            ));
        }

        let mut handles = Vec::new();

        let root = &self.settings.resource_root;
        let file_watcher = self
            .locations
            .iter()
            .filter_map(|l| l.file_path(root))
            .fold(
                FileWatcher::new(
                    self.store.clone(),
                    self.reader,
                    FileWatcherConfig::default().with_poll_interval(self.settings.poll_interval()),
                ),
                |watcher, path| watcher.watch(path),
            );
        if !file_watcher.is_empty() {
            handles.push(file_watcher.start()?);
        }

        if let Some(watcher) = &self.coordination {
            handles.push(watcher.start().await);
        }

        info!(watchers = handles.len(), "Started watching property sources");
        *guard = Some(handles);
        Ok(())
    }

    /// Stop all watchers and remove every coordination watch
    pub async fn stop_watching(&self) {
        let handles = self.watch_handles.write().await.take();
        if let Some(handles) = handles {
            for handle in handles {
                handle.stop().await;
            }
            info!("Stopped watching property sources");
        }
    }

    pub async fn is_watching(&self) -> bool {
        self.watch_handles.read().await.is_some()
    }

    /// Watch state of a configured coordination path
    pub fn watch_state(&self, path: &str) -> Option<WatchState> {
        self.coordination.as_ref().and_then(|w| w.state(path))
    }
}

impl std::fmt::Debug for PropertiesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertiesManager")
            .field("locations", &self.locations)
            .field("properties", &self.store.snapshot().len())
            .field("has_notifier", &self.store.notifier().is_some())
            .field("has_client", &self.client.is_some())
            .finish()
    }
}
