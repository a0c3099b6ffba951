//! Static file watcher
//!
//! Uses a `notify` poll watcher on the directory of each configured file and
//! reconciles a file whenever its modification time changes. The watches are
//! installed synchronously in [`FileWatcher::start`], so any write made after
//! that call returns is observed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::PropertiesError;
use crate::events::PropertySource;
use crate::sources::{SourceReader, WatchHandle};
use crate::store::PropertyStore;

/// Configuration for the file watcher
#[derive(Debug, Clone)]
pub struct FileWatcherConfig {
    /// Interval between polls
    pub poll_interval: Duration,
    /// Hash file contents on every poll instead of relying on mtime only
    pub compare_contents: bool,
}

impl Default for FileWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            compare_contents: false,
        }
    }
}

impl FileWatcherConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_compare_contents(mut self, compare_contents: bool) -> Self {
        self.compare_contents = compare_contents;
        self
    }
}

#[derive(Debug, Clone)]
struct WatchedFile {
    source: PropertySource,
    path: PathBuf,
    /// Directory handed to the poll watcher
    dir: PathBuf,
}

impl WatchedFile {
    fn new(path: PathBuf) -> Self {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            source: PropertySource::static_file(path.to_string_lossy()),
            path,
            dir,
        }
    }

    /// Event paths are the watched directory joined with the entry name
    fn matches(&self, changed: &Path) -> bool {
        changed.parent() == Some(self.dir.as_path()) && changed.file_name() == self.path.file_name()
    }
}

/// Watches static property files and reconciles them into the store
#[derive(Debug, Clone)]
pub struct FileWatcher {
    files: Vec<WatchedFile>,
    store: Arc<PropertyStore>,
    reader: SourceReader,
    config: FileWatcherConfig,
}

impl FileWatcher {
    pub fn new(store: Arc<PropertyStore>, reader: SourceReader, config: FileWatcherConfig) -> Self {
        Self {
            files: Vec::new(),
            store,
            reader,
            config,
        }
    }

    /// Add a file to watch
    pub fn watch(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(WatchedFile::new(path.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Install the watches and start the reload task.
    ///
    /// The poll watcher takes its baseline before this returns. Each file is
    /// then re-read once, which picks up edits made between the initial load
    /// and this call; an unchanged file produces no events.
    ///
    /// A directory that cannot be watched is logged and skipped. Failing to
    /// create the poll watcher itself is an error.
    pub fn start(&self) -> crate::Result<WatchHandle> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let notify_config = notify::Config::default()
            .with_poll_interval(self.config.poll_interval)
            .with_compare_contents(self.config.compare_contents);

        let mut watcher = PollWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let _ = event_tx.send(res);
            },
            notify_config,
        )
        .map_err(|e| PropertiesError::watch_install("file watcher", e))?;

        let dirs: BTreeSet<&Path> = self.files.iter().map(|f| f.dir.as_path()).collect();
        for dir in dirs {
            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!(dir = %dir.display(), error = %e, "Failed to watch property file directory");
            }
        }

        let files = self.files.clone();
        let store = self.store.clone();
        let reader = self.reader;
        let poll_interval = self.config.poll_interval;
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            // Owned by the task so polling stops with it
            let _watcher = watcher;
            info!(files = files.len(), ?poll_interval, "Started watching property files");

            for file in &files {
                reload(file.clone(), store.clone(), reader).await;
            }

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("File watcher shutting down");
                        break;
                    }
                    Some(first) = event_rx.recv() => {
                        // Coalesce everything one poll reported
                        let mut changed = BTreeSet::new();
                        let mut next = Some(first);
                        while let Some(res) = next {
                            collect_changed(&files, res, &mut changed);
                            next = event_rx.try_recv().ok();
                        }

                        for index in changed {
                            let file = &files[index];
                            debug!(path = %file.path.display(), "Property file modified");
                            reload(file.clone(), store.clone(), reader).await;
                        }
                    }
                }
            }
        });

        Ok(WatchHandle::new(handle, shutdown_tx))
    }
}

/// Record the indexes of watched files touched by one watcher event
fn collect_changed(
    files: &[WatchedFile],
    res: notify::Result<notify::Event>,
    changed: &mut BTreeSet<usize>,
) {
    match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            for path in &event.paths {
                changed.extend(
                    files
                        .iter()
                        .enumerate()
                        .filter(|(_, f)| f.matches(path))
                        .map(|(i, _)| i),
                );
            }
        }
        Err(e) => warn!(error = %e, "Property file watch error"),
    }
}

/// Read and reconcile one file on the blocking pool
async fn reload(file: WatchedFile, store: Arc<PropertyStore>, reader: SourceReader) {
    let result = tokio::task::spawn_blocking(move || match reader.read_file(&file.path) {
        Ok(properties) => {
            store.reconcile(&file.source, &properties);
        }
        Err(e) => {
            error!(
                source = %file.source,
                error = %e,
                "Failed to reload property file, keeping last known values"
            );
        }
    })
    .await;

    if let Err(e) = result {
        error!(error = %e, "Property file reload task failed");
    }
}
