//! Property sources and their watchers
//!
//! This module provides:
//! - Reader: parse static files and node content into flat maps
//! - File: poll static files for modification
//! - Coordination: track coordination-service nodes that may not exist yet

mod coordination;
mod file;
mod reader;

pub use coordination::{CoordinationWatcher, WatchState};
pub use file::{FileWatcher, FileWatcherConfig};
pub use reader::{SourceReader, TextEncoding, parse_properties, parse_toml};

/// Handle for a running watcher
pub struct WatchHandle {
    /// Task handle for the watcher
    handle: tokio::task::JoinHandle<()>,
    /// Shutdown signal
    shutdown: tokio::sync::oneshot::Sender<()>,
}

impl WatchHandle {
    pub fn new(
        handle: tokio::task::JoinHandle<()>,
        shutdown: tokio::sync::oneshot::Sender<()>,
    ) -> Self {
        Self { handle, shutdown }
    }

    /// Whether the watcher task has ended
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the watcher and wait for it to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
