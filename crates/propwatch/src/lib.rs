//! Live property configuration for propwatch
//!
//! This crate keeps an in-memory view of application properties that:
//! - Merges static property files and coordination-service nodes
//! - Applies a configurable override policy on every reconciliation
//! - Reports exactly which existing keys changed to registered listeners
//! - Resolves `${other.key}` placeholders recursively at read time
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      PropertiesManager                           │
//! │  ┌─────────────┐                  ┌──────────────────────┐       │
//! │  │ FileWatcher │                  │ CoordinationWatcher  │       │
//! │  └──────┬──────┘                  └──────────┬───────────┘       │
//! │         └──────────────┬─────────────────────┘                   │
//! │                  ┌─────▼──────┐                                  │
//! │                  │ Property   │◄──── PlaceholderResolver          │
//! │                  │ Store      │                                  │
//! │                  └─────┬──────┘                                  │
//! │                  EventNotifier                                   │
//! └────────────────────────┬────────────────────────────────────────┘
//!                          │
//!         ┌────────────────┼────────────────┐
//!         ▼                ▼                ▼
//!     Listeners        Listeners       broadcast::Receiver
//! ```

pub mod coordination;
pub mod events;
pub mod location;
pub mod manager;
pub mod merger;
pub mod notifier;
pub mod resolver;
pub mod settings;
pub mod sources;
pub mod store;

// Re-export main types
pub use coordination::{ClientFactory, ClientRegistry, CoordinationClient, WatchEvent};
pub use events::{ChangeEvent, PropertySource, SourceKind};
pub use location::LocationSpec;
pub use manager::{PropertiesManager, PropertiesManagerBuilder};
pub use merger::MergePolicy;
pub use notifier::{EventNotifier, PropertyChangeListener};
pub use resolver::PlaceholderResolver;
pub use settings::ManagerSettings;
pub use sources::{SourceReader, TextEncoding, WatchHandle, WatchState};
pub use store::PropertyStore;

/// Error types for property operations
#[derive(Debug, thiserror::Error)]
pub enum PropertiesError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Failed to read source {source_id}: {reason}")]
    SourceRead { source_id: String, reason: String },

    #[error("Failed to watch path {path}: {reason}")]
    WatchInstall { path: String, reason: String },

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Malformed placeholder in value of '{key}': {value}")]
    MalformedPlaceholder { key: String, value: String },

    #[error("Placeholder cycle detected: {}", chain.join(" -> "))]
    ResolutionCycle { chain: Vec<String> },

    #[error("Unresolved placeholder '{placeholder}' in value of '{key}'")]
    UnresolvedPlaceholder { key: String, placeholder: String },

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Unrecognized location: {0}")]
    UnrecognizedLocation(String),

    #[error("Settings error: {0}")]
    Settings(String),
}

impl PropertiesError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn source_read(source_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SourceRead {
            source_id: source_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn watch_install(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::WatchInstall {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn coordination(msg: impl Into<String>) -> Self {
        Self::Coordination(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn not_configured(msg: impl Into<String>) -> Self {
        Self::NotConfigured(msg.into())
    }

    pub fn settings(msg: impl Into<String>) -> Self {
        Self::Settings(msg.into())
    }
}

/// Result type for property operations
pub type Result<T> = std::result::Result<T, PropertiesError>;
