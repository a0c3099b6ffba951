//! Property sources and change events

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Kind of a property source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Static file (filesystem or bundled resource)
    StaticFile,
    /// Node in the coordination service
    Coordination,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StaticFile => write!(f, "file"),
            Self::Coordination => write!(f, "coordination"),
        }
    }
}

/// Identity of a source contributing properties.
///
/// The id is the source descriptor: a file path for static sources, the
/// node path for coordination sources. Two sources are the same source iff
/// their ids and kinds match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertySource {
    pub id: String,
    pub kind: SourceKind,
}

impl PropertySource {
    pub fn new(id: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Static file source identified by its path
    pub fn static_file(id: impl Into<String>) -> Self {
        Self::new(id, SourceKind::StaticFile)
    }

    /// Coordination-service source identified by its node path
    pub fn coordination(path: impl Into<String>) -> Self {
        Self::new(path, SourceKind::Coordination)
    }
}

impl std::fmt::Display for PropertySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A single property whose value changed during one reconciliation.
///
/// Only keys that already existed in the snapshot produce events; newly
/// inserted keys are silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Property key that changed
    pub key: String,
    /// Value before the reconciliation
    pub old_value: String,
    /// Value after the reconciliation
    pub new_value: String,
    /// Source whose reconciliation produced the change
    pub source: PropertySource,
    /// Time the change was computed
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ChangeEvent {
    pub fn new(
        key: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
        source: PropertySource,
    ) -> Self {
        Self {
            key: key.into(),
            old_value: old_value.into(),
            new_value: new_value.into(),
            source,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}
