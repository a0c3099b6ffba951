//! Property merging and diffing under an override policy
//!
//! Every key remembers the source that last wrote it. Whether another
//! source may replace the value depends on the deployment's [`MergePolicy`]:
//! 1. A source may always update keys it owns
//! 2. `Override` lets a source take over keys owned by an equal or lower priority source
//! 3. `FirstWriterWins` never transfers ownership

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

use crate::events::{ChangeEvent, PropertySource, SourceKind};

/// Priority levels for property sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    StaticFile = 10,
    Coordination = 20,
}

impl From<SourceKind> for Priority {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::StaticFile => Priority::StaticFile,
            SourceKind::Coordination => Priority::Coordination,
        }
    }
}

/// How duplicate keys from different sources are settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Coordination values replace static values, later sources of the same kind replace earlier ones
    Override,
    /// The first source to populate a key keeps it
    #[default]
    FirstWriterWins,
}

impl MergePolicy {
    /// Policy for an `override` deployment flag
    pub fn from_override(override_existing: bool) -> Self {
        if override_existing {
            Self::Override
        } else {
            Self::FirstWriterWins
        }
    }

    /// Whether `incoming` may write a key currently owned by `owner`
    pub fn accepts(&self, owner: &PropertySource, incoming: &PropertySource) -> bool {
        if owner == incoming {
            return true;
        }
        match self {
            Self::Override => Priority::from(owner.kind) <= Priority::from(incoming.kind),
            Self::FirstWriterWins => false,
        }
    }
}

impl From<bool> for MergePolicy {
    fn from(override_existing: bool) -> Self {
        Self::from_override(override_existing)
    }
}

/// Merged property values with tracking of the owning source per key
#[derive(Debug, Clone, Default)]
pub struct MergedProperties {
    values: HashMap<String, String>,
    owners: HashMap<String, PropertySource>,
}

impl MergedProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a raw (unresolved) value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Check whether a key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Get the source that owns a key
    pub fn owner(&self, key: &str) -> Option<&PropertySource> {
        self.owners.get(key)
    }

    /// All raw values
    pub fn as_map(&self) -> &HashMap<String, String> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Merge one source's full content, returning the next generation and
    /// the change events it implies.
    ///
    /// `self` is left untouched so the caller can publish the result
    /// atomically.
    pub fn merge(
        &self,
        source: &PropertySource,
        incoming: &HashMap<String, String>,
        policy: MergePolicy,
    ) -> (MergedProperties, Vec<ChangeEvent>) {
        let mut next = self.clone();
        let mut events = Vec::new();

        // Sorted so a batch has a stable order
        let mut keys: Vec<&String> = incoming.keys().collect();
        keys.sort();

        for key in keys {
            let new_value = &incoming[key];
            match next.values.get(key) {
                None => {
                    next.values.insert(key.clone(), new_value.clone());
                    next.owners.insert(key.clone(), source.clone());
                }
                Some(old_value) => {
                    let accepted = next
                        .owners
                        .get(key)
                        .map(|owner| policy.accepts(owner, source))
                        .unwrap_or(true);

                    if !accepted {
                        trace!(key = %key, source = %source, "Key held by another source, skipping");
                        continue;
                    }

                    if old_value != new_value {
                        events.push(ChangeEvent::new(
                            key.as_str(),
                            old_value.as_str(),
                            new_value.as_str(),
                            source.clone(),
                        ));
                        next.values.insert(key.clone(), new_value.clone());
                    }
                    next.owners.insert(key.clone(), source.clone());
                }
            }
        }

        (next, events)
    }
}
