//! Lazy `${key}` placeholder resolution.
//!
//! A value is resolved one placeholder at a time: the leftmost `${` and the
//! next `}` after it delimit the inner key, which is itself resolved
//! depth-first before being substituted. The pass repeats until no `${`
//! remains. Resolution runs against a single snapshot, so a concurrent
//! reconciliation cannot mix two generations into one result.

use std::sync::Arc;

use crate::merger::MergedProperties;
use crate::store::PropertyStore;
use crate::{PropertiesError, Result};

const PLACEHOLDER_PREFIX: &str = "${";
const PLACEHOLDER_SUFFIX: char = '}';

/// Upper bound on substitutions within a single value
const MAX_SUBSTITUTIONS: usize = 1024;

/// Resolves property values against a [`PropertyStore`]
#[derive(Debug, Clone)]
pub struct PlaceholderResolver {
    store: Arc<PropertyStore>,
}

impl PlaceholderResolver {
    pub fn new(store: Arc<PropertyStore>) -> Self {
        Self { store }
    }

    /// Resolve `key` (or `${key}`) to its fully substituted value.
    ///
    /// Returns `Ok(None)` when the key is not present.
    pub fn resolve(&self, key: &str) -> Result<Option<String>> {
        let snapshot = self.store.snapshot();
        resolve_in(&snapshot, key)
    }
}

/// Resolve `key` against a snapshot
pub fn resolve_in(properties: &MergedProperties, key: &str) -> Result<Option<String>> {
    let mut chain = Vec::new();
    resolve_key(properties, strip_placeholder(key), &mut chain)
}

/// `${key}` → `key`; anything else is returned unchanged
fn strip_placeholder(key: &str) -> &str {
    key.strip_prefix(PLACEHOLDER_PREFIX)
        .and_then(|rest| rest.strip_suffix(PLACEHOLDER_SUFFIX))
        .unwrap_or(key)
}

/// Whether a value still has a placeholder to substitute
pub fn requires_resolution(value: &str) -> bool {
    value.contains(PLACEHOLDER_PREFIX)
}

fn resolve_key(
    properties: &MergedProperties,
    key: &str,
    chain: &mut Vec<String>,
) -> Result<Option<String>> {
    if chain.iter().any(|k| k == key) {
        let mut chain = chain.clone();
        chain.push(key.to_string());
        return Err(PropertiesError::ResolutionCycle { chain });
    }

    let Some(raw) = properties.get(key) else {
        return Ok(None);
    };
    if !requires_resolution(raw) {
        return Ok(Some(raw.to_string()));
    }

    chain.push(key.to_string());
    let mut value = raw.to_string();
    let mut substitutions = 0;

    while let Some(start) = value.find(PLACEHOLDER_PREFIX) {
        substitutions += 1;
        if substitutions > MAX_SUBSTITUTIONS {
            return Err(malformed(key, raw));
        }

        let inner_start = start + PLACEHOLDER_PREFIX.len();
        let Some(inner_len) = value[inner_start..].find(PLACEHOLDER_SUFFIX) else {
            return Err(malformed(key, raw));
        };
        let end = inner_start + inner_len;
        let inner = &value[inner_start..end];
        if inner.is_empty() || inner.contains(PLACEHOLDER_PREFIX) {
            return Err(malformed(key, raw));
        }

        let resolved = resolve_key(properties, inner, chain)?.ok_or_else(|| {
            PropertiesError::UnresolvedPlaceholder {
                key: key.to_string(),
                placeholder: value[start..=end].to_string(),
            }
        })?;

        value = format!("{}{}{}", &value[..start], resolved, &value[end + 1..]);
    }

    chain.pop();
    Ok(Some(value))
}

fn malformed(key: &str, raw: &str) -> PropertiesError {
    PropertiesError::MalformedPlaceholder {
        key: key.to_string(),
        value: raw.to_string(),
    }
}
