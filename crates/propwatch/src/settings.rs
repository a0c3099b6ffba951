//! Manager settings
//!
//! Settings come from an optional TOML file, overridden by environment
//! variables such as `PROPWATCH__OVERRIDE_EXISTING=true` or
//! `PROPWATCH__LOCATIONS=classpath:app.properties,zookeeper:/app/config`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::location::LocationSpec;
use crate::merger::MergePolicy;
use crate::sources::TextEncoding;
use crate::{PropertiesError, Result};

const ENV_PREFIX: &str = "PROPWATCH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Location strings, in declaration order
    pub locations: Vec<String>,
    /// Let later and higher-priority sources replace existing values
    pub override_existing: bool,
    pub encoding: TextEncoding,
    /// File watcher poll interval
    pub poll_interval_ms: u64,
    /// Directory `classpath:` locations resolve against
    pub resource_root: PathBuf,
    /// Coordination service connection string
    pub connection_string: Option<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            locations: Vec::new(),
            override_existing: false,
            encoding: TextEncoding::Utf8,
            poll_interval_ms: 1000,
            resource_root: PathBuf::from("."),
            connection_string: None,
        }
    }
}

impl ManagerSettings {
    /// Load from an optional file plus `PROPWATCH__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load using an explicit environment map instead of the process
    /// environment
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("locations")
                .try_parsing(true)
                .source(env),
        );

        let settings: Self = builder
            .build()
            .map_err(|e| PropertiesError::settings(format!("config build error: {e}")))?
            .try_deserialize()
            .map_err(|e| PropertiesError::settings(format!("config deserialize error: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Self = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .map_err(|e| PropertiesError::settings(format!("config build error: {e}")))?
            .try_deserialize()
            .map_err(|e| PropertiesError::settings(format!("config deserialize error: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(PropertiesError::settings("poll_interval_ms must be > 0"));
        }
        LocationSpec::parse_all(&self.locations)?;
        if let Some(connection) = &self.connection_string
            && connection.trim().is_empty()
        {
            return Err(PropertiesError::settings("connection_string must not be empty"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy::from_override(self.override_existing)
    }

    /// Parsed locations
    pub fn location_specs(&self) -> Result<Vec<LocationSpec>> {
        LocationSpec::parse_all(&self.locations)
    }
}
