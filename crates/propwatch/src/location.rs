//! Parsing of location strings into typed source descriptors

use std::path::{Path, PathBuf};

use crate::events::{PropertySource, SourceKind};
use crate::{PropertiesError, Result};

const CLASSPATH_PREFIX: &str = "classpath:";
const FILE_PREFIX: &str = "file:";
const ZOOKEEPER_PREFIX: &str = "zookeeper:";

/// A configured property location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocationSpec {
    /// Bundled resource, relative to the resource root
    Classpath(PathBuf),
    /// Filesystem path
    File(PathBuf),
    /// Absolute node path in the coordination service
    Coordination(String),
}

impl LocationSpec {
    /// Parse `classpath:..`, `file:..` or `zookeeper:..`.
    ///
    /// Unknown prefixes are rejected rather than ignored.
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();

        if let Some(rest) = location.strip_prefix(CLASSPATH_PREFIX) {
            let rest = rest.trim_start_matches('/');
            if rest.is_empty() {
                return Err(PropertiesError::UnrecognizedLocation(location.to_string()));
            }
            return Ok(Self::Classpath(PathBuf::from(rest)));
        }

        if let Some(rest) = location.strip_prefix(FILE_PREFIX) {
            // file:///etc/app.properties and file:/etc/app.properties are the same
            let rest = rest.strip_prefix("//").unwrap_or(rest);
            if rest.is_empty() {
                return Err(PropertiesError::UnrecognizedLocation(location.to_string()));
            }
            return Ok(Self::File(PathBuf::from(rest)));
        }

        if let Some(rest) = location.strip_prefix(ZOOKEEPER_PREFIX) {
            let path = rest.trim_end_matches('/');
            if !path.starts_with('/') {
                return Err(PropertiesError::UnrecognizedLocation(format!(
                    "{location} (coordination paths must be absolute)"
                )));
            }
            return Ok(Self::Coordination(path.to_string()));
        }

        Err(PropertiesError::UnrecognizedLocation(location.to_string()))
    }

    /// Parse a list of locations, failing on the first invalid one
    pub fn parse_all<S: AsRef<str>>(locations: &[S]) -> Result<Vec<Self>> {
        locations.iter().map(|l| Self::parse(l.as_ref())).collect()
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Classpath(_) | Self::File(_) => SourceKind::StaticFile,
            Self::Coordination(_) => SourceKind::Coordination,
        }
    }

    /// Filesystem path for static locations, resolving classpath entries
    /// against `resource_root`
    pub fn file_path(&self, resource_root: &Path) -> Option<PathBuf> {
        match self {
            Self::Classpath(rel) => Some(resource_root.join(rel)),
            Self::File(path) => Some(path.clone()),
            Self::Coordination(_) => None,
        }
    }

    /// Source identity used for merge ownership
    pub fn source(&self, resource_root: &Path) -> PropertySource {
        match self {
            Self::Coordination(path) => PropertySource::coordination(path.as_str()),
            _ => {
                let path = self.file_path(resource_root).unwrap_or_default();
                PropertySource::static_file(path.to_string_lossy())
            }
        }
    }
}

impl std::fmt::Display for LocationSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Classpath(path) => write!(f, "{CLASSPATH_PREFIX}{}", path.display()),
            Self::File(path) => write!(f, "{FILE_PREFIX}{}", path.display()),
            Self::Coordination(path) => write!(f, "{ZOOKEEPER_PREFIX}{path}"),
        }
    }
}

impl std::str::FromStr for LocationSpec {
    type Err = PropertiesError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Parent of a coordination path (`/app/config` → `/app`, `/config` → `/`)
pub fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => path[..index].to_string(),
    }
}
