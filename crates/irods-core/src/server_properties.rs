//! Server capability facts discovered during handshakes

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Release version such as `rods4.2.8`, ordered by (major, minor, patch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ReleaseVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ReleaseVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        *self >= Self::new(major, minor, patch)
    }
}

impl FromStr for ReleaseVersion {
    type Err = Error;

    /// Accepts `rods4.2.8`, `4.2.8` and shorter forms (`rods4.2`)
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("rods").unwrap_or(trimmed);
        let mut parts = digits.split('.');
        let mut next = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(p) => {
                    // tolerate suffixes like "8rc1"
                    let numeric: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                    numeric
                        .parse()
                        .map_err(|_| Error::InvalidVersion(s.to_string()))
                }
                None if required => Err(Error::InvalidVersion(s.to_string())),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(false)?;
        let patch = next(false)?;
        Ok(Self::new(major, minor, patch))
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rods{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What a server told us about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProperties {
    pub icat_enabled: bool,
    pub api_version: String,
    pub release_version: ReleaseVersion,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HostZone {
    host: String,
    zone: String,
}

impl HostZone {
    fn new(host: &str, zone: &str) -> Self {
        Self {
            host: host.to_string(),
            zone: zone.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct CacheEntry {
    properties: Option<Arc<ServerProperties>>,
    values: HashMap<String, String>,
}

/// Cache of server properties keyed by (host, zone), shared by every
/// connection created from the same manager. Entries are replaced
/// wholesale, never mutated in place.
#[derive(Debug, Default)]
pub struct ServerPropertiesCache {
    entries: RwLock<HashMap<HostZone, CacheEntry>>,
}

impl ServerPropertiesCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str, zone: &str) -> Option<Arc<ServerProperties>> {
        self.entries
            .read()
            .get(&HostZone::new(host, zone))
            .and_then(|e| e.properties.clone())
    }

    /// Store properties for (host, zone), replacing any previous value
    pub fn put(&self, host: &str, zone: &str, properties: ServerProperties) -> Arc<ServerProperties> {
        let properties = Arc::new(properties);
        self.entries
            .write()
            .entry(HostZone::new(host, zone))
            .or_default()
            .properties = Some(properties.clone());
        properties
    }

    /// Store a named property discovered for (host, zone)
    pub fn cache_property(&self, host: &str, zone: &str, name: &str, value: impl Into<String>) {
        self.entries
            .write()
            .entry(HostZone::new(host, zone))
            .or_default()
            .values
            .insert(name.to_string(), value.into());
    }

    pub fn retrieve_value(&self, host: &str, zone: &str, name: &str) -> Option<String> {
        self.entries
            .read()
            .get(&HostZone::new(host, zone))
            .and_then(|e| e.values.get(name).cloned())
    }

    /// Remove one named property; true when it was present
    pub fn delete_cached_property(&self, host: &str, zone: &str, name: &str) -> bool {
        self.entries
            .write()
            .get_mut(&HostZone::new(host, zone))
            .map(|e| e.values.remove(name).is_some())
            .unwrap_or(false)
    }

    /// Forget everything known about (host, zone)
    pub fn remove(&self, host: &str, zone: &str) -> bool {
        self.entries
            .write()
            .remove(&HostZone::new(host, zone))
            .is_some()
    }

    /// Clear the whole cache
    pub fn delete_cache(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
