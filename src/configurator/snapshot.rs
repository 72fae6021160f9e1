//! Local mirror of the coordination tree
//!
//! The snapshot is a JSON object addressed by dotted paths
//! (`transport_server.message_timeout`, `services.device_manager`). Every
//! mutation goes through this type and is followed by [`ConfigSnapshot::persist`],
//! which replaces the file atomically.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// Snapshot section holding service registries
pub const SERVICES_SECTION: &str = "services";

/// One running instance of a named service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistryEntry {
    pub uuid: String,
    /// Liveness leaf text, verbatim
    pub online: String,
}

impl ServiceRegistryEntry {
    #[must_use]
    pub fn new(uuid: impl Into<String>, online: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            online: online.into(),
        }
    }

    /// Only the exact text `"true"` counts as online
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online == "true"
    }
}

/// In-memory configuration tree with optional file backing
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    root: Map<String, Value>,
    path: Option<PathBuf>,
}

impl ConfigSnapshot {
    /// Empty snapshot that persists to `path`
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            root: Map::new(),
            path: Some(path.into()),
        }
    }

    /// Load a previously persisted snapshot, or start empty if none exists
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let root = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content)? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            root,
            path: Some(path),
        })
    }

    /// File this snapshot persists to
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whole tree as a JSON value
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// Look up a dotted path; `None` on any missing segment
    #[must_use]
    pub fn get(&self, dotted: &str) -> Option<&Value> {
        let mut segments = dotted.split('.');
        let mut cur = self.root.get(segments.next()?)?;
        for segment in segments {
            cur = match cur {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        (!cur.is_null()).then_some(cur)
    }

    /// Replace a top-level section
    pub fn set_section(&mut self, name: &str, value: Value) {
        self.root.insert(name.to_string(), value);
    }

    /// Registry entries of a service, skipping malformed rows
    #[must_use]
    pub fn service_entries(&self, service: &str) -> Vec<ServiceRegistryEntry> {
        self.services()
            .and_then(|s| s.get(service))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn services(&self) -> Option<&Map<String, Value>> {
        self.root.get(SERVICES_SECTION).and_then(Value::as_object)
    }

    fn write_entries(&mut self, service: &str, entries: &[ServiceRegistryEntry]) {
        let items = entries
            .iter()
            .map(|e| serde_json::json!({ "uuid": e.uuid, "online": e.online }))
            .collect();
        let mut services = match self.root.remove(SERVICES_SECTION) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        services.insert(service.to_string(), Value::Array(items));
        self.root
            .insert(SERVICES_SECTION.to_string(), Value::Object(services));
    }

    /// Replace the entry with the same uuid, or append it
    pub fn upsert_service_entry(&mut self, service: &str, entry: ServiceRegistryEntry) {
        let mut entries = self.service_entries(service);
        match entries.iter_mut().find(|e| e.uuid == entry.uuid) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.write_entries(service, &entries);
    }

    /// Drop entries whose uuid is not in `live`; returns how many were dropped
    pub fn retain_service_entries(&mut self, service: &str, live: &[String]) -> usize {
        let entries = self.service_entries(service);
        let before = entries.len();
        let kept: Vec<_> = entries
            .into_iter()
            .filter(|e| live.iter().any(|uuid| *uuid == e.uuid))
            .collect();
        let dropped = before - kept.len();
        self.write_entries(service, &kept);
        dropped
    }

    /// Rewrite the backing file atomically (temp file + rename)
    ///
    /// A snapshot without a path is memory-only and this is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written or renamed into place
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &self.root)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        tracing::trace!(path = %path.display(), "snapshot persisted");
        Ok(())
    }
}
