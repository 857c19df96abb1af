//! Persisted registry of installed extensions.
//!
//! Stored as a JSON map `id -> InstalledExtension`. Every save writes a
//! temporary file next to the registry and renames it into place.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::types::errors::RuntimeError;
use crate::types::extension::InstalledExtension;

pub struct ExtensionRegistry {
    path: PathBuf,
    entries: BTreeMap<String, InstalledExtension>,
}

impl ExtensionRegistry {
    /// An empty registry that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Reads the registry. A missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self::new(path));
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| RuntimeError::Registry(format!("Failed to read registry: {}", e)))?;
        let entries: BTreeMap<String, InstalledExtension> = serde_json::from_str(&content)
            .map_err(|e| RuntimeError::Registry(format!("Failed to parse registry: {}", e)))?;
        debug!(target: "registry", path = %path.display(), count = entries.len(), "registry loaded");
        Ok(Self { path, entries })
    }

    pub fn save(&self) -> Result<(), RuntimeError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RuntimeError::Registry(format!("Failed to create registry directory: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| RuntimeError::Registry(format!("Failed to serialize registry: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| RuntimeError::Registry(format!("Failed to write registry: {}", e)))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| RuntimeError::Registry(format!("Failed to replace registry: {}", e)))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &str) -> Option<&InstalledExtension> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut InstalledExtension> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, entry: InstalledExtension) -> Option<InstalledExtension> {
        self.entries.insert(entry.id.clone(), entry)
    }

    pub fn remove(&mut self, id: &str) -> Option<InstalledExtension> {
        self.entries.remove(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &InstalledExtension> {
        self.entries.values()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Latest install timestamp on record, 0 when empty.
    pub fn latest_install(&self) -> i64 {
        self.entries.values().map(|e| e.installed_at).max().unwrap_or(0)
    }

    /// Keeps one entry per (name, version): the most recently installed.
    ///
    /// Returns the entries that were dropped.
    pub fn reconcile_duplicates(&mut self) -> Vec<InstalledExtension> {
        let mut newest: HashMap<(String, String), (String, i64)> = HashMap::new();
        for entry in self.entries.values() {
            let key = (entry.name().to_string(), entry.version().to_string());
            match newest.get(&key) {
                Some((_, at)) if *at >= entry.installed_at => {}
                _ => {
                    newest.insert(key, (entry.id.clone(), entry.installed_at));
                }
            }
        }
        let keep: Vec<String> = newest.into_values().map(|(id, _)| id).collect();
        let dropped: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !keep.contains(id))
            .cloned()
            .collect();
        dropped
            .into_iter()
            .filter_map(|id| {
                let entry = self.entries.remove(&id)?;
                warn!(target: "registry", extension_id = %id, name = %entry.name(), "duplicate install dropped");
                Some(entry)
            })
            .collect()
    }
}
