//! `chrome.storage` backing stores.
//!
//! `local` and `sync` persist in the `storage_items` table; `session` lives in
//! memory and is lost when the runtime exits. Each write is checked against
//! the area quota before anything is stored.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::params;
use serde_json::{Map, Value};
use tracing::debug;

use crate::database::connection::Database;
use crate::types::config::StorageQuotas;
use crate::types::errors::StorageError;
use crate::types::storage::{StorageAreaKind, StorageChange, StorageChanges, StorageKeys};

/// One extension-partitioned key/value area.
pub trait AreaStore: Send + Sync {
    fn get_all(&self, extension_id: &str) -> Result<BTreeMap<String, Value>, StorageError>;
    fn put(&self, extension_id: &str, items: &BTreeMap<String, Value>) -> Result<(), StorageError>;
    fn delete(&self, extension_id: &str, keys: &[String]) -> Result<(), StorageError>;
    fn clear(&self, extension_id: &str) -> Result<(), StorageError>;
}

/// Persistent area stored in SQLite.
pub struct SqliteArea {
    db: Arc<Database>,
    area: StorageAreaKind,
}

impl SqliteArea {
    pub fn new(db: Arc<Database>, area: StorageAreaKind) -> Self {
        Self { db, area }
    }
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

impl AreaStore for SqliteArea {
    fn get_all(&self, extension_id: &str) -> Result<BTreeMap<String, Value>, StorageError> {
        let conn = self.db.connection();
        let mut stmt = conn
            .prepare("SELECT key, value FROM storage_items WHERE extension_id = ?1 AND area = ?2")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![extension_id, self.area.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut items = BTreeMap::new();
        for row in rows {
            let (key, raw) = row.map_err(db_err)?;
            let value = serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(e.to_string()))?;
            items.insert(key, value);
        }
        Ok(items)
    }

    fn put(&self, extension_id: &str, items: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let mut conn = self.db.connection();
        let tx = conn.transaction().map_err(db_err)?;
        for (key, value) in items {
            let raw = serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
            tx.execute(
                "INSERT INTO storage_items (extension_id, area, key, value, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(extension_id, area, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![extension_id, self.area.as_str(), key, raw, now],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    fn delete(&self, extension_id: &str, keys: &[String]) -> Result<(), StorageError> {
        let mut conn = self.db.connection();
        let tx = conn.transaction().map_err(db_err)?;
        for key in keys {
            tx.execute(
                "DELETE FROM storage_items WHERE extension_id = ?1 AND area = ?2 AND key = ?3",
                params![extension_id, self.area.as_str(), key],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    fn clear(&self, extension_id: &str) -> Result<(), StorageError> {
        self.db
            .connection()
            .execute(
                "DELETE FROM storage_items WHERE extension_id = ?1 AND area = ?2",
                params![extension_id, self.area.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

/// In-memory area for `storage.session`.
#[derive(Default)]
pub struct MemoryArea {
    items: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Value>>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl AreaStore for MemoryArea {
    fn get_all(&self, extension_id: &str) -> Result<BTreeMap<String, Value>, StorageError> {
        Ok(self.lock().get(extension_id).cloned().unwrap_or_default())
    }

    fn put(&self, extension_id: &str, items: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let mut all = self.lock();
        let area = all.entry(extension_id.to_string()).or_default();
        for (key, value) in items {
            area.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn delete(&self, extension_id: &str, keys: &[String]) -> Result<(), StorageError> {
        if let Some(area) = self.lock().get_mut(extension_id) {
            for key in keys {
                area.remove(key);
            }
        }
        Ok(())
    }

    fn clear(&self, extension_id: &str) -> Result<(), StorageError> {
        self.lock().remove(extension_id);
        Ok(())
    }
}

/// Serialized size of one item: key length plus JSON value length.
pub fn item_size(key: &str, value: &Value) -> usize {
    key.len() + value.to_string().len()
}

pub fn total_size<'a, I>(items: I) -> usize
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    items.into_iter().map(|(k, v)| item_size(k, v)).sum()
}

/// The three storage areas with quota enforcement.
pub struct StorageEngine {
    local: Box<dyn AreaStore>,
    sync: Box<dyn AreaStore>,
    session: Box<dyn AreaStore>,
    quotas: StorageQuotas,
    /// Serializes check-then-write so two writers cannot together exceed a quota.
    write_lock: Mutex<()>,
}

impl StorageEngine {
    pub fn new(db: Arc<Database>, quotas: StorageQuotas) -> Self {
        Self::with_areas(
            Box::new(SqliteArea::new(Arc::clone(&db), StorageAreaKind::Local)),
            Box::new(SqliteArea::new(db, StorageAreaKind::Sync)),
            Box::new(MemoryArea::new()),
            quotas,
        )
    }

    pub fn with_areas(
        local: Box<dyn AreaStore>,
        sync: Box<dyn AreaStore>,
        session: Box<dyn AreaStore>,
        quotas: StorageQuotas,
    ) -> Self {
        Self {
            local,
            sync,
            session,
            quotas,
            write_lock: Mutex::new(()),
        }
    }

    fn area(&self, kind: StorageAreaKind) -> &dyn AreaStore {
        match kind {
            StorageAreaKind::Local => self.local.as_ref(),
            StorageAreaKind::Sync => self.sync.as_ref(),
            StorageAreaKind::Session => self.session.as_ref(),
        }
    }

    pub fn quota(&self, kind: StorageAreaKind) -> usize {
        self.quotas.for_area(kind)
    }

    pub fn get(&self, extension_id: &str, kind: StorageAreaKind, keys: &StorageKeys) -> Result<Map<String, Value>, StorageError> {
        let stored = self.area(kind).get_all(extension_id)?;
        let mut result = Map::new();
        match keys {
            StorageKeys::All => {
                result.extend(stored);
            }
            StorageKeys::One(key) => {
                if let Some(value) = stored.get(key) {
                    result.insert(key.clone(), value.clone());
                }
            }
            StorageKeys::Many(list) => {
                for key in list {
                    if let Some(value) = stored.get(key) {
                        result.insert(key.clone(), value.clone());
                    }
                }
            }
            StorageKeys::WithDefaults(defaults) => {
                for (key, default) in defaults {
                    let value = stored.get(key).unwrap_or(default);
                    result.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(result)
    }

    /// Stores `items`, replacing existing keys. Fails without writing when the quota would be exceeded.
    pub fn set(&self, extension_id: &str, kind: StorageAreaKind, items: Map<String, Value>) -> Result<StorageChanges, StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let area = self.area(kind);
        let existing = area.get_all(extension_id)?;

        let mut merged = existing.clone();
        for (key, value) in &items {
            merged.insert(key.clone(), value.clone());
        }
        let requested = total_size(&merged);
        let quota = self.quota(kind);
        if requested > quota {
            debug!(target: "storage", extension_id, area = kind.as_str(), requested, quota, "quota exceeded");
            return Err(StorageError::QuotaExceeded {
                area: kind.as_str().to_string(),
                requested,
                quota,
            });
        }

        let items: BTreeMap<String, Value> = items.into_iter().collect();
        area.put(extension_id, &items)?;

        Ok(items
            .into_iter()
            .filter_map(|(key, new_value)| {
                let old_value = existing.get(&key).cloned();
                if old_value.as_ref() == Some(&new_value) {
                    return None;
                }
                Some((
                    key,
                    StorageChange {
                        old_value,
                        new_value: Some(new_value),
                    },
                ))
            })
            .collect())
    }

    pub fn remove(&self, extension_id: &str, kind: StorageAreaKind, keys: &[String]) -> Result<StorageChanges, StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let area = self.area(kind);
        let existing = area.get_all(extension_id)?;
        area.delete(extension_id, keys)?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                existing.get(key).map(|old| {
                    (
                        key.clone(),
                        StorageChange {
                            old_value: Some(old.clone()),
                            new_value: None,
                        },
                    )
                })
            })
            .collect())
    }

    pub fn clear(&self, extension_id: &str, kind: StorageAreaKind) -> Result<StorageChanges, StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let area = self.area(kind);
        let existing = area.get_all(extension_id)?;
        area.clear(extension_id)?;
        Ok(existing
            .into_iter()
            .map(|(key, old)| {
                (
                    key,
                    StorageChange {
                        old_value: Some(old),
                        new_value: None,
                    },
                )
            })
            .collect())
    }

    pub fn bytes_in_use(&self, extension_id: &str, kind: StorageAreaKind, keys: &StorageKeys) -> Result<usize, StorageError> {
        let selected = match keys {
            StorageKeys::WithDefaults(defaults) => {
                let names = StorageKeys::Many(defaults.keys().cloned().collect());
                self.get(extension_id, kind, &names)?
            }
            other => self.get(extension_id, kind, other)?,
        };
        Ok(total_size(&selected))
    }

    /// Wipes every area for an uninstalled extension.
    pub fn clear_extension(&self, extension_id: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        for kind in StorageAreaKind::ALL {
            self.area(kind).clear(extension_id)?;
        }
        Ok(())
    }
}
