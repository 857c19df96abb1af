//! Permission Manager for the extension runtime.
//!
//! Tracks which permissions each extension holds, stored in SQLite, and
//! arbitrates new requests through the host UI.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::params;
use tracing::{debug, info};
use uuid::Uuid;

use crate::database::connection::Database;
use crate::host::PermissionPrompt;
use crate::services::content_matcher::MatchPattern;
use crate::types::errors::PermissionError;
use crate::types::permission::{
    is_host_pattern, overall_risk, parse_set, PendingPermissionRequest, PermissionOutcome, RiskLevel,
};

/// Trait defining the direct permission bookkeeping operations.
pub trait PermissionManagerTrait {
    fn grant(&self, extension_id: &str, permissions: &BTreeSet<String>) -> Result<(), PermissionError>;
    fn revoke(&self, extension_id: &str, permissions: &BTreeSet<String>) -> Result<usize, PermissionError>;
    fn has(&self, permission: &str, extension_id: &str) -> Result<bool, PermissionError>;
    fn granted(&self, extension_id: &str) -> Result<BTreeSet<String>, PermissionError>;
    fn allows_url(&self, extension_id: &str, url: &str) -> Result<bool, PermissionError>;
    fn remove_all(&self, extension_id: &str) -> Result<usize, PermissionError>;
}

fn db_err(e: rusqlite::Error) -> PermissionError {
    PermissionError::Database(e.to_string())
}

/// Keeps a request listed as pending until the prompt returns or is cancelled.
struct PendingEntry<'a> {
    pending: &'a Mutex<HashMap<String, PendingPermissionRequest>>,
    request_id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.request_id);
    }
}

/// Permission manager backed by SQLite.
pub struct PermissionManager {
    db: Arc<Database>,
    prompt: Arc<dyn PermissionPrompt>,
    auto_grant_trusted: bool,
    pending: Mutex<HashMap<String, PendingPermissionRequest>>,
    request_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PermissionManager {
    pub fn new(db: Arc<Database>, prompt: Arc<dyn PermissionPrompt>, auto_grant_trusted: bool) -> Self {
        Self {
            db,
            prompt,
            auto_grant_trusted,
            pending: Mutex::new(HashMap::new()),
            request_locks: Mutex::new(HashMap::new()),
        }
    }

    fn now_ts() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn request_lock(&self, extension_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.request_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(extension_id.to_string()).or_default())
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingPermissionRequest>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Asks for `permissions` on behalf of an extension.
    ///
    /// Permissions already held are not asked again. Requests for one
    /// extension are answered one at a time.
    pub async fn request(
        &self,
        extension_id: &str,
        extension_name: &str,
        permissions: &BTreeSet<String>,
    ) -> Result<PermissionOutcome, PermissionError> {
        let lock = self.request_lock(extension_id);
        let _serialized = lock.lock().await;

        let held = self.granted(extension_id)?;
        let missing: BTreeSet<String> = permissions.difference(&held).cloned().collect();
        if missing.is_empty() {
            return Ok(PermissionOutcome::Granted);
        }

        let parsed = parse_set(&missing);
        let risk = overall_risk(&parsed);
        if self.auto_grant_trusted && risk < RiskLevel::High {
            debug!(target: "permissions", extension_id, ?risk, "auto-granting");
            self.grant(extension_id, &missing)?;
            return Ok(PermissionOutcome::Granted);
        }

        let request = PendingPermissionRequest {
            id: Uuid::new_v4().to_string(),
            extension_id: extension_id.to_string(),
            extension_name: extension_name.to_string(),
            permissions: parsed.clone(),
            created_at: Self::now_ts(),
        };
        let request_id = request.id.clone();
        self.pending_map().insert(request_id.clone(), request);
        let listed = PendingEntry {
            pending: &self.pending,
            request_id,
        };

        let descriptions: Vec<String> = parsed.iter().map(|p| p.description()).collect();
        let answer = self.prompt.confirm(extension_name, &descriptions).await;
        drop(listed);

        match answer {
            Ok(true) => {
                self.grant(extension_id, &missing)?;
                info!(target: "permissions", extension_id, count = missing.len(), "permissions granted");
                Ok(PermissionOutcome::Granted)
            }
            Ok(false) => {
                info!(target: "permissions", extension_id, "permissions denied");
                Ok(PermissionOutcome::Denied)
            }
            Err(e) => Err(PermissionError::Prompt(e.to_string())),
        }
    }

    /// Requests currently waiting on the host UI, oldest first.
    pub fn pending_requests(&self) -> Vec<PendingPermissionRequest> {
        let mut requests: Vec<_> = self.pending_map().values().cloned().collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        requests
    }

    /// Granted host patterns only.
    pub fn granted_hosts(&self, extension_id: &str) -> Result<Vec<String>, PermissionError> {
        Ok(self
            .granted(extension_id)?
            .into_iter()
            .filter(|p| is_host_pattern(p))
            .collect())
    }
}

impl PermissionManagerTrait for PermissionManager {
    fn grant(&self, extension_id: &str, permissions: &BTreeSet<String>) -> Result<(), PermissionError> {
        let now = Self::now_ts();
        let mut conn = self.db.connection();
        let tx = conn.transaction().map_err(db_err)?;
        for permission in permissions {
            tx.execute(
                "INSERT OR IGNORE INTO permission_grants (extension_id, permission, granted_at) VALUES (?1, ?2, ?3)",
                params![extension_id, permission, now],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)
    }

    fn revoke(&self, extension_id: &str, permissions: &BTreeSet<String>) -> Result<usize, PermissionError> {
        let mut conn = self.db.connection();
        let tx = conn.transaction().map_err(db_err)?;
        let mut removed = 0;
        for permission in permissions {
            removed += tx
                .execute(
                    "DELETE FROM permission_grants WHERE extension_id = ?1 AND permission = ?2",
                    params![extension_id, permission],
                )
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(removed)
    }

    fn has(&self, permission: &str, extension_id: &str) -> Result<bool, PermissionError> {
        let conn = self.db.connection();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM permission_grants WHERE extension_id = ?1 AND permission = ?2",
                params![extension_id, permission],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    fn granted(&self, extension_id: &str) -> Result<BTreeSet<String>, PermissionError> {
        let conn = self.db.connection();
        let mut stmt = conn
            .prepare("SELECT permission FROM permission_grants WHERE extension_id = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![extension_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut result = BTreeSet::new();
        for row in rows {
            result.insert(row.map_err(db_err)?);
        }
        Ok(result)
    }

    fn allows_url(&self, extension_id: &str, url: &str) -> Result<bool, PermissionError> {
        Ok(self.granted_hosts(extension_id)?.iter().any(|pattern| {
            MatchPattern::compile(pattern)
                .map(|p| p.matches(url))
                .unwrap_or(false)
        }))
    }

    fn remove_all(&self, extension_id: &str) -> Result<usize, PermissionError> {
        let removed = self
            .db
            .connection()
            .execute(
                "DELETE FROM permission_grants WHERE extension_id = ?1",
                params![extension_id],
            )
            .map_err(db_err)?;
        self.request_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(extension_id);
        Ok(removed)
    }
}
