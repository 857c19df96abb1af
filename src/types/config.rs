use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::storage::StorageAreaKind;

pub const DATA_DIR_ENV: &str = "EXTHOST_DATA_DIR";

/// Runtime configuration. Every field has a default, so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/extensions` when unset.
    pub extensions_dir: Option<PathBuf>,
    /// Defaults to `<data_dir>/extensions.json` when unset.
    pub registry_path: Option<PathBuf>,
    /// Defaults to `<data_dir>/extension-host.db` when unset.
    pub database_path: Option<PathBuf>,
    pub extension_scheme: String,
    pub quotas: StorageQuotas,
    pub callback_timeout_ms: u64,
    /// Limit on a permission dialog; `0` waits for the user.
    pub prompt_timeout_ms: u64,
    pub listener_timeout_ms: u64,
    pub dedup_window_ms: u64,
    pub sweep_interval_ms: u64,
    /// In-flight web requests older than this are failed by the sweep.
    pub request_max_age_ms: u64,
    pub script_memory_limit_bytes: usize,
    /// Limit on one background evaluation; `0` disables it.
    pub script_timeout_ms: u64,
    /// Grant low and medium risk requests without asking the user.
    pub auto_grant_trusted: bool,
    /// Templates with an `{id}` placeholder, tried in order.
    pub store_mirrors: Vec<String>,
    pub download_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageQuotas {
    pub local_bytes: usize,
    pub sync_bytes: usize,
    pub session_bytes: usize,
}

impl Default for StorageQuotas {
    fn default() -> Self {
        Self {
            local_bytes: 10 * 1024 * 1024,
            sync_bytes: 100 * 1024,
            session_bytes: 10 * 1024 * 1024,
        }
    }
}

impl StorageQuotas {
    pub fn for_area(&self, area: StorageAreaKind) -> usize {
        match area {
            StorageAreaKind::Local => self.local_bytes,
            StorageAreaKind::Sync => self.sync_bytes,
            StorageAreaKind::Session => self.session_bytes,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            extensions_dir: None,
            registry_path: None,
            database_path: None,
            extension_scheme: "chrome-extension".to_string(),
            quotas: StorageQuotas::default(),
            callback_timeout_ms: 30_000,
            prompt_timeout_ms: 0,
            listener_timeout_ms: 5_000,
            dedup_window_ms: 1_000,
            sweep_interval_ms: 1_000,
            request_max_age_ms: 300_000,
            script_memory_limit_bytes: 64 * 1024 * 1024,
            script_timeout_ms: 5_000,
            auto_grant_trusted: false,
            store_mirrors: vec![
                "https://clients2.google.com/service/update2/crx?response=redirect&prodversion=120.0&acceptformat=crx3&x=id%3D{id}%26uc".to_string(),
            ],
            download_retries: 3,
        }
    }
}

impl RuntimeConfig {
    /// Config rooted at `data_dir`, everything else defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn extensions_dir(&self) -> PathBuf {
        self.extensions_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("extensions"))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("extensions.json"))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("extension-host.db"))
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    pub fn prompt_timeout(&self) -> Option<Duration> {
        (self.prompt_timeout_ms > 0).then(|| Duration::from_millis(self.prompt_timeout_ms))
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub fn request_max_age(&self) -> Duration {
        Duration::from_millis(self.request_max_age_ms)
    }

    /// `chrome-extension://<id>/`
    pub fn extension_origin(&self, extension_id: &str) -> String {
        format!("{}://{}/", self.extension_scheme, extension_id)
    }

    /// URL of a file inside an extension; a leading `/` on `path` is ignored.
    pub fn extension_url(&self, extension_id: &str, path: &str) -> String {
        format!(
            "{}{}",
            self.extension_origin(extension_id),
            path.trim_start_matches('/')
        )
    }

    /// Extension id of a URL under the extension scheme, if any.
    pub fn extension_id_of<'a>(&self, url: &'a str) -> Option<&'a str> {
        let rest = url
            .strip_prefix(self.extension_scheme.as_str())?
            .strip_prefix("://")?;
        let id = rest.split(['/', '?', '#']).next()?;
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

/// `$EXTHOST_DATA_DIR`, else the platform data dir, else `./extension-host`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|d| d.join("extension-host"))
        .unwrap_or_else(|| PathBuf::from("extension-host"))
}

/// Platform config dir used for `config.json`.
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::config_dir()
        .map(|d| d.join("extension-host"))
        .unwrap_or_else(|| PathBuf::from("extension-host"))
}
