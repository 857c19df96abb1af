use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::manifest::Manifest;

/// Where an installed extension came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallSource {
    /// Unpacked directory copied into the extensions dir.
    Local,
    /// Package downloaded from a store mirror.
    Store,
    /// Unpacked directory loaded in place.
    Dev,
}

impl InstallSource {
    /// Whether uninstall deletes the extension's files.
    pub fn owns_files(self) -> bool {
        !matches!(self, InstallSource::Dev)
    }
}

/// Persisted registry entry for an installed extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledExtension {
    pub id: String,
    pub manifest: Manifest,
    pub install_path: PathBuf,
    /// Milliseconds since the Unix epoch; strictly increasing across installs.
    pub installed_at: i64,
    pub last_used_at: Option<i64>,
    pub enabled: bool,
    pub source: InstallSource,
    #[serde(default)]
    pub store_id: Option<String>,
}

impl InstalledExtension {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    pub fn summary(&self, state: ExtensionState) -> ExtensionSummary {
        ExtensionSummary {
            id: self.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            manifest_version: self.manifest.manifest_version.as_number(),
            enabled: self.enabled,
            state,
            source: self.source,
            installed_at: self.installed_at,
            permissions: self.manifest.declared_permissions().into_iter().collect(),
        }
    }
}

/// Lifecycle position of an extension inside the runtime.
///
/// `Installing` covers the time between validation and activation, while the
/// permission dialog is open. `Uninstalled` is reported for ids removed during
/// the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    Installing,
    Enabled,
    Disabled,
    Uninstalled,
}

/// Flat view handed to the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub manifest_version: u8,
    pub enabled: bool,
    pub state: ExtensionState,
    pub source: InstallSource,
    pub installed_at: i64,
    pub permissions: Vec<String>,
}

/// Lifecycle notification published to runtime subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtensionEvent {
    Installed { extension_id: String },
    Uninstalled { extension_id: String },
    Enabled { extension_id: String },
    Disabled { extension_id: String },
}

impl ExtensionEvent {
    pub fn extension_id(&self) -> &str {
        match self {
            ExtensionEvent::Installed { extension_id }
            | ExtensionEvent::Uninstalled { extension_id }
            | ExtensionEvent::Enabled { extension_id }
            | ExtensionEvent::Disabled { extension_id } => extension_id,
        }
    }
}

/// Why `runtime.onInstalled` fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallReason {
    Install,
    Update,
}
