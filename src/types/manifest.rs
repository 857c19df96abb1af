use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Manifest format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ManifestVersion {
    V2,
    V3,
}

impl ManifestVersion {
    pub fn as_number(self) -> u8 {
        match self {
            ManifestVersion::V2 => 2,
            ManifestVersion::V3 => 3,
        }
    }
}

impl TryFrom<u8> for ManifestVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(ManifestVersion::V2),
            3 => Ok(ManifestVersion::V3),
            other => Err(format!("unsupported manifest version {}", other)),
        }
    }
}

impl From<ManifestVersion> for u8 {
    fn from(value: ManifestVersion) -> Self {
        value.as_number()
    }
}

/// Validated, immutable extension manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: ManifestVersion,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub optional_permissions: BTreeSet<String>,
    #[serde(default)]
    pub host_permissions: BTreeSet<String>,
    #[serde(default)]
    pub background: Option<BackgroundDescriptor>,
    #[serde(default)]
    pub content_scripts: Vec<ContentScriptDescriptor>,
    #[serde(default)]
    pub action: Option<ActionDescriptor>,
    #[serde(default)]
    pub options_page: Option<OptionsPageDescriptor>,
}

impl Manifest {
    /// Every permission the manifest declares up front, API and host alike.
    pub fn declared_permissions(&self) -> BTreeSet<String> {
        self.permissions
            .iter()
            .chain(self.host_permissions.iter())
            .cloned()
            .collect()
    }

    /// Permissions the extension may ask for later through `chrome.permissions.request`.
    pub fn requestable_permissions(&self) -> BTreeSet<String> {
        let mut all = self.declared_permissions();
        all.extend(self.optional_permissions.iter().cloned());
        all
    }

    pub fn is_v3(&self) -> bool {
        self.manifest_version == ManifestVersion::V3
    }
}

/// How an extension's background logic is packaged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackgroundDescriptor {
    /// Manifest v2 persistent (or event) script list.
    Scripts { scripts: Vec<String>, persistent: bool },
    /// Manifest v2 background page; its `<script src>` tags are loaded in order.
    Page { page: String, persistent: bool },
    /// Manifest v3 event-driven worker.
    ServiceWorker { service_worker: String, module: bool },
}

impl BackgroundDescriptor {
    pub fn is_persistent(&self) -> bool {
        match self {
            BackgroundDescriptor::Scripts { persistent, .. } => *persistent,
            BackgroundDescriptor::Page { persistent, .. } => *persistent,
            BackgroundDescriptor::ServiceWorker { .. } => false,
        }
    }
}

/// When a content script runs relative to page parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAt {
    DocumentStart,
    DocumentEnd,
    #[default]
    DocumentIdle,
}

/// One `content_scripts` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentScriptDescriptor {
    pub matches: Vec<String>,
    #[serde(default)]
    pub exclude_matches: Vec<String>,
    #[serde(default)]
    pub js: Vec<String>,
    #[serde(default)]
    pub css: Vec<String>,
    #[serde(default)]
    pub run_at: RunAt,
    #[serde(default)]
    pub all_frames: bool,
}

/// Toolbar icon: a single path or a size → path map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IconSet {
    Single(String),
    Sized(BTreeMap<String, String>),
}

/// `action` (v3) or `browser_action` / `page_action` (v2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    #[serde(default)]
    pub default_popup: Option<String>,
    #[serde(default)]
    pub default_title: Option<String>,
    #[serde(default)]
    pub default_icon: Option<IconSet>,
}

/// `options_ui` or legacy `options_page`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionsPageDescriptor {
    pub page: String,
    #[serde(default)]
    pub open_in_tab: bool,
}
