//! Contracts the embedding browser shell implements.
//!
//! The runtime never renders pages, owns tabs or draws dialogs itself; it
//! calls out through these traits and awaits the answers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::errors::HostError;
use crate::types::message::PageId;
use crate::types::tab::{CreateProperties, TabInfo, TabQuery, UpdateProperties};

/// When a user script runs relative to page parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionTime {
    /// Before any page script.
    DocumentStart,
    /// After the document has been parsed.
    DocumentEnd,
}

/// A script the renderer should run in a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserScript {
    pub extension_id: String,
    /// File the script came from, for diagnostics.
    pub file: String,
    pub source: String,
    pub timing: InjectionTime,
    pub all_frames: bool,
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub exclude_matches: Vec<String>,
}

/// Page-rendering component.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Runs `source` in the page and returns its completion value as JSON.
    async fn evaluate_script(&self, page: PageId, source: &str) -> Result<Value, HostError>;
    /// Makes `__postNative(channel, msg)` inside the page deliver to the runtime.
    async fn register_channel(&self, page: PageId, channel: &str) -> Result<(), HostError>;
    /// Delivers `message` to `__extensionBridge.receive` in the page.
    async fn post_message(&self, page: PageId, channel: &str, message: Value) -> Result<(), HostError>;
    async fn add_user_script(&self, page: PageId, script: UserScript) -> Result<(), HostError>;
    /// Opens `url` in a new tab (or a popup window when `in_tab` is false).
    async fn create_page(&self, url: &str, in_tab: bool) -> Result<PageId, HostError>;
}

/// Tab and window manager.
#[async_trait]
pub trait TabHost: Send + Sync {
    async fn query(&self, query: &TabQuery) -> Result<Vec<TabInfo>, HostError>;
    async fn get(&self, tab_id: i64) -> Result<TabInfo, HostError>;
    async fn create(&self, properties: &CreateProperties) -> Result<TabInfo, HostError>;
    async fn update(&self, tab_id: i64, properties: &UpdateProperties) -> Result<TabInfo, HostError>;
    async fn remove(&self, tab_ids: &[i64]) -> Result<(), HostError>;
    /// The focused tab, if any.
    async fn current(&self) -> Result<Option<TabInfo>, HostError>;
}

/// Host UI that asks the user to confirm permissions.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    /// `true` when the user accepts every listed permission.
    async fn confirm(&self, extension_name: &str, descriptions: &[String]) -> Result<bool, HostError>;
}
