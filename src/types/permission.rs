use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A capability an extension must hold before using a sensitive API or host.
///
/// Serialized as its manifest spelling (`"storage"`, `"https://*.example.com/*"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Permission {
    ActiveTab,
    Alarms,
    Bookmarks,
    BrowsingData,
    ContextMenus,
    Cookies,
    Debugger,
    DeclarativeNetRequest,
    Downloads,
    History,
    Identity,
    Management,
    NativeMessaging,
    Notifications,
    Privacy,
    Proxy,
    Scripting,
    Storage,
    Tabs,
    TopSites,
    UnlimitedStorage,
    WebNavigation,
    WebRequest,
    WebRequestBlocking,
    /// A host match pattern, including `<all_urls>`.
    Host(String),
    /// Anything the runtime does not model explicitly.
    Other(String),
}

/// Coarse grouping used when presenting permissions to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    HostAccess,
    NetworkInterception,
    BrowserData,
    Storage,
    Privacy,
    GenericApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl Permission {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "activeTab" => Permission::ActiveTab,
            "alarms" => Permission::Alarms,
            "bookmarks" => Permission::Bookmarks,
            "browsingData" => Permission::BrowsingData,
            "contextMenus" => Permission::ContextMenus,
            "cookies" => Permission::Cookies,
            "debugger" => Permission::Debugger,
            "declarativeNetRequest" => Permission::DeclarativeNetRequest,
            "downloads" => Permission::Downloads,
            "history" => Permission::History,
            "identity" => Permission::Identity,
            "management" => Permission::Management,
            "nativeMessaging" => Permission::NativeMessaging,
            "notifications" => Permission::Notifications,
            "privacy" => Permission::Privacy,
            "proxy" => Permission::Proxy,
            "scripting" => Permission::Scripting,
            "storage" => Permission::Storage,
            "tabs" => Permission::Tabs,
            "topSites" => Permission::TopSites,
            "unlimitedStorage" => Permission::UnlimitedStorage,
            "webNavigation" => Permission::WebNavigation,
            "webRequest" => Permission::WebRequest,
            "webRequestBlocking" => Permission::WebRequestBlocking,
            other if is_host_pattern(other) => Permission::Host(other.to_string()),
            other => Permission::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Permission::ActiveTab => "activeTab",
            Permission::Alarms => "alarms",
            Permission::Bookmarks => "bookmarks",
            Permission::BrowsingData => "browsingData",
            Permission::ContextMenus => "contextMenus",
            Permission::Cookies => "cookies",
            Permission::Debugger => "debugger",
            Permission::DeclarativeNetRequest => "declarativeNetRequest",
            Permission::Downloads => "downloads",
            Permission::History => "history",
            Permission::Identity => "identity",
            Permission::Management => "management",
            Permission::NativeMessaging => "nativeMessaging",
            Permission::Notifications => "notifications",
            Permission::Privacy => "privacy",
            Permission::Proxy => "proxy",
            Permission::Scripting => "scripting",
            Permission::Storage => "storage",
            Permission::Tabs => "tabs",
            Permission::TopSites => "topSites",
            Permission::UnlimitedStorage => "unlimitedStorage",
            Permission::WebNavigation => "webNavigation",
            Permission::WebRequest => "webRequest",
            Permission::WebRequestBlocking => "webRequestBlocking",
            Permission::Host(pattern) => pattern,
            Permission::Other(name) => name,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Permission::Host(_))
    }

    pub fn category(&self) -> PermissionCategory {
        match self {
            Permission::Host(_) | Permission::ActiveTab => PermissionCategory::HostAccess,
            Permission::WebRequest
            | Permission::WebRequestBlocking
            | Permission::DeclarativeNetRequest
            | Permission::Proxy => PermissionCategory::NetworkInterception,
            Permission::Bookmarks
            | Permission::BrowsingData
            | Permission::Cookies
            | Permission::Downloads
            | Permission::History
            | Permission::Tabs
            | Permission::TopSites
            | Permission::WebNavigation => PermissionCategory::BrowserData,
            Permission::Storage | Permission::UnlimitedStorage => PermissionCategory::Storage,
            Permission::Privacy | Permission::Identity | Permission::Debugger => {
                PermissionCategory::Privacy
            }
            Permission::Alarms
            | Permission::ContextMenus
            | Permission::Management
            | Permission::NativeMessaging
            | Permission::Notifications
            | Permission::Scripting
            | Permission::Other(_) => PermissionCategory::GenericApi,
        }
    }

    pub fn risk_level(&self) -> RiskLevel {
        match self {
            Permission::Host(pattern) if is_broad_host_pattern(pattern) => RiskLevel::High,
            Permission::Host(_) => RiskLevel::Medium,
            Permission::WebRequestBlocking
            | Permission::Proxy
            | Permission::Debugger
            | Permission::NativeMessaging
            | Permission::Cookies
            | Permission::History
            | Permission::Privacy
            | Permission::Management => RiskLevel::High,
            Permission::WebRequest
            | Permission::Tabs
            | Permission::BrowsingData
            | Permission::Bookmarks
            | Permission::Downloads
            | Permission::Scripting
            | Permission::DeclarativeNetRequest
            | Permission::Identity
            | Permission::TopSites
            | Permission::WebNavigation
            | Permission::Other(_) => RiskLevel::Medium,
            Permission::ActiveTab
            | Permission::Alarms
            | Permission::ContextMenus
            | Permission::Notifications
            | Permission::Storage
            | Permission::UnlimitedStorage => RiskLevel::Low,
        }
    }

    /// Sentence shown in the install/permission dialog.
    pub fn description(&self) -> String {
        match self {
            Permission::Host(pattern) if is_broad_host_pattern(pattern) => {
                "Read and change all your data on all websites".to_string()
            }
            Permission::Host(pattern) => format!("Read and change your data on {}", pattern),
            Permission::ActiveTab => "Access the current tab when you invoke the extension".to_string(),
            Permission::Alarms => "Schedule code to run periodically".to_string(),
            Permission::Bookmarks => "Read and change your bookmarks".to_string(),
            Permission::BrowsingData => "Clear your browsing data".to_string(),
            Permission::ContextMenus => "Add items to context menus".to_string(),
            Permission::Cookies => "Read and change cookies on websites".to_string(),
            Permission::Debugger => "Access the page debugger backend".to_string(),
            Permission::DeclarativeNetRequest => "Block content on any page".to_string(),
            Permission::Downloads => "Manage your downloads".to_string(),
            Permission::History => "Read and change your browsing history".to_string(),
            Permission::Identity => "Know your email address".to_string(),
            Permission::Management => "Manage your apps, extensions, and themes".to_string(),
            Permission::NativeMessaging => {
                "Communicate with cooperating native applications".to_string()
            }
            Permission::Notifications => "Display notifications".to_string(),
            Permission::Privacy => "Change your privacy-related settings".to_string(),
            Permission::Proxy => "Read and change proxy settings".to_string(),
            Permission::Scripting => "Inject scripts into pages".to_string(),
            Permission::Storage => "Store data locally".to_string(),
            Permission::Tabs => "Read your browsing activity".to_string(),
            Permission::TopSites => "Read a list of your most frequently visited websites".to_string(),
            Permission::UnlimitedStorage => "Store an unlimited amount of data".to_string(),
            Permission::WebNavigation => "Read your browsing activity".to_string(),
            Permission::WebRequest => "Observe network requests".to_string(),
            Permission::WebRequestBlocking => "Block and modify network requests".to_string(),
            Permission::Other(name) => format!("Use the {} API", name),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Permission {
    fn from(value: String) -> Self {
        Permission::parse(&value)
    }
}

impl From<&str> for Permission {
    fn from(value: &str) -> Self {
        Permission::parse(value)
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.as_str().to_string()
    }
}

/// Overall risk of a set: the highest member, `Low` for an empty set.
pub fn overall_risk<'a, I>(permissions: I) -> RiskLevel
where
    I: IntoIterator<Item = &'a Permission>,
{
    permissions
        .into_iter()
        .map(Permission::risk_level)
        .max()
        .unwrap_or(RiskLevel::Low)
}

/// Parse a set of raw manifest permission strings.
pub fn parse_set<'a, I>(raw: I) -> BTreeSet<Permission>
where
    I: IntoIterator<Item = &'a String>,
{
    raw.into_iter().map(|p| Permission::parse(p)).collect()
}

/// True for `<all_urls>` and `scheme://host/path`-shaped strings.
pub fn is_host_pattern(raw: &str) -> bool {
    raw == "<all_urls>" || raw.contains("://")
}

fn is_broad_host_pattern(pattern: &str) -> bool {
    if pattern == "<all_urls>" {
        return true;
    }
    match pattern.split_once("://") {
        Some((_, rest)) => rest.split('/').next().map(|host| host == "*").unwrap_or(false),
        None => false,
    }
}

/// The user's answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    Granted,
    Denied,
}

/// A request waiting on the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPermissionRequest {
    pub id: String,
    pub extension_id: String,
    pub extension_name: String,
    pub permissions: BTreeSet<Permission>,
    pub created_at: i64,
}
