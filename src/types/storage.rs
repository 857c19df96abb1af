use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the three `chrome.storage` areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageAreaKind {
    Local,
    Sync,
    Session,
}

impl StorageAreaKind {
    pub const ALL: [StorageAreaKind; 3] = [
        StorageAreaKind::Local,
        StorageAreaKind::Sync,
        StorageAreaKind::Session,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StorageAreaKind::Local => "local",
            StorageAreaKind::Sync => "sync",
            StorageAreaKind::Session => "session",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(StorageAreaKind::Local),
            "sync" => Some(StorageAreaKind::Sync),
            "session" => Some(StorageAreaKind::Session),
            _ => None,
        }
    }

    pub fn is_persistent(self) -> bool {
        !matches!(self, StorageAreaKind::Session)
    }
}

impl fmt::Display for StorageAreaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key selector accepted by `get` and `getBytesInUse`.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageKeys {
    /// `null` or omitted: every key.
    All,
    One(String),
    Many(Vec<String>),
    /// Missing keys fall back to the given defaults.
    WithDefaults(BTreeMap<String, Value>),
}

impl StorageKeys {
    /// Interprets the first argument to `storage.<area>.get`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(StorageKeys::All),
            Value::String(key) => Some(StorageKeys::One(key.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(StorageKeys::Many),
            Value::Object(map) => Some(StorageKeys::WithDefaults(
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            _ => None,
        }
    }
}

/// Old/new pair for one key, as `storage.onChanged` reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// Key → change map for one write.
pub type StorageChanges = BTreeMap<String, StorageChange>;
