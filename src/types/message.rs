use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlates an asynchronous call with its single completion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackToken(String);

impl CallbackToken {
    /// Native-side tokens are UUID v4.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallbackToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallbackToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A page context known to the renderer. Equal to the tab id of the page.
pub type PageId = i64;

/// Long-lived port between a page and a background host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for PortId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity attached to every runtime message, as `onMessage` listeners see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<i64>,
}

impl MessageSender {
    pub fn background(extension_id: &str) -> Self {
        Self {
            id: extension_id.to_string(),
            url: None,
            tab: None,
        }
    }

    pub fn page(extension_id: &str, url: &str, tab: i64) -> Self {
        Self {
            id: extension_id.to_string(),
            url: Some(url.to_string()),
            tab: Some(tab),
        }
    }
}

/// A value crossing from a script context into native code, before sanitizing.
///
/// Mirrors what a script can hand over: optionals that may be absent, numbers
/// that may be non-finite, and host objects with no JSON form.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeValue {
    Null,
    Optional(Option<Box<BridgeValue>>),
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<BridgeValue>),
    Map(BTreeMap<String, BridgeValue>),
    /// A function, symbol or other object without a JSON form, described by its type name.
    Opaque(String),
}

impl From<serde_json::Value> for BridgeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => BridgeValue::Null,
            serde_json::Value::Bool(b) => BridgeValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => BridgeValue::Int(i),
                None => BridgeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => BridgeValue::String(s),
            serde_json::Value::Array(items) => {
                BridgeValue::Array(items.into_iter().map(BridgeValue::from).collect())
            }
            serde_json::Value::Object(map) => BridgeValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, BridgeValue::from(v)))
                    .collect(),
            ),
        }
    }
}
