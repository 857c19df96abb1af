//! Typed extension API calls.
//!
//! Script shims hand over `(method, payload)`; [`ApiCall::parse`] validates
//! the payload once at the boundary so the router only ever sees typed calls.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::ApiError;
use super::message::PortId;
use super::storage::{StorageAreaKind, StorageKeys};
use super::tab::{CreateProperties, TabQuery, UpdateProperties};
use super::web_request::{RequestFilter, WebRequestStage};

/// `{permissions, origins}` as `chrome.permissions` takes and returns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default)]
    pub origins: BTreeSet<String>,
}

impl PermissionSet {
    pub fn all(&self) -> BTreeSet<String> {
        self.permissions.union(&self.origins).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.origins.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    StorageGet {
        area: StorageAreaKind,
        keys: StorageKeys,
    },
    StorageSet {
        area: StorageAreaKind,
        items: Map<String, Value>,
    },
    StorageRemove {
        area: StorageAreaKind,
        keys: Vec<String>,
    },
    StorageClear {
        area: StorageAreaKind,
    },
    StorageBytesInUse {
        area: StorageAreaKind,
        keys: StorageKeys,
    },
    TabsQuery(TabQuery),
    TabsGet {
        tab_id: i64,
    },
    TabsCreate(CreateProperties),
    TabsUpdate {
        tab_id: Option<i64>,
        properties: UpdateProperties,
    },
    TabsRemove {
        tab_ids: Vec<i64>,
    },
    RuntimeSendMessage {
        message: Value,
    },
    RuntimeOpenOptionsPage,
    RuntimeConnect {
        name: Option<String>,
    },
    WebRequestAddListener {
        stage: WebRequestStage,
        handle: String,
        filter: RequestFilter,
        extra_info_spec: Vec<String>,
    },
    WebRequestRemoveListener {
        handle: String,
    },
    PermissionsRequest(PermissionSet),
    PermissionsContains(PermissionSet),
    PermissionsGetAll,
    PermissionsRemove(PermissionSet),
    PortPostMessage {
        port_id: PortId,
        message: Value,
    },
    PortDisconnect {
        port_id: PortId,
    },
}

impl ApiCall {
    pub fn parse(method: &str, payload: Value) -> Result<Self, ApiError> {
        let args = Args { method, payload };
        let call = match method {
            "storage.get" => ApiCall::StorageGet {
                area: args.area()?,
                keys: args.keys()?,
            },
            "storage.set" => ApiCall::StorageSet {
                area: args.area()?,
                items: args.object("items")?,
            },
            "storage.remove" => ApiCall::StorageRemove {
                area: args.area()?,
                keys: match args.keys()? {
                    StorageKeys::One(key) => vec![key],
                    StorageKeys::Many(keys) => keys,
                    _ => return Err(args.invalid("keys must be a string or list of strings")),
                },
            },
            "storage.clear" => ApiCall::StorageClear { area: args.area()? },
            "storage.getBytesInUse" => ApiCall::StorageBytesInUse {
                area: args.area()?,
                keys: args.keys()?,
            },
            "tabs.query" => ApiCall::TabsQuery(args.typed_or_default("query")?),
            "tabs.get" => ApiCall::TabsGet {
                tab_id: args.int("tabId")?,
            },
            "tabs.create" => ApiCall::TabsCreate(args.typed_or_default("properties")?),
            "tabs.update" => ApiCall::TabsUpdate {
                tab_id: args.optional_int("tabId")?,
                properties: args.typed_or_default("properties")?,
            },
            "tabs.remove" => ApiCall::TabsRemove {
                tab_ids: match args.field("tabIds") {
                    Some(Value::Number(_)) => vec![args.int("tabIds")?],
                    Some(Value::Array(_)) => args.typed("tabIds")?,
                    _ => return Err(args.invalid("tabIds must be an integer or list of integers")),
                },
            },
            "runtime.sendMessage" => ApiCall::RuntimeSendMessage {
                message: args.field("message").cloned().unwrap_or(Value::Null),
            },
            "runtime.openOptionsPage" => ApiCall::RuntimeOpenOptionsPage,
            "runtime.connect" => ApiCall::RuntimeConnect {
                name: args.optional_string("name")?,
            },
            "webRequest.addListener" => {
                let event = args.string("event")?;
                let stage = WebRequestStage::from_event_name(&event)
                    .ok_or_else(|| args.invalid(&format!("unknown webRequest event {}", event)))?;
                ApiCall::WebRequestAddListener {
                    stage,
                    handle: args.string("handle")?,
                    filter: args.typed("filter")?,
                    extra_info_spec: args.typed_or_default("extraInfoSpec")?,
                }
            }
            "webRequest.removeListener" => ApiCall::WebRequestRemoveListener {
                handle: args.string("handle")?,
            },
            "permissions.request" => ApiCall::PermissionsRequest(args.permission_set()?),
            "permissions.contains" => ApiCall::PermissionsContains(args.permission_set()?),
            "permissions.getAll" => ApiCall::PermissionsGetAll,
            "permissions.remove" => ApiCall::PermissionsRemove(args.permission_set()?),
            "port.postMessage" => ApiCall::PortPostMessage {
                port_id: PortId::from(args.string("portId")?),
                message: args.field("message").cloned().unwrap_or(Value::Null),
            },
            "port.disconnect" => ApiCall::PortDisconnect {
                port_id: PortId::from(args.string("portId")?),
            },
            other => return Err(ApiError::UnknownMethod(other.to_string())),
        };
        Ok(call)
    }

    pub fn method(&self) -> &'static str {
        match self {
            ApiCall::StorageGet { .. } => "storage.get",
            ApiCall::StorageSet { .. } => "storage.set",
            ApiCall::StorageRemove { .. } => "storage.remove",
            ApiCall::StorageClear { .. } => "storage.clear",
            ApiCall::StorageBytesInUse { .. } => "storage.getBytesInUse",
            ApiCall::TabsQuery(_) => "tabs.query",
            ApiCall::TabsGet { .. } => "tabs.get",
            ApiCall::TabsCreate(_) => "tabs.create",
            ApiCall::TabsUpdate { .. } => "tabs.update",
            ApiCall::TabsRemove { .. } => "tabs.remove",
            ApiCall::RuntimeSendMessage { .. } => "runtime.sendMessage",
            ApiCall::RuntimeOpenOptionsPage => "runtime.openOptionsPage",
            ApiCall::RuntimeConnect { .. } => "runtime.connect",
            ApiCall::WebRequestAddListener { .. } => "webRequest.addListener",
            ApiCall::WebRequestRemoveListener { .. } => "webRequest.removeListener",
            ApiCall::PermissionsRequest(_) => "permissions.request",
            ApiCall::PermissionsContains(_) => "permissions.contains",
            ApiCall::PermissionsGetAll => "permissions.getAll",
            ApiCall::PermissionsRemove(_) => "permissions.remove",
            ApiCall::PortPostMessage { .. } => "port.postMessage",
            ApiCall::PortDisconnect { .. } => "port.disconnect",
        }
    }

    /// Calls with visible side effects that a double click must not repeat.
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, ApiCall::RuntimeOpenOptionsPage)
    }
}

struct Args<'a> {
    method: &'a str,
    payload: Value,
}

impl Args<'_> {
    fn invalid(&self, reason: &str) -> ApiError {
        ApiError::InvalidArguments {
            method: self.method.to_string(),
            reason: reason.to_string(),
        }
    }

    fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name).filter(|v| !v.is_null())
    }

    fn string(&self, name: &str) -> Result<String, ApiError> {
        self.field(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.invalid(&format!("{} must be a string", name)))
    }

    fn optional_string(&self, name: &str) -> Result<Option<String>, ApiError> {
        match self.field(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid(&format!("{} must be a string", name))),
        }
    }

    fn int(&self, name: &str) -> Result<i64, ApiError> {
        self.field(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| self.invalid(&format!("{} must be an integer", name)))
    }

    fn optional_int(&self, name: &str) -> Result<Option<i64>, ApiError> {
        match self.field(name) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.invalid(&format!("{} must be an integer", name))),
        }
    }

    fn object(&self, name: &str) -> Result<Map<String, Value>, ApiError> {
        self.field(name)
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| self.invalid(&format!("{} must be an object", name)))
    }

    fn typed<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ApiError> {
        let value = self
            .field(name)
            .cloned()
            .ok_or_else(|| self.invalid(&format!("missing {}", name)))?;
        serde_json::from_value(value).map_err(|e| self.invalid(&format!("{}: {}", name, e)))
    }

    fn typed_or_default<T: serde::de::DeserializeOwned + Default>(
        &self,
        name: &str,
    ) -> Result<T, ApiError> {
        match self.field(name) {
            None => Ok(T::default()),
            Some(_) => self.typed(name),
        }
    }

    fn area(&self) -> Result<StorageAreaKind, ApiError> {
        let raw = self.string("area")?;
        StorageAreaKind::parse(&raw).ok_or_else(|| self.invalid(&format!("unknown storage area {}", raw)))
    }

    fn keys(&self) -> Result<StorageKeys, ApiError> {
        let value = self.payload.get("keys").cloned().unwrap_or(Value::Null);
        StorageKeys::from_value(&value)
            .ok_or_else(|| self.invalid("keys must be null, a string, a list of strings or an object"))
    }

    fn permission_set(&self) -> Result<PermissionSet, ApiError> {
        self.typed_or_default("permissions")
    }
}
