//! RPC method handler for the extension host JSON-RPC protocol.
//!
//! Extracted from `rpc_server.rs` so it can be unit-tested independently.
//! `handle_method` dispatches calls from the shell to the runtime; the
//! [`ShellBridge`] goes the other way, implementing the page-rendering, tab
//! and host-UI contracts as `host.request` lines the shell answers with
//! `host.reply`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::app::{App, HostCollaborators};
use crate::host::{PageRenderer, PermissionPrompt, TabHost, UserScript};
use crate::managers::permission_manager::PermissionManagerTrait;
use crate::services::content_matcher::FrameKind;
use crate::types::errors::HostError;
use crate::types::extension::InstallSource;
use crate::types::message::PageId;
use crate::types::tab::{CreateProperties, TabInfo, TabQuery, UpdateProperties};
use crate::types::web_request::{OutgoingRequest, ResponseInfo};

// ─── Shell bridge ───

type HostReply = Result<Value, HostError>;

/// Outgoing half of the protocol: requests the runtime makes of the shell.
pub struct ShellBridge {
    lines: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<HostReply>>>,
    next_id: AtomicU64,
    timeout: Duration,
    /// Limit for `permission.confirm`; `None` waits for the user's answer.
    prompt_timeout: Option<Duration>,
}

impl ShellBridge {
    /// `lines` receives every JSON line to write to stdout.
    pub fn new(lines: mpsc::UnboundedSender<String>, timeout: Duration) -> Self {
        Self {
            lines,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
            prompt_timeout: None,
        }
    }

    /// Sets the permission dialog limit, independent of the request timeout.
    pub fn with_prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    /// The bridge as the three collaborator contracts.
    pub fn collaborators(self: &Arc<Self>) -> HostCollaborators {
        HostCollaborators {
            pages: self.clone(),
            tabs: self.clone(),
            prompt: self.clone(),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<HostReply>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Sends `{"event":"host.request","request_id","kind",...fields}` and waits for the reply.
    pub async fn request(&self, kind: &str, fields: Value) -> HostReply {
        self.request_within(kind, fields, Some(self.timeout)).await
    }

    async fn request_within(&self, kind: &str, fields: Value, timeout: Option<Duration>) -> HostReply {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = Map::new();
        line.insert("event".to_string(), json!("host.request"));
        line.insert("request_id".to_string(), json!(request_id));
        line.insert("kind".to_string(), json!(kind));
        if let Value::Object(fields) = fields {
            line.extend(fields);
        }

        let (tx, rx) = oneshot::channel();
        self.pending().insert(request_id, tx);
        if self.lines.send(Value::Object(line).to_string()).is_err() {
            self.pending().remove(&request_id);
            return Err(HostError::Unavailable("shell output closed".to_string()));
        }

        let answer = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(answer) => answer,
                Err(_) => {
                    self.pending().remove(&request_id);
                    warn!(target: "rpc", request_id, kind, "host request timed out");
                    return Err(HostError::Timeout);
                }
            },
            None => rx.await,
        };
        answer.unwrap_or_else(|_| Err(HostError::Unavailable("shell bridge dropped".to_string())))
    }

    /// Completes a request from `host.reply` params. `false` when the id is unknown.
    pub fn reply(&self, params: &Value) -> Result<bool, String> {
        let request_id = params
            .get("request_id")
            .and_then(|v| v.as_u64())
            .ok_or("missing request_id")?;
        let reply = if let Some(error) = params.get("error") {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            match params.get("no_such_tab").and_then(|v| v.as_i64()) {
                Some(tab_id) => Err(HostError::NoSuchTab(tab_id)),
                None => Err(HostError::Rejected(message)),
            }
        } else {
            Ok(params.get("result").cloned().unwrap_or(Value::Null))
        };

        let waiter = self.pending().remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
                Ok(true)
            }
            None => {
                debug!(target: "rpc", request_id, "reply for unknown host request");
                Ok(false)
            }
        }
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, HostError> {
    serde_json::from_value(value).map_err(|e| HostError::Rejected(format!("malformed host reply: {}", e)))
}

#[async_trait]
impl PageRenderer for ShellBridge {
    async fn evaluate_script(&self, page: PageId, source: &str) -> Result<Value, HostError> {
        self.request("page.evaluate", json!({ "page": page, "source": source })).await
    }

    async fn register_channel(&self, page: PageId, channel: &str) -> Result<(), HostError> {
        self.request("page.register_channel", json!({ "page": page, "channel": channel }))
            .await
            .map(|_| ())
    }

    async fn post_message(&self, page: PageId, channel: &str, message: Value) -> Result<(), HostError> {
        self.request(
            "page.post_message",
            json!({ "page": page, "channel": channel, "message": message }),
        )
        .await
        .map(|_| ())
    }

    async fn add_user_script(&self, page: PageId, script: UserScript) -> Result<(), HostError> {
        self.request("page.add_user_script", json!({ "page": page, "script": script }))
            .await
            .map(|_| ())
    }

    async fn create_page(&self, url: &str, in_tab: bool) -> Result<PageId, HostError> {
        let value = self
            .request("page.create", json!({ "url": url, "in_tab": in_tab }))
            .await?;
        value
            .get("page")
            .and_then(|v| v.as_i64())
            .or_else(|| value.as_i64())
            .ok_or_else(|| HostError::Rejected("page.create reply has no page id".to_string()))
    }
}

#[async_trait]
impl TabHost for ShellBridge {
    async fn query(&self, query: &TabQuery) -> Result<Vec<TabInfo>, HostError> {
        decode(self.request("tabs.query", json!({ "query": query })).await?)
    }

    async fn get(&self, tab_id: i64) -> Result<TabInfo, HostError> {
        decode(self.request("tabs.get", json!({ "tab_id": tab_id })).await?)
    }

    async fn create(&self, properties: &CreateProperties) -> Result<TabInfo, HostError> {
        decode(self.request("tabs.create", json!({ "properties": properties })).await?)
    }

    async fn update(&self, tab_id: i64, properties: &UpdateProperties) -> Result<TabInfo, HostError> {
        decode(
            self.request("tabs.update", json!({ "tab_id": tab_id, "properties": properties }))
                .await?,
        )
    }

    async fn remove(&self, tab_ids: &[i64]) -> Result<(), HostError> {
        self.request("tabs.remove", json!({ "tab_ids": tab_ids }))
            .await
            .map(|_| ())
    }

    async fn current(&self) -> Result<Option<TabInfo>, HostError> {
        decode(self.request("tabs.current", json!({})).await?)
    }
}

#[async_trait]
impl PermissionPrompt for ShellBridge {
    async fn confirm(&self, extension_name: &str, descriptions: &[String]) -> Result<bool, HostError> {
        let value = self
            .request_within(
                "permission.confirm",
                json!({ "extension_name": extension_name, "descriptions": descriptions }),
                self.prompt_timeout,
            )
            .await?;
        Ok(value
            .get("granted")
            .and_then(|v| v.as_bool())
            .or_else(|| value.as_bool())
            .unwrap_or(false))
    }
}

// ─── Method dispatch ───

fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str, String> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing {}", name))
}

fn page_param(params: &Value) -> Result<PageId, String> {
    params
        .get("page")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| "missing page".to_string())
}

fn request_id_param(params: &Value) -> Result<u64, String> {
    params
        .get("request_id")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| "missing request_id".to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

#[cfg(feature = "network")]
async fn install_from_store(app: &App, store_id: &str) -> Result<Value, String> {
    let summary = app.store.install(store_id).await.map_err(|e| e.to_string())?;
    to_json(&summary)
}

#[cfg(not(feature = "network"))]
async fn install_from_store(_app: &App, store_id: &str) -> Result<Value, String> {
    Err(format!("store installs are not available in this build: {}", store_id))
}

/// Dispatch a JSON-RPC method call to the runtime.
///
/// Returns `Ok(Value)` on success or `Err(String)` with an error message.
pub async fn handle_method(app: &App, bridge: &ShellBridge, method: &str, params: &Value) -> Result<Value, String> {
    match method {
        // ─── Extensions ───
        "extension.install" => {
            let path = str_param(params, "path")?;
            let source = if params.get("dev").and_then(|v| v.as_bool()).unwrap_or(false) {
                InstallSource::Dev
            } else {
                InstallSource::Local
            };
            let summary = app.runtime.install(path, source).await.map_err(|e| e.to_string())?;
            to_json(&summary)
        }
        "extension.install_from_store" => {
            let store_id = str_param(params, "store_id")?;
            install_from_store(app, store_id).await
        }
        "extension.uninstall" => {
            let id = str_param(params, "id")?;
            app.runtime.uninstall(id).await.map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }
        "extension.enable" => {
            let id = str_param(params, "id")?;
            let summary = app.runtime.enable(id).await.map_err(|e| e.to_string())?;
            to_json(&summary)
        }
        "extension.disable" => {
            let id = str_param(params, "id")?;
            let summary = app.runtime.disable(id).await.map_err(|e| e.to_string())?;
            to_json(&summary)
        }
        "extension.list" => {
            let list = app.runtime.list().await.map_err(|e| e.to_string())?;
            to_json(&list)
        }
        "extension.get" => {
            let id = str_param(params, "id")?;
            let entry = app
                .runtime
                .get(id)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("extension not found: {}", id))?;
            to_json(&entry)
        }

        // ─── Pages ───
        "navigation.completed" => {
            let page = page_param(params)?;
            let url = str_param(params, "url")?;
            let frame = match params.get("frame").and_then(|v| v.as_str()) {
                None | Some("top") => FrameKind::Top,
                Some("sub") => FrameKind::Sub,
                Some(other) => return Err(format!("invalid frame: {}", other)),
            };
            let outcome = app
                .runtime
                .navigation_completed(page, url, frame)
                .await
                .map_err(|e| e.to_string())?;
            to_json(&outcome)
        }
        "page.closed" => {
            let page = page_param(params)?;
            app.runtime.page_closed(page).await.map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }
        "page.message" => {
            let page = page_param(params)?;
            let message = params.get("message").cloned().ok_or("missing message")?;
            app.router.page_message(page, message).await.map_err(|e| e.to_string())?;
            Ok(json!({"ok": true}))
        }

        // ─── Web requests ───
        "webrequest.before_request" => {
            let raw = params.get("request").cloned().unwrap_or_else(|| params.clone());
            let request: OutgoingRequest =
                serde_json::from_value(raw).map_err(|e| format!("invalid request: {}", e))?;
            if !["http://", "https://", "ws://", "wss://"].iter().any(|scheme| request.url.starts_with(scheme)) {
                return Err("invalid url: must be http(s) or ws(s)".to_string());
            }
            let disposition = app.interceptor.begin_request(request).await;
            to_json(&disposition)
        }
        "webrequest.response_started" => {
            let request_id = request_id_param(params)?;
            let response: ResponseInfo = match params.get("response") {
                Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| format!("invalid response: {}", e))?,
                None => ResponseInfo::default(),
            };
            let known = app.interceptor.response_started(request_id, response).await;
            Ok(json!({"known": known}))
        }
        "webrequest.completed" => {
            let request_id = request_id_param(params)?;
            let known = app.interceptor.completed(request_id).await;
            Ok(json!({"known": known}))
        }
        "webrequest.error" => {
            let request_id = request_id_param(params)?;
            let error = str_param(params, "error")?;
            let known = app.interceptor.error_occurred(request_id, error).await;
            Ok(json!({"known": known}))
        }

        // ─── Permissions ───
        "permissions.pending" => to_json(&app.permissions.pending_requests()),
        "permissions.granted" => {
            let id = str_param(params, "id")?;
            let granted = app.permissions.granted(id).map_err(|e| e.to_string())?;
            to_json(&granted)
        }

        // ─── Host bridge ───
        "host.reply" => {
            let known = bridge.reply(params)?;
            Ok(json!({"known": known}))
        }

        _ => Err(format!("unknown method: {}", method)),
    }
}
