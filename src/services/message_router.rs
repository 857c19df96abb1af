//! Message routing between extension pages, background hosts and native code.
//!
//! Every asynchronous call is correlated by a [`CallbackToken`]. The router
//! keeps `token -> (completion, deadline)` and fires each completion exactly
//! once: when the answer arrives, or with a timeout error when the periodic
//! sweep finds it expired.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::host::{PageRenderer, TabHost};
use crate::managers::permission_manager::{PermissionManager, PermissionManagerTrait};
use crate::services::background_host::{HostCommand, HostHandle, HostOutbound, ScriptedListener};
use crate::services::listener_registry::SubscriptionHandle;
use crate::services::storage_engine::StorageEngine;
use crate::services::web_request::{self, ListenerSpec, WebRequestInterceptor};
use crate::types::api::{ApiCall, PermissionSet};
use crate::types::config::RuntimeConfig;
use crate::types::errors::{ApiError, HostError};
use crate::types::manifest::Manifest;
use crate::types::message::{BridgeValue, CallbackToken, MessageSender, PageId, PortId};
use crate::types::permission::{is_host_pattern, PermissionOutcome};
use crate::types::storage::StorageAreaKind;
use crate::types::tab::TabInfo;

/// Channel name pages post to with `__postNative`.
pub const BRIDGE_CHANNEL: &str = "extension-bridge";

const PAGE_PRELUDE: &str = include_str!("js/page_prelude.js");

/// Turns a script-side value into plain JSON.
///
/// Absent optionals become `null`; non-finite numbers and values without a
/// JSON form become strings.
pub fn sanitize(value: BridgeValue) -> Value {
    match value {
        BridgeValue::Null | BridgeValue::Optional(None) => Value::Null,
        BridgeValue::Optional(Some(inner)) => sanitize(*inner),
        BridgeValue::Bool(b) => Value::Bool(b),
        BridgeValue::Int(i) => Value::from(i),
        BridgeValue::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        BridgeValue::String(s) => Value::String(s),
        BridgeValue::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        BridgeValue::Map(map) => Value::Object(map.into_iter().map(|(k, v)| (k, sanitize(v))).collect()),
        BridgeValue::Opaque(description) => Value::String(description),
    }
}

/// Where the answer for a token goes.
#[derive(Debug)]
pub enum Completion {
    /// A call made by a background script.
    Host { extension_id: String },
    /// A call made by a wired extension page.
    Page { page: PageId },
    /// Native code awaiting a reply, such as `sendResponse`.
    Waiter(oneshot::Sender<Result<Value, ApiError>>),
}

/// In-flight completions keyed by token.
#[derive(Debug, Default)]
pub struct PendingCallbacks {
    entries: HashMap<CallbackToken, (Completion, Instant)>,
}

impl PendingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a completion. A token already in flight is rejected and the completion handed back.
    pub fn insert(&mut self, token: CallbackToken, completion: Completion, deadline: Instant) -> Result<(), Completion> {
        if self.entries.contains_key(&token) {
            return Err(completion);
        }
        self.entries.insert(token, (completion, deadline));
        Ok(())
    }

    pub fn take(&mut self, token: &CallbackToken) -> Option<Completion> {
        self.entries.remove(token).map(|(completion, _)| completion)
    }

    pub fn contains(&self, token: &CallbackToken) -> bool {
        self.entries.contains_key(token)
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<(CallbackToken, Completion)> {
        let expired: Vec<CallbackToken> = self
            .entries
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(token, _)| token.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|token| self.take(&token).map(|completion| (token, completion)))
            .collect()
    }

    /// Drops entries matching `predicate` without firing them.
    pub fn discard(&mut self, mut predicate: impl FnMut(&Completion) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (completion, _)| !predicate(completion));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collapses repeats of one side-effecting action inside a time window.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    recent: HashMap<(String, String), Instant>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: HashMap::new(),
        }
    }

    /// `true` when `(action, extension_id)` has not run within the window.
    pub fn admit(&mut self, action: &str, extension_id: &str, now: Instant) -> bool {
        let window = self.window;
        self.recent
            .retain(|_, at| now.saturating_duration_since(*at) < window);
        let key = (action.to_string(), extension_id.to_string());
        if self.recent.contains_key(&key) {
            return false;
        }
        self.recent.insert(key, now);
        true
    }
}

/// The context an API call came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerContext {
    Background,
    Page { page: PageId, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub extension_id: String,
    pub context: CallerContext,
}

impl Caller {
    pub fn background(extension_id: &str) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            context: CallerContext::Background,
        }
    }

    pub fn page(extension_id: &str, page: PageId, url: &str) -> Self {
        Self {
            extension_id: extension_id.to_string(),
            context: CallerContext::Page {
                page,
                url: url.to_string(),
            },
        }
    }

    pub fn sender(&self) -> MessageSender {
        match &self.context {
            CallerContext::Background => MessageSender::background(&self.extension_id),
            CallerContext::Page { page, url } => MessageSender::page(&self.extension_id, url, *page),
        }
    }
}

struct ExtensionRoute {
    name: String,
    manifest: Manifest,
    host: Option<HostHandle>,
}

#[derive(Debug, Clone)]
struct WiredPage {
    extension_id: String,
    url: String,
}

#[derive(Debug, Clone)]
struct PortRoute {
    extension_id: String,
    page: PageId,
}

struct RouterState {
    extensions: HashMap<String, ExtensionRoute>,
    pages: HashMap<PageId, WiredPage>,
    ports: HashMap<PortId, PortRoute>,
    web_request_handles: HashMap<(String, String), SubscriptionHandle>,
    pending: PendingCallbacks,
    dedup: Deduplicator,
}

/// Bridge between page contexts, background hosts and the native services.
pub struct MessageRouter {
    config: Arc<RuntimeConfig>,
    permissions: Arc<PermissionManager>,
    storage: Arc<StorageEngine>,
    interceptor: Arc<WebRequestInterceptor>,
    renderer: Arc<dyn PageRenderer>,
    tabs: Arc<dyn TabHost>,
    state: Mutex<RouterState>,
}

impl MessageRouter {
    pub fn new(
        config: Arc<RuntimeConfig>,
        permissions: Arc<PermissionManager>,
        storage: Arc<StorageEngine>,
        interceptor: Arc<WebRequestInterceptor>,
        renderer: Arc<dyn PageRenderer>,
        tabs: Arc<dyn TabHost>,
    ) -> Self {
        let dedup = Deduplicator::new(config.dedup_window());
        Self {
            config,
            permissions,
            storage,
            interceptor,
            renderer,
            tabs,
            state: Mutex::new(RouterState {
                extensions: HashMap::new(),
                pages: HashMap::new(),
                ports: HashMap::new(),
                web_request_handles: HashMap::new(),
                pending: PendingCallbacks::new(),
                dedup,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ─── Extensions ───

    /// Makes an enabled extension reachable. `host` is absent for extensions without background logic.
    pub fn attach_extension(&self, extension_id: &str, name: &str, manifest: Manifest, host: Option<HostHandle>) {
        self.state().extensions.insert(
            extension_id.to_string(),
            ExtensionRoute {
                name: name.to_string(),
                manifest,
                host,
            },
        );
    }

    /// Removes every route, listener and in-flight call belonging to an extension.
    pub async fn detach_extension(&self, extension_id: &str) {
        let closed_ports: Vec<(PortId, PageId)> = {
            let mut state = self.state();
            state.extensions.remove(extension_id);
            state.pages.retain(|_, wired| wired.extension_id != extension_id);
            state
                .web_request_handles
                .retain(|(owner, _), _| owner != extension_id);
            state.pending.discard(|completion| {
                matches!(completion, Completion::Host { extension_id: owner } if owner == extension_id)
            });
            let ports: Vec<(PortId, PageId)> = state
                .ports
                .iter()
                .filter(|(_, route)| route.extension_id == extension_id)
                .map(|(id, route)| (id.clone(), route.page))
                .collect();
            for (id, _) in &ports {
                state.ports.remove(id);
            }
            ports
        };
        let removed = self.interceptor.remove_extension(extension_id);
        for (port_id, page) in closed_ports {
            self.post_to_page(page, json!({ "type": "port_disconnect", "portId": port_id }))
                .await;
        }
        debug!(target: "router", extension_id, web_request_listeners = removed, "extension detached");
    }

    pub fn is_attached(&self, extension_id: &str) -> bool {
        self.state().extensions.contains_key(extension_id)
    }

    pub fn host(&self, extension_id: &str) -> Option<HostHandle> {
        self.state()
            .extensions
            .get(extension_id)
            .and_then(|route| route.host.clone())
    }

    // ─── Pages ───

    /// Wires an extension page to its extension. `false` when `url` is not a page of an attached extension.
    pub async fn wire_page(&self, page: PageId, url: &str) -> Result<bool, ApiError> {
        let Some(extension_id) = self.config.extension_id_of(url).map(str::to_string) else {
            return Ok(false);
        };
        let manifest = match self.state().extensions.get(&extension_id) {
            Some(route) => route.manifest.clone(),
            None => return Ok(false),
        };

        self.renderer.register_channel(page, BRIDGE_CHANNEL).await?;
        let bootstrap = json!({
            "id": extension_id,
            "origin": self.config.extension_origin(&extension_id),
            "channel": BRIDGE_CHANNEL,
            "manifest": manifest,
            "quotas": {
                "local": self.config.quotas.local_bytes,
                "sync": self.config.quotas.sync_bytes,
                "session": self.config.quotas.session_bytes,
            },
        });
        let source = format!("{}({});", PAGE_PRELUDE, bootstrap);
        self.renderer.evaluate_script(page, &source).await?;

        self.state().pages.insert(
            page,
            WiredPage {
                extension_id: extension_id.clone(),
                url: url.to_string(),
            },
        );
        info!(target: "router", extension_id = %extension_id, page, "extension page wired");
        Ok(true)
    }

    /// Forgets a page and closes its ports.
    pub fn unwire_page(&self, page: PageId) -> bool {
        let (was_wired, closed) = {
            let mut state = self.state();
            let was_wired = state.pages.remove(&page).is_some();
            let closed: Vec<(PortId, String)> = state
                .ports
                .iter()
                .filter(|(_, route)| route.page == page)
                .map(|(id, route)| (id.clone(), route.extension_id.clone()))
                .collect();
            for (id, _) in &closed {
                state.ports.remove(id);
            }
            state.pending.discard(|completion| matches!(completion, Completion::Page { page: p } if *p == page));
            (was_wired, closed)
        };
        for (port_id, extension_id) in closed {
            if let Some(host) = self.host(&extension_id) {
                let _ = host.send(HostCommand::PortDisconnect { port_id });
            }
        }
        was_wired
    }

    pub fn wired_pages(&self, extension_id: &str) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self
            .state()
            .pages
            .iter()
            .filter(|(_, wired)| wired.extension_id == extension_id)
            .map(|(page, _)| *page)
            .collect();
        pages.sort_unstable();
        pages
    }

    /// Handles a message a wired page posted on the bridge channel.
    pub async fn page_message(self: &Arc<Self>, page: PageId, message: Value) -> Result<(), ApiError> {
        let wired = self.state().pages.get(&page).cloned();
        let Some(wired) = wired else {
            warn!(target: "router", page, "message from a page that is not wired; dropped");
            return Err(ApiError::NoReceiver);
        };

        let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
        let token = message
            .get("token")
            .and_then(Value::as_str)
            .map(CallbackToken::from)
            .ok_or_else(|| ApiError::InvalidArguments {
                method: "bridge".to_string(),
                reason: "missing token".to_string(),
            })?;

        match kind {
            "call" => {
                let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
                let payload = message.get("payload").cloned().unwrap_or(Value::Null);
                let call = match ApiCall::parse(method, sanitize(BridgeValue::from(payload))) {
                    Ok(call) => call,
                    Err(e) => {
                        self.post_completion(page, &token, Err(e)).await;
                        return Ok(());
                    }
                };
                let deadline = Instant::now() + self.config.callback_timeout();
                let registered = self
                    .state()
                    .pending
                    .insert(token.clone(), Completion::Page { page }, deadline);
                if registered.is_err() {
                    warn!(target: "router", page, %token, "duplicate in-flight token rejected");
                    return Err(ApiError::InvalidArguments {
                        method: method.to_string(),
                        reason: format!("token {} is already in flight", token),
                    });
                }
                let caller = Caller::page(&wired.extension_id, page, &wired.url);
                let router = Arc::clone(self);
                tokio::spawn(async move {
                    let result = router.dispatch(&caller, call).await;
                    router.resolve(&token, result).await;
                });
                Ok(())
            }
            "reply" => {
                let value = message.get("value").cloned().unwrap_or(Value::Null);
                self.resolve(&token, Ok(value)).await;
                Ok(())
            }
            other => Err(ApiError::InvalidArguments {
                method: "bridge".to_string(),
                reason: format!("unknown message type {}", other),
            }),
        }
    }

    // ─── Completions ───

    /// Fires the completion registered under `token`. Unknown tokens are dropped with a warning.
    pub async fn resolve(&self, token: &CallbackToken, result: Result<Value, ApiError>) -> bool {
        let completion = self.state().pending.take(token);
        match completion {
            Some(completion) => {
                self.fire(token.clone(), completion, result).await;
                true
            }
            None => {
                warn!(target: "router", %token, "response for unknown callback token dropped");
                false
            }
        }
    }

    /// Completes every expired entry with a timeout error.
    pub async fn sweep_expired(&self, now: Instant) -> usize {
        let expired = self.state().pending.expire(now);
        let count = expired.len();
        for (token, completion) in expired {
            debug!(target: "router", %token, "callback deadline passed");
            self.fire(token, completion, Err(ApiError::Timeout)).await;
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    fn register_waiter(&self) -> (CallbackToken, oneshot::Receiver<Result<Value, ApiError>>) {
        let (tx, rx) = oneshot::channel();
        let token = CallbackToken::generate();
        let deadline = Instant::now() + self.config.callback_timeout();
        let _ = self.state().pending.insert(token.clone(), Completion::Waiter(tx), deadline);
        (token, rx)
    }

    async fn fire(&self, token: CallbackToken, completion: Completion, result: Result<Value, ApiError>) {
        match completion {
            Completion::Host { extension_id } => match self.host(&extension_id) {
                Some(host) => {
                    if host.complete(token, result.map_err(|e| e.to_string())).is_err() {
                        debug!(target: "router", extension_id = %extension_id, "host gone before completion");
                    }
                }
                None => debug!(target: "router", extension_id = %extension_id, "completion for detached extension dropped"),
            },
            Completion::Page { page } => self.post_completion(page, &token, result).await,
            Completion::Waiter(tx) => {
                let _ = tx.send(result);
            }
        }
    }

    async fn post_completion(&self, page: PageId, token: &CallbackToken, result: Result<Value, ApiError>) {
        let message = match result {
            Ok(value) => json!({ "type": "complete", "token": token, "ok": value }),
            Err(e) => json!({ "type": "complete", "token": token, "error": e.to_string() }),
        };
        self.post_to_page(page, message).await;
    }

    async fn post_to_page(&self, page: PageId, message: Value) {
        if let Err(e) = self.renderer.post_message(page, BRIDGE_CHANNEL, message).await {
            warn!(target: "router", page, error = %e, "could not post to page");
        }
    }

    // ─── Host traffic ───

    /// Handles one message from a background host thread.
    pub fn handle_outbound(self: &Arc<Self>, message: HostOutbound) {
        match message {
            HostOutbound::Call {
                extension_id,
                token,
                call,
            } => {
                let deadline = Instant::now() + self.config.callback_timeout();
                let completion = Completion::Host {
                    extension_id: extension_id.clone(),
                };
                if self.state().pending.insert(token.clone(), completion, deadline).is_err() {
                    warn!(target: "router", extension_id = %extension_id, %token, "duplicate in-flight token rejected");
                    return;
                }
                let router = Arc::clone(self);
                tokio::spawn(async move {
                    let caller = Caller::background(&extension_id);
                    let result = router.dispatch(&caller, call).await;
                    router.resolve(&token, result).await;
                });
            }
            HostOutbound::Reply { token, value } => {
                let router = Arc::clone(self);
                tokio::spawn(async move {
                    router.resolve(&token, Ok(value)).await;
                });
            }
        }
    }

    /// Drains host traffic and sweeps expired callbacks until every host sender is gone.
    pub async fn run(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<HostOutbound>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => self.handle_outbound(message),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep_expired(Instant::now()).await;
                    self.interceptor
                        .expire_stale(web_request::now_ms(), self.config.request_max_age())
                        .await;
                }
            }
        }
        debug!(target: "router", "router loop stopped");
    }

    /// Sends `event` to the background host and every wired page of an extension.
    pub async fn emit(&self, extension_id: &str, event: &str, args: Vec<Value>) {
        if let Some(host) = self.host(extension_id) {
            if let Err(e) = host.dispatch_event(event, args.clone()) {
                debug!(target: "router", extension_id, event, error = %e, "event not delivered to host");
            }
        }
        for page in self.wired_pages(extension_id) {
            self.post_to_page(page, json!({ "type": "event", "name": event, "args": args }))
                .await;
        }
    }

    // ─── Dispatch ───

    /// Runs one typed API call on behalf of `caller`.
    pub async fn dispatch(&self, caller: &Caller, call: ApiCall) -> Result<Value, ApiError> {
        let extension_id = caller.extension_id.as_str();
        if !self.is_attached(extension_id) {
            return Err(ApiError::NoReceiver);
        }
        if call.is_deduplicated() && !self.state().dedup.admit(call.method(), extension_id, Instant::now()) {
            debug!(target: "router", extension_id, method = call.method(), "repeated call ignored");
            return Ok(Value::Null);
        }
        match call {
            ApiCall::StorageGet { area, keys } => {
                self.require(extension_id, "storage")?;
                Ok(Value::Object(self.storage.get(extension_id, area, &keys)?))
            }
            ApiCall::StorageSet { area, items } => {
                self.require(extension_id, "storage")?;
                let changes = self.storage.set(extension_id, area, items)?;
                self.storage_changed(extension_id, area, changes).await;
                Ok(Value::Null)
            }
            ApiCall::StorageRemove { area, keys } => {
                self.require(extension_id, "storage")?;
                let changes = self.storage.remove(extension_id, area, &keys)?;
                self.storage_changed(extension_id, area, changes).await;
                Ok(Value::Null)
            }
            ApiCall::StorageClear { area } => {
                self.require(extension_id, "storage")?;
                let changes = self.storage.clear(extension_id, area)?;
                self.storage_changed(extension_id, area, changes).await;
                Ok(Value::Null)
            }
            ApiCall::StorageBytesInUse { area, keys } => {
                self.require(extension_id, "storage")?;
                Ok(json!(self.storage.bytes_in_use(extension_id, area, &keys)?))
            }

            ApiCall::TabsQuery(query) => {
                let tabs = self.tabs.query(&query).await?;
                let visible = self.visible_tabs(extension_id, tabs)?;
                Ok(json!(visible))
            }
            ApiCall::TabsGet { tab_id } => {
                let tab = self.tabs.get(tab_id).await?;
                Ok(json!(self.visible_tabs(extension_id, vec![tab])?.pop()))
            }
            ApiCall::TabsCreate(properties) => {
                let tab = self.tabs.create(&properties).await?;
                Ok(json!(self.visible_tabs(extension_id, vec![tab])?.pop()))
            }
            ApiCall::TabsUpdate { tab_id, properties } => {
                let tab_id = match tab_id {
                    Some(id) => id,
                    None => self
                        .tabs
                        .current()
                        .await?
                        .map(|tab| tab.id)
                        .ok_or(HostError::NoSuchTab(-1))?,
                };
                let tab = self.tabs.update(tab_id, &properties).await?;
                Ok(json!(self.visible_tabs(extension_id, vec![tab])?.pop()))
            }
            ApiCall::TabsRemove { tab_ids } => {
                self.tabs.remove(&tab_ids).await?;
                Ok(Value::Null)
            }

            ApiCall::RuntimeSendMessage { message } => self.send_message(caller, message).await,
            ApiCall::RuntimeOpenOptionsPage => self.open_options_page(extension_id).await,
            ApiCall::RuntimeConnect { name } => self.connect(caller, name.unwrap_or_default()),

            ApiCall::PortPostMessage { port_id, message } => self.port_message(caller, port_id, message).await,
            ApiCall::PortDisconnect { port_id } => self.port_disconnect(caller, port_id).await,

            ApiCall::WebRequestAddListener {
                stage,
                handle,
                filter,
                extra_info_spec,
            } => {
                let host = match (&caller.context, self.host(extension_id)) {
                    (CallerContext::Background, Some(host)) => host,
                    _ => {
                        return Err(ApiError::InvalidArguments {
                            method: "webRequest.addListener".to_string(),
                            reason: "webRequest listeners are only available to background scripts".to_string(),
                        })
                    }
                };
                self.require(extension_id, "webRequest")?;
                let blocking = extra_info_spec.iter().any(|s| s == "blocking");
                if blocking {
                    self.require(extension_id, "webRequestBlocking")?;
                }
                let host_scope = self.permissions.granted_hosts(extension_id)?;
                let spec = ListenerSpec {
                    extension_id: extension_id.to_string(),
                    stage,
                    filter,
                    blocking,
                    host_scope: Some(host_scope),
                    listener: Arc::new(ScriptedListener::new(host, handle.clone(), self.config.listener_timeout())),
                };
                let subscription = self
                    .interceptor
                    .add_listener(spec)
                    .map_err(|e| ApiError::InvalidArguments {
                        method: "webRequest.addListener".to_string(),
                        reason: e.to_string(),
                    })?;
                self.state()
                    .web_request_handles
                    .insert((extension_id.to_string(), handle), subscription);
                Ok(Value::Null)
            }
            ApiCall::WebRequestRemoveListener { handle } => {
                let subscription = self
                    .state()
                    .web_request_handles
                    .remove(&(extension_id.to_string(), handle));
                if let Some(subscription) = subscription {
                    self.interceptor.remove_listener(subscription);
                }
                Ok(Value::Null)
            }

            ApiCall::PermissionsRequest(set) => self.request_permissions(extension_id, set).await,
            ApiCall::PermissionsContains(set) => {
                let granted = self.permissions.granted(extension_id)?;
                Ok(Value::Bool(set.all().is_subset(&granted)))
            }
            ApiCall::PermissionsGetAll => {
                let granted = self.permissions.granted(extension_id)?;
                Ok(json!(split_permissions(granted)))
            }
            ApiCall::PermissionsRemove(set) => self.remove_permissions(extension_id, set).await,
        }
    }

    fn require(&self, extension_id: &str, permission: &str) -> Result<(), ApiError> {
        if self.permissions.has(permission, extension_id)? {
            Ok(())
        } else {
            Err(ApiError::PermissionRequired(permission.to_string()))
        }
    }

    fn visible_tabs(&self, extension_id: &str, tabs: Vec<TabInfo>) -> Result<Vec<TabInfo>, ApiError> {
        if self.permissions.has("tabs", extension_id)? {
            return Ok(tabs);
        }
        tabs.into_iter()
            .map(|tab| -> Result<TabInfo, ApiError> {
                let allowed = match &tab.url {
                    Some(url) => self.permissions.allows_url(extension_id, url)?,
                    None => false,
                };
                Ok(if allowed { tab } else { tab.redacted() })
            })
            .collect()
    }

    async fn storage_changed(
        &self,
        extension_id: &str,
        area: StorageAreaKind,
        changes: crate::types::storage::StorageChanges,
    ) {
        if changes.is_empty() {
            return;
        }
        self.emit(extension_id, "storage.onChanged", vec![json!(changes), json!(area.as_str())])
            .await;
    }

    async fn send_message(&self, caller: &Caller, message: Value) -> Result<Value, ApiError> {
        let extension_id = caller.extension_id.as_str();
        match &caller.context {
            CallerContext::Page { .. } => {
                let host = self.host(extension_id).ok_or(ApiError::NoReceiver)?;
                let (token, rx) = self.register_waiter();
                let delivered = host.send(HostCommand::DeliverMessage {
                    message,
                    sender: caller.sender(),
                    reply_token: Some(token.clone()),
                });
                if delivered.is_err() {
                    self.state().pending.take(&token);
                    return Err(ApiError::NoReceiver);
                }
                rx.await.unwrap_or(Err(ApiError::NoReceiver))
            }
            CallerContext::Background => {
                let pages = self.wired_pages(extension_id);
                if pages.is_empty() {
                    return Err(ApiError::NoReceiver);
                }
                let (token, rx) = self.register_waiter();
                let envelope = json!({
                    "type": "message",
                    "message": message,
                    "sender": caller.sender(),
                    "replyToken": token,
                });
                for page in pages {
                    self.post_to_page(page, envelope.clone()).await;
                }
                rx.await.unwrap_or(Err(ApiError::NoReceiver))
            }
        }
    }

    async fn open_options_page(&self, extension_id: &str) -> Result<Value, ApiError> {
        let options = self
            .state()
            .extensions
            .get(extension_id)
            .and_then(|route| route.manifest.options_page.clone());
        let Some(options) = options else {
            return Err(ApiError::InvalidArguments {
                method: "runtime.openOptionsPage".to_string(),
                reason: "extension has no options page".to_string(),
            });
        };
        let url = self.config.extension_url(extension_id, &options.page);
        let page = self.renderer.create_page(&url, options.open_in_tab).await?;
        debug!(target: "router", extension_id, page, "options page opened");
        Ok(Value::Null)
    }

    fn connect(&self, caller: &Caller, name: String) -> Result<Value, ApiError> {
        let CallerContext::Page { page, .. } = &caller.context else {
            return Err(ApiError::InvalidArguments {
                method: "runtime.connect".to_string(),
                reason: "ports can only be opened from extension pages".to_string(),
            });
        };
        let host = self.host(&caller.extension_id).ok_or(ApiError::NoReceiver)?;
        let port_id = PortId::generate();
        self.state().ports.insert(
            port_id.clone(),
            PortRoute {
                extension_id: caller.extension_id.clone(),
                page: *page,
            },
        );
        let opened = host.send(HostCommand::PortConnect {
            port_id: port_id.clone(),
            name,
            sender: caller.sender(),
        });
        if opened.is_err() {
            self.state().ports.remove(&port_id);
            return Err(ApiError::NoReceiver);
        }
        Ok(json!({ "portId": port_id }))
    }

    fn port_route(&self, caller: &Caller, port_id: &PortId) -> Result<PortRoute, ApiError> {
        self.state()
            .ports
            .get(port_id)
            .filter(|route| route.extension_id == caller.extension_id)
            .cloned()
            .ok_or(ApiError::NoReceiver)
    }

    async fn port_message(&self, caller: &Caller, port_id: PortId, message: Value) -> Result<Value, ApiError> {
        let route = self.port_route(caller, &port_id)?;
        match caller.context {
            CallerContext::Page { .. } => {
                let host = self.host(&route.extension_id).ok_or(ApiError::NoReceiver)?;
                host.send(HostCommand::PortMessage { port_id, message })
                    .map_err(|_| ApiError::NoReceiver)?;
            }
            CallerContext::Background => {
                self.post_to_page(
                    route.page,
                    json!({ "type": "port_message", "portId": port_id, "message": message }),
                )
                .await;
            }
        }
        Ok(Value::Null)
    }

    async fn port_disconnect(&self, caller: &Caller, port_id: PortId) -> Result<Value, ApiError> {
        let route = self.port_route(caller, &port_id)?;
        self.state().ports.remove(&port_id);
        match caller.context {
            CallerContext::Page { .. } => {
                if let Some(host) = self.host(&route.extension_id) {
                    let _ = host.send(HostCommand::PortDisconnect { port_id });
                }
            }
            CallerContext::Background => {
                self.post_to_page(route.page, json!({ "type": "port_disconnect", "portId": port_id }))
                    .await;
            }
        }
        Ok(Value::Null)
    }

    async fn request_permissions(&self, extension_id: &str, set: PermissionSet) -> Result<Value, ApiError> {
        let (name, requestable) = match self.state().extensions.get(extension_id) {
            Some(route) => (route.name.clone(), route.manifest.requestable_permissions()),
            None => return Err(ApiError::NoReceiver),
        };
        let wanted = set.all();
        if let Some(undeclared) = wanted.iter().find(|p| !requestable.contains(*p)) {
            return Err(ApiError::InvalidArguments {
                method: "permissions.request".to_string(),
                reason: format!("{} is not declared in the manifest", undeclared),
            });
        }
        let before = self.permissions.granted(extension_id)?;
        match self.permissions.request(extension_id, &name, &wanted).await? {
            PermissionOutcome::Granted => {
                let added: BTreeSet<String> = wanted.difference(&before).cloned().collect();
                if !added.is_empty() {
                    self.emit(extension_id, "permissions.onAdded", vec![json!(split_permissions(added))])
                        .await;
                }
                Ok(Value::Bool(true))
            }
            PermissionOutcome::Denied => Ok(Value::Bool(false)),
        }
    }

    async fn remove_permissions(&self, extension_id: &str, set: PermissionSet) -> Result<Value, ApiError> {
        let optional = match self.state().extensions.get(extension_id) {
            Some(route) => route.manifest.optional_permissions.clone(),
            None => return Err(ApiError::NoReceiver),
        };
        let wanted = set.all();
        if let Some(required) = wanted.iter().find(|p| !optional.contains(*p)) {
            return Err(ApiError::InvalidArguments {
                method: "permissions.remove".to_string(),
                reason: format!("required permission {} cannot be removed", required),
            });
        }
        let held = self.permissions.granted(extension_id)?;
        let removable: BTreeSet<String> = wanted.intersection(&held).cloned().collect();
        let removed = self.permissions.revoke(extension_id, &removable)?;
        if removed > 0 {
            self.emit(extension_id, "permissions.onRemoved", vec![json!(split_permissions(removable))])
                .await;
        }
        Ok(Value::Bool(removed > 0))
    }
}

/// Splits raw grants into API permissions and host origins.
pub fn split_permissions(granted: BTreeSet<String>) -> PermissionSet {
    let (origins, permissions): (BTreeSet<String>, BTreeSet<String>) =
        granted.into_iter().partition(|p| is_host_pattern(p));
    PermissionSet { permissions, origins }
}
