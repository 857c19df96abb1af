//! Background script hosts.
//!
//! Each enabled extension with background logic gets its own QuickJS runtime
//! on a dedicated OS thread. The thread owns the runtime outright and works
//! through [`HostCommand`]s one at a time, so extension code is strictly
//! single-threaded while different extensions run concurrently. Calls from
//! script into native code leave the thread as [`HostOutbound`] messages.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime, Value};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::services::extension_files::{read_extension_file, resolve_extension_file};
use crate::services::message_router::sanitize;
use crate::services::web_request::WebRequestListener;
use crate::types::api::ApiCall;
use crate::types::config::StorageQuotas;
use crate::types::errors::{BackgroundScriptError, RuntimeError};
use crate::types::manifest::{BackgroundDescriptor, Manifest};
use crate::types::message::{BridgeValue, CallbackToken, MessageSender, PortId};
use crate::types::web_request::{BlockingResponse, RequestDetails, WebRequestStage};

const API_PRELUDE: &str = include_str!("js/api_prelude.js");

/// Work for a host thread.
#[derive(Debug)]
pub enum HostCommand {
    /// Resolves the script-side callback or promise registered under `token`.
    Complete {
        token: CallbackToken,
        result: Result<serde_json::Value, String>,
    },
    DispatchEvent {
        event: String,
        args: Vec<serde_json::Value>,
    },
    /// A `runtime.sendMessage` for `runtime.onMessage`; `reply_token` receives `sendResponse`.
    DeliverMessage {
        message: serde_json::Value,
        sender: MessageSender,
        reply_token: Option<CallbackToken>,
    },
    PortConnect {
        port_id: PortId,
        name: String,
        sender: MessageSender,
    },
    PortMessage {
        port_id: PortId,
        message: serde_json::Value,
    },
    PortDisconnect {
        port_id: PortId,
    },
    /// Runs one registered listener and sends back its return value.
    InvokeListener {
        handle: String,
        args: Vec<serde_json::Value>,
        reply: oneshot::Sender<Option<serde_json::Value>>,
    },
    Evaluate {
        source: String,
        reply: oneshot::Sender<Result<serde_json::Value, BackgroundScriptError>>,
    },
    Shutdown,
}

/// Messages a host thread sends to the router.
#[derive(Debug, Clone, PartialEq)]
pub enum HostOutbound {
    Call {
        extension_id: String,
        token: CallbackToken,
        call: ApiCall,
    },
    /// `sendResponse` from an `onMessage` listener.
    Reply {
        token: CallbackToken,
        value: serde_json::Value,
    },
}

/// What a host needs to start.
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub extension_id: String,
    pub manifest: Manifest,
    pub install_path: PathBuf,
    /// `chrome-extension://<id>/`
    pub origin: String,
    pub memory_limit: usize,
    pub quotas: StorageQuotas,
    /// Longest a single evaluation may run before it is interrupted. Zero disables the limit.
    pub script_timeout: Duration,
}

/// Cloneable sender half of a running host.
#[derive(Debug, Clone)]
pub struct HostHandle {
    extension_id: String,
    commands: mpsc::UnboundedSender<HostCommand>,
}

impl HostHandle {
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn send(&self, command: HostCommand) -> Result<(), BackgroundScriptError> {
        self.commands
            .send(command)
            .map_err(|_| BackgroundScriptError::Stopped(self.extension_id.clone()))
    }

    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn dispatch_event(&self, event: &str, args: Vec<serde_json::Value>) -> Result<(), BackgroundScriptError> {
        self.send(HostCommand::DispatchEvent {
            event: event.to_string(),
            args,
        })
    }

    pub fn complete(&self, token: CallbackToken, result: Result<serde_json::Value, String>) -> Result<(), BackgroundScriptError> {
        self.send(HostCommand::Complete { token, result })
    }

    /// Evaluates `source` in the background context and returns its JSON value.
    pub async fn evaluate(&self, source: &str) -> Result<serde_json::Value, BackgroundScriptError> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::Evaluate {
            source: source.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| BackgroundScriptError::Stopped(self.extension_id.clone()))?
    }

    /// Runs a listener; `None` when it returned nothing, threw, or missed the deadline.
    pub async fn invoke_listener(
        &self,
        handle: &str,
        args: Vec<serde_json::Value>,
        timeout: Duration,
    ) -> Option<serde_json::Value> {
        let (reply, rx) = oneshot::channel();
        self.send(HostCommand::InvokeListener {
            handle: handle.to_string(),
            args,
            reply,
        })
        .ok()?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(target: "background", extension_id = %self.extension_id, handle, "listener timed out");
                None
            }
        }
    }
}

/// A running background host. Dropping it stops the thread.
pub struct BackgroundHost {
    handle: HostHandle,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundHost {
    /// Starts the host thread and waits until every background script has run once.
    pub async fn spawn(
        spec: HostSpec,
        outbound: mpsc::UnboundedSender<HostOutbound>,
    ) -> Result<Self, BackgroundScriptError> {
        Self::spawn_with(spec, outbound, |_| {}).await
    }

    /// Like [`BackgroundHost::spawn`], handing the command handle to `on_start`
    /// before the top-level scripts run, so calls they make can be completed.
    pub async fn spawn_with(
        spec: HostSpec,
        outbound: mpsc::UnboundedSender<HostOutbound>,
        on_start: impl FnOnce(HostHandle),
    ) -> Result<Self, BackgroundScriptError> {
        let sources = load_sources(&spec)?;
        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let extension_id = spec.extension_id.clone();
        let handle = HostHandle {
            extension_id: extension_id.clone(),
            commands,
        };
        on_start(handle.clone());

        let thread = std::thread::Builder::new()
            .name(format!("bg-{}", extension_id))
            .spawn(move || run_host(spec, sources, rx, outbound, ready_tx))
            .map_err(|e| BackgroundScriptError::EngineUnavailable(e.to_string()))?;

        let host = Self {
            handle,
            thread: Some(thread),
        };

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(target: "background", extension_id = %extension_id, "background host started");
                Ok(host)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackgroundScriptError::Stopped(extension_id)),
        }
    }

    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    pub fn extension_id(&self) -> &str {
        &self.handle.extension_id
    }

    /// Asks the thread to exit and waits for it on a blocking thread.
    pub async fn shutdown(mut self) {
        let _ = self.handle.send(HostCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || thread.join()).await;
        }
        debug!(target: "background", extension_id = %self.handle.extension_id, "background host stopped");
    }
}

impl Drop for BackgroundHost {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.handle.send(HostCommand::Shutdown);
        }
    }
}

/// `(file, source)` pairs in load order.
fn load_sources(spec: &HostSpec) -> Result<Vec<(String, String)>, BackgroundScriptError> {
    let files = match &spec.manifest.background {
        None => return Ok(Vec::new()),
        Some(BackgroundDescriptor::Scripts { scripts, .. }) => scripts.clone(),
        Some(BackgroundDescriptor::ServiceWorker { service_worker, module }) => {
            if *module {
                warn!(target: "background", extension_id = %spec.extension_id, "module workers are evaluated as classic scripts");
            }
            vec![service_worker.clone()]
        }
        Some(BackgroundDescriptor::Page { page, .. }) => {
            let html = read_extension_file(&spec.install_path, page, &spec.extension_id)
                .map_err(|e| entry_point_error(&spec.extension_id, page, e))?;
            page_script_sources(page, &html)
        }
    };
    files
        .into_iter()
        .map(|file| {
            let source = read_extension_file(&spec.install_path, &file, &spec.extension_id)
                .map_err(|e| entry_point_error(&spec.extension_id, &file, e))?;
            Ok((file, source))
        })
        .collect()
}

fn entry_point_error(extension_id: &str, file: &str, e: RuntimeError) -> BackgroundScriptError {
    match e {
        RuntimeError::MissingFile { .. } => BackgroundScriptError::MissingEntryPoint {
            extension_id: extension_id.to_string(),
            file: file.to_string(),
        },
        other => BackgroundScriptError::ExecutionFailed {
            extension_id: extension_id.to_string(),
            file: file.to_string(),
            message: other.to_string(),
            stack: None,
        },
    }
}

/// `<script src>` paths of a background page, resolved against the page's directory.
pub fn page_script_sources(page: &str, html: &str) -> Vec<String> {
    static SCRIPT_SRC: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = SCRIPT_SRC
        .get_or_init(|| Regex::new(r#"(?i)<script\b[^>]*\bsrc\s*=\s*["']([^"']+)["']"#).ok())
        .as_ref()
    else {
        return Vec::new();
    };
    let base = Path::new(page).parent().unwrap_or_else(|| Path::new(""));
    re.captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|src| !src.contains("://"))
        .map(|src| {
            if let Some(absolute) = src.strip_prefix('/') {
                absolute.to_string()
            } else {
                base.join(src).to_string_lossy().replace('\\', "/")
            }
        })
        .collect()
}

/// Whether `file` exists and stays inside the install directory.
pub fn entry_point_exists(install_path: &Path, file: &str, extension_id: &str) -> bool {
    resolve_extension_file(install_path, file, extension_id).is_ok()
}

/// Deadline checked by the engine's interrupt handler while script code runs.
#[derive(Clone, Default)]
struct Watchdog(Arc<Mutex<Option<Instant>>>);

impl Watchdog {
    fn deadline(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn arm(&self, budget: Duration) {
        *self.deadline() = (!budget.is_zero()).then(|| Instant::now() + budget);
    }

    fn expired(&self) -> bool {
        self.deadline().map(|at| Instant::now() >= at).unwrap_or(false)
    }

    /// Clears the deadline; `true` when it had already passed.
    fn disarm(&self) -> bool {
        let expired = self.expired();
        *self.deadline() = None;
        expired
    }
}

fn run_host(
    spec: HostSpec,
    sources: Vec<(String, String)>,
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    outbound: mpsc::UnboundedSender<HostOutbound>,
    ready: oneshot::Sender<Result<(), BackgroundScriptError>>,
) {
    let extension_id = spec.extension_id.clone();
    let watchdog = Watchdog::default();
    let engine = match create_engine(&spec, outbound, &watchdog) {
        Ok(engine) => engine,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let (runtime, context) = engine;

    for (file, source) in &sources {
        watchdog.arm(spec.script_timeout);
        let outcome = context.with(|ctx| {
            ctx.eval::<(), _>(source.as_str())
                .catch(&ctx)
                .map_err(|caught| caught_to_error(&extension_id, file, caught))
        });
        drain_jobs(&runtime, &extension_id);
        let outcome = if watchdog.disarm() {
            Err(BackgroundScriptError::TimedOut {
                extension_id: extension_id.clone(),
                file: file.clone(),
            })
        } else {
            outcome
        };
        if let Err(e) = outcome {
            log_script_error(&e);
            let _ = ready.send(Err(e));
            return;
        }
    }
    let _ = ready.send(Ok(()));

    while let Some(command) = commands.blocking_recv() {
        if matches!(command, HostCommand::Shutdown) {
            break;
        }
        watchdog.arm(spec.script_timeout);
        context.with(|ctx| handle_command(&ctx, &extension_id, command));
        drain_jobs(&runtime, &extension_id);
        if watchdog.disarm() {
            warn!(target: "background", extension_id = %extension_id, timeout_ms = spec.script_timeout.as_millis() as u64, "script ran past its time limit and was interrupted");
        }
    }
}

fn create_engine(
    spec: &HostSpec,
    outbound: mpsc::UnboundedSender<HostOutbound>,
    watchdog: &Watchdog,
) -> Result<(Runtime, Context), BackgroundScriptError> {
    let unavailable = |e: rquickjs::Error| BackgroundScriptError::EngineUnavailable(e.to_string());
    let runtime = Runtime::new().map_err(unavailable)?;
    if spec.memory_limit > 0 {
        runtime.set_memory_limit(spec.memory_limit);
    }
    let dog = watchdog.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || dog.expired())));
    let context = Context::full(&runtime).map_err(unavailable)?;

    let config = json!({
        "id": spec.extension_id,
        "origin": spec.origin,
        "manifest": spec.manifest,
        "quotas": {
            "local": spec.quotas.local_bytes,
            "sync": spec.quotas.sync_bytes,
            "session": spec.quotas.session_bytes,
        },
    })
    .to_string();

    context.with(|ctx| {
        install_natives(&ctx, &spec.extension_id, outbound)
            .and_then(|_| {
                let init: Function = ctx.eval(API_PRELUDE)?;
                init.call::<_, ()>((ctx.globals(), config))
            })
            .and_then(|_| {
                if spec.manifest.is_v3() {
                    ctx.eval::<(), _>("delete globalThis.eval;")
                } else {
                    Ok(())
                }
            })
            .catch(&ctx)
            .map_err(|caught| caught_to_error(&spec.extension_id, "<prelude>", caught))
    })?;

    Ok((runtime, context))
}

fn install_natives<'js>(
    ctx: &Ctx<'js>,
    extension_id: &str,
    outbound: mpsc::UnboundedSender<HostOutbound>,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let call_id = extension_id.to_string();
    let call_outbound = outbound.clone();
    let native_call = Function::new(ctx.clone(), move |method: String, payload: Value<'js>| -> String {
        let payload = sanitize(js_to_bridge(&payload));
        match ApiCall::parse(&method, payload) {
            Ok(call) => {
                let token = CallbackToken::generate();
                let message = HostOutbound::Call {
                    extension_id: call_id.clone(),
                    token: token.clone(),
                    call,
                };
                if call_outbound.send(message).is_err() {
                    return json!({ "error": "Extension runtime is shutting down" }).to_string();
                }
                json!({ "token": token }).to_string()
            }
            Err(e) => json!({ "error": e.to_string() }).to_string(),
        }
    })?;
    globals.set("__native_call", native_call)?;

    let native_reply = Function::new(ctx.clone(), move |token: String, value: String| {
        let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::Null);
        let _ = outbound.send(HostOutbound::Reply {
            token: CallbackToken::from(token),
            value,
        });
    })?;
    globals.set("__native_reply", native_reply)?;

    let log_id = extension_id.to_string();
    let log = Function::new(ctx.clone(), move |level: String, message: String| {
        match level.as_str() {
            "error" => error!(target: "extension_console", extension_id = %log_id, "{}", message),
            "warn" => warn!(target: "extension_console", extension_id = %log_id, "{}", message),
            "debug" => debug!(target: "extension_console", extension_id = %log_id, "{}", message),
            _ => info!(target: "extension_console", extension_id = %log_id, "{}", message),
        }
    })?;
    globals.set("__log", log)?;

    Ok(())
}

/// Converts a script value into a [`BridgeValue`] without going through JSON text.
pub fn js_to_bridge(value: &Value<'_>) -> BridgeValue {
    if value.is_undefined() {
        return BridgeValue::Optional(None);
    }
    if value.is_null() {
        return BridgeValue::Null;
    }
    if value.is_function() {
        return BridgeValue::Opaque("function".to_string());
    }
    if let Some(b) = value.as_bool() {
        return BridgeValue::Bool(b);
    }
    if let Some(i) = value.as_int() {
        return BridgeValue::Int(i64::from(i));
    }
    if let Some(f) = value.as_float() {
        return BridgeValue::Float(f);
    }
    if let Some(s) = value.as_string() {
        return match s.to_string() {
            Ok(s) => BridgeValue::String(s),
            Err(_) => BridgeValue::Opaque("string".to_string()),
        };
    }
    if let Some(array) = value.as_array() {
        return BridgeValue::Array(
            array
                .iter::<Value>()
                .map(|item| item.map(|v| js_to_bridge(&v)).unwrap_or(BridgeValue::Null))
                .collect(),
        );
    }
    if let Some(object) = value.as_object() {
        let mut map = std::collections::BTreeMap::new();
        for key in object.keys::<String>().flatten() {
            if let Ok(item) = object.get::<_, Value>(key.as_str()) {
                if item.is_undefined() || item.is_function() {
                    continue;
                }
                map.insert(key, js_to_bridge(&item));
            }
        }
        return BridgeValue::Map(map);
    }
    BridgeValue::Opaque(format!("{:?}", value.type_of()))
}

fn handle_command(ctx: &Ctx<'_>, extension_id: &str, command: HostCommand) {
    let result = match command {
        HostCommand::Complete { token, result } => {
            let outcome = match result {
                Ok(value) => json!({ "ok": value }),
                Err(message) => json!({ "error": message }),
            };
            call_global(ctx, extension_id, "__complete", (token.to_string(), outcome.to_string()))
        }
        HostCommand::DispatchEvent { event, args } => {
            call_global(ctx, extension_id, "__dispatchEvent", (event, serde_json::Value::Array(args).to_string()))
        }
        HostCommand::DeliverMessage {
            message,
            sender,
            reply_token,
        } => call_global(
            ctx,
            extension_id,
            "__deliverMessage",
            (
                message.to_string(),
                json!(sender).to_string(),
                reply_token.map(|t| t.to_string()).unwrap_or_default(),
            ),
        ),
        HostCommand::PortConnect { port_id, name, sender } => call_global(
            ctx,
            extension_id,
            "__connectPort",
            (port_id.to_string(), name, json!(sender).to_string()),
        ),
        HostCommand::PortMessage { port_id, message } => {
            call_global(ctx, extension_id, "__portMessage", (port_id.to_string(), message.to_string()))
        }
        HostCommand::PortDisconnect { port_id } => call_global(ctx, extension_id, "__portDisconnect", (port_id.to_string(),)),
        HostCommand::InvokeListener { handle, args, reply } => {
            let returned = ctx
                .globals()
                .get::<_, Function>("__invokeListener")
                .and_then(|f| f.call::<_, Option<String>>((handle, serde_json::Value::Array(args).to_string())))
                .catch(ctx);
            match returned {
                Ok(json) => {
                    let value = json.and_then(|s| serde_json::from_str(&s).ok());
                    let _ = reply.send(value);
                    Ok(())
                }
                Err(caught) => {
                    let _ = reply.send(None);
                    Err(caught_to_error(extension_id, "<listener>", caught))
                }
            }
        }
        HostCommand::Evaluate { source, reply } => {
            let evaluated = ctx
                .eval::<Value, _>(source)
                .and_then(|value| match ctx.json_stringify(value)? {
                    Some(s) => s.to_string(),
                    None => Ok("null".to_string()),
                })
                .catch(ctx)
                .map_err(|caught| caught_to_error(extension_id, "<evaluate>", caught))
                .map(|text| serde_json::from_str(&text).unwrap_or(serde_json::Value::Null));
            let _ = reply.send(evaluated);
            Ok(())
        }
        HostCommand::Shutdown => Ok(()),
    };
    if let Err(e) = result {
        log_script_error(&e);
    }
}

fn call_global<'js, A>(ctx: &Ctx<'js>, extension_id: &str, name: &str, args: A) -> Result<(), BackgroundScriptError>
where
    A: rquickjs::function::IntoArgs<'js>,
{
    ctx.globals()
        .get::<_, Function>(name)
        .and_then(|f| f.call::<_, ()>(args))
        .catch(ctx)
        .map_err(|caught| caught_to_error(extension_id, name, caught))
}

fn caught_to_error(extension_id: &str, file: &str, caught: CaughtError<'_>) -> BackgroundScriptError {
    let (message, stack) = match &caught {
        CaughtError::Exception(exception) => (
            exception.message().unwrap_or_else(|| "uncaught exception".to_string()),
            exception.stack(),
        ),
        other => (other.to_string(), None),
    };
    BackgroundScriptError::ExecutionFailed {
        extension_id: extension_id.to_string(),
        file: file.to_string(),
        message,
        stack,
    }
}

fn log_script_error(e: &BackgroundScriptError) {
    match e {
        BackgroundScriptError::ExecutionFailed {
            extension_id,
            file,
            message,
            stack,
        } => error!(
            target: "background",
            extension_id = %extension_id,
            file = %file,
            stack = stack.as_deref().unwrap_or(""),
            "{}",
            message
        ),
        other => error!(target: "background", "{}", other),
    }
}

fn drain_jobs(runtime: &Runtime, extension_id: &str) {
    while runtime.is_job_pending() {
        if runtime.execute_pending_job().is_err() {
            warn!(target: "background", extension_id, "pending job threw");
        }
    }
}

/// webRequest listener living in a background script.
pub struct ScriptedListener {
    host: HostHandle,
    handle: String,
    timeout: Duration,
}

impl ScriptedListener {
    pub fn new(host: HostHandle, handle: String, timeout: Duration) -> Self {
        Self { host, handle, timeout }
    }
}

#[async_trait]
impl WebRequestListener for ScriptedListener {
    async fn handle(&self, _stage: WebRequestStage, details: &RequestDetails) -> BlockingResponse {
        let args = vec![json!(details)];
        match self.host.invoke_listener(&self.handle, args, self.timeout).await {
            Some(value) => BlockingResponse::from_script_value(&value),
            None => BlockingResponse::Allow,
        }
    }
}
