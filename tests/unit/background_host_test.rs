//! Unit tests for background script hosts running on the QuickJS engine.

#[path = "../support/mod.rs"]
mod support;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use extension_host::services::background_host::{
    entry_point_exists, page_script_sources, BackgroundHost, HostCommand, HostOutbound, HostSpec,
};
use extension_host::services::manifest_parser::ManifestParser;
use extension_host::types::api::ApiCall;
use extension_host::types::config::StorageQuotas;
use extension_host::types::errors::BackgroundScriptError;
use extension_host::types::message::{CallbackToken, MessageSender};
use extension_host::types::storage::{StorageAreaKind, StorageKeys};

use support::ExtensionDir;

const EXT: &str = "bgbgbgbgbgbgbgbgbgbgbgbgbgbgbgbg";

fn worker_extension(source: &str) -> ExtensionDir {
    ExtensionDir::new(support::manifest_v3(
        "Worker",
        json!({"background": {"service_worker": "sw.js"}}),
    ))
    .with_file("sw.js", source)
}

fn spec_for(dir: &ExtensionDir) -> HostSpec {
    HostSpec {
        extension_id: EXT.to_string(),
        manifest: ManifestParser::parse_path(&dir.path()).unwrap(),
        install_path: dir.path(),
        origin: format!("chrome-extension://{}/", EXT),
        memory_limit: 32 * 1024 * 1024,
        quotas: StorageQuotas::default(),
        script_timeout: Duration::from_secs(2),
    }
}

async fn start(source: &str) -> (ExtensionDir, BackgroundHost, mpsc::UnboundedReceiver<HostOutbound>) {
    let dir = worker_extension(source);
    let (tx, rx) = mpsc::unbounded_channel();
    let host = BackgroundHost::spawn(spec_for(&dir), tx).await.expect("host should start");
    (dir, host, rx)
}

async fn next_outbound(rx: &mut mpsc::UnboundedReceiver<HostOutbound>) -> HostOutbound {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("outbound message in time")
        .expect("channel open")
}

async fn next_call(rx: &mut mpsc::UnboundedReceiver<HostOutbound>) -> (CallbackToken, ApiCall) {
    match next_outbound(rx).await {
        HostOutbound::Call {
            extension_id,
            token,
            call,
        } => {
            assert_eq!(extension_id, EXT);
            (token, call)
        }
        other => panic!("expected a call, got {:?}", other),
    }
}

#[tokio::test]
async fn evaluate_returns_json_values() {
    let (_dir, host, _rx) = start("globalThis.answer = { n: 42, list: [1, 'two'] };").await;
    let handle = host.handle();

    assert_eq!(handle.evaluate("1 + 2").await.unwrap(), json!(3));
    assert_eq!(handle.evaluate("answer").await.unwrap(), json!({"n": 42, "list": [1, "two"]}));
    assert_eq!(handle.evaluate("undefined").await.unwrap(), Value::Null);
    assert_eq!(handle.evaluate("chrome.runtime.id").await.unwrap(), json!(EXT));
    assert_eq!(
        handle.evaluate("chrome.runtime.getURL('/page.html')").await.unwrap(),
        json!(format!("chrome-extension://{}/page.html", EXT))
    );

    host.shutdown().await;
}

#[tokio::test]
async fn evaluate_reports_exceptions() {
    let (_dir, host, _rx) = start("").await;

    let result = host.handle().evaluate("throw new Error('kaboom')").await;

    match result {
        Err(BackgroundScriptError::ExecutionFailed { message, .. }) => assert!(message.contains("kaboom")),
        other => panic!("expected execution failure, got {:?}", other),
    }
    host.shutdown().await;
}

#[tokio::test]
async fn manifest_v3_workers_have_no_eval() {
    let (_dir, host, _rx) = start("").await;
    assert_eq!(host.handle().evaluate("typeof eval").await.unwrap(), json!("undefined"));
    host.shutdown().await;
}

#[tokio::test]
async fn events_reach_registered_listeners() {
    let (_dir, host, _rx) = start(
        "globalThis.seen = [];
         chrome.runtime.onInstalled.addListener(function (details) { seen.push(details.reason); });",
    )
    .await;
    let handle = host.handle();

    handle
        .dispatch_event("runtime.onInstalled", vec![json!({"reason": "install"})])
        .unwrap();
    handle.dispatch_event("runtime.onStartup", vec![]).unwrap();

    assert_eq!(handle.evaluate("seen").await.unwrap(), json!(["install"]));
    host.shutdown().await;
}

#[tokio::test]
async fn callback_style_call_is_completed_by_token() {
    let (_dir, host, mut rx) = start(
        "chrome.storage.local.get(null, function (items) { globalThis.got = items; });",
    )
    .await;

    let (token, call) = next_call(&mut rx).await;
    assert_eq!(
        call,
        ApiCall::StorageGet {
            area: StorageAreaKind::Local,
            keys: StorageKeys::All
        }
    );

    let handle = host.handle();
    handle.complete(token, Ok(json!({"color": "red"}))).unwrap();
    assert_eq!(handle.evaluate("got").await.unwrap(), json!({"color": "red"}));
    host.shutdown().await;
}

#[tokio::test]
async fn failed_call_sets_last_error_during_callback() {
    let (_dir, host, mut rx) = start(
        "chrome.tabs.get(5, function (tab) {
           globalThis.err = chrome.runtime.lastError && chrome.runtime.lastError.message;
           globalThis.tabArg = tab === undefined ? 'none' : tab;
         });",
    )
    .await;

    let (token, call) = next_call(&mut rx).await;
    assert_eq!(call, ApiCall::TabsGet { tab_id: 5 });

    let handle = host.handle();
    handle.complete(token, Err("No tab with id: 5".to_string())).unwrap();
    assert_eq!(handle.evaluate("err").await.unwrap(), json!("No tab with id: 5"));
    assert_eq!(handle.evaluate("tabArg").await.unwrap(), json!("none"));
    assert_eq!(handle.evaluate("chrome.runtime.lastError === undefined").await.unwrap(), json!(true));
    host.shutdown().await;
}

#[tokio::test]
async fn promise_style_call_resolves() {
    let (_dir, host, mut rx) = start(
        "chrome.storage.sync.set({ a: 1 }).then(function () { globalThis.done = 'yes'; });",
    )
    .await;

    let (token, call) = next_call(&mut rx).await;
    assert!(matches!(call, ApiCall::StorageSet { area: StorageAreaKind::Sync, .. }));

    let handle = host.handle();
    handle.complete(token, Ok(Value::Null)).unwrap();
    assert_eq!(handle.evaluate("globalThis.done").await.unwrap(), json!("yes"));
    host.shutdown().await;
}

#[tokio::test]
async fn invalid_call_rejects_without_leaving_the_host() {
    let (_dir, host, mut rx) = start(
        "chrome.storage.local.get(null).catch(function (e) { globalThis.fail = e.message; });
         chrome.storage.local.set(5, function () { globalThis.setErr = chrome.runtime.lastError.message; });",
    )
    .await;
    let handle = host.handle();

    // The first call is valid and leaves the host; the second is rejected locally
    let (_token, _call) = next_call(&mut rx).await;
    let set_err = handle.evaluate("setErr").await.unwrap();
    assert!(set_err.as_str().unwrap().contains("items must be an object"), "{}", set_err);
    assert!(rx.try_recv().is_err());
    host.shutdown().await;
}

#[tokio::test]
async fn send_response_replies_with_token() {
    let (_dir, host, mut rx) = start(
        "chrome.runtime.onMessage.addListener(function (msg, sender, sendResponse) {
           sendResponse({ echo: msg, from: sender.id });
         });",
    )
    .await;

    let reply_token = CallbackToken::from("reply-1");
    host.handle()
        .send(HostCommand::DeliverMessage {
            message: json!("hello"),
            sender: MessageSender::page(EXT, "chrome-extension://x/popup.html", 3),
            reply_token: Some(reply_token.clone()),
        })
        .unwrap();

    assert_eq!(
        next_outbound(&mut rx).await,
        HostOutbound::Reply {
            token: reply_token,
            value: json!({"echo": "hello", "from": EXT}),
        }
    );
    host.shutdown().await;
}

#[tokio::test]
async fn message_without_response_is_answered_with_null() {
    let (_dir, host, mut rx) = start("chrome.runtime.onMessage.addListener(function () {});").await;

    host.handle()
        .send(HostCommand::DeliverMessage {
            message: json!(1),
            sender: MessageSender::background(EXT),
            reply_token: Some(CallbackToken::from("r")),
        })
        .unwrap();

    assert_eq!(
        next_outbound(&mut rx).await,
        HostOutbound::Reply {
            token: CallbackToken::from("r"),
            value: Value::Null,
        }
    );
    host.shutdown().await;
}

#[tokio::test]
async fn async_listener_keeps_the_channel_open() {
    let (_dir, host, mut rx) = start(
        "chrome.runtime.onMessage.addListener(function (msg, sender, sendResponse) {
           globalThis.later = sendResponse;
           return true;
         });",
    )
    .await;
    let handle = host.handle();

    handle
        .send(HostCommand::DeliverMessage {
            message: json!(1),
            sender: MessageSender::background(EXT),
            reply_token: Some(CallbackToken::from("r2")),
        })
        .unwrap();
    handle.evaluate("0").await.unwrap();
    assert!(rx.try_recv().is_err(), "no reply until sendResponse runs");

    handle.evaluate("later('done')").await.unwrap();
    assert_eq!(
        next_outbound(&mut rx).await,
        HostOutbound::Reply {
            token: CallbackToken::from("r2"),
            value: json!("done"),
        }
    );
    host.shutdown().await;
}

#[tokio::test]
async fn web_request_listener_registers_and_answers() {
    let (_dir, host, mut rx) = start(
        "chrome.webRequest.onBeforeRequest.addListener(function (details) {
           return { cancel: details.url.indexOf('ads') >= 0 };
         }, { urls: ['<all_urls>'] }, ['blocking']);",
    )
    .await;

    let (_token, call) = next_call(&mut rx).await;
    let handle_name = match call {
        ApiCall::WebRequestAddListener {
            handle,
            extra_info_spec,
            filter,
            ..
        } => {
            assert_eq!(extra_info_spec, vec!["blocking".to_string()]);
            assert_eq!(filter.urls, vec!["<all_urls>".to_string()]);
            handle
        }
        other => panic!("unexpected call {:?}", other),
    };

    let answer = host
        .handle()
        .invoke_listener(&handle_name, vec![json!({"url": "https://ads.test/x"})], Duration::from_secs(2))
        .await;
    assert_eq!(answer, Some(json!({"cancel": true})));
    let unknown = host
        .handle()
        .invoke_listener("h999", vec![json!({})], Duration::from_secs(2))
        .await;
    assert_eq!(unknown, None);
    host.shutdown().await;
}

#[tokio::test]
async fn ports_deliver_messages_to_on_connect_listeners() {
    let (_dir, host, _rx) = start(
        "globalThis.log = [];
         chrome.runtime.onConnect.addListener(function (port) {
           log.push('connect:' + port.name);
           port.onMessage.addListener(function (m) { log.push('msg:' + m); });
           port.onDisconnect.addListener(function () { log.push('bye'); });
         });",
    )
    .await;
    let handle = host.handle();
    let port_id = extension_host::types::message::PortId::from("p1".to_string());

    handle
        .send(HostCommand::PortConnect {
            port_id: port_id.clone(),
            name: "stream".to_string(),
            sender: MessageSender::background(EXT),
        })
        .unwrap();
    handle
        .send(HostCommand::PortMessage {
            port_id: port_id.clone(),
            message: json!("one"),
        })
        .unwrap();
    handle.send(HostCommand::PortDisconnect { port_id }).unwrap();

    assert_eq!(
        handle.evaluate("log").await.unwrap(),
        json!(["connect:stream", "msg:one", "bye"])
    );
    host.shutdown().await;
}

#[tokio::test]
async fn throwing_top_level_script_fails_startup() {
    let dir = worker_extension("throw new Error('bad worker');");
    let (tx, _rx) = mpsc::unbounded_channel();

    let result = BackgroundHost::spawn(spec_for(&dir), tx).await;

    match result {
        Err(BackgroundScriptError::ExecutionFailed { file, message, .. }) => {
            assert_eq!(file, "sw.js");
            assert!(message.contains("bad worker"));
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("host should not start"),
    }
}

#[tokio::test]
async fn missing_entry_point_is_reported() {
    let dir = ExtensionDir::new(support::manifest_v3(
        "Worker",
        json!({"background": {"service_worker": "missing.js"}}),
    ));
    let (tx, _rx) = mpsc::unbounded_channel();

    let result = BackgroundHost::spawn(spec_for(&dir), tx).await;

    assert!(matches!(
        result,
        Err(BackgroundScriptError::MissingEntryPoint { ref file, .. }) if file == "missing.js"
    ));
    assert!(!entry_point_exists(&dir.path(), "missing.js", EXT));
}

#[tokio::test]
async fn endless_top_level_script_is_interrupted() {
    let dir = worker_extension("while (true) {}");
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut spec = spec_for(&dir);
    spec.script_timeout = Duration::from_millis(200);

    let result = tokio::time::timeout(Duration::from_secs(10), BackgroundHost::spawn(spec, tx))
        .await
        .expect("startup must not hang");

    match result {
        Err(BackgroundScriptError::TimedOut { extension_id, file }) => {
            assert_eq!(extension_id, EXT);
            assert_eq!(file, "sw.js");
        }
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("host should not start"),
    }
}

#[tokio::test]
async fn endless_listener_is_interrupted_and_host_keeps_working() {
    let dir = worker_extension(
        "chrome.runtime.onStartup.addListener(function () { for (;;) {} });
         globalThis.alive = 'yes';",
    );
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut spec = spec_for(&dir);
    spec.script_timeout = Duration::from_millis(200);
    let host = BackgroundHost::spawn(spec, tx).await.expect("host should start");
    let handle = host.handle();

    handle.dispatch_event("runtime.onStartup", Vec::new()).unwrap();
    let answer = tokio::time::timeout(Duration::from_secs(10), handle.evaluate("alive"))
        .await
        .expect("host thread must come back");

    assert_eq!(answer.unwrap(), json!("yes"));
    host.shutdown().await;
}

#[tokio::test]
async fn v2_background_page_loads_its_scripts_in_order() {
    let dir = ExtensionDir::new(support::manifest_v2(
        "Legacy",
        json!({"background": {"page": "bg/index.html"}}),
    ))
    .with_file(
        "bg/index.html",
        "<html><script src=\"first.js\"></script><script src='/lib/second.js'></script></html>",
    )
    .with_file("bg/first.js", "globalThis.order = ['first'];")
    .with_file("lib/second.js", "order.push('second');");
    let (tx, _rx) = mpsc::unbounded_channel();

    let host = BackgroundHost::spawn(spec_for(&dir), tx).await.unwrap();

    assert_eq!(host.handle().evaluate("order").await.unwrap(), json!(["first", "second"]));
    assert_eq!(host.handle().evaluate("typeof eval").await.unwrap(), json!("function"));
    host.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_the_handle() {
    let (_dir, host, _rx) = start("").await;
    let handle = host.handle();
    assert!(handle.is_alive());

    host.shutdown().await;

    assert!(!handle.is_alive());
    assert!(matches!(handle.evaluate("1").await, Err(BackgroundScriptError::Stopped(_))));
}

#[test]
fn page_script_sources_resolves_relative_paths() {
    let html = r#"<script src="a.js"></script>
                  <SCRIPT type="text/javascript" src='../shared/b.js'></SCRIPT>
                  <script src="https://cdn.test/c.js"></script>
                  <script src="/root.js"></script>
                  <script>inline()</script>"#;
    assert_eq!(
        page_script_sources("pages/bg.html", html),
        vec![
            "pages/a.js".to_string(),
            "pages/../shared/b.js".to_string(),
            "root.js".to_string()
        ]
    );
}
