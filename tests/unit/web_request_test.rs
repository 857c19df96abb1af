//! Unit tests for the web request interception pipeline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use extension_host::services::web_request::{
    merge_headers, now_ms, FnListener, ListenerSpec, WebRequestInterceptor, WebRequestListener,
};
use extension_host::types::web_request::{
    BlockingResponse, HttpHeader, OutgoingRequest, RequestDetails, RequestDisposition, RequestFilter,
    ResourceType, ResponseInfo, WebRequestStage, ERR_BLOCKED_BY_CLIENT, ERR_TIMED_OUT,
};
use serde_json::json;

fn listener<F>(f: F) -> Arc<dyn WebRequestListener>
where
    F: Fn(WebRequestStage, &RequestDetails) -> BlockingResponse + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

fn request(url: &str) -> OutgoingRequest {
    OutgoingRequest {
        url: url.to_string(),
        method: "GET".to_string(),
        frame_id: 0,
        tab_id: 1,
        window_id: 1,
        resource_type: ResourceType::MainFrame,
        request_headers: vec![HttpHeader::new("Accept", "*/*")],
    }
}

fn spec(extension_id: &str, stage: WebRequestStage, blocking: bool, listener: Arc<dyn WebRequestListener>) -> ListenerSpec {
    ListenerSpec {
        extension_id: extension_id.to_string(),
        stage,
        filter: RequestFilter {
            urls: vec!["<all_urls>".to_string()],
            ..RequestFilter::default()
        },
        blocking,
        host_scope: None,
        listener,
    }
}

/// Records the stage and URL of every notification.
fn recorder() -> (Arc<Mutex<Vec<(WebRequestStage, String)>>>, Arc<dyn WebRequestListener>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let l = listener(move |stage, details: &RequestDetails| {
        sink.lock().unwrap().push((stage, details.url.clone()));
        BlockingResponse::Allow
    });
    (seen, l)
}

#[tokio::test]
async fn request_without_listeners_proceeds_unchanged() {
    let interceptor = WebRequestInterceptor::new();

    let disposition = interceptor.begin_request(request("https://example.com/")).await;

    match disposition {
        RequestDisposition::Proceed { url, headers, .. } => {
            assert_eq!(url, "https://example.com/");
            assert_eq!(headers, vec![HttpHeader::new("Accept", "*/*")]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(interceptor.in_flight_count(), 1);
}

#[tokio::test]
async fn request_ids_increase() {
    let interceptor = WebRequestInterceptor::new();
    let a = interceptor.begin_request(request("https://a.test/")).await.request_id();
    let b = interceptor.begin_request(request("https://b.test/")).await.request_id();
    assert!(b > a);
}

#[tokio::test]
async fn blocking_cancel_blocks_and_reports_error() {
    let interceptor = WebRequestInterceptor::new();
    interceptor
        .add_listener(spec(
            "blocker",
            WebRequestStage::BeforeRequest,
            true,
            listener(|_, _: &RequestDetails| BlockingResponse::Cancel),
        ))
        .unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    interceptor
        .add_listener(spec(
            "observer",
            WebRequestStage::ErrorOccurred,
            false,
            listener(move |_, d: &RequestDetails| {
                sink.lock().unwrap().push(d.error.clone());
                BlockingResponse::Allow
            }),
        ))
        .unwrap();

    let disposition = interceptor.begin_request(request("https://ads.test/")).await;

    assert!(disposition.is_blocked());
    assert_eq!(interceptor.in_flight_count(), 0);
    assert_eq!(*errors.lock().unwrap(), vec![Some(ERR_BLOCKED_BY_CLIENT.to_string())]);
}

#[tokio::test]
async fn non_blocking_cancel_is_ignored() {
    let interceptor = WebRequestInterceptor::new();
    interceptor
        .add_listener(spec(
            "observer",
            WebRequestStage::BeforeRequest,
            false,
            listener(|_, _: &RequestDetails| BlockingResponse::Cancel),
        ))
        .unwrap();

    let disposition = interceptor.begin_request(request("https://example.com/")).await;
    assert!(!disposition.is_blocked());
}

#[tokio::test]
async fn redirect_is_seen_by_later_listeners() {
    let interceptor = WebRequestInterceptor::new();
    interceptor
        .add_listener(spec(
            "redirector",
            WebRequestStage::BeforeRequest,
            true,
            listener(|_, d: &RequestDetails| {
                if d.url.starts_with("http://") {
                    BlockingResponse::Redirect(d.url.replacen("http://", "https://", 1))
                } else {
                    BlockingResponse::Allow
                }
            }),
        ))
        .unwrap();
    let (seen, l) = recorder();
    interceptor
        .add_listener(spec("observer", WebRequestStage::BeforeSendHeaders, false, l))
        .unwrap();

    let disposition = interceptor.begin_request(request("http://example.com/a")).await;

    match disposition {
        RequestDisposition::Proceed { url, .. } => assert_eq!(url, "https://example.com/a"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(WebRequestStage::BeforeSendHeaders, "https://example.com/a".to_string())]
    );
}

#[tokio::test]
async fn header_change_applies_only_in_before_send_headers() {
    let interceptor = WebRequestInterceptor::new();
    let set_dnt = || {
        listener(|_, _: &RequestDetails| BlockingResponse::ModifyHeaders(vec![HttpHeader::new("DNT", "1")]))
    };
    interceptor
        .add_listener(spec("early", WebRequestStage::BeforeRequest, true, set_dnt()))
        .unwrap();

    let disposition = interceptor.begin_request(request("https://example.com/")).await;
    match disposition {
        RequestDisposition::Proceed { headers, .. } => assert_eq!(headers.len(), 1),
        other => panic!("unexpected {:?}", other),
    }

    interceptor
        .add_listener(spec("late", WebRequestStage::BeforeSendHeaders, true, set_dnt()))
        .unwrap();
    let disposition = interceptor.begin_request(request("https://example.com/")).await;
    match disposition {
        RequestDisposition::Proceed { headers, .. } => {
            assert!(headers.contains(&HttpHeader::new("DNT", "1")));
            assert_eq!(headers.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn filters_select_by_url_type_and_tab() {
    let interceptor = WebRequestInterceptor::new();
    let (seen, l) = recorder();
    interceptor
        .add_listener(ListenerSpec {
            extension_id: "ext".to_string(),
            stage: WebRequestStage::BeforeRequest,
            filter: RequestFilter {
                urls: vec!["https://*.example.com/*".to_string()],
                types: Some(vec![ResourceType::Script]),
                tab_id: Some(1),
                window_id: None,
            },
            blocking: false,
            host_scope: None,
            listener: l,
        })
        .unwrap();

    let mut script = request("https://cdn.example.com/app.js");
    script.resource_type = ResourceType::Script;
    interceptor.begin_request(script.clone()).await;

    interceptor.begin_request(request("https://cdn.example.com/page")).await;
    let mut other_tab = script.clone();
    other_tab.tab_id = 9;
    interceptor.begin_request(other_tab).await;
    let mut other_host = script;
    other_host.url = "https://elsewhere.test/app.js".to_string();
    interceptor.begin_request(other_host).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn host_scope_hides_unpermitted_urls() {
    let interceptor = WebRequestInterceptor::new();
    let (seen, l) = recorder();
    let mut s = spec("ext", WebRequestStage::BeforeRequest, false, l);
    s.host_scope = Some(vec!["https://allowed.test/*".to_string()]);
    interceptor.add_listener(s).unwrap();

    interceptor.begin_request(request("https://allowed.test/x")).await;
    interceptor.begin_request(request("https://denied.test/x")).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![(WebRequestStage::BeforeRequest, "https://allowed.test/x".to_string())]
    );
}

#[tokio::test]
async fn after_stages_follow_the_request_lifecycle() {
    let interceptor = WebRequestInterceptor::new();
    let (seen, l) = recorder();
    interceptor
        .add_listener(spec("ext", WebRequestStage::ResponseStarted, false, l.clone()))
        .unwrap();
    interceptor
        .add_listener(spec("ext", WebRequestStage::Completed, false, l))
        .unwrap();

    let id = interceptor.begin_request(request("https://example.com/")).await.request_id();
    assert!(
        interceptor
            .response_started(
                id,
                ResponseInfo {
                    status_code: 200,
                    response_headers: vec![HttpHeader::new("Content-Type", "text/html")],
                },
            )
            .await
    );
    assert!(interceptor.completed(id).await);

    assert_eq!(interceptor.in_flight_count(), 0);
    assert!(!interceptor.completed(id).await, "completed id is forgotten");
    assert!(!interceptor.error_occurred(4242, "net::ERR_FAILED").await);
    let stages: Vec<_> = seen.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(stages, vec![WebRequestStage::ResponseStarted, WebRequestStage::Completed]);
}

#[tokio::test]
async fn unfinished_requests_expire_with_a_timeout_error() {
    let interceptor = WebRequestInterceptor::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    interceptor
        .add_listener(spec(
            "ext",
            WebRequestStage::ErrorOccurred,
            false,
            listener(move |_, details: &RequestDetails| {
                sink.lock().unwrap().push(details.error.clone());
                BlockingResponse::Allow
            }),
        ))
        .unwrap();

    let stale = interceptor.begin_request(request("https://slow.test/")).await.request_id();
    let max_age = Duration::from_secs(60);

    assert_eq!(interceptor.expire_stale(now_ms(), max_age).await, 0, "fresh requests are kept");
    assert_eq!(interceptor.in_flight_count(), 1);

    let later = now_ms() + 61_000;
    assert_eq!(interceptor.expire_stale(later, max_age).await, 1);
    assert_eq!(interceptor.in_flight_count(), 0);
    assert!(!interceptor.completed(stale).await, "expired id is forgotten");
    assert_eq!(*errors.lock().unwrap(), vec![Some(ERR_TIMED_OUT.to_string())]);
}

#[tokio::test]
async fn removing_listeners() {
    let interceptor = WebRequestInterceptor::new();
    let (_, l) = recorder();
    let handle = interceptor
        .add_listener(spec("a", WebRequestStage::BeforeRequest, false, l.clone()))
        .unwrap();
    interceptor
        .add_listener(spec("a", WebRequestStage::Completed, false, l.clone()))
        .unwrap();
    interceptor
        .add_listener(spec("b", WebRequestStage::Completed, false, l))
        .unwrap();

    assert_eq!(interceptor.owner_of(handle), Some("a".to_string()));
    assert!(interceptor.remove_listener(handle));
    assert!(!interceptor.remove_listener(handle));
    assert_eq!(interceptor.remove_extension("a"), 1);
    assert_eq!(interceptor.listener_count("a"), 0);
    assert_eq!(interceptor.listener_count("b"), 1);
}

#[tokio::test]
async fn empty_url_filter_selects_every_request() {
    let interceptor = WebRequestInterceptor::new();
    let (seen, l) = recorder();
    let mut s = spec("ext", WebRequestStage::BeforeRequest, false, l);
    s.filter.urls = Vec::new();
    interceptor.add_listener(s).unwrap();

    interceptor.begin_request(request("https://a.test/")).await;
    interceptor.begin_request(request("ws://b.test/socket")).await;

    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn merge_headers_replaces_case_insensitively() {
    let mut headers = vec![HttpHeader::new("User-Agent", "a"), HttpHeader::new("Accept", "*/*")];
    merge_headers(
        &mut headers,
        vec![HttpHeader::new("user-agent", "b"), HttpHeader::new("DNT", "1")],
    );
    assert_eq!(
        headers,
        vec![
            HttpHeader::new("user-agent", "b"),
            HttpHeader::new("Accept", "*/*"),
            HttpHeader::new("DNT", "1"),
        ]
    );
}

#[test]
fn blocking_response_from_script_values() {
    assert_eq!(BlockingResponse::from_script_value(&json!({"cancel": true})), BlockingResponse::Cancel);
    assert_eq!(
        BlockingResponse::from_script_value(&json!({"redirectUrl": "https://x.test/"})),
        BlockingResponse::Redirect("https://x.test/".to_string())
    );
    assert_eq!(
        BlockingResponse::from_script_value(&json!({"requestHeaders": [{"name": "A", "value": "b"}]})),
        BlockingResponse::ModifyHeaders(vec![HttpHeader::new("A", "b")])
    );
    assert_eq!(BlockingResponse::from_script_value(&json!(null)), BlockingResponse::Allow);
    assert_eq!(BlockingResponse::from_script_value(&json!({"cancel": false})), BlockingResponse::Allow);
}

#[test]
fn stage_names_round_trip() {
    for stage in [
        WebRequestStage::BeforeRequest,
        WebRequestStage::BeforeSendHeaders,
        WebRequestStage::ResponseStarted,
        WebRequestStage::Completed,
        WebRequestStage::ErrorOccurred,
    ] {
        assert_eq!(WebRequestStage::from_event_name(stage.event_name()), Some(stage));
    }
    assert!(WebRequestStage::BeforeRequest.can_block());
    assert!(!WebRequestStage::Completed.can_block());
}
