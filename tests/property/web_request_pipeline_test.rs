//! Property-based tests for the web request pipeline.
//!
//! Random chains of onBeforeRequest listeners are registered in order; the
//! outcome must follow from the blocking listeners alone.

use std::sync::Arc;

use extension_host::services::web_request::{FnListener, ListenerSpec, WebRequestInterceptor, WebRequestListener};
use extension_host::types::web_request::{
    BlockingResponse, OutgoingRequest, RequestDetails, RequestDisposition, RequestFilter, ResourceType,
    WebRequestStage,
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Action {
    Allow,
    Cancel,
    Redirect,
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![Just(Action::Allow), Just(Action::Cancel), Just(Action::Redirect)]
}

fn redirect_target(index: usize) -> String {
    format!("https://redirect.test/{}", index)
}

fn listener_for(index: usize, action: Action) -> Arc<dyn WebRequestListener> {
    Arc::new(FnListener(move |_stage: WebRequestStage, _details: &RequestDetails| match action {
        Action::Allow => BlockingResponse::Allow,
        Action::Cancel => BlockingResponse::Cancel,
        Action::Redirect => BlockingResponse::Redirect(redirect_target(index)),
    }))
}

fn request(url: &str) -> OutgoingRequest {
    OutgoingRequest {
        url: url.to_string(),
        method: "GET".to_string(),
        frame_id: 0,
        tab_id: 1,
        window_id: 1,
        resource_type: ResourceType::Script,
        request_headers: Vec::new(),
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Property: a request is blocked exactly when a blocking listener cancels it;
    // otherwise the URL is the last blocking redirect, and non-blocking answers are ignored.
    #[test]
    fn outcome_follows_blocking_listeners(chain in proptest::collection::vec((any::<bool>(), arb_action()), 0..8)) {
        let interceptor = WebRequestInterceptor::new();
        for (index, (blocking, action)) in chain.iter().enumerate() {
            interceptor
                .add_listener(ListenerSpec {
                    extension_id: format!("ext{}", index),
                    stage: WebRequestStage::BeforeRequest,
                    filter: RequestFilter {
                        urls: vec!["<all_urls>".to_string()],
                        ..RequestFilter::default()
                    },
                    blocking: *blocking,
                    host_scope: None,
                    listener: listener_for(index, *action),
                })
                .unwrap();
        }

        let original = "https://origin.test/app.js";
        let disposition = block_on(interceptor.begin_request(request(original)));

        let mut expected_url = original.to_string();
        let mut expect_blocked = false;
        for (index, (blocking, action)) in chain.iter().enumerate() {
            if !blocking {
                continue;
            }
            match action {
                Action::Allow => {}
                Action::Cancel => {
                    expect_blocked = true;
                    break;
                }
                Action::Redirect => expected_url = redirect_target(index),
            }
        }

        match disposition {
            RequestDisposition::Blocked { .. } => {
                prop_assert!(expect_blocked);
                prop_assert_eq!(interceptor.in_flight_count(), 0);
            }
            RequestDisposition::Proceed { url, .. } => {
                prop_assert!(!expect_blocked);
                prop_assert_eq!(url, expected_url);
                prop_assert_eq!(interceptor.in_flight_count(), 1);
            }
        }
    }

    // Property: request ids are unique and increasing within one interceptor.
    #[test]
    fn request_ids_strictly_increase(count in 1usize..20) {
        let interceptor = WebRequestInterceptor::new();
        let ids: Vec<u64> = block_on(async {
            let mut ids = Vec::new();
            for i in 0..count {
                let url = format!("https://site{}.test/", i);
                ids.push(interceptor.begin_request(request(&url)).await.request_id());
            }
            ids
        });
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
