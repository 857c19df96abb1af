//! Staged web request interception.
//!
//! Every request passes `beforeRequest` and `beforeSendHeaders` before the
//! network layer sends it; `responseStarted`, `completed` and `errorOccurred`
//! are reported afterwards. Listeners of one stage run one after another in
//! registration order, on the task that issued the request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::services::content_matcher::MatchPattern;
use crate::services::listener_registry::{ListenerRegistry, SubscriptionHandle};
use crate::types::errors::ManifestError;
use crate::types::web_request::{
    BlockingResponse, HttpHeader, OutgoingRequest, RequestDetails, RequestDisposition, RequestFilter,
    ResponseInfo, WebRequestRecord, WebRequestStage, ERR_BLOCKED_BY_CLIENT, ERR_TIMED_OUT,
};

/// Receives stage notifications for the requests its filter selects.
#[async_trait]
pub trait WebRequestListener: Send + Sync {
    async fn handle(&self, stage: WebRequestStage, details: &RequestDetails) -> BlockingResponse;
}

/// Adapts a plain closure into a listener.
pub struct FnListener<F>(pub F);

#[async_trait]
impl<F> WebRequestListener for FnListener<F>
where
    F: Fn(WebRequestStage, &RequestDetails) -> BlockingResponse + Send + Sync,
{
    async fn handle(&self, stage: WebRequestStage, details: &RequestDetails) -> BlockingResponse {
        (self.0)(stage, details)
    }
}

/// Everything needed to attach one listener.
pub struct ListenerSpec {
    pub extension_id: String,
    pub stage: WebRequestStage,
    pub filter: RequestFilter,
    /// Decisions are honoured only for blocking listeners.
    pub blocking: bool,
    /// When set, the listener only sees URLs matching one of these host patterns.
    pub host_scope: Option<Vec<String>>,
    pub listener: Arc<dyn WebRequestListener>,
}

struct Registration {
    stage: WebRequestStage,
    filter: RequestFilter,
    urls: Vec<MatchPattern>,
    blocking: bool,
    host_scope: Option<Vec<MatchPattern>>,
    listener: Arc<dyn WebRequestListener>,
}

impl Registration {
    fn selects(&self, record: &WebRequestRecord) -> bool {
        if !self.urls.is_empty() && !self.urls.iter().any(|p| p.matches(&record.url)) {
            return false;
        }
        if let Some(types) = &self.filter.types {
            if !types.contains(&record.resource_type) {
                return false;
            }
        }
        if let Some(tab_id) = self.filter.tab_id {
            if tab_id != record.tab_id {
                return false;
            }
        }
        if let Some(window_id) = self.filter.window_id {
            if window_id != record.window_id {
                return false;
            }
        }
        match &self.host_scope {
            Some(scope) => scope.iter().any(|p| p.matches(&record.url)),
            None => true,
        }
    }
}

/// The interception pipeline shared by the network layer and the router.
pub struct WebRequestInterceptor {
    next_request_id: AtomicU64,
    listeners: RwLock<ListenerRegistry<Arc<Registration>>>,
    in_flight: Mutex<HashMap<u64, WebRequestRecord>>,
}

impl Default for WebRequestInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl WebRequestInterceptor {
    pub fn new() -> Self {
        Self {
            next_request_id: AtomicU64::new(1),
            listeners: RwLock::new(ListenerRegistry::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_listener(&self, spec: ListenerSpec) -> Result<SubscriptionHandle, ManifestError> {
        let urls = spec
            .filter
            .urls
            .iter()
            .map(|p| MatchPattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        let host_scope = match spec.host_scope {
            Some(patterns) => Some(
                patterns
                    .iter()
                    .map(|p| MatchPattern::compile(p))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };
        let registration = Arc::new(Registration {
            stage: spec.stage,
            filter: spec.filter,
            urls,
            blocking: spec.blocking && spec.stage.can_block(),
            host_scope,
            listener: spec.listener,
        });
        let handle = self.write_listeners().add(&spec.extension_id, registration);
        debug!(target: "web_request", extension_id = %spec.extension_id, stage = spec.stage.event_name(), %handle, "listener added");
        Ok(handle)
    }

    pub fn remove_listener(&self, handle: SubscriptionHandle) -> bool {
        self.write_listeners().remove(handle).is_some()
    }

    /// Drops every listener an extension registered.
    pub fn remove_extension(&self, extension_id: &str) -> usize {
        self.write_listeners().remove_owner(extension_id)
    }

    pub fn listener_count(&self, extension_id: &str) -> usize {
        self.read_listeners().count_owner(extension_id)
    }

    pub fn owner_of(&self, handle: SubscriptionHandle) -> Option<String> {
        self.read_listeners().owner(handle).map(str::to_string)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Runs the before-stages and decides whether the request may be sent.
    pub async fn begin_request(&self, request: OutgoingRequest) -> RequestDisposition {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let mut record = WebRequestRecord {
            request_id,
            url: request.url,
            method: request.method,
            frame_id: request.frame_id,
            tab_id: request.tab_id,
            window_id: request.window_id,
            resource_type: request.resource_type,
            timestamp: now_ms(),
            request_headers: request.request_headers,
            status_code: None,
            response_headers: Vec::new(),
            error: None,
        };

        let blocked = self.run_before_stage(WebRequestStage::BeforeRequest, &mut record).await
            || self.run_before_stage(WebRequestStage::BeforeSendHeaders, &mut record).await;

        if blocked {
            record.error = Some(ERR_BLOCKED_BY_CLIENT.to_string());
            debug!(target: "web_request", request_id, url = %record.url, "request blocked");
            self.notify(WebRequestStage::ErrorOccurred, &record).await;
            return RequestDisposition::Blocked { request_id };
        }

        let disposition = RequestDisposition::Proceed {
            request_id,
            url: record.url.clone(),
            headers: record.request_headers.clone(),
        };
        self.lock_in_flight().insert(request_id, record);
        disposition
    }

    /// Records the response status and notifies observers. `false` for unknown ids.
    pub async fn response_started(&self, request_id: u64, response: ResponseInfo) -> bool {
        let snapshot = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get_mut(&request_id) {
                Some(record) => {
                    record.status_code = Some(response.status_code);
                    record.response_headers = response.response_headers;
                    record.clone()
                }
                None => return false,
            }
        };
        self.notify(WebRequestStage::ResponseStarted, &snapshot).await;
        true
    }

    /// Notifies completion and discards the record.
    pub async fn completed(&self, request_id: u64) -> bool {
        let Some(record) = self.lock_in_flight().remove(&request_id) else {
            return false;
        };
        self.notify(WebRequestStage::Completed, &record).await;
        true
    }

    /// Notifies a terminal network error and discards the record.
    pub async fn error_occurred(&self, request_id: u64, error: &str) -> bool {
        let Some(mut record) = self.lock_in_flight().remove(&request_id) else {
            return false;
        };
        record.error = Some(error.to_string());
        self.notify(WebRequestStage::ErrorOccurred, &record).await;
        true
    }

    /// Fails every request started more than `max_age` before `now_ms` with
    /// `net::ERR_TIMED_OUT`. The router calls this on each sweep tick.
    pub async fn expire_stale(&self, now_ms: i64, max_age: Duration) -> usize {
        let cutoff = now_ms.saturating_sub(max_age.as_millis() as i64);
        let stale: Vec<WebRequestRecord> = {
            let mut in_flight = self.lock_in_flight();
            let ids: Vec<u64> = in_flight
                .values()
                .filter(|record| record.timestamp <= cutoff)
                .map(|record| record.request_id)
                .collect();
            ids.iter().filter_map(|id| in_flight.remove(id)).collect()
        };
        let count = stale.len();
        for mut record in stale {
            debug!(target: "web_request", request_id = record.request_id, url = %record.url, "request never finished; expiring");
            record.error = Some(ERR_TIMED_OUT.to_string());
            self.notify(WebRequestStage::ErrorOccurred, &record).await;
        }
        count
    }

    /// Returns `true` when a blocking listener cancelled the request.
    async fn run_before_stage(&self, stage: WebRequestStage, record: &mut WebRequestRecord) -> bool {
        for registration in self.listeners_for(stage) {
            // Filters see the URL as rewritten by earlier listeners
            if !registration.selects(record) {
                continue;
            }
            let response = registration.listener.handle(stage, &record.details()).await;
            if !registration.blocking {
                continue;
            }
            match (stage, response) {
                (_, BlockingResponse::Allow) => {}
                (_, BlockingResponse::Cancel) => return true,
                (WebRequestStage::BeforeRequest, BlockingResponse::Redirect(url)) => {
                    debug!(target: "web_request", request_id = record.request_id, from = %record.url, to = %url, "redirect");
                    record.url = url;
                }
                (WebRequestStage::BeforeSendHeaders, BlockingResponse::ModifyHeaders(headers)) => {
                    merge_headers(&mut record.request_headers, headers);
                }
                (stage, other) => {
                    warn!(target: "web_request", stage = stage.event_name(), ?other, "response not allowed at this stage; ignored");
                }
            }
        }
        false
    }

    async fn notify(&self, stage: WebRequestStage, record: &WebRequestRecord) {
        let details = record.details();
        for registration in self.listeners_for(stage) {
            if registration.selects(record) {
                let _ = registration.listener.handle(stage, &details).await;
            }
        }
    }

    fn listeners_for(&self, stage: WebRequestStage) -> Vec<Arc<Registration>> {
        self.read_listeners()
            .iter()
            .filter(|(_, _, r)| r.stage == stage)
            .map(|(_, _, r)| Arc::clone(r))
            .collect()
    }

    fn read_listeners(&self) -> std::sync::RwLockReadGuard<'_, ListenerRegistry<Arc<Registration>>> {
        self.listeners.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_listeners(&self) -> std::sync::RwLockWriteGuard<'_, ListenerRegistry<Arc<Registration>>> {
        self.listeners.write().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<u64, WebRequestRecord>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Applies `updates` over `headers`; names compare case-insensitively and the update wins.
pub fn merge_headers(headers: &mut Vec<HttpHeader>, updates: Vec<HttpHeader>) {
    for update in updates {
        match headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(&update.name))
        {
            Some(existing) => *existing = update,
            None => headers.push(update),
        }
    }
}

/// Milliseconds since the Unix epoch, the clock request timestamps use.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
