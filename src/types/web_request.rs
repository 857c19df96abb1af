use serde::{Deserialize, Serialize};

/// Kind of resource a request loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    Stylesheet,
    Script,
    Image,
    Font,
    Object,
    Xmlhttprequest,
    Ping,
    Media,
    Websocket,
    Other,
}

impl Default for ResourceType {
    fn default() -> Self {
        ResourceType::Other
    }
}

/// Name/value pair. Names compare case-insensitively when merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Which requests a listener wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFilter {
    pub urls: Vec<String>,
    #[serde(default)]
    pub types: Option<Vec<ResourceType>>,
    #[serde(default)]
    pub tab_id: Option<i64>,
    #[serde(default)]
    pub window_id: Option<i64>,
}

/// Pipeline stage a listener is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebRequestStage {
    #[serde(rename = "onBeforeRequest")]
    BeforeRequest,
    #[serde(rename = "onBeforeSendHeaders")]
    BeforeSendHeaders,
    #[serde(rename = "onResponseStarted")]
    ResponseStarted,
    #[serde(rename = "onCompleted")]
    Completed,
    #[serde(rename = "onErrorOccurred")]
    ErrorOccurred,
}

impl WebRequestStage {
    pub fn event_name(self) -> &'static str {
        match self {
            WebRequestStage::BeforeRequest => "onBeforeRequest",
            WebRequestStage::BeforeSendHeaders => "onBeforeSendHeaders",
            WebRequestStage::ResponseStarted => "onResponseStarted",
            WebRequestStage::Completed => "onCompleted",
            WebRequestStage::ErrorOccurred => "onErrorOccurred",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "onBeforeRequest" => Some(WebRequestStage::BeforeRequest),
            "onBeforeSendHeaders" => Some(WebRequestStage::BeforeSendHeaders),
            "onResponseStarted" => Some(WebRequestStage::ResponseStarted),
            "onCompleted" => Some(WebRequestStage::Completed),
            "onErrorOccurred" => Some(WebRequestStage::ErrorOccurred),
            _ => None,
        }
    }

    /// Stages whose listener decisions can alter the request.
    pub fn can_block(self) -> bool {
        matches!(
            self,
            WebRequestStage::BeforeRequest | WebRequestStage::BeforeSendHeaders
        )
    }
}

/// A request as the network layer hands it to the interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub frame_id: i64,
    #[serde(default = "default_tab")]
    pub tab_id: i64,
    #[serde(default = "default_tab")]
    pub window_id: i64,
    #[serde(default, rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub request_headers: Vec<HttpHeader>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_tab() -> i64 {
    -1
}

/// In-flight record tracked between `begin_request` and completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebRequestRecord {
    pub request_id: u64,
    pub url: String,
    pub method: String,
    pub frame_id: i64,
    pub tab_id: i64,
    pub window_id: i64,
    pub resource_type: ResourceType,
    pub timestamp: i64,
    pub request_headers: Vec<HttpHeader>,
    pub status_code: Option<u16>,
    pub response_headers: Vec<HttpHeader>,
    pub error: Option<String>,
}

impl WebRequestRecord {
    pub fn details(&self) -> RequestDetails {
        RequestDetails {
            request_id: self.request_id.to_string(),
            url: self.url.clone(),
            method: self.method.clone(),
            frame_id: self.frame_id,
            tab_id: self.tab_id,
            window_id: self.window_id,
            resource_type: self.resource_type,
            time_stamp: self.timestamp,
            request_headers: if self.request_headers.is_empty() {
                None
            } else {
                Some(self.request_headers.clone())
            },
            status_code: self.status_code,
            response_headers: if self.response_headers.is_empty() {
                None
            } else {
                Some(self.response_headers.clone())
            },
            error: self.error.clone(),
        }
    }
}

/// Snapshot passed to listeners, shaped like the `details` object scripts receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDetails {
    pub request_id: String,
    pub url: String,
    pub method: String,
    pub frame_id: i64,
    pub tab_id: i64,
    pub window_id: i64,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub time_stamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Vec<HttpHeader>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<HttpHeader>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A listener's decision for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum BlockingResponse {
    #[default]
    Allow,
    Cancel,
    Redirect(String),
    ModifyHeaders(Vec<HttpHeader>),
}

impl BlockingResponse {
    /// Reads the object a script listener returns (`{cancel}`, `{redirectUrl}`, `{requestHeaders}`).
    pub fn from_script_value(value: &serde_json::Value) -> Self {
        let Some(obj) = value.as_object() else {
            return BlockingResponse::Allow;
        };
        if obj.get("cancel").and_then(|v| v.as_bool()).unwrap_or(false) {
            return BlockingResponse::Cancel;
        }
        if let Some(url) = obj.get("redirectUrl").and_then(|v| v.as_str()) {
            return BlockingResponse::Redirect(url.to_string());
        }
        if let Some(headers) = obj.get("requestHeaders") {
            if let Ok(list) = serde_json::from_value::<Vec<HttpHeader>>(headers.clone()) {
                return BlockingResponse::ModifyHeaders(list);
            }
        }
        BlockingResponse::Allow
    }
}

/// What the network layer should do with a request after the before-stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum RequestDisposition {
    Proceed {
        request_id: u64,
        url: String,
        headers: Vec<HttpHeader>,
    },
    Blocked {
        request_id: u64,
    },
}

impl RequestDisposition {
    pub fn request_id(&self) -> u64 {
        match self {
            RequestDisposition::Proceed { request_id, .. }
            | RequestDisposition::Blocked { request_id } => *request_id,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, RequestDisposition::Blocked { .. })
    }
}

/// Reported by the network layer when the response arrives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInfo {
    pub status_code: u16,
    #[serde(default)]
    pub response_headers: Vec<HttpHeader>,
}

pub const ERR_BLOCKED_BY_CLIENT: &str = "net::ERR_BLOCKED_BY_CLIENT";
/// Reported for requests the network layer never finished.
pub const ERR_TIMED_OUT: &str = "net::ERR_TIMED_OUT";
