// Extension host services
// Services provide the runtime proper: manifests, content scripts, script hosts, messaging, storage, web requests.

pub mod background_host;
pub mod config_engine;
pub mod content_matcher;
pub mod extension_files;
pub mod extension_runtime;
pub mod listener_registry;
pub mod manifest_parser;
pub mod message_router;
pub mod storage_engine;
#[cfg(feature = "network")]
pub mod store_installer;
pub mod web_request;
