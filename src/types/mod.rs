// Extension host shared type definitions
// Each submodule defines types used across the runtime.

pub mod api;
pub mod config;
pub mod errors;
pub mod extension;
pub mod manifest;
pub mod message;
pub mod permission;
pub mod storage;
pub mod tab;
pub mod web_request;
