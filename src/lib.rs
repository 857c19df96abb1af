//! Extension host: a multi-tenant runtime for browser extensions.
//!
//! Parses manifests, arbitrates permissions, runs background scripts in
//! isolated script contexts, injects content scripts, routes messages and
//! intercepts web requests. The embedding shell supplies page rendering,
//! tabs and dialogs through the contracts in [`host`].

pub mod app;
pub mod database;
pub mod host;
pub mod managers;
pub mod services;
pub mod rpc_handler;
pub mod types;
