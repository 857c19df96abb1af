//! Extension host RPC server: JSON-RPC over stdin/stdout for shell integration.
//!
//! Protocol: one JSON object per line (newline-delimited JSON).
//! Request:  {"id":1, "method":"extension.install", "params":{"path":"..."}}
//! Response: {"id":1, "result":{...}} or {"id":1, "error":"..."}
//! Runtime → shell: {"event":"host.request","request_id":7,"kind":"tabs.query",...},
//! answered with {"method":"host.reply","params":{"request_id":7,"result":...}}.
//! Logs go to stderr; stdout carries only protocol lines.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use extension_host::app::App;
use extension_host::rpc_handler::{handle_method, ShellBridge};
use extension_host::services::config_engine::{ConfigEngine, ConfigEngineTrait};
use extension_host::types::config::RuntimeConfig;

const LOG_ENV: &str = "EXTHOST_LOG";

/// Simple rate limiter: max requests per second.
struct RateLimiter {
    window_start: Instant,
    request_count: u32,
    max_per_second: u32,
}

impl RateLimiter {
    fn new(max_per_second: u32) -> Self {
        Self { window_start: Instant::now(), request_count: 0, max_per_second }
    }

    /// Returns true if the request is allowed, false if rate-limited.
    fn check(&mut self) -> bool {
        if self.window_start.elapsed().as_secs() >= 1 {
            self.window_start = Instant::now();
            self.request_count = 0;
        }
        self.request_count += 1;
        self.request_count <= self.max_per_second
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn load_config() -> RuntimeConfig {
    let mut engine = ConfigEngine::new(None);
    match engine.load() {
        Ok(config) => config,
        Err(e) => {
            error!(target: "rpc", path = %engine.config_path().display(), error = %e, "config unreadable; using defaults");
            RuntimeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let config = load_config();

    // Single writer so lines from concurrent tasks never interleave.
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let bridge = Arc::new(
        ShellBridge::new(lines_tx.clone(), config.callback_timeout()).with_prompt_timeout(config.prompt_timeout()),
    );
    let app = match App::new(config, bridge.collaborators()) {
        Ok(app) => Arc::new(app),
        Err(e) => {
            error!(target: "rpc", error = %e, "failed to initialize extension host");
            let _ = lines_tx.send(json!({"event":"fatal","error":e.to_string()}).to_string());
            drop(lines_tx);
            let _ = writer.await;
            std::process::exit(1);
        }
    };

    match app.runtime.subscribe().await {
        Ok((_, mut events)) => {
            let lines = lines_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let _ = lines.send(json!({"event":"extension.event","data":event}).to_string());
                }
            });
        }
        Err(e) => warn!(target: "rpc", error = %e, "lifecycle events unavailable"),
    }

    let startup = match app.startup().await {
        Ok(report) => serde_json::to_value(&report).unwrap_or(Value::Null),
        Err(e) => {
            error!(target: "rpc", error = %e, "startup failed");
            Value::Null
        }
    };

    // Signal ready
    let _ = lines_tx.send(json!({"event":"ready","version":env!("CARGO_PKG_VERSION"),"startup":startup}).to_string());

    // Max 200 RPC requests per second.
    let mut rate_limiter = RateLimiter::new(200);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(target: "rpc", error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let _ = lines_tx.send(json!({"id":null,"error":format!("parse error: {}", e)}).to_string());
                continue;
            }
        };

        let id = req.get("id").cloned().unwrap_or(Value::Null);
        let method = req.get("method").and_then(|v| v.as_str()).unwrap_or("").to_string();

        // Replies to our own requests are never throttled.
        if method != "host.reply" && !rate_limiter.check() {
            let _ = lines_tx.send(json!({"id": id, "error": "rate limit exceeded"}).to_string());
            continue;
        }

        let params = req.get("params").cloned().unwrap_or(json!({}));
        let app = Arc::clone(&app);
        let bridge = Arc::clone(&bridge);
        let lines = lines_tx.clone();
        tokio::spawn(async move {
            let response = match handle_method(&app, &bridge, &method, &params).await {
                Ok(val) => json!({"id": id, "result": val}),
                Err(err) => json!({"id": id, "error": err}),
            };
            let _ = lines.send(response.to_string());
        });
    }

    info!(target: "rpc", "stdin closed; shutting down");
    app.shutdown().await;
    drop(lines_tx);
    drop(bridge);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), writer).await;
}
