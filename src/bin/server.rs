//! Shard KV server binary
//!
//! Runs a single replica group over the in-memory commit log with the HTTP
//! client API. A real deployment would wire a replicated log module behind
//! the same `CommitLog` seam.
//!
//! Usage: shard-kv-server --gid <GROUP_ID> --port <PORT> [--max-log-size N] [--request-timeout-ms N]
//!
//! Options:
//!   --max-log-size N          Snapshot once the log passes 80% of N bytes (default: disabled)
//!   --request-timeout-ms N    Per-request commit wait (default: 1000)

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use shard_kv::api::client_http::create_router;
use shard_kv::core::config::KvConfig;
use shard_kv::core::kv_server::ShardKvServer;
use shard_kv::log::memory::MemoryLog;

fn parse_args() -> (u64, u16, KvConfig) {
    let args: Vec<String> = env::args().collect();

    let mut gid: u64 = 1;
    let mut port: Option<u16> = None;
    let mut config = KvConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--gid" => {
                gid = args[i + 1].parse().expect("Invalid group ID");
                i += 2;
            }
            "--port" => {
                port = Some(args[i + 1].parse().expect("Invalid port"));
                i += 2;
            }
            "--max-log-size" => {
                let max: u64 = args[i + 1].parse().expect("Invalid max log size");
                config = config.with_max_log_size(Some(max));
                i += 2;
            }
            "--request-timeout-ms" => {
                let ms: u64 = args[i + 1].parse().expect("Invalid request timeout");
                config = config.with_request_timeout(Duration::from_millis(ms));
                i += 2;
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                i += 1;
            }
        }
    }

    let port = port.expect("--port is required");
    (gid, port, config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (gid, port, config) = parse_args();

    let (log, apply_rx) = MemoryLog::new();
    let server = ShardKvServer::new(gid, log, apply_rx, config);
    let handle = server.start();

    let app = create_router(handle);

    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();
    info!(gid, %addr, "shard KV server listening");
    info!("  POST /kv/get        - linearizable read");
    info!("  POST /kv/put_append - replicated write");
    info!("  GET  /kv/status     - replica status");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
