//! Testing utilities for integration tests
//!
//! Provides `TestGroup` for spinning up one in-process replica group,
//! backed by the in-memory log, behind a real HTTP listener.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::client_http::{
    create_router, GetRequest, GetResponse, PutAppendRequest, PutAppendResponse, WriteOp,
};
use crate::core::command::shard_for_key;
use crate::core::config::KvConfig;
use crate::core::kv_server::{GroupStatus, ShardKvHandle, ShardKvServer};
use crate::log::memory::MemoryLog;

/// Group id the harness starts its replica under
pub const TEST_GID: u64 = 1;

/// One in-process replica group with an HTTP front end
pub struct TestGroup {
    /// HTTP address
    pub addr: SocketAddr,
    /// Handle for direct (non-HTTP) operations and inspection
    pub handle: ShardKvHandle,
    /// The backing log, for fault injection
    pub log: Arc<MemoryLog>,
    http_shutdown_tx: Option<oneshot::Sender<()>>,
    client: reqwest::Client,
}

impl TestGroup {
    /// Start a group with default config
    pub async fn start() -> Self {
        Self::with_config(KvConfig::default()).await
    }

    /// Start a group with custom config
    pub async fn with_config(config: KvConfig) -> Self {
        let (log, apply_rx) = MemoryLog::new();
        let server = ShardKvServer::new(TEST_GID, log.clone(), apply_rx, config);
        let handle = server.start();

        let app = create_router(handle.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = http_shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        TestGroup {
            addr,
            handle,
            log,
            http_shutdown_tx: Some(http_shutdown_tx),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Read a key over HTTP, routing it to its shard
    pub async fn http_get(&self, key: &str, client_id: u64, sequence: u64) -> GetResponse {
        let request = GetRequest {
            key: key.to_string(),
            client_id,
            shard_id: shard_for_key(key),
            sequence,
        };
        self.client
            .post(self.url("/kv/get"))
            .json(&request)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Write a key over HTTP, routing it to its shard
    pub async fn http_put_append(
        &self,
        key: &str,
        value: &str,
        op: WriteOp,
        client_id: u64,
        sequence: u64,
    ) -> PutAppendResponse {
        let request = PutAppendRequest {
            key: key.to_string(),
            value: value.to_string(),
            op,
            client_id,
            shard_id: shard_for_key(key),
            sequence,
        };
        self.client
            .post(self.url("/kv/put_append"))
            .json(&request)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Fetch replica status over HTTP
    pub async fn http_status(&self) -> GroupStatus {
        self.client
            .get(self.url("/kv/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Shut down the HTTP server and the apply engine
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.http_shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.shutdown().await;
    }
}
