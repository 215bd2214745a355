//! HTTP client API for a shard group replica
//!
//! Endpoints for external clients:
//! - Submit reads and writes to the group
//! - Query replica status
//!
//! Replies carry a wire status plus a wrong-leader flag so a retrying client
//! can distinguish "find the leader" from "give up or back off" without
//! parsing error bodies.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::kv_server::{GroupStatus, ShardKvHandle, SubmitError};

/// Wire status vocabulary shared with client libraries
pub const STATUS_OK: &str = "OK";
pub const STATUS_NO_KEY: &str = "ErrNoKey";
pub const STATUS_WRONG_GROUP: &str = "ErrWrongGroup";
pub const STATUS_REQUEST_TIMEOUT: &str = "ErrRequestTimeout";
pub const STATUS_WRONG_LEADER: &str = "ErrWrongLeader";
pub const STATUS_APPLY_FAIL: &str = "ErrApplyFail";
pub const STATUS_UNORDERED_SEQ: &str = "ErrUnorderedSeq";

/// Write flavor for the put_append endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put,
    Append,
}

/// Request body for a read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    pub client_id: u64,
    pub shard_id: usize,
    pub sequence: u64,
}

/// Response for a read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    pub wrong_leader: bool,
    pub status: String,
    /// Empty when the status is not OK
    pub value: String,
}

/// Request body for a write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendRequest {
    pub key: String,
    pub value: String,
    pub op: WriteOp,
    pub client_id: u64,
    pub shard_id: usize,
    pub sequence: u64,
}

/// Response for a write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendResponse {
    pub wrong_leader: bool,
    pub status: String,
}

fn error_reply(err: &SubmitError) -> (bool, &'static str) {
    match err {
        SubmitError::NotLeader => (true, STATUS_WRONG_LEADER),
        SubmitError::ShuttingDown => (true, STATUS_WRONG_LEADER),
        SubmitError::WrongGroup => (false, STATUS_WRONG_GROUP),
        SubmitError::RequestTimeout => (false, STATUS_REQUEST_TIMEOUT),
        SubmitError::Superseded => (false, STATUS_APPLY_FAIL),
        SubmitError::UnorderedSequence => (false, STATUS_UNORDERED_SEQ),
    }
}

/// Create the router for the client HTTP API
pub fn create_router(handle: ShardKvHandle) -> Router {
    Router::new()
        .route("/kv/get", post(handle_get))
        .route("/kv/put_append", post(handle_put_append))
        .route("/kv/status", get(handle_status))
        .with_state(handle)
}

/// Handle POST /kv/get - linearizable read through the log
pub async fn handle_get(
    State(handle): State<ShardKvHandle>,
    Json(request): Json<GetRequest>,
) -> Json<GetResponse> {
    let reply = match handle
        .get(
            request.key,
            request.client_id,
            request.shard_id,
            request.sequence,
        )
        .await
    {
        Ok(Some(value)) => GetResponse {
            wrong_leader: false,
            status: STATUS_OK.to_string(),
            value,
        },
        Ok(None) => GetResponse {
            wrong_leader: false,
            status: STATUS_NO_KEY.to_string(),
            value: String::new(),
        },
        Err(err) => {
            let (wrong_leader, status) = error_reply(&err);
            GetResponse {
                wrong_leader,
                status: status.to_string(),
                value: String::new(),
            }
        }
    };
    Json(reply)
}

/// Handle POST /kv/put_append - replicated write
pub async fn handle_put_append(
    State(handle): State<ShardKvHandle>,
    Json(request): Json<PutAppendRequest>,
) -> Json<PutAppendResponse> {
    let result = match request.op {
        WriteOp::Put => {
            handle
                .put(
                    request.key,
                    request.value,
                    request.client_id,
                    request.shard_id,
                    request.sequence,
                )
                .await
        }
        WriteOp::Append => {
            handle
                .append(
                    request.key,
                    request.value,
                    request.client_id,
                    request.shard_id,
                    request.sequence,
                )
                .await
        }
    };

    let reply = match result {
        Ok(()) => PutAppendResponse {
            wrong_leader: false,
            status: STATUS_OK.to_string(),
        },
        Err(err) => {
            let (wrong_leader, status) = error_reply(&err);
            PutAppendResponse {
                wrong_leader,
                status: status.to_string(),
            }
        }
    };
    Json(reply)
}

/// Handle GET /kv/status - replica introspection
pub async fn handle_status(State(handle): State<ShardKvHandle>) -> Json<GroupStatus> {
    Json(handle.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::shard_for_key;
    use crate::core::config::KvConfig;
    use crate::core::kv_server::ShardKvServer;
    use crate::log::memory::MemoryLog;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn test_app() -> (Router, ShardKvHandle, Arc<MemoryLog>) {
        let (log, apply_rx) = MemoryLog::new();
        let server = ShardKvServer::new(1, log.clone(), apply_rx, KvConfig::default());
        let handle = server.start();
        (create_router(handle.clone()), handle, log)
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_over_http() {
        let (app, _handle, _log) = test_app();
        let shard = shard_for_key("a");

        let put = PutAppendRequest {
            key: "a".to_string(),
            value: "1".to_string(),
            op: WriteOp::Put,
            client_id: 7,
            shard_id: shard,
            sequence: 0,
        };
        let response = app
            .clone()
            .oneshot(post_json("/kv/put_append", serde_json::to_string(&put).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reply: PutAppendResponse = read_json(response).await;
        assert_eq!(reply.status, STATUS_OK);
        assert!(!reply.wrong_leader);

        let get = GetRequest {
            key: "a".to_string(),
            client_id: 7,
            shard_id: shard,
            sequence: 1,
        };
        let response = app
            .oneshot(post_json("/kv/get", serde_json::to_string(&get).unwrap()))
            .await
            .unwrap();
        let reply: GetResponse = read_json(response).await;
        assert_eq!(reply.status, STATUS_OK);
        assert_eq!(reply.value, "1");
    }

    #[tokio::test]
    async fn test_get_missing_key_reports_no_key() {
        let (app, _handle, _log) = test_app();

        let get = GetRequest {
            key: "nope".to_string(),
            client_id: 7,
            shard_id: shard_for_key("nope"),
            sequence: 0,
        };
        let response = app
            .oneshot(post_json("/kv/get", serde_json::to_string(&get).unwrap()))
            .await
            .unwrap();
        let reply: GetResponse = read_json(response).await;
        assert_eq!(reply.status, STATUS_NO_KEY);
        assert_eq!(reply.value, "");
    }

    #[tokio::test]
    async fn test_not_leader_over_http() {
        let (app, _handle, log) = test_app();
        log.set_leader(false);

        let get = GetRequest {
            key: "a".to_string(),
            client_id: 7,
            shard_id: shard_for_key("a"),
            sequence: 0,
        };
        let response = app
            .oneshot(post_json("/kv/get", serde_json::to_string(&get).unwrap()))
            .await
            .unwrap();
        let reply: GetResponse = read_json(response).await;
        assert!(reply.wrong_leader);
        assert_eq!(reply.status, STATUS_WRONG_LEADER);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (app, handle, _log) = test_app();

        handle
            .put("a".to_string(), "1".to_string(), 7, shard_for_key("a"), 0)
            .await
            .unwrap();

        let request = Request::builder()
            .method("GET")
            .uri("/kv/status")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let status: GroupStatus = read_json(response).await;
        assert_eq!(status.gid, 1);
        assert_eq!(status.last_applied, 1);
        assert_eq!(status.pending_requests, 0);
    }
}
