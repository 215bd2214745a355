//! Client-facing server for one replica of the group
//!
//! An RPC handler builds a command, submits it to the log, and blocks on a
//! one-shot channel until the apply engine correlates the commit back to it
//! (or the request times out). Handlers never touch shard state directly.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::command::{Command, Operation, NUM_SHARDS};
use super::config::KvConfig;
use super::correlator::{RequestKey, RequestOutcome};
use super::engine::{ApplyEngine, GroupState, SharedGroupState};
use super::shard::ApplyOutput;
use crate::log::{AppendError, ApplyMsg, CommitLog};

/// Why a submitted operation did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// This replica is not the log leader; retry against another replica
    NotLeader,
    /// The shard is not assigned to this group under the current config
    WrongGroup,
    /// The commit did not arrive within the request timeout
    RequestTimeout,
    /// A different command committed past this submission's position
    Superseded,
    /// The sequence number ran ahead of the client's next expected one
    UnorderedSequence,
    /// The replica stopped serving
    ShuttingDown,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::NotLeader => write!(f, "not the leader"),
            SubmitError::WrongGroup => write!(f, "shard not owned by this group"),
            SubmitError::RequestTimeout => write!(f, "request timed out"),
            SubmitError::Superseded => write!(f, "submission superseded before commit"),
            SubmitError::UnorderedSequence => write!(f, "sequence number out of order"),
            SubmitError::ShuttingDown => write!(f, "replica shutting down"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Externally visible state of a replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub gid: u64,
    pub config_num: u64,
    pub last_applied: u64,
    pub pending_requests: usize,
}

/// One replica's server: the apply engine plus its client-facing handle
pub struct ShardKvServer {
    engine: ApplyEngine,
    handle: ShardKvHandle,
}

impl ShardKvServer {
    /// Wire a server to its log module and commit stream
    pub fn new(
        gid: u64,
        log: Arc<dyn CommitLog>,
        apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
        config: KvConfig,
    ) -> Self {
        let state: SharedGroupState = Arc::new(Mutex::new(GroupState::new(gid)));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let engine = ApplyEngine::new(
            Arc::clone(&state),
            Arc::clone(&log),
            apply_rx,
            shutdown_rx,
            config.clone(),
        );
        let handle = ShardKvHandle {
            gid,
            state,
            log,
            config,
            shutdown_tx,
        };
        ShardKvServer { engine, handle }
    }

    /// Start the apply engine and return the handle for client operations
    pub fn start(self) -> ShardKvHandle {
        tokio::spawn(self.engine.run());
        self.handle
    }
}

/// Handle for submitting client operations to a running replica
#[derive(Clone)]
pub struct ShardKvHandle {
    gid: u64,
    state: SharedGroupState,
    log: Arc<dyn CommitLog>,
    config: KvConfig,
    shutdown_tx: mpsc::Sender<()>,
}

impl ShardKvHandle {
    /// Linearizable read; Ok(None) means the key is absent
    pub async fn get(
        &self,
        key: String,
        client_id: u64,
        shard_id: usize,
        sequence: u64,
    ) -> Result<Option<String>, SubmitError> {
        self.check_shard(shard_id)?;
        let command = Command {
            op: Operation::Get { key },
            client_id,
            shard_id,
            sequence,
        };
        match self.submit(command).await? {
            ApplyOutput::Value(value) => Ok(value),
            _ => Ok(None),
        }
    }

    /// Replicated write: set the key to the value
    pub async fn put(
        &self,
        key: String,
        value: String,
        client_id: u64,
        shard_id: usize,
        sequence: u64,
    ) -> Result<(), SubmitError> {
        self.check_shard(shard_id)?;
        let command = Command {
            op: Operation::Put { key, value },
            client_id,
            shard_id,
            sequence,
        };
        self.submit(command).await.map(|_| ())
    }

    /// Replicated write: concatenate the value onto the key
    pub async fn append(
        &self,
        key: String,
        value: String,
        client_id: u64,
        shard_id: usize,
        sequence: u64,
    ) -> Result<(), SubmitError> {
        self.check_shard(shard_id)?;
        let command = Command {
            op: Operation::Append { key, value },
            client_id,
            shard_id,
            sequence,
        };
        self.submit(command).await.map(|_| ())
    }

    /// Append to the log and wait for the commit to be correlated back
    async fn submit(&self, command: Command) -> Result<ApplyOutput, SubmitError> {
        let submitted = command.clone();
        let position = match self.log.append(command).await {
            Ok(position) => position,
            Err(AppendError::NotLeader) => return Err(SubmitError::NotLeader),
        };
        let key = RequestKey {
            term: position.term,
            index: position.index,
        };

        let receiver = {
            let mut state = self.state.lock().unwrap();
            if state.last_applied >= position.index {
                // The commit outran this registration; answer from dedup state
                return match state.completed(&submitted) {
                    Some(output) => Ok(output),
                    None => Err(SubmitError::Superseded),
                };
            }
            state.pending.register(key)
        };

        match timeout(self.config.request_timeout, receiver).await {
            Ok(Ok(RequestOutcome::Applied(ApplyOutput::Unordered))) => {
                Err(SubmitError::UnorderedSequence)
            }
            Ok(Ok(RequestOutcome::Applied(output))) => Ok(output),
            Ok(Ok(RequestOutcome::Superseded)) => Err(SubmitError::Superseded),
            Ok(Ok(RequestOutcome::ShuttingDown)) => Err(SubmitError::ShuttingDown),
            // Sender dropped without resolving: the engine is gone
            Ok(Err(_)) => Err(SubmitError::ShuttingDown),
            Err(_) => {
                // Stop waiting AND remove the record, or the table would
                // grow without bound and a late commit would signal nobody
                self.state.lock().unwrap().pending.cancel(key);
                Err(SubmitError::RequestTimeout)
            }
        }
    }

    fn check_shard(&self, shard_id: usize) -> Result<(), SubmitError> {
        if shard_id >= NUM_SHARDS {
            return Err(SubmitError::WrongGroup);
        }
        let state = self.state.lock().unwrap();
        if !state.config.owns(self.gid, shard_id) {
            return Err(SubmitError::WrongGroup);
        }
        Ok(())
    }

    pub fn status(&self) -> GroupStatus {
        let state = self.state.lock().unwrap();
        GroupStatus {
            gid: self.gid,
            config_num: state.config.num,
            last_applied: state.last_applied,
            pending_requests: state.pending.len(),
        }
    }

    /// Read a value directly from shard state, bypassing the log
    /// (inspection and tests only; not linearizable)
    pub fn peek(&self, shard_id: usize, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .shards
            .get(shard_id)
            .and_then(|shard| shard.kvs.get(key).cloned())
    }

    /// Stop the apply engine; in-flight waiters resolve as shutting down
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}
