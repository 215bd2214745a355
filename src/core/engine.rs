//! Apply engine: the sole consumer of the commit stream
//!
//! One task drains the log's commit notifications strictly in commit order.
//! That order is the only source of linearizability for the key/value state:
//! nothing else mutates the shards. Each applied commit resolves the
//! request correlator and may trigger a snapshot of the full group state.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::command::{Command, GroupConfig, Operation, NUM_SHARDS};
use super::config::KvConfig;
use super::correlator::{PendingTable, RequestKey};
use super::shard::{ApplyOutput, ShardState};
use super::snapshot::{SnapshotBlob, SnapshotError};
use crate::log::{ApplyMsg, CommitLog};

/// All mutable state of one replica, behind a single lock
///
/// RPC handlers never touch this directly; they go through the submission
/// path, which only reaches the pending table.
#[derive(Debug)]
pub struct GroupState {
    pub gid: u64,
    /// One state machine per shard, indexed by shard id
    pub shards: Vec<ShardState>,
    /// Highest log index applied so far (0 before anything applied)
    pub last_applied: u64,
    /// Last known shard-to-group assignment
    pub config: GroupConfig,
    pub pending: PendingTable,
}

impl GroupState {
    pub fn new(gid: u64) -> Self {
        GroupState {
            gid,
            shards: (0..NUM_SHARDS).map(ShardState::new).collect(),
            last_applied: 0,
            config: GroupConfig::initial(gid),
            pending: PendingTable::new(),
        }
    }

    /// Install a shard assignment if it supersedes the current one
    fn install_config(&mut self, config: &GroupConfig) -> ApplyOutput {
        if config.num > self.config.num {
            for shard in &mut self.shards {
                if config.owns(self.gid, shard.shard_id) && config.num > shard.config_num {
                    shard.config_num = config.num;
                }
            }
            self.config = config.clone();
        }
        ApplyOutput::Done
    }

    /// Answer for a command whose (client, sequence) has already been
    /// applied, reconstructed from the dedup state; None if not yet applied
    pub fn completed(&self, command: &Command) -> Option<ApplyOutput> {
        let shard = self.shards.get(command.shard_id)?;
        if !shard.applied(command.client_id, command.sequence) {
            return None;
        }
        match &command.op {
            Operation::Get { .. } => Some(ApplyOutput::Value(
                shard
                    .cached_read(command.client_id)
                    .and_then(|entry| entry.value.clone()),
            )),
            _ => Some(ApplyOutput::Done),
        }
    }
}

/// Shared reference to the group state
pub type SharedGroupState = Arc<Mutex<GroupState>>;

/// Conditions after which the replica cannot safely continue serving
#[derive(Debug, Clone, PartialEq)]
pub enum FatalError {
    /// The catch-up snapshot could not be decoded
    Snapshot(SnapshotError),
    /// A committed command targets a shard that does not exist
    ShardOutOfRange { shard_id: usize, index: u64 },
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::Snapshot(err) => write!(f, "snapshot install failed: {}", err),
            FatalError::ShardOutOfRange { shard_id, index } => {
                write!(
                    f,
                    "committed command at index {} targets unknown shard {}",
                    index, shard_id
                )
            }
        }
    }
}

impl std::error::Error for FatalError {}

/// Drains the commit stream and applies it to the group state
pub struct ApplyEngine {
    state: SharedGroupState,
    log: Arc<dyn CommitLog>,
    apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
    shutdown_rx: mpsc::Receiver<()>,
    config: KvConfig,
}

impl ApplyEngine {
    pub fn new(
        state: SharedGroupState,
        log: Arc<dyn CommitLog>,
        apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
        shutdown_rx: mpsc::Receiver<()>,
        config: KvConfig,
    ) -> Self {
        Self {
            state,
            log,
            apply_rx,
            shutdown_rx,
            config,
        }
    }

    /// Drain loop; runs until shutdown, stream close, or a fatal condition
    ///
    /// On exit every pending waiter is released as shutting down, so no
    /// submitter blocks past its own timeout.
    pub async fn run(mut self) {
        if let Some(fault) = self.drain().await {
            error!(error = %fault, "apply engine stopping, replica can no longer serve");
        }
        self.state.lock().unwrap().pending.drain();
    }

    async fn drain(&mut self) -> Option<FatalError> {
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    debug!("apply engine shut down");
                    return None;
                }
                msg = self.apply_rx.recv() => match msg {
                    Some(ApplyMsg::Command { term, index, command }) => {
                        match self.apply_command(term, index, command) {
                            Ok(Some((blob, covered_index))) => {
                                let log = Arc::clone(&self.log);
                                // Compaction runs off the drain path
                                tokio::spawn(async move {
                                    log.take_snapshot(blob, covered_index).await;
                                });
                            }
                            Ok(None) => {}
                            Err(fault) => return Some(fault),
                        }
                    }
                    Some(ApplyMsg::Snapshot { data }) => {
                        if let Err(fault) = self.install_snapshot(&data) {
                            return Some(fault);
                        }
                    }
                    None => return None,
                },
            }
        }
    }

    /// Apply one committed command; returns a due snapshot, if any
    fn apply_command(
        &self,
        term: u64,
        index: u64,
        command: Command,
    ) -> Result<Option<(Vec<u8>, u64)>, FatalError> {
        let mut state = self.state.lock().unwrap();

        let output = match &command.op {
            Operation::NewConfig { config } => state.install_config(config),
            Operation::Get { key } => {
                let shard = shard_mut(&mut state, command.shard_id, index)?;
                shard.read(command.client_id, command.sequence, key)
            }
            Operation::Put { key, value } => {
                let shard = shard_mut(&mut state, command.shard_id, index)?;
                shard.put(command.client_id, command.sequence, key, value)
            }
            Operation::Append { key, value } => {
                let shard = shard_mut(&mut state, command.shard_id, index)?;
                shard.append(command.client_id, command.sequence, key, value)
            }
        };

        state.last_applied = index;
        state.pending.resolve(RequestKey { term, index }, output);

        Ok(self.snapshot_if_due(&state))
    }

    /// Check the log size against the threshold and serialize if past it
    fn snapshot_if_due(&self, state: &GroupState) -> Option<(Vec<u8>, u64)> {
        let threshold = self.config.snapshot_threshold()?;
        if self.log.state_size() <= threshold {
            return None;
        }

        let blob = SnapshotBlob::new(state.shards.clone(), state.last_applied);
        match blob.encode() {
            Ok(data) => {
                info!(
                    covered_index = state.last_applied,
                    size = data.len(),
                    "log past snapshot threshold, compacting"
                );
                Some((data, state.last_applied))
            }
            Err(err) => {
                error!(error = %err, "snapshot encode failed, skipping compaction");
                None
            }
        }
    }

    /// Install a catch-up snapshot, guarding against regression
    fn install_snapshot(&self, data: &[u8]) -> Result<(), FatalError> {
        let blob = SnapshotBlob::decode(data).map_err(FatalError::Snapshot)?;

        let mut state = self.state.lock().unwrap();
        if blob.last_applied > state.last_applied {
            info!(
                from_index = state.last_applied,
                to_index = blob.last_applied,
                "installing snapshot"
            );
            state.shards = blob.shards;
            state.last_applied = blob.last_applied;
        } else {
            debug!(
                snapshot_index = blob.last_applied,
                last_applied = state.last_applied,
                "ignoring stale snapshot"
            );
        }
        Ok(())
    }
}

fn shard_mut(
    state: &mut GroupState,
    shard_id: usize,
    index: u64,
) -> Result<&mut ShardState, FatalError> {
    state
        .shards
        .get_mut(shard_id)
        .ok_or(FatalError::ShardOutOfRange { shard_id, index })
}
