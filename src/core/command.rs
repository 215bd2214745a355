//! Replicated commands and shard routing
//!
//! Every client operation (and every config change) becomes one `Command`
//! appended to the replicated log. Once appended, a command is immutable and
//! addressed by the (term, index) pair the log assigns it.

use serde::{Deserialize, Serialize};

/// Number of key shards jointly owned by all replica groups
pub const NUM_SHARDS: usize = 10;

/// Map a key to the shard that owns it
pub fn shard_for_key(key: &str) -> usize {
    match key.as_bytes().first() {
        Some(byte) => *byte as usize % NUM_SHARDS,
        None => 0,
    }
}

/// A single entry in the replicated log
///
/// The payload is a tagged variant per operation kind, so a committed
/// command can never carry a payload that doesn't match its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub op: Operation,
    /// Logical client that issued the operation
    pub client_id: u64,
    /// Shard the operation targets
    pub shard_id: usize,
    /// Per-client dedup sequence number (monotonic, one outstanding at a time)
    pub sequence: u64,
}

/// Operation kind with its typed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Get { key: String },
    Put { key: String, value: String },
    Append { key: String, value: String },
    /// Shard-assignment change (appended by the migration layer)
    NewConfig { config: GroupConfig },
}

/// Shard-to-group assignment at a given config version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Config version; higher numbers supersede lower ones
    pub num: u64,
    /// Owning group id per shard, indexed by shard id
    pub owner: [u64; NUM_SHARDS],
}

impl GroupConfig {
    /// Initial config: every shard assigned to the given group
    pub fn initial(gid: u64) -> Self {
        GroupConfig {
            num: 0,
            owner: [gid; NUM_SHARDS],
        }
    }

    /// Whether this config assigns `shard_id` to group `gid`
    pub fn owns(&self, gid: u64, shard_id: usize) -> bool {
        self.owner.get(shard_id).copied() == Some(gid)
    }
}
