//! Seam to the consensus/log-replication module
//!
//! This layer never talks to peers itself. It appends commands to an
//! external ordered log, consumes the log's commit-notification stream, and
//! hands back snapshots for compaction. Leader election, durability, and
//! replication all live behind this trait.

pub mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::core::command::Command;

/// Position the log assigned to an appended command
///
/// A (term, index) pair identifies at most one possible committed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub index: u64,
    pub term: u64,
}

/// One item of the commit-notification stream, delivered in commit order
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// A committed command at its (term, index) position
    Command {
        term: u64,
        index: u64,
        command: Command,
    },
    /// Catch-up via compaction: a full snapshot blob replaces log replay
    Snapshot { data: Vec<u8> },
}

/// Errors from appending to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendError {
    /// This replica is not the log leader; the client must retry elsewhere
    NotLeader,
}

impl fmt::Display for AppendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppendError::NotLeader => write!(f, "not the log leader"),
        }
    }
}

impl std::error::Error for AppendError {}

/// The ordered replicated log, as seen by the apply pipeline
///
/// Implementations push committed entries, in order, into the
/// `ApplyMsg` stream handed out at construction time.
#[async_trait]
pub trait CommitLog: Send + Sync {
    /// Append a command for replication
    /// Returns the assigned position, or NotLeader without touching state
    async fn append(&self, command: Command) -> Result<LogPosition, AppendError>;

    /// Hand a snapshot covering all entries up to `covered_index`
    /// The log discards those entries and serves the blob to lagging replicas
    async fn take_snapshot(&self, data: Vec<u8>, covered_index: u64);

    /// Current size of the log's replicated state, for the snapshot threshold
    fn state_size(&self) -> u64;
}
