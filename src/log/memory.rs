//! In-memory commit log
//!
//! A single-replica log that commits every append immediately onto the
//! apply stream. No durability, no peers. Used by unit and integration
//! tests, and by the standalone server binary.
//!
//! Test controls cover the failure modes the real log module produces:
//! losing leadership, term changes, withheld commits, and a different
//! command committing at a position a caller is waiting on.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{AppendError, ApplyMsg, CommitLog, LogPosition};
use crate::core::command::Command;

#[derive(Debug, Clone, Serialize)]
struct LogEntry {
    index: u64,
    term: u64,
    command: Command,
}

#[derive(Debug)]
struct Inner {
    term: u64,
    is_leader: bool,
    entries: Vec<LogEntry>,
    /// Index the next append will receive (1-based, survives truncation)
    next_index: u64,
    snapshot: Option<Vec<u8>>,
    hold_commits: bool,
    held: Vec<ApplyMsg>,
}

/// In-memory single-replica commit log
pub struct MemoryLog {
    inner: Mutex<Inner>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
}

impl MemoryLog {
    /// Create a log and the commit stream it feeds
    /// Starts as leader at term 1
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ApplyMsg>) {
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let log = MemoryLog {
            inner: Mutex::new(Inner {
                term: 1,
                is_leader: true,
                entries: Vec::new(),
                next_index: 1,
                snapshot: None,
                hold_commits: false,
                held: Vec::new(),
            }),
            apply_tx,
        };
        (Arc::new(log), apply_rx)
    }

    /// Toggle leadership
    pub fn set_leader(&self, is_leader: bool) {
        self.inner.lock().unwrap().is_leader = is_leader;
    }

    /// Bump the term, as a leadership change would; returns the new term
    pub fn advance_term(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.term += 1;
        inner.term
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock().unwrap().term
    }

    /// Buffer commits instead of delivering them
    pub fn hold_commits(&self, hold: bool) {
        self.inner.lock().unwrap().hold_commits = hold;
    }

    /// Deliver every buffered commit in order and stop holding
    pub fn release_held(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.hold_commits = false;
        for msg in inner.held.drain(..) {
            let _ = self.apply_tx.send(msg);
        }
    }

    /// Deliver a commit at an arbitrary position, as a new leader's log would
    pub fn commit_external(&self, term: u64, index: u64, command: Command) {
        let _ = self.apply_tx.send(ApplyMsg::Command {
            term,
            index,
            command,
        });
    }

    /// Deliver a snapshot on the commit stream (catch-up path)
    pub fn deliver_snapshot(&self, data: Vec<u8>) {
        let _ = self.apply_tx.send(ApplyMsg::Snapshot { data });
    }

    /// Most recent blob handed over via `take_snapshot`
    pub fn snapshot_blob(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().snapshot.clone()
    }

    /// Entries still held in the log (not yet compacted away)
    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[async_trait]
impl CommitLog for MemoryLog {
    async fn append(&self, command: Command) -> Result<LogPosition, AppendError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.is_leader {
            return Err(AppendError::NotLeader);
        }

        let position = LogPosition {
            index: inner.next_index,
            term: inner.term,
        };
        inner.next_index += 1;
        inner.entries.push(LogEntry {
            index: position.index,
            term: position.term,
            command: command.clone(),
        });

        let msg = ApplyMsg::Command {
            term: position.term,
            index: position.index,
            command,
        };
        if inner.hold_commits {
            inner.held.push(msg);
        } else {
            // Unbounded send under the lock keeps delivery in index order
            let _ = self.apply_tx.send(msg);
        }
        Ok(position)
    }

    async fn take_snapshot(&self, data: Vec<u8>, covered_index: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.snapshot = Some(data);
        inner.entries.retain(|entry| entry.index > covered_index);
    }

    fn state_size(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        serde_json::to_vec(&inner.entries)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::Operation;

    fn put(key: &str, value: &str, sequence: u64) -> Command {
        Command {
            op: Operation::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
            client_id: 1,
            shard_id: 0,
            sequence,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_indices() {
        let (log, mut apply_rx) = MemoryLog::new();

        let first = log.append(put("a", "1", 0)).await.unwrap();
        let second = log.append(put("b", "2", 1)).await.unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert_eq!(first.term, second.term);

        // Commits arrive in index order
        match apply_rx.recv().await.unwrap() {
            ApplyMsg::Command { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected message: {:?}", other),
        }
        match apply_rx.recv().await.unwrap() {
            ApplyMsg::Command { index, .. } => assert_eq!(index, 2),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_append_when_not_leader() {
        let (log, _apply_rx) = MemoryLog::new();
        log.set_leader(false);

        let result = log.append(put("a", "1", 0)).await;
        assert_eq!(result, Err(AppendError::NotLeader));
        assert_eq!(log.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let (log, mut apply_rx) = MemoryLog::new();
        log.hold_commits(true);

        log.append(put("a", "1", 0)).await.unwrap();
        assert!(apply_rx.try_recv().is_err());

        log.release_held();
        assert!(matches!(
            apply_rx.try_recv().unwrap(),
            ApplyMsg::Command { index: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_take_snapshot_compacts() {
        let (log, _apply_rx) = MemoryLog::new();
        for i in 0..5 {
            log.append(put("k", "v", i)).await.unwrap();
        }
        let size_before = log.state_size();

        log.take_snapshot(b"blob".to_vec(), 3).await;

        assert_eq!(log.entry_count(), 2);
        assert!(log.state_size() < size_before);
        assert_eq!(log.snapshot_blob(), Some(b"blob".to_vec()));

        // Indices keep growing after compaction
        let next = log.append(put("k", "v", 5)).await.unwrap();
        assert_eq!(next.index, 6);
    }

    #[tokio::test]
    async fn test_advance_term_changes_positions() {
        let (log, _apply_rx) = MemoryLog::new();
        let before = log.append(put("a", "1", 0)).await.unwrap();
        let term = log.advance_term();
        let after = log.append(put("a", "1", 0)).await.unwrap();
        assert_eq!(after.term, term);
        assert!(after.term > before.term);
    }
}
