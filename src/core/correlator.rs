//! Request correlator: pending-request table keyed by (term, index)
//!
//! Every submission registers a one-shot waiter under the (term, index) pair
//! the log assigned to its append. When a commit is applied, all waiters at
//! strictly earlier positions are superseded (their command can no longer
//! commit as appended, typically because leadership changed), the waiter at
//! the exact position gets the apply result, and later waiters stay pending.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::shard::ApplyOutput;

/// Identity of a submission: the (term, index) the log assigned its append
///
/// The derived lexicographic order (term first, then index) is exactly the
/// supersession order: a key below the committed one can never commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub term: u64,
    pub index: u64,
}

/// What a waiting submitter learns about its command
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// The command committed at its position and was applied
    Applied(ApplyOutput),
    /// A different command committed past this position; retry
    Superseded,
    /// The replica stopped serving before the command was applied
    ShuttingDown,
}

/// Table of submissions still waiting for their commit
///
/// At most one record per key: the log assigns each append a fresh index
/// under a given term, and a (term, index) pair commits at most one command.
#[derive(Debug, Default)]
pub struct PendingTable {
    waiters: HashMap<RequestKey, oneshot::Sender<RequestOutcome>>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable {
            waiters: HashMap::new(),
        }
    }

    /// Register a waiter for the given position
    pub fn register(&mut self, key: RequestKey) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key, tx);
        rx
    }

    /// Remove a waiter that stopped listening (submit timeout)
    pub fn cancel(&mut self, key: RequestKey) {
        self.waiters.remove(&key);
    }

    /// Resolve waiters against the commit applied at `committed`
    ///
    /// Sends never block: a waiter that already timed out has dropped its
    /// receiver and the send is a no-op.
    pub fn resolve(&mut self, committed: RequestKey, output: ApplyOutput) {
        let due: Vec<RequestKey> = self
            .waiters
            .keys()
            .filter(|key| **key <= committed)
            .copied()
            .collect();

        for key in due {
            if let Some(tx) = self.waiters.remove(&key) {
                let outcome = if key == committed {
                    RequestOutcome::Applied(output.clone())
                } else {
                    RequestOutcome::Superseded
                };
                let _ = tx.send(outcome);
            }
        }
    }

    /// Release every waiter as shutting down
    pub fn drain(&mut self) {
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(RequestOutcome::ShuttingDown);
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
