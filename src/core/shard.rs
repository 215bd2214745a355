//! Per-shard state machine
//!
//! One `ShardState` per shard holds the key/value data together with the
//! deduplication bookkeeping: the next expected sequence number per client
//! and a cache of each client's last completed read.
//!
//! The sequence gate is the dedup mechanism. A client retries a lost request
//! with an unchanged sequence number; once the original commits and advances
//! `next_sequence`, the retry compares as "less than" and is answered from
//! cache (reads) or dropped as already-applied (writes) instead of being
//! applied twice.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Result of applying one committed command to its shard
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutput {
    /// Read result: the value under the key, or None if the key is absent
    Value(Option<String>),
    /// Write applied (or deduplicated), or config change processed
    Done,
    /// Sequence number ran ahead of the next expected one for this client
    Unordered,
}

/// A client's last completed read, replayed verbatim on duplicate GETs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRead {
    pub sequence: u64,
    /// None records a missing key, so the replayed answer matches the original
    pub value: Option<String>,
}

/// Key/value state of a single shard plus its dedup bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardState {
    pub kvs: HashMap<String, String>,
    /// Next expected sequence number per client, defaulting to 0
    pub next_sequence: HashMap<u64, u64>,
    pub read_cache: HashMap<u64, CachedRead>,
    pub shard_id: usize,
    /// Config version whose data this shard currently holds
    pub config_num: u64,
}

impl ShardState {
    pub fn new(shard_id: usize) -> Self {
        ShardState {
            kvs: HashMap::new(),
            next_sequence: HashMap::new(),
            read_cache: HashMap::new(),
            shard_id,
            config_num: 0,
        }
    }

    fn next_seq(&self, client_id: u64) -> u64 {
        self.next_sequence.get(&client_id).copied().unwrap_or(0)
    }

    fn advance_seq(&mut self, client_id: u64) {
        *self.next_sequence.entry(client_id).or_insert(0) += 1;
    }

    /// Whether (client, sequence) has already been applied on this shard
    pub fn applied(&self, client_id: u64, sequence: u64) -> bool {
        sequence < self.next_seq(client_id)
    }

    /// The client's last completed read, if any
    pub fn cached_read(&self, client_id: u64) -> Option<&CachedRead> {
        self.read_cache.get(&client_id)
    }

    /// Apply a committed GET
    ///
    /// Duplicates are served from the read cache without touching state;
    /// exactly-expected sequences read, cache, and advance the counter.
    pub fn read(&mut self, client_id: u64, sequence: u64, key: &str) -> ApplyOutput {
        let next = self.next_seq(client_id);
        if sequence < next {
            let cached = self
                .read_cache
                .get(&client_id)
                .and_then(|entry| entry.value.clone());
            ApplyOutput::Value(cached)
        } else if sequence == next {
            let value = self.kvs.get(key).cloned();
            self.read_cache.insert(
                client_id,
                CachedRead {
                    sequence,
                    value: value.clone(),
                },
            );
            self.advance_seq(client_id);
            ApplyOutput::Value(value)
        } else {
            ApplyOutput::Unordered
        }
    }

    /// Apply a committed PUT
    pub fn put(&mut self, client_id: u64, sequence: u64, key: &str, value: &str) -> ApplyOutput {
        self.write(client_id, sequence, |kvs| {
            kvs.insert(key.to_string(), value.to_string());
        })
    }

    /// Apply a committed APPEND (concatenates onto the existing value)
    pub fn append(&mut self, client_id: u64, sequence: u64, key: &str, value: &str) -> ApplyOutput {
        self.write(client_id, sequence, |kvs| {
            kvs.entry(key.to_string()).or_default().push_str(value);
        })
    }

    fn write<F>(&mut self, client_id: u64, sequence: u64, mutate: F) -> ApplyOutput
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let next = self.next_seq(client_id);
        if sequence == next {
            mutate(&mut self.kvs);
            self.advance_seq(client_id);
            ApplyOutput::Done
        } else if sequence < next {
            // Retry of an already-applied write
            ApplyOutput::Done
        } else {
            ApplyOutput::Unordered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_get() {
        let mut shard = ShardState::new(0);

        assert_eq!(shard.put(7, 0, "a", "1"), ApplyOutput::Done);
        assert_eq!(shard.read(7, 1, "a"), ApplyOutput::Value(Some("1".to_string())));
    }

    #[test]
    fn test_duplicate_put_applies_once() {
        let mut shard = ShardState::new(0);

        shard.put(7, 0, "a", "1");
        // Simulated retry with the same sequence number
        assert_eq!(shard.put(7, 0, "a", "1"), ApplyOutput::Done);
        assert_eq!(shard.kvs.get("a"), Some(&"1".to_string()));
        assert_eq!(shard.next_sequence.get(&7), Some(&1));
    }

    #[test]
    fn test_append_concatenates() {
        let mut shard = ShardState::new(0);

        shard.put(7, 0, "a", "1");
        shard.append(7, 1, "a", "2");
        assert_eq!(shard.kvs.get("a"), Some(&"12".to_string()));
    }

    #[test]
    fn test_append_to_absent_key() {
        let mut shard = ShardState::new(0);

        shard.append(7, 0, "a", "x");
        assert_eq!(shard.kvs.get("a"), Some(&"x".to_string()));
    }

    #[test]
    fn test_duplicate_append_applies_once() {
        let mut shard = ShardState::new(0);

        shard.put(7, 0, "a", "1");
        shard.append(7, 1, "a", "2");
        shard.append(7, 1, "a", "2");
        assert_eq!(shard.kvs.get("a"), Some(&"12".to_string()));
    }

    #[test]
    fn test_duplicate_read_served_from_cache() {
        let mut shard = ShardState::new(0);

        shard.put(7, 0, "a", "old");
        assert_eq!(shard.read(7, 1, "a"), ApplyOutput::Value(Some("old".to_string())));

        // Another client overwrites the key
        shard.put(8, 0, "a", "new");

        // Replay of the read answers what that read originally saw
        assert_eq!(shard.read(7, 1, "a"), ApplyOutput::Value(Some("old".to_string())));
        // State is unchanged by the replay
        assert_eq!(shard.next_sequence.get(&7), Some(&2));
    }

    #[test]
    fn test_read_missing_key() {
        let mut shard = ShardState::new(0);

        assert_eq!(shard.read(7, 0, "nope"), ApplyOutput::Value(None));
        // The miss is cached and replayed as a miss, not as an empty string
        assert_eq!(shard.read(7, 0, "nope"), ApplyOutput::Value(None));
    }

    #[test]
    fn test_sequence_gap_is_rejected() {
        let mut shard = ShardState::new(0);

        assert_eq!(shard.put(7, 3, "a", "1"), ApplyOutput::Unordered);
        assert_eq!(shard.read(7, 3, "a"), ApplyOutput::Unordered);
        // Nothing changed
        assert!(shard.kvs.is_empty());
        assert_eq!(shard.next_sequence.get(&7), None);
    }

    #[test]
    fn test_sequence_advances_exactly_once_per_applied_command() {
        let mut shard = ShardState::new(0);

        shard.put(7, 0, "a", "1");
        shard.put(7, 0, "a", "1"); // dup
        shard.put(7, 5, "a", "x"); // gap
        assert_eq!(shard.next_sequence.get(&7), Some(&1));

        shard.append(7, 1, "a", "2");
        assert_eq!(shard.next_sequence.get(&7), Some(&2));
    }

    #[test]
    fn test_clients_are_independent() {
        let mut shard = ShardState::new(0);

        shard.put(7, 0, "a", "1");
        // Client 8 starts from sequence 0 regardless of client 7
        assert_eq!(shard.put(8, 0, "b", "2"), ApplyOutput::Done);
        assert_eq!(shard.kvs.len(), 2);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut shard = ShardState::new(4);
        shard.put(7, 0, "a", "1");
        shard.read(7, 1, "a");

        let bytes = serde_json::to_vec(&shard).unwrap();
        let decoded: ShardState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, shard);
    }
}
