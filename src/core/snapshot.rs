//! Snapshot blob format for log compaction
//!
//! A snapshot captures the full shard-state set plus the last applied index,
//! serialized as a versioned blob. The log module stores the blob, truncates
//! entries up to the covered index, and delivers the same blob to replicas
//! that are too far behind to catch up by log replay.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::shard::ShardState;

/// Current snapshot format version; bump on any schema change
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Errors from encoding or decoding a snapshot blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    Encode(String),
    Decode(String),
    /// Blob was written by an incompatible format version
    UnsupportedVersion(u32),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Encode(msg) => write!(f, "snapshot encode failed: {}", msg),
            SnapshotError::Decode(msg) => write!(f, "snapshot decode failed: {}", msg),
            SnapshotError::UnsupportedVersion(version) => {
                write!(f, "unsupported snapshot format version: {}", version)
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Serialized form of the full group state at a log position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBlob {
    pub version: u32,
    pub shards: Vec<ShardState>,
    /// Highest log index whose effects the shards reflect
    pub last_applied: u64,
}

impl SnapshotBlob {
    pub fn new(shards: Vec<ShardState>, last_applied: u64) -> Self {
        SnapshotBlob {
            version: SNAPSHOT_FORMAT_VERSION,
            shards,
            last_applied,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec(self).map_err(|e| SnapshotError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, SnapshotError> {
        let blob: SnapshotBlob =
            serde_json::from_slice(data).map_err(|e| SnapshotError::Decode(e.to_string()))?;
        if blob.version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(blob.version));
        }
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::NUM_SHARDS;

    fn populated_shards() -> Vec<ShardState> {
        let mut shards: Vec<ShardState> = (0..NUM_SHARDS).map(ShardState::new).collect();
        shards[0].put(7, 0, "a", "1");
        shards[3].put(9, 0, "x", "y");
        shards[3].read(9, 1, "x");
        shards
    }

    #[test]
    fn test_roundtrip_is_field_for_field_identical() {
        let blob = SnapshotBlob::new(populated_shards(), 42);
        let bytes = blob.encode().unwrap();
        let decoded = SnapshotBlob::decode(&bytes).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = SnapshotBlob::decode(b"not a snapshot");
        assert!(matches!(result, Err(SnapshotError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut blob = SnapshotBlob::new(populated_shards(), 42);
        blob.version = 99;
        let bytes = serde_json::to_vec(&blob).unwrap();
        assert_eq!(
            SnapshotBlob::decode(&bytes),
            Err(SnapshotError::UnsupportedVersion(99))
        );
    }
}
