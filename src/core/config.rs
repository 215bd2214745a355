//! Server configuration parameters

use std::time::Duration;

/// Configuration for the command-apply pipeline
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// How long a submitted command may wait for its commit (default: 1s)
    pub request_timeout: Duration,
    /// Replicated-log size that triggers a snapshot once 80% full
    /// None disables snapshotting entirely
    pub max_log_size: Option<u64>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1),
            max_log_size: None,
        }
    }
}

impl KvConfig {
    /// Create a new config with a custom request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Create a new config with a snapshot size limit
    /// Pass None to disable snapshotting
    pub fn with_max_log_size(mut self, max: Option<u64>) -> Self {
        self.max_log_size = max;
        self
    }

    /// Log size past which a snapshot is due (80% of the configured max)
    pub fn snapshot_threshold(&self) -> Option<u64> {
        self.max_log_size.map(|max| max / 5 * 4)
    }
}
