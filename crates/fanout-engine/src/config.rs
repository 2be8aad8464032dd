//! Configuration for the fan-out engine.

use std::time::Duration;

/// Engine tunables.
///
/// The defaults match production behavior; tests narrow them to exercise
/// thresholds without multi-kilobyte fixtures.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Request-admission bucket capacity per connection.
    pub request_capacity: u32,

    /// Tokens returned to the request bucket per second.
    pub request_refill_per_sec: u32,

    /// File-storage bucket capacity per connection.
    pub storage_capacity: u32,

    /// Tokens returned to the file-storage bucket per second.
    pub storage_refill_per_sec: u32,

    /// Age a missing sequence number must reach before the gap is repaired
    /// with a rollback record. Younger gaps are treated as in-flight writes.
    pub gap_repair_after: Duration,

    /// Cumulative delivered bytes after which the client is told to compact
    /// its transaction log into a new snapshot bundle.
    pub build_bundle_threshold: usize,

    /// Sliding TTL of the per-user file-ID cache.
    pub file_id_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_capacity: 25,
            request_refill_per_sec: 1,
            storage_capacity: 200,
            storage_refill_per_sec: 200,
            gap_repair_after: Duration::from_secs(10),
            build_bundle_threshold: 50 * 1024,
            file_id_ttl: Duration::from_secs(60),
        }
    }
}
