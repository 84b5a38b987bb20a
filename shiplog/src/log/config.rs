//! Log configuration.

use serde::{Deserialize, Serialize};

/// Sizing and placement of log segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Rotate the active segment once its store reaches this many bytes.
    pub max_store_bytes: u64,
    /// Byte cap for the memory-mapped index file.
    pub max_index_bytes: u64,
    /// Offset assigned to the first record of a fresh log.
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }
}
