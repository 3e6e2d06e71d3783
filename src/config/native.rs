//! Native broker configuration.

use serde::Deserialize;

use crate::cluster::codec::DEFAULT_MAX_FRAME_BYTES;

/// Settings for the coordinator/worker broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
    /// Cap on items buffered per work queue while nobody pulls.
    /// Unbounded when unset; when full the oldest item is dropped.
    pub work_queue_buffer_limit: Option<usize>,
    /// Largest frame accepted on a worker process link.
    pub max_frame_bytes: usize,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            work_queue_buffer_limit: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
