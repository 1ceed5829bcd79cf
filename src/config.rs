//! Engine and device tunables.

use std::time::Duration;

/// Engine-wide configuration, fixed for the lifetime of an [`Engine`](crate::Engine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Tasks in the completion worker pool.
    pub workers: usize,
    /// Delay before a backpressure retry pass runs.
    pub retry_interval: Duration,
    /// Cap on commands waiting for delivery per device. When exceeded the oldest
    /// entry is failed with a communication failure. `None` means unbounded.
    pub max_pending_deliveries: Option<usize>,
    /// Segment size for data buffers the engine allocates on behalf of a front end.
    pub segment_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_interval: Duration::from_millis(10),
            max_pending_deliveries: None,
            segment_size: 4096,
        }
    }
}

/// Per-device configuration supplied at attach time.
#[derive(Clone, Debug, Default)]
pub struct DeviceConfig {
    /// Used in logs only.
    pub name: Option<String>,
    /// Lowers the backing store's maximum transfer size (in blocks). Values above what
    /// the store advertises are ignored.
    pub max_transfer_blocks: Option<u32>,
}

impl DeviceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_max_transfer_blocks(mut self, blocks: u32) -> Self {
        self.max_transfer_blocks = Some(blocks);
        self
    }
}
