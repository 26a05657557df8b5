//! Tunable constants and construction-time configuration.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

/// Default depth of the outbound priority lane (stream id `0` frames). Kept
/// small: priority frames are keepalive/error frames and should never queue
/// up behind application traffic.
pub const DEFAULT_PRIORITY_QUEUE_DEPTH: usize = 16;

/// Default number of retained bytes the in-memory
/// [`BoundedResumableFramesStore`](crate::store::BoundedResumableFramesStore)
/// will hold before `saveFrames` reports [`StoreError::BufferOverflow`]
/// (spec §4.2: "on overflow the store signals an error").
///
/// [`StoreError::BufferOverflow`]: crate::error::StoreError::BufferOverflow
pub const DEFAULT_STORE_CAPACITY_BYTES: u64 = 16 * 1024 * 1024;

/// Construction-time parameters for a
/// [`BoundedResumableFramesStore`](crate::store::BoundedResumableFramesStore).
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Maximum retained unacknowledged bytes, see
    /// [`DEFAULT_STORE_CAPACITY_BYTES`].
    pub capacity_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_STORE_CAPACITY_BYTES,
        }
    }
}
