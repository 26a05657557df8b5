//! The resumable frames store (spec §4.2): a durable, bounded, append-only
//! log of outbound resumable frames, with acknowledgement-pruning and a
//! replay stream for reconnects.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::config::StoreConfig;
use crate::dupe::Dupe;
use crate::error::StoreError;
use crate::frame::Frame;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// A replayed frame, or the store reporting it cannot continue (spec §7:
/// "Store replay anomaly (error)"). A stream that ends without an `Err` is
/// the distinct "completed unexpectedly" anomaly (spec §9).
pub type ReplayStream = BoxStream<'static, Result<Frame, StoreError>>;

/// A snapshot of the four position counters from spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePositions {
    /// Total bytes of resumable frames admitted from the peer.
    pub implied_position: u64,
    /// Total bytes of resumable frames appended to the store.
    pub sent_position: u64,
    /// Last position the peer has acknowledged receiving from us.
    pub local_ack: u64,
    /// The `implied_position` value we most recently reported to the peer.
    pub remote_ack: u64,
}

/// The collaborator interface the RDC consumes (spec §4.2). Implementers
/// must uphold: strict append order, monotonic position advancement,
/// release of buffer memory/refcounts exactly once per pruned frame, and
/// that a concurrent appender/replayer never observes out-of-order offsets.
pub trait ResumableFramesStore: Send + Sync + 'static {
    /// Append a resumable (`stream_id != 0`) outbound frame, advancing
    /// `sentPosition` by its length. Callers must not pass non-resumable
    /// frames (the RDC routes those around the store entirely, spec §4.2:
    /// "forwarded without recording").
    fn append(&self, frame: Frame) -> Result<(), StoreError>;

    /// Emits every retained frame in `[localAck, sentPosition)` in append
    /// order, then continues live as new frames are appended. Subscribable
    /// multiple times across the RDC's lifetime; at most one live
    /// subscription is expected at a time (a new `connect` replaces the
    /// prior one).
    ///
    /// Takes `Arc<Self>` rather than `&self` because the returned stream is
    /// `'static` and must keep the store alive for as long as it is polled.
    fn resume_stream(self: Arc<Self>) -> ReplayStream;

    /// Called for each inbound stream-id-nonzero frame within the current
    /// transport attachment. Returns `true` the first time this segment of
    /// the inbound byte stream is seen (it should be admitted to the
    /// session); `false` if it falls at-or-before `impliedPosition` (a
    /// replayed duplicate).
    fn resumable_frame_received(&self, frame: &Frame) -> bool;

    /// Called on peer acknowledgement; advances `localAck` and releases
    /// frames below it.
    fn release_frames(&self, remote_position: u64);

    /// Reset the inbound de-duplication cursor to `remoteAck` for a freshly
    /// attached transport (spec §4.3: receiving subscriber is created per
    /// attachment) and return that baseline.
    fn begin_new_attachment(&self) -> u64;

    /// Record that we have just reported our current `impliedPosition` to
    /// the peer as an acknowledgement, advancing `remoteAck` to match.
    /// Returns the new `remoteAck` for the caller to place in the
    /// acknowledgement frame (frame construction is out of scope here).
    fn note_remote_ack_sent(&self) -> u64;

    /// A snapshot of the four position counters, for diagnostics and tests.
    fn positions(&self) -> StorePositions;
}

struct StoredFrame {
    /// Offset in the sent-byte-stream at which this frame begins.
    start: u64,
    frame: Frame,
}

struct StoreState {
    frames: VecDeque<StoredFrame>,
    retained_bytes: u64,
    local_ack: u64,
    sent_position: u64,
    implied_position: u64,
    remote_ack: u64,
    attachment_cursor: u64,
    capacity_bytes: u64,
    /// Set once the store itself is torn down; new `resume_stream` calls
    /// still work (they just immediately see no more live frames after
    /// draining the backlog) but no further appends are accepted.
    closed: bool,
}

/// An in-memory, bounded [`ResumableFramesStore`].
///
/// Retention is enforced in bytes (`StoreConfig::capacity_bytes`); an
/// append that would exceed the bound returns
/// [`StoreError::BufferOverflow`] instead of growing unboundedly (spec
/// §4.2: "on overflow the store signals an error").
pub struct BoundedResumableFramesStore {
    state: Mutex<StoreState>,
    notify: Notify,
}

impl BoundedResumableFramesStore {
    /// Create an empty store with the given configuration.
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StoreState {
                frames: VecDeque::new(),
                retained_bytes: 0,
                local_ack: 0,
                sent_position: 0,
                implied_position: 0,
                remote_ack: 0,
                attachment_cursor: 0,
                capacity_bytes: config.capacity_bytes,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    /// Create an empty store with [`StoreConfig::default`].
    pub fn new_default() -> Arc<Self> {
        Self::new(StoreConfig::default())
    }

    /// Stop accepting appends and wake any live replay waiters so they can
    /// observe completion. Idempotent.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        drop(st);
        self.notify.notify_waiters();
    }
}

impl ResumableFramesStore for BoundedResumableFramesStore {
    #[tracing::instrument(skip_all, level = "trace", fields(len = frame.len()))]
    fn append(&self, frame: Frame) -> Result<(), StoreError> {
        debug_assert!(frame.is_resumable(), "non-resumable frame reached the store");
        let mut st = self.state.lock();
        if st.retained_bytes + frame.len() > st.capacity_bytes {
            warn!(
                retained_bytes = st.retained_bytes,
                capacity_bytes = st.capacity_bytes,
                "resumable frame store overflowed"
            );
            return Err(StoreError::BufferOverflow);
        }
        let start = st.sent_position;
        let len = frame.len();
        st.retained_bytes += len;
        st.sent_position += len;
        st.frames.push_back(StoredFrame { start, frame });
        drop(st);
        self.notify.notify_waiters();
        Ok(())
    }

    fn resume_stream(self: Arc<Self>) -> ReplayStream {
        Box::pin(futures_util::stream::unfold(
            ReplayState { store: self, cursor: None },
            |mut rs| async move {
                loop {
                    let notified = rs.store.notify.notified();
                    let (item, done) = rs.poll_once();
                    if let Some(item) = item {
                        return Some((item, rs));
                    }
                    if done {
                        return None;
                    }
                    notified.await;
                }
            },
        ))
    }

    #[tracing::instrument(skip_all, level = "trace", fields(len = frame.len()))]
    fn resumable_frame_received(&self, frame: &Frame) -> bool {
        let mut st = self.state.lock();
        let end = st.attachment_cursor + frame.len();
        st.attachment_cursor = end;
        if end > st.implied_position {
            st.implied_position = end;
            trace!(implied_position = end, "admitted novel resumable frame");
            true
        } else {
            trace!(implied_position = st.implied_position, end, "dropped replayed duplicate");
            false
        }
    }

    fn release_frames(&self, remote_position: u64) {
        let mut st = self.state.lock();
        if remote_position <= st.local_ack {
            return;
        }
        let remote_position = remote_position.min(st.sent_position);
        while let Some(front) = st.frames.front() {
            if front.start + front.frame.len() <= remote_position {
                let freed = st.frames.pop_front().expect("front just checked").frame.len();
                st.retained_bytes -= freed;
            } else {
                break;
            }
        }
        // `remote_position` may land inside the frame now at the front (acks
        // aren't required to fall on frame boundaries); that frame is still
        // retained in full, so `localAck` can only advance to its start, not
        // past it, or the store would claim to retain less than it does.
        let boundary = st.frames.front().map(|f| f.start).unwrap_or(st.sent_position);
        st.local_ack = boundary;
        debug!(local_ack = boundary, requested = remote_position, "released acknowledged frames");
    }

    fn begin_new_attachment(&self) -> u64 {
        let mut st = self.state.lock();
        st.attachment_cursor = st.remote_ack;
        st.attachment_cursor
    }

    fn note_remote_ack_sent(&self) -> u64 {
        let mut st = self.state.lock();
        st.remote_ack = st.implied_position;
        st.remote_ack
    }

    fn positions(&self) -> StorePositions {
        let st = self.state.lock();
        StorePositions {
            implied_position: st.implied_position,
            sent_position: st.sent_position,
            local_ack: st.local_ack,
            remote_ack: st.remote_ack,
        }
    }
}

struct ReplayState {
    store: Arc<BoundedResumableFramesStore>,
    /// `None` until the first poll, at which point it is pinned to the
    /// store's current `localAck` (spec §4.2: replay starts at
    /// `localAck`).
    cursor: Option<u64>,
}

impl ReplayState {
    /// Returns `(Some(item), _)` if a frame or terminal error is ready,
    /// `(None, true)` if the store closed with nothing left to emit, or
    /// `(None, false)` if the caller should wait for a notification.
    fn poll_once(&mut self) -> (Option<Result<Frame, StoreError>>, bool) {
        let st = self.store.state.lock();
        let mut cursor = *self.cursor.get_or_insert(st.local_ack);
        if cursor < st.local_ack {
            // Frames we hadn't replayed yet were acknowledged (and pruned)
            // before we got to them; skip forward, nothing to replay there.
            cursor = st.local_ack;
        }
        if let Some(stored) = st.frames.iter().find(|f| f.start == cursor) {
            let frame = stored.frame.dupe();
            self.cursor = Some(cursor + frame.len());
            return (Some(Ok(frame)), false);
        }
        // `cursor` didn't land on a retained frame boundary. `release_frames`
        // now clamps `localAck` to one, so this shouldn't happen in practice,
        // but resync to the earliest retained frame instead of stalling
        // forever if it ever does.
        if let Some(front) = st.frames.front() {
            if front.start > cursor {
                let cursor = front.start;
                let frame = front.frame.dupe();
                self.cursor = Some(cursor + frame.len());
                return (Some(Ok(frame)), false);
            }
        }
        let caught_up = cursor >= st.sent_position;
        let closed = st.closed;
        self.cursor = Some(cursor);
        drop(st);
        if caught_up && closed {
            (None, true)
        } else {
            (None, false)
        }
    }
}
