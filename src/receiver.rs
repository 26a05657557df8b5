//! The frame receiving subscriber (spec §4.3): a short-lived adapter paired
//! 1:1 with a transport attachment that applies the inbound de-duplication
//! rule and forwards novel frames to the session.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::dupe::Dupe;
use crate::frame::Frame;
use crate::store::ResumableFramesStore;
use crate::transport::Transport;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

/// Applies the §4.1 receive routing rule to one inbound frame: connection
/// frames (`stream_id == 0`) pass straight through; resumable frames are
/// admitted only if the store reports them as novel.
fn route_frame(frame: Frame, store: &Arc<dyn ResumableFramesStore>, session_tx: &mpsc::UnboundedSender<Frame>) {
    if !frame.is_resumable() {
        session_tx.send(frame).ok();
        return;
    }
    if store.resumable_frame_received(&frame) {
        session_tx.send(frame).ok();
    } else {
        trace!(stream_id = frame.stream_id(), "dropped replayed duplicate frame");
    }
}

/// A per-attachment inbound adapter. See module docs.
#[derive(Debug)]
pub struct FrameReceivingSubscriber {
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    terminated: Arc<AtomicBool>,
}

impl FrameReceivingSubscriber {
    /// Spawn a task that drains `transport.receive()` for the lifetime of
    /// this attachment, applying the routing rule to each frame. Resets the
    /// store's inbound de-duplication cursor to `remoteAck` first (spec
    /// §4.3: one subscriber per attachment).
    pub fn spawn(
        connection_index: u32,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ResumableFramesStore>,
        session_tx: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        store.begin_new_attachment();

        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        let terminated = Arc::new(AtomicBool::new(false));

        let task_cancelled = cancelled.dupe();
        let task_cancel_notify = cancel_notify.dupe();
        let task_terminated = terminated.dupe();

        tokio::spawn(async move {
            let mut inbound = transport.receive();
            loop {
                tokio::select! {
                    biased;
                    () = task_cancel_notify.notified() => {
                        trace!(connection_index, "receiving subscriber cancelled");
                        break;
                    }
                    maybe = inbound.next() => {
                        match maybe {
                            Some(frame) if !task_cancelled.load(Ordering::Acquire) => {
                                route_frame(frame, &store, &session_tx);
                            }
                            Some(_) => break,
                            None => {
                                debug!(connection_index, "transport receive stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            task_terminated.store(true, Ordering::Release);
        });

        Self {
            cancelled,
            cancel_notify,
            terminated,
        }
    }

    /// Cancel the upstream subscription. Idempotent; does not propagate
    /// anything to the session (spec §4.3).
    pub fn dispose(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.cancel_notify.notify_waiters();
        }
    }

    /// `true` once the per-attachment task has stopped, whether because the
    /// transport closed or because [`dispose`](Self::dispose) was called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BoundedResumableFramesStore;
    use bytes::Bytes;
    use futures_util::stream;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct StubTransport {
        frames: Mutex<Option<Vec<Frame>>>,
    }

    impl Transport for StubTransport {
        fn send_frame(&self, _frame: Frame) {}
        fn receive(&self) -> crate::transport::FrameStream {
            let frames = self.frames.lock().take().unwrap_or_default();
            Box::pin(stream::iter(frames))
        }
        fn on_close(&self) -> crate::transport::CloseFuture {
            Box::pin(async {})
        }
        fn dispose(&self) {}
        fn send_error_and_close(&self, _error: &crate::error::Error) -> crate::transport::CloseFuture {
            Box::pin(async {})
        }
    }

    fn frame(stream_id: u32, payload: &str) -> Frame {
        Frame::with_stream_id(stream_id, Bytes::copy_from_slice(payload.as_bytes()))
    }

    #[tokio::test]
    async fn duplicate_replayed_frames_are_dropped_before_session() {
        let store = BoundedResumableFramesStore::new_default();
        assert!(store.resumable_frame_received(&frame(1, "0123456789")));
        assert!(store.resumable_frame_received(&frame(1, "0123456789")));
        assert_eq!(store.positions().implied_position, 20);

        let transport: Arc<dyn Transport> = Arc::new(StubTransport {
            frames: Mutex::new(Some(vec![
                frame(0, "K"),
                frame(1, "0123456789"),
                frame(1, "0123456789"),
            ])),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = FrameReceivingSubscriber::spawn(1, transport, store, tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.stream_id(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "duplicates must not reach the session");
        assert!(sub.is_terminated());
    }
}
