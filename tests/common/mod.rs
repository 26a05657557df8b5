//! Shared test support: an in-memory [`Transport`] double.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use bytes::Bytes;
use futures_util::stream;
use parking_lot::Mutex;
use rsocket_resume::{CloseFuture, Error, Frame, FrameStream, Transport};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// A channel-backed [`Transport`]: frames sent to it are captured in
/// submission order; inbound frames are pushed by the test via
/// [`push_inbound`](Self::push_inbound); `dispose()`/`send_error_and_close`
/// resolve [`on_close`](Transport::on_close).
pub struct ChannelTransport {
    pub sent: Mutex<Vec<Frame>>,
    inbound_tx: tokio::sync::Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    close_notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    pub disposals: AtomicUsize,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound_tx: tokio::sync::Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            close_notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            disposals: AtomicUsize::new(0),
        })
    }

    pub async fn push_inbound(&self, frame: Frame) {
        let guard = self.inbound_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            tx.send(frame).ok();
        }
    }

    /// Close the inbound stream (simulates the peer side going quiet)
    /// without tearing down `on_close`/`dispose`.
    pub async fn end_inbound(&self) {
        self.inbound_tx.lock().await.take();
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().iter().map(|f| f.as_bytes().to_vec()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for ChannelTransport {
    fn send_frame(&self, frame: Frame) {
        self.sent.lock().push(frame);
    }

    fn receive(&self) -> FrameStream {
        let rx = self.inbound_rx.lock().take().expect("receive() called once per attachment");
        Box::pin(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|f| (f, rx)) }))
    }

    fn on_close(&self) -> CloseFuture {
        let notify = Arc::clone(&self.close_notify);
        let closed = Arc::clone(&self.closed);
        Box::pin(async move {
            let notified = notify.notified();
            if closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        })
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::AcqRel);
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }

    fn send_error_and_close(&self, _error: &Error) -> CloseFuture {
        self.dispose();
        Box::pin(async {})
    }
}

pub fn frame(stream_id: u32, payload: &str) -> Frame {
    Frame::with_stream_id(stream_id, Bytes::copy_from_slice(payload.as_bytes()))
}

/// Poll `condition` in a cooperative-yield loop until it's `true` or
/// `timeout` elapses, panicking on timeout. Used instead of a fixed sleep
/// to deflake tests driven by background tasks (the append task, the
/// per-attachment forwarding task) without depending on their scheduling.
pub async fn wait_until(timeout: std::time::Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition did not become true before timeout");
}
