//! The Resumable Duplex Connection (RDC, spec §4.1): the long-lived duplex
//! frame channel a session holds onto across transport loss.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! This is the ~55% component. It owns the active-connection pointer, the
//! outbound priority/normal split, and the per-attachment wiring of the
//! store's replay stream and a [`FrameReceivingSubscriber`] onto whichever
//! transport is currently live.

use crate::config::{DEFAULT_PRIORITY_QUEUE_DEPTH, StoreConfig};
use crate::dupe::Dupe;
use crate::error::{Error, StoreError};
use crate::receiver::FrameReceivingSubscriber;
use crate::store::ResumableFramesStore;
use crate::transport::{Allocator, FrameStream, Transport};
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::frame::Frame;

/// Which end of the session opened the connection. Informational only, it
/// never changes the state machine (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The side that dials out and typically initiates reconnects.
    Client,
    /// The side that accepts inbound transports.
    Server,
}

/// An opaque session identity, typically 16 bytes. Immutable for the
/// lifetime of the RDC; used only for correlation and logging (spec §3).
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(Bytes);

impl SessionToken {
    /// Wrap an opaque token, typically 16 bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The raw token bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({} bytes)", self.0.len())
    }
}

/// The active-connection pointer (spec §3 invariant 4): a live transport, or
/// the terminal sentinel. Once `Disposed`, nothing else is ever stored here.
enum ActiveConnection {
    Live(Arc<dyn Transport>),
    Disposed,
}

/// A stream of `connectionIndex` values, one per transport that closes
/// (spec §6 `onActiveConnectionClosed`).
pub type IndexStream = futures_util::stream::BoxStream<'static, u32>;

enum ForwardOutcome {
    ReplayError(StoreError),
    ReplayCompleted,
}

/// Drains the priority lane and the store's replay stream onto one
/// transport attachment, biased toward priority frames (spec §5: "frames
/// with stream id 0 may overtake non-priority frames").
async fn run_forward_task(
    transport: Arc<dyn Transport>,
    store: Arc<dyn ResumableFramesStore>,
    priority_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
) -> ForwardOutcome {
    let mut priority_rx = priority_rx.lock().await;
    let mut replay = store.resume_stream();
    loop {
        tokio::select! {
            biased;
            Some(frame) = priority_rx.recv() => {
                transport.send_frame(frame);
            }
            item = replay.next() => {
                match item {
                    Some(Ok(frame)) => transport.send_frame(frame),
                    Some(Err(e)) => return ForwardOutcome::ReplayError(e),
                    None => return ForwardOutcome::ReplayCompleted,
                }
            }
        }
    }
}

struct Inner {
    #[allow(dead_code)]
    side: Side,
    #[allow(dead_code)]
    session_token: SessionToken,
    store: Arc<dyn ResumableFramesStore>,

    active: Mutex<ActiveConnection>,
    connection_index: AtomicU32,
    disposed: AtomicBool,
    initial_wiring_done: AtomicBool,

    priority_tx: mpsc::UnboundedSender<Frame>,
    priority_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>>,
    normal_tx: mpsc::UnboundedSender<Frame>,

    session_tx: mpsc::UnboundedSender<Frame>,
    session_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,

    receiving_subscriber: Mutex<Option<FrameReceivingSubscriber>>,
    forward_task: Mutex<Option<JoinHandle<()>>>,

    active_closed_tx: Mutex<Option<mpsc::UnboundedSender<u32>>>,
    active_closed_rx: Mutex<Option<mpsc::UnboundedReceiver<u32>>>,

    close_notify: Notify,
    close_cause: Mutex<Option<Arc<dyn std::error::Error + Send + Sync + 'static>>>,
}

impl Inner {
    /// Marks disposed and swaps the active pointer to the sentinel. Returns
    /// the value that was there, for the (one) caller that wins the race to
    /// tear it down; `None` if someone else already disposed.
    fn begin_dispose(self: &Arc<Self>) -> Option<ActiveConnection> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut active = self.active.lock();
        Some(std::mem::replace(&mut *active, ActiveConnection::Disposed))
    }

    fn finish_teardown(self: &Arc<Self>, cause: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>) {
        if let Some(sub) = self.receiving_subscriber.lock().take() {
            sub.dispose();
        }
        if let Some(task) = self.forward_task.lock().take() {
            task.abort();
        }
        *self.close_cause.lock() = cause;
        self.active_closed_tx.lock().take();
        self.close_notify.notify_waiters();
        debug!("resumable duplex connection disposed");
    }

    fn dispose(self: &Arc<Self>) {
        let Some(prev) = self.begin_dispose() else {
            return;
        };
        if let ActiveConnection::Live(t) = prev {
            t.dispose();
        }
        self.finish_teardown(None);
    }

    fn dispose_with_error(self: &Arc<Self>, err: Error) {
        let Some(prev) = self.begin_dispose() else {
            return;
        };
        if let ActiveConnection::Live(t) = prev {
            t.dispose();
        }
        let cause: Arc<dyn std::error::Error + Send + Sync + 'static> = Arc::new(err);
        self.finish_teardown(Some(cause));
    }

    async fn send_error_and_close(self: &Arc<Self>, err: Error) {
        let Some(prev) = self.begin_dispose() else {
            return;
        };
        if let ActiveConnection::Live(t) = prev {
            t.send_error_and_close(&err).await;
        }
        let cause = err.into_cause().map(Arc::from);
        self.finish_teardown(cause);
    }

    /// Wires a receiving subscriber and a forwarding task onto `transport`,
    /// tearing down whatever attachment preceded it first (spec §3
    /// invariant 5).
    fn wire_attachment(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        if let Some(old) = self.receiving_subscriber.lock().take() {
            old.dispose();
        }
        if let Some(old) = self.forward_task.lock().take() {
            old.abort();
        }

        let index = self.connection_index.fetch_add(1, Ordering::AcqRel) + 1;

        let sub = FrameReceivingSubscriber::spawn(index, transport.dupe(), self.store.dupe(), self.session_tx.dupe());
        *self.receiving_subscriber.lock() = Some(sub);

        let store = self.store.dupe();
        let priority_rx = self.priority_rx.dupe();
        let forward_transport = transport.dupe();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = run_forward_task(forward_transport, store, priority_rx).await;
            match outcome {
                ForwardOutcome::ReplayError(e) => {
                    warn!(connection_index = index, "store replay errored, closing connection");
                    this.send_error_and_close(Error::Store(e)).await;
                }
                ForwardOutcome::ReplayCompleted => {
                    warn!(connection_index = index, "store replay completed unexpectedly");
                    this.send_error_and_close(Error::ConnectionClosedUnexpectedly).await;
                }
            }
        });
        *self.forward_task.lock() = Some(handle);

        let closed_transport = transport.dupe();
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            closed_transport.on_close().await;
            watcher.on_transport_closed(index);
        });

        trace!(connection_index = index, "attachment wired");
    }

    /// Runs on transport close (spec §4.1 connect algorithm step 6). Only
    /// acts if `index` is still the current attachment; a later `connect`
    /// may already have replaced it.
    fn on_transport_closed(self: &Arc<Self>, index: u32) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.connection_index.load(Ordering::Acquire) != index {
            return;
        }
        if let Some(sub) = self.receiving_subscriber.lock().take() {
            sub.dispose();
        }
        if let Some(task) = self.forward_task.lock().take() {
            task.abort();
        }
        if let Some(tx) = self.active_closed_tx.lock().as_ref() {
            tx.send(index).ok();
        }
        debug!(connection_index = index, "active transport closed");
    }

    /// Called the first time the session requests a frame from `receive()`
    /// (spec §4.1 state `1 → 2`). Idempotent.
    fn trigger_initial_wiring(self: &Arc<Self>) {
        if self.initial_wiring_done.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let current = match &*self.active.lock() {
            ActiveConnection::Live(t) => Some(t.dupe()),
            ActiveConnection::Disposed => None,
        };
        if let Some(transport) = current {
            self.wire_attachment(transport);
        }
    }
}

/// The session-facing inbound stream returned by
/// [`ResumableDuplexConnection::receive`]. Dropping it (including on
/// cancellation) disposes the RDC (spec §5: "cancellation of the session's
/// receive subscription equals `dispose()`").
struct ReceiveStream {
    inner: mpsc::UnboundedReceiver<Frame>,
    rdc: Arc<Inner>,
    wired: bool,
}

impl futures_util::Stream for ReceiveStream {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        let this = self.get_mut();
        if !this.wired {
            this.rdc.trigger_initial_wiring();
            this.wired = true;
        }
        this.inner.poll_recv(cx)
    }
}

impl Drop for ReceiveStream {
    fn drop(&mut self) {
        self.rdc.dispose();
    }
}

/// A stable, long-lived duplex frame channel above a swappable transport
/// (spec §4.1). Cheaply cloned (an `Arc` handle) via [`Dupe`].
#[derive(Clone)]
pub struct ResumableDuplexConnection(Arc<Inner>);

impl ResumableDuplexConnection {
    /// Construct a new RDC. `store` is assumed already started; `initial`
    /// is *not* wired until the session's first demand (spec §4.1).
    pub fn new(side: Side, session_token: SessionToken, initial: Arc<dyn Transport>, store: Arc<dyn ResumableFramesStore>) -> Self {
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let (normal_tx, mut normal_rx) = mpsc::unbounded_channel::<Frame>();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (active_closed_tx, active_closed_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            side,
            session_token,
            store,
            active: Mutex::new(ActiveConnection::Live(initial)),
            connection_index: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
            initial_wiring_done: AtomicBool::new(false),
            priority_tx,
            priority_rx: Arc::new(tokio::sync::Mutex::new(priority_rx)),
            normal_tx,
            session_tx,
            session_rx: Mutex::new(Some(session_rx)),
            receiving_subscriber: Mutex::new(None),
            forward_task: Mutex::new(None),
            active_closed_tx: Mutex::new(Some(active_closed_tx)),
            active_closed_rx: Mutex::new(Some(active_closed_rx)),
            close_notify: Notify::new(),
            close_cause: Mutex::new(None),
        });

        let append_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(frame) = normal_rx.recv().await {
                if let Err(e) = append_inner.store.append(frame) {
                    warn!("resumable frame store overflowed, disposing connection");
                    append_inner.dispose_with_error(Error::Store(e));
                    break;
                }
            }
        });

        Self(inner)
    }

    /// Convenience constructor using [`StoreConfig::default`]'s bounded
    /// in-memory store and [`DEFAULT_PRIORITY_QUEUE_DEPTH`]'s implied
    /// priority-lane semantics (the lane itself is unbounded, per spec §2's
    /// "priority-aware unbounded queue"; the constant only documents the
    /// design intent, see `config` module docs).
    pub fn with_default_store(side: Side, session_token: SessionToken, initial: Arc<dyn Transport>) -> Self {
        let store = crate::store::BoundedResumableFramesStore::new(StoreConfig::default());
        Self::new(side, session_token, initial, store)
    }

    /// Enqueue `frame` for the active transport. Never blocks, never fails;
    /// silently dropped if the RDC is disposed (spec §7: "silent no-op").
    pub fn send_frame(&self, stream_id: u32, frame: Bytes) {
        if self.0.disposed.load(Ordering::Acquire) {
            return;
        }
        let frame = Frame::with_stream_id(stream_id, frame);
        let result = if frame.is_resumable() {
            self.0.normal_tx.send(frame)
        } else {
            self.0.priority_tx.send(frame)
        };
        result.ok();
    }

    /// The session-facing inbound stream (spec §4.1 `receive`). Subsequent
    /// calls after the first are silently ignored (spec §3 invariant 6).
    pub fn receive(&self) -> FrameStream {
        let rx = self.0.session_rx.lock().take();
        match rx {
            Some(inner) => Box::pin(ReceiveStream {
                inner,
                rdc: Arc::clone(&self.0),
                wired: false,
            }),
            None => Box::pin(futures_util::stream::empty()),
        }
    }

    /// Atomically swap the active-connection pointer onto `new_transport`.
    /// Returns `false` if the RDC is already disposed. If the session
    /// hasn't yet made its first demand, the new transport replaces the
    /// stored pointer but wiring is deferred to that first demand (spec §9
    /// open question: "buffer early reconnects until state ≥ 2").
    pub fn connect(&self, new_transport: Arc<dyn Transport>) -> bool {
        let prev = {
            let mut active = self.0.active.lock();
            if matches!(*active, ActiveConnection::Disposed) {
                return false;
            }
            std::mem::replace(&mut *active, ActiveConnection::Live(new_transport.dupe()))
        };
        if let ActiveConnection::Live(t) = prev {
            t.dispose();
        }
        if self.0.initial_wiring_done.load(Ordering::Acquire) {
            self.0.wire_attachment(new_transport);
        }
        true
    }

    /// Dispose the current transport without changing the active-connection
    /// pointer's logical slot; a successor is expected via `connect` (spec
    /// §4.1 `disconnect`). No-op if disposed.
    pub fn disconnect(&self) {
        let active = self.0.active.lock();
        if let ActiveConnection::Live(t) = &*active {
            t.dispose();
        }
    }

    /// Mark disposed, forward an error frame on the last live transport,
    /// await its close, then tear down. Idempotent (spec §4.1
    /// `sendErrorAndClose`).
    pub async fn send_error_and_close(&self, err: Error) {
        self.0.send_error_and_close(err).await;
    }

    /// Same teardown as [`send_error_and_close`](Self::send_error_and_close)
    /// without sending an error frame. Idempotent (spec §4.1 `dispose`).
    pub fn dispose(&self) {
        self.0.dispose();
    }

    /// Resolves when the RDC is terminally closed: `Ok(())` for a plain
    /// `dispose()`, `Err(cause)` if terminated with an underlying cause
    /// (spec §4.1 `onClose`).
    pub async fn on_close(&self) -> Result<(), Arc<dyn std::error::Error + Send + Sync + 'static>> {
        loop {
            let notified = self.0.close_notify.notified();
            tokio::pin!(notified);
            // Register with the `Notify` before checking `disposed`, otherwise a
            // `dispose()` landing between the load and the await notifies nobody
            // and this never wakes up.
            notified.as_mut().enable();
            if self.0.disposed.load(Ordering::Acquire) {
                return match self.0.close_cause.lock().clone() {
                    Some(cause) => Err(cause),
                    None => Ok(()),
                };
            }
            notified.await;
        }
    }

    /// Emits the `connectionIndex` each time the active transport closes;
    /// completes once the RDC is disposed (spec §6
    /// `onActiveConnectionClosed`). Subscribable once.
    pub fn on_active_connection_closed(&self) -> IndexStream {
        let rx = self.0.active_closed_rx.lock().take();
        match rx {
            Some(rx) => Box::pin(futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) })),
            None => Box::pin(futures_util::stream::empty()),
        }
    }

    /// `true` once the RDC has been terminally torn down (spec §4.1
    /// `isDisposed`).
    pub fn is_disposed(&self) -> bool {
        self.0.disposed.load(Ordering::Acquire)
    }

    /// Best-effort peer address of the active transport, `None` once
    /// disposed (spec §4.1 `remoteAddress`, resolved per `SPEC_FULL.md`
    /// ADDED §D).
    pub fn remote_address(&self) -> Option<String> {
        match &*self.0.active.lock() {
            ActiveConnection::Live(t) => t.remote_address(),
            ActiveConnection::Disposed => None,
        }
    }

    /// The active transport's allocator marker, `None` once disposed (spec
    /// §4.1 `alloc`, resolved per `SPEC_FULL.md` ADDED §D).
    pub fn alloc(&self) -> Option<Allocator> {
        match &*self.0.active.lock() {
            ActiveConnection::Live(t) => Some(t.alloc()),
            ActiveConnection::Disposed => None,
        }
    }
}

impl Dupe for ResumableDuplexConnection {
    fn dupe(&self) -> Self {
        Self(self.0.dupe())
    }
}

impl fmt::Debug for ResumableDuplexConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableDuplexConnection")
            .field("disposed", &self.is_disposed())
            .field("connection_index", &self.0.connection_index.load(Ordering::Relaxed))
            .finish()
    }
}

// Priority-lane depth: the lane is an unbounded channel (spec §2), this
// constant is referenced only to keep `config`'s intent documented and
// exercised from this module.
const _: usize = DEFAULT_PRIORITY_QUEUE_DEPTH;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BoundedResumableFramesStore;
    use crate::transport::CloseFuture;
    use futures_util::stream;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    /// An in-memory transport test double: frames sent to it are captured
    /// in order; `close()` ends both its inbound stream and `on_close`.
    struct ChannelTransport {
        sent: Mutex<Vec<Frame>>,
        inbound_tx: AsyncMutex<Option<mpsc::UnboundedSender<Frame>>>,
        inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
        close_notify: Arc<Notify>,
        closed: Arc<AtomicBool>,
        disposals: AtomicUsize,
    }

    impl ChannelTransport {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                inbound_tx: AsyncMutex::new(Some(tx)),
                inbound_rx: Mutex::new(Some(rx)),
                close_notify: Arc::new(Notify::new()),
                closed: Arc::new(AtomicBool::new(false)),
                disposals: AtomicUsize::new(0),
            })
        }

        async fn push_inbound(&self, frame: Frame) {
            let guard = self.inbound_tx.lock().await;
            if let Some(tx) = guard.as_ref() {
                tx.send(frame).ok();
            }
        }

        fn sent_payloads(&self) -> Vec<Vec<u8>> {
            self.sent.lock().iter().map(|f| f.as_bytes().to_vec()).collect()
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

    fn frame(stream_id: u32, payload: &str) -> Frame {
        Frame::with_stream_id(stream_id, Bytes::copy_from_slice(payload.as_bytes()))
    }

    #[tokio::test]
    async fn priority_frame_overtakes_queued_frames() {
        let transport = ChannelTransport::new();
        let store = BoundedResumableFramesStore::new_default();
        let rdc = ResumableDuplexConnection::new(Side::Client, SessionToken::new(Bytes::from_static(b"0123456789abcdef")), transport.dupe(), store);

        rdc.send_frame(7, Bytes::copy_from_slice(b"A"));
        rdc.send_frame(9, Bytes::copy_from_slice(b"B"));
        rdc.send_frame(0, Bytes::copy_from_slice(b"K"));

        // Trigger the `1 -> 2` wiring transition directly, the way the
        // first demand on `receive()` would.
        rdc.0.trigger_initial_wiring();

        tokio::time::timeout(std::time::Duration::from_millis(200), async {
            loop {
                if transport.sent.lock().len() >= 3 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(transport.sent_payloads(), vec![b"K".to_vec(), b"A".to_vec(), b"B".to_vec()]);
    }

    #[tokio::test]
    async fn disposed_rdc_rejects_connect_and_send() {
        let transport = ChannelTransport::new();
        let store = BoundedResumableFramesStore::new_default();
        let rdc = ResumableDuplexConnection::new(Side::Server, SessionToken::new(Bytes::from_static(b"0123456789abcdef")), transport, store);

        rdc.dispose();
        assert!(rdc.is_disposed());

        let t3 = ChannelTransport::new();
        assert!(!rdc.connect(t3.dupe()));
        assert_eq!(t3.sent.lock().len(), 0);

        rdc.send_frame(1, Bytes::copy_from_slice(b"ignored"));
        assert!(rdc.on_close().await.is_ok());
    }

    #[tokio::test]
    async fn double_dispose_is_idempotent() {
        let transport = ChannelTransport::new();
        let store = BoundedResumableFramesStore::new_default();
        let rdc = ResumableDuplexConnection::new(Side::Client, SessionToken::new(Bytes::from_static(b"0123456789abcdef")), transport.dupe(), store);
        rdc.dispose();
        rdc.dispose();
        assert_eq!(transport.disposals.load(Ordering::Acquire), 1);
    }
}
