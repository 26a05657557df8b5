//! The transport collaborator interface consumed by the RDC (spec §6).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Concrete transports (TCP, WebSocket, in-memory pipes, TLS setup) are out
//! of scope for this crate (spec §1); this module only fixes the interface
//! the core swaps between. Test doubles live in `tests/`.

use crate::error::Error;
use crate::frame::Frame;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

/// A push stream of inbound frames. Infinite; terminates when the
/// transport is lost (spec §6).
pub type FrameStream = BoxStream<'static, Frame>;

/// A future that resolves once some teardown has completed.
pub type CloseFuture = BoxFuture<'static, ()>;

/// Placeholder for "the allocator of the active transport" (spec §4.1). No
/// custom buffer-allocator abstraction is built in this crate, frames are
/// plain [`bytes::Bytes`], so this is a zero-sized marker distinguishing a
/// reachable transport from a disposed one, per `SPEC_FULL.md` ADDED §D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocator;

/// The duplex, byte-moving channel a [`ResumableDuplexConnection`] attaches
/// to and swaps on reconnect.
///
/// [`ResumableDuplexConnection`]: crate::connection::ResumableDuplexConnection
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget send. Never blocks, never fails from the caller's
    /// point of view (spec §6).
    fn send_frame(&self, frame: Frame);

    /// The inbound push stream. Spec-level contract: infinite until the
    /// transport is lost. Implementations need only support a single call
    /// per attachment: the RDC subscribes exactly once per `connect`.
    fn receive(&self) -> FrameStream;

    /// Resolves when the transport is fully torn down.
    fn on_close(&self) -> CloseFuture;

    /// Idempotent close, no acknowledgement frame sent.
    fn dispose(&self);

    /// Emit an RSocket error frame, then close. Resolves once the transport
    /// reports itself closed.
    fn send_error_and_close(&self, error: &Error) -> CloseFuture;

    /// Best-effort peer address, if the transport has one.
    fn remote_address(&self) -> Option<String> {
        None
    }

    /// See [`Allocator`].
    fn alloc(&self) -> Allocator {
        Allocator
    }
}
