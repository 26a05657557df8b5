//! A resumable duplex connection layer for RSocket-style protocols:
//! transport-transparent reconnect with bounded, acknowledgement-pruned
//! frame replay.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! The crate has one core type, [`connection::ResumableDuplexConnection`]
//! (re-exported as [`ResumableDuplexConnection`]), sitting above a
//! [`transport::Transport`] collaborator and a [`store::ResumableFramesStore`]
//! collaborator. Concrete transports, frame wire encoding, and upper-layer
//! RSocket semantics are out of scope, see each module's docs for the exact
//! boundary.
#![warn(missing_docs, missing_debug_implementations)]
#![forbid(unsafe_code)]

pub mod config;
mod connection;
pub mod dupe;
pub mod error;
pub mod frame;
mod receiver;
pub mod store;
pub mod transport;

pub use connection::{IndexStream, ResumableDuplexConnection, Side, SessionToken};
pub use dupe::Dupe;
pub use error::{Error, Result, StoreError};
pub use frame::Frame;
pub use receiver::FrameReceivingSubscriber;
pub use transport::{Allocator, CloseFuture, FrameStream, Transport};
