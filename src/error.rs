//! Crate error types.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the resumable duplex connection and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// The resumable frames store refused an append or its replay stream
    /// reported a failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The store's replay stream completed instead of staying open for the
    /// lifetime of the connection. Treated as an anomaly (see
    /// [`crate::connection::ResumableDuplexConnection`] design notes).
    #[error("Connection Closed Unexpectedly")]
    ConnectionClosedUnexpectedly,
    /// A peer- or application-supplied error, sent via `sendErrorAndClose`.
    #[error("{message}")]
    Application {
        /// Human-readable description sent to the peer.
        message: String,
        /// Optional underlying cause, propagated to `onClose`.
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
    /// An active transport reported an error. Never surfaced from a bare
    /// transport loss (see spec §7); only reachable through
    /// [`Error::Application`]'s cause chain or a caller that chooses to
    /// surface it explicitly.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Build an [`Error::Application`] with no underlying cause.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
            cause: None,
        }
    }

    /// Build an [`Error::Application`] wrapping a cause.
    pub fn application_with_cause(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Application {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// The underlying cause, if any, that should terminate `onClose`.
    pub fn into_cause(self) -> Option<Box<dyn std::error::Error + Send + Sync + 'static>> {
        match self {
            Self::Application { cause, .. } => cause,
            other => Some(Box::new(other)),
        }
    }
}

/// Errors returned by a [`ResumableFramesStore`](crate::store::ResumableFramesStore)
/// implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store's bounded buffer would overflow accepting this append.
    #[error("resumable frame store overflowed its retention buffer")]
    BufferOverflow,
    /// The replay stream was asked to start below the frames the store has
    /// already pruned, the peer is asking to resume from a position we can
    /// no longer serve.
    #[error("replay requested from position {requested}, but frames are only retained from {retained_from}")]
    PositionTooOld {
        /// The position asked for.
        requested: u64,
        /// The oldest position the store still has.
        retained_from: u64,
    },
}
