//! The frame type this crate's core reads the stream-id prefix from.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Everything past the stream id is opaque to this layer: encoding,
//! composite metadata, and MIME type tables are the frame codec's concern,
//! not this crate's (spec §1, §6). We only need enough of a `Frame` type to
//! (a) read a 4-byte stream-id prefix and (b) know a frame's byte length for
//! position accounting.

use crate::dupe::Dupe;
use bytes::Bytes;
use std::fmt;

/// Stream id `0` denotes a connection-level frame; any other value denotes a
/// resumable, application-stream frame (spec §3).
pub const CONNECTION_STREAM_ID: u32 = 0;

/// A length-known, reference-counted, opaque protocol frame with a
/// fixed-offset stream-id prefix.
///
/// Cloning a `Frame` is a `Bytes` refcount bump, never a copy of the
/// payload.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    stream_id: u32,
    bytes: Bytes,
}

/// A frame too short to contain the stream-id prefix.
#[derive(Debug, thiserror::Error)]
#[error("frame is {len} bytes, shorter than the {prefix} byte stream-id prefix")]
pub struct TooShort {
    len: usize,
    prefix: usize,
}

impl Frame {
    const STREAM_ID_PREFIX_LEN: usize = 4;

    /// Build a frame, reading its stream id from the fixed-offset prefix.
    pub fn new(bytes: Bytes) -> Result<Self, TooShort> {
        if bytes.len() < Self::STREAM_ID_PREFIX_LEN {
            return Err(TooShort {
                len: bytes.len(),
                prefix: Self::STREAM_ID_PREFIX_LEN,
            });
        }
        let stream_id = u32::from_be_bytes(bytes[..4].try_into().expect("checked length above"));
        Ok(Self { stream_id, bytes })
    }

    /// Build a frame with an explicit stream id, without re-reading the
    /// prefix. Used by tests and by collaborators that already know the id.
    pub fn with_stream_id(stream_id: u32, bytes: Bytes) -> Self {
        Self { stream_id, bytes }
    }

    /// The frame's stream id.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// `true` for any stream id other than [`CONNECTION_STREAM_ID`], i.e.
    /// frames the store must persist and the replay protocol covers.
    #[inline]
    pub fn is_resumable(&self) -> bool {
        self.stream_id != CONNECTION_STREAM_ID
    }

    /// Byte length, used for position accounting
    /// (`sentPosition`/`impliedPosition` advance by this amount).
    #[inline]
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// `true` if the frame carries no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The raw bytes, for handing to a transport.
    #[inline]
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume the frame, returning the raw bytes.
    #[inline]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream_id", &self.stream_id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Dupe for Frame {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
