//! A cheap, explicit alternative to [`Clone`].
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Most of the handles in this crate are `Arc`-backed and cloning them is a
//! refcount bump, never a deep copy. Calling that `clone()` reads as if it
//! might be expensive; `dupe()` makes the O(1) guarantee part of the name.

use std::sync::Arc;
use tokio::sync::mpsc;

/// Marker for types whose [`dupe`](Dupe::dupe) is always O(1).
pub trait Dupe {
    /// Duplicate `self` cheaply (refcount bump or `Copy`).
    fn dupe(&self) -> Self;
}

impl<T: ?Sized> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Arc::clone(self)
    }
}

impl<T> Dupe for mpsc::Sender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for mpsc::UnboundedSender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl Dupe for bytes::Bytes {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
