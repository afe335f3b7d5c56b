//! Epoch clock for node-level cache expiration.
//!
//! A [`Timestamp`] pairs a monotonic instant with the clock epoch current
//! when it was issued. [`Clock::invalidate`] bumps the epoch, which makes
//! every earlier timestamp compare as expired regardless of its instant.
//! This is how one signal expires every cached attribute and directory
//! listing at once without walking the node graph.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// A point in time tagged with the epoch it was issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    epoch: u64,
    at: Instant,
}

/// Issues and compares [`Timestamp`]s.
#[derive(Debug, Default)]
pub struct Clock {
    epoch: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The current time. Already expired when used as an expiration.
    pub fn now(&self) -> Timestamp {
        Timestamp {
            epoch: self.epoch(),
            at: Instant::now(),
        }
    }

    /// An expiration `ttl` from now.
    pub fn after(&self, ttl: Duration) -> Timestamp {
        let now = Instant::now();
        Timestamp {
            epoch: self.epoch(),
            at: now.checked_add(ttl).unwrap_or(now),
        }
    }

    /// True once `expires` has passed or an invalidation happened since it was issued.
    pub fn is_expired(&self, expires: Timestamp) -> bool {
        expires.epoch != self.epoch() || Instant::now() >= expires.at
    }

    /// Expires every timestamp issued so far.
    pub fn invalidate(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        info!(epoch, "Node caches invalidated");
    }
}

/// Cloneable handle that invalidates an adapter's caches.
#[derive(Debug, Clone)]
pub struct Invalidator {
    clock: Arc<Clock>,
}

impl Invalidator {
    pub(crate) fn new(clock: Arc<Clock>) -> Self {
        Self { clock }
    }

    pub fn invalidate(&self) {
        self.clock.invalidate();
    }
}
