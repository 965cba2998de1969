//! Deferred socket release
//!
//! Socket handles are never closed and freed synchronously from inside a
//! transport callback: teardown calls `close` immediately, then hands the
//! handle to a [`ReleaseGate`], which assigns each release a due time at
//! least one spacing interval after the previously assigned release. The
//! node frees the handle when its tick reaches the due time.
//!
//! The gate is process-wide by default so releases are serialised even
//! when several logical meshes share one process; test harnesses inject
//! an isolated gate instead.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::debug;

use canopy_core::SocketHandle;

/// Default minimum interval between consecutive socket frees
pub const DEFAULT_DELETION_SPACING: Duration = Duration::from_millis(1000);

#[derive(Debug)]
struct GateInner {
    spacing_us: u64,
    last_due_us: Option<u64>,
}

/// Spacing-enforced allocator of socket release times
#[derive(Debug, Clone)]
pub struct ReleaseGate {
    inner: Arc<Mutex<GateInner>>,
}

impl ReleaseGate {
    /// An isolated gate, for simulations and tests
    pub fn isolated(spacing: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                spacing_us: spacing.as_micros() as u64,
                last_due_us: None,
            })),
        }
    }

    /// The process-wide gate with the default spacing
    pub fn process_wide() -> Self {
        static GLOBAL: OnceLock<ReleaseGate> = OnceLock::new();
        GLOBAL
            .get_or_init(|| ReleaseGate::isolated(DEFAULT_DELETION_SPACING))
            .clone()
    }

    /// Assign a due time for one socket release
    ///
    /// The returned time is never earlier than `now_us` and never closer
    /// than one spacing interval to the previously assigned release.
    pub fn schedule(&self, now_us: u64) -> u64 {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = match inner.last_due_us {
            None => now_us,
            Some(last) => now_us.max(last + inner.spacing_us),
        };
        inner.last_due_us = Some(due);
        due
    }
}

/// A socket awaiting its deferred free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRelease {
    pub socket: SocketHandle,
    pub due_us: u64,
}

/// Sockets whose free is pending, ordered by due time
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    pending: Vec<PendingRelease>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a socket, asking the gate for its due time
    pub fn defer(&mut self, gate: &ReleaseGate, socket: SocketHandle, now_us: u64) -> u64 {
        let due_us = gate.schedule(now_us);
        debug!(%socket, due_us, "socket free deferred");
        self.pending.push(PendingRelease { socket, due_us });
        self.pending.sort_by_key(|p| p.due_us);
        due_us
    }

    /// Pop every socket whose due time has passed
    pub fn take_due(&mut self, now_us: u64) -> Vec<SocketHandle> {
        let split = self.pending.partition_point(|p| p.due_us <= now_us);
        self.pending
            .drain(..split)
            .map(|p| p.socket)
            .collect()
    }

    /// Drain everything regardless of due time (for `stop()` teardown
    /// on a platform that is going away anyway)
    pub fn drain_all(&mut self) -> Vec<SocketHandle> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|p| p.socket)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_release_is_immediate() {
        let gate = ReleaseGate::isolated(Duration::from_millis(1000));
        assert_eq!(gate.schedule(5_000), 5_000);
    }

    #[test]
    fn test_consecutive_releases_are_spaced() {
        let gate = ReleaseGate::isolated(Duration::from_millis(1000));
        let a = gate.schedule(0);
        let b = gate.schedule(1);
        let c = gate.schedule(2);
        assert!(b - a >= 1_000_000);
        assert!(c - b >= 1_000_000);
    }

    #[test]
    fn test_spacing_not_enforced_across_quiet_periods() {
        let gate = ReleaseGate::isolated(Duration::from_millis(1000));
        let a = gate.schedule(0);
        // Long after the previous release: due immediately.
        let b = gate.schedule(10_000_000);
        assert_eq!(b, 10_000_000);
        assert!(b - a >= 1_000_000);
    }

    #[test]
    fn test_queue_orders_by_due_time() {
        let gate = ReleaseGate::isolated(Duration::from_millis(100));
        let mut queue = ReleaseQueue::new();
        queue.defer(&gate, SocketHandle(1), 0);
        queue.defer(&gate, SocketHandle(2), 0);
        queue.defer(&gate, SocketHandle(3), 0);

        assert_eq!(queue.take_due(0), vec![SocketHandle(1)]);
        assert!(queue.take_due(99_999).is_empty());
        assert_eq!(queue.take_due(100_000), vec![SocketHandle(2)]);
        assert_eq!(queue.take_due(u64::MAX), vec![SocketHandle(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_all_ignores_due_times() {
        let gate = ReleaseGate::isolated(Duration::from_millis(100));
        let mut queue = ReleaseQueue::new();
        queue.defer(&gate, SocketHandle(1), 0);
        queue.defer(&gate, SocketHandle(2), 0);
        assert_eq!(queue.drain_all().len(), 2);
        assert!(queue.is_empty());
    }
}
