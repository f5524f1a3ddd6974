//! Per-engine observables.
//!
//! Each channel sort engine exposes a set of atomic counters plus the last
//! input/output DAQ timestamps. All atomic writes use `Relaxed` ordering —
//! these are sampling metrics, not synchronisation. Reads of different
//! counters are not required to be mutually consistent.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

/// Nanosecond wall timestamp via `CLOCK_MONOTONIC_RAW` (Linux) or `Instant`
/// (other platforms). Used for worker liveness diagnostics only; DAQ
/// timestamps come out of the buffers themselves.
#[inline(always)]
pub fn now_ns() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// Atomic counters for one channel sort engine.
pub struct SorterStats {
    /// Stream kind label ("hit", "moni", "sn", "tcal").
    pub kind: &'static str,

    /// Records dequeued for a registered channel, sentinels excluded.
    pub records_in: AtomicU64,
    /// Records forwarded downstream, sentinels excluded.
    pub records_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,

    /// Buffers dropped because their mbid was never registered.
    pub unknown_dropped: AtomicU64,
    /// Output elements whose timestamp went backwards. Should stay 0 while
    /// producers honor per-channel monotonicity; the element is still
    /// forwarded.
    pub out_of_order: AtomicU64,
    /// End-of-stream sentinels observed so far.
    pub eos_seen: AtomicU64,

    /// DAQ timestamp of the last dequeued buffer (sentinels included).
    pub last_in_timestamp: AtomicI64,
    /// DAQ timestamp of the last popped element.
    pub last_out_timestamp: AtomicI64,
    /// `now_ns()` at the last queue take; a stale value flags a starved or
    /// wedged worker.
    pub last_take_wall_ns: AtomicU64,
}

/// Plain-struct snapshot of [`SorterStats`] for display (no atomics).
#[derive(Debug, Clone, Serialize)]
pub struct SorterSnapshot {
    pub kind: &'static str,
    pub records_in: u64,
    pub records_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub unknown_dropped: u64,
    pub out_of_order: u64,
    pub eos_seen: u64,
    pub last_in_timestamp: i64,
    pub last_out_timestamp: i64,
    /// DAQ time currently buffered between input and output (0.1 ns).
    pub buffered_utc_depth: i64,
    pub queue_depth: usize,
}

impl SorterStats {
    pub fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            records_in: AtomicU64::new(0),
            records_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            unknown_dropped: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            eos_seen: AtomicU64::new(0),
            last_in_timestamp: AtomicI64::new(0),
            last_out_timestamp: AtomicI64::new(0),
            last_take_wall_ns: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self, queue_depth: usize) -> SorterSnapshot {
        let last_in = self.last_in_timestamp.load(Relaxed);
        let last_out = self.last_out_timestamp.load(Relaxed);
        SorterSnapshot {
            kind: self.kind,
            records_in: self.records_in.load(Relaxed),
            records_out: self.records_out.load(Relaxed),
            bytes_in: self.bytes_in.load(Relaxed),
            bytes_out: self.bytes_out.load(Relaxed),
            unknown_dropped: self.unknown_dropped.load(Relaxed),
            out_of_order: self.out_of_order.load(Relaxed),
            eos_seen: self.eos_seen.load(Relaxed),
            last_in_timestamp: last_in,
            last_out_timestamp: last_out,
            buffered_utc_depth: last_in.saturating_sub(last_out),
            queue_depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let s = SorterStats::new("hit");
        s.records_in.store(10, Relaxed);
        s.records_out.store(8, Relaxed);
        s.last_in_timestamp.store(5_000, Relaxed);
        s.last_out_timestamp.store(3_000, Relaxed);
        let snap = s.snapshot(2);
        assert_eq!(snap.kind, "hit");
        assert_eq!(snap.records_in, 10);
        assert_eq!(snap.records_out, 8);
        assert_eq!(snap.buffered_utc_depth, 2_000);
        assert_eq!(snap.queue_depth, 2);
    }

    #[test]
    fn test_now_ns_is_monotone() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
