//! Collection statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and
//! not used as synchronization primitives. The arena lock provides the
//! ordering guarantees for correctness; these counters are purely for
//! monitoring.
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Trace lifecycle ----
    /// Traces created.
    pub trace_start_count: AtomicU64,
    /// Traces driven to FINISHED.
    pub trace_finish_count: AtomicU64,
    /// Traces that entered emergency mode.
    pub emergency_count: AtomicU64,

    // ---- Byte flows ----
    /// Bytes condemned (turned white) across all traces.
    pub condemned_bytes: AtomicU64,
    /// Bytes copied to a forwarding buffer.
    pub forwarded_bytes: AtomicU64,
    /// Bytes preserved in place by nails.
    pub preserved_bytes: AtomicU64,
    /// Bytes of white segments returned to the OS.
    pub reclaimed_bytes: AtomicU64,

    // ---- Fix / scan ----
    /// References passed to the fix protocol (past the zone test).
    pub fix_count: AtomicU64,
    /// Segment scans performed.
    pub seg_scan_count: AtomicU64,
    /// Nails recorded in nailboards.
    pub nail_count: AtomicU64,

    // ---- Barriers / OS ----
    /// Barrier faults serviced by the access handler.
    pub barrier_fault_count: AtomicU64,
    /// Calls to `platform::page_alloc` for segments.
    pub seg_alloc_count: AtomicU64,
    /// Bytes requested from the OS for segments.
    pub seg_alloc_bytes: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            trace_start_count: AtomicU64::new(0),
            trace_finish_count: AtomicU64::new(0),
            emergency_count: AtomicU64::new(0),
            condemned_bytes: AtomicU64::new(0),
            forwarded_bytes: AtomicU64::new(0),
            preserved_bytes: AtomicU64::new(0),
            reclaimed_bytes: AtomicU64::new(0),
            fix_count: AtomicU64::new(0),
            seg_scan_count: AtomicU64::new(0),
            nail_count: AtomicU64::new(0),
            barrier_fault_count: AtomicU64::new(0),
            seg_alloc_count: AtomicU64::new(0),
            seg_alloc_bytes: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all collection statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub trace_start_count: u64,
    pub trace_finish_count: u64,
    pub emergency_count: u64,
    pub condemned_bytes: u64,
    pub forwarded_bytes: u64,
    pub preserved_bytes: u64,
    pub reclaimed_bytes: u64,
    pub fix_count: u64,
    pub seg_scan_count: u64,
    pub nail_count: u64,
    pub barrier_fault_count: u64,
    pub seg_alloc_count: u64,
    pub seg_alloc_bytes: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        trace_start_count: s.trace_start_count.load(Ordering::Relaxed),
        trace_finish_count: s.trace_finish_count.load(Ordering::Relaxed),
        emergency_count: s.emergency_count.load(Ordering::Relaxed),
        condemned_bytes: s.condemned_bytes.load(Ordering::Relaxed),
        forwarded_bytes: s.forwarded_bytes.load(Ordering::Relaxed),
        preserved_bytes: s.preserved_bytes.load(Ordering::Relaxed),
        reclaimed_bytes: s.reclaimed_bytes.load(Ordering::Relaxed),
        fix_count: s.fix_count.load(Ordering::Relaxed),
        seg_scan_count: s.seg_scan_count.load(Ordering::Relaxed),
        nail_count: s.nail_count.load(Ordering::Relaxed),
        barrier_fault_count: s.barrier_fault_count.load(Ordering::Relaxed),
        seg_alloc_count: s.seg_alloc_count.load(Ordering::Relaxed),
        seg_alloc_bytes: s.seg_alloc_bytes.load(Ordering::Relaxed),
    }
}
