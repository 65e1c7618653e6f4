//! Traces: one collection cycle each.
//!
//! A trace owns a white set (the condemned zones), walks grey segments
//! under a pacing budget, and reclaims what stayed white. The life of a
//! trace:
//!
//! INIT: condemnation computes the white set and whitens segments.
//! UNFLIPPED: transient; the first quantum performs the flip.
//! FLIPPED: mutators see the post-collection world; grey segments are
//! scanned incrementally, read-protected until they are.
//! RECLAIM: no grey remains; white segments are freed or padded out.
//! FINISHED: accounting posted, slot recycled.
//!
//! The fix protocol dispatched from scan states lives here too: it
//! resolves one reference against the condemned set, forwarding, pinning
//! or splatting as the rank demands.

use crate::amc;
use crate::arena::Arena;
use crate::buffer::Buffer;
use crate::fin;
use crate::message::{self, MessageType};
use crate::rank::Rank;
use crate::refset::RefSet;
use crate::root;
use crate::scan::ScanState;
use crate::seg::Seg;
use crate::shield::{self, AccessSet};
use crate::{Addr, Res, Result, Size, stat_inc};
use core::ptr;
use log::{debug, warn};

pub use crate::config::TRACE_MAX;

/// A set of trace ids.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TraceSet(pub usize);

impl TraceSet {
    pub const EMPTY: TraceSet = TraceSet(0);

    #[inline]
    pub const fn single(ti: usize) -> TraceSet {
        TraceSet(1 << ti)
    }

    #[inline]
    pub const fn add(self, ti: usize) -> TraceSet {
        TraceSet(self.0 | 1 << ti)
    }

    #[inline]
    pub const fn del(self, ti: usize) -> TraceSet {
        TraceSet(self.0 & !(1 << ti))
    }

    #[inline]
    pub const fn contains(self, ti: usize) -> bool {
        self.0 & 1 << ti != 0
    }

    #[inline]
    pub const fn union(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 | other.0)
    }

    #[inline]
    pub const fn inter(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 & other.0)
    }

    #[inline]
    pub const fn diff(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 & !other.0)
    }

    #[inline]
    pub const fn is_sub(self, other: TraceSet) -> bool {
        self.0 & !other.0 == 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate member trace ids.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..TRACE_MAX).filter(move |&ti| self.contains(ti))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceState {
    Init,
    Unflipped,
    Flipped,
    Reclaim,
    Finished,
}

/// One collection cycle. Slots live in the arena, indexed by trace id.
pub struct Trace {
    pub busy: bool,
    pub state: TraceState,
    /// Condemned zones.
    pub white: RefSet,
    /// Zones that may move; a subset of `white`.
    pub may_move: RefSet,
    /// Bytes condemned.
    pub condemned: Size,
    /// Bytes in collectable segments left out of the condemnation.
    pub not_condemned: Size,
    /// Bytes grey at the start; the base of the pacing formula.
    pub foundation: Size,
    /// Scan-work budget per poll quantum, in bytes.
    pub rate: Size,
    /// Bytes copied to forwarding buffers.
    pub forwarded: Size,
    /// Bytes preserved in place by nails.
    pub preserved_in_place: Size,
    /// Bytes reclaimed (freed segments and padded-out runs).
    pub reclaim_size: Size,
    pub root_scan_count: usize,
    pub seg_scan_count: usize,
    pub fix_count: u64,
    /// Forwarding space ran out; fixes pin instead of copying.
    pub emergency: bool,
    /// The FINAL-rank pass has run.
    pub fin_done: bool,
    /// Weak-ranked roots have been splatted or snapped.
    pub weak_done: bool,
    pub why: &'static str,
}

impl Trace {
    pub const fn empty() -> Trace {
        Trace {
            busy: false,
            state: TraceState::Finished,
            white: RefSet::EMPTY,
            may_move: RefSet::EMPTY,
            condemned: 0,
            not_condemned: 0,
            foundation: 0,
            rate: 0,
            forwarded: 0,
            preserved_in_place: 0,
            reclaim_size: 0,
            root_scan_count: 0,
            seg_scan_count: 0,
            fix_count: 0,
            emergency: false,
            fin_done: false,
            weak_done: false,
            why: "",
        }
    }
}

// ---- Colour transitions ----

/// Make `seg` grey for `traces`, raising the read barrier when required:
/// a segment grey for a flipped trace must be protected unless it is
/// nailed (nailed segments are rescanned regardless).
///
/// # Safety
/// Arena lock held.
pub(crate) unsafe fn seg_set_grey(arena: *mut Arena, seg: *mut Seg, traces: TraceSet) {
    unsafe {
        debug_assert!(!(*seg).rank_set.is_empty());
        if traces.is_sub((*seg).grey) {
            return;
        }
        (*seg).grey = (*seg).grey.union(traces);
        if !(*seg).grey.inter((*arena).flipped).is_empty() && (*seg).nailed.is_empty() {
            shield::raise(arena, seg, AccessSet::READ);
        }
    }
}

/// Remove greyness for `traces`, lowering the read barrier when no
/// flipped trace still has the segment grey.
unsafe fn seg_set_greyless(arena: *mut Arena, seg: *mut Seg, traces: TraceSet) {
    unsafe {
        (*seg).grey = (*seg).grey.diff(traces);
        if (*seg).grey.inter((*arena).flipped).is_empty() {
            shield::lower(arena, seg, AccessSet::READ);
        }
    }
}

/// Install a scanned segment's summary, maintaining the write barrier: a
/// summary tighter than universal is only sound while mutator writes are
/// trapped.
///
/// # Safety
/// Arena lock held.
pub(crate) unsafe fn seg_set_summary(arena: *mut Arena, seg: *mut Seg, summary: RefSet) {
    unsafe {
        if (*seg).rank_set.is_empty() {
            return;
        }
        if !(*seg).buffer.is_null() || !(*arena).config.barriers {
            // Buffered segments take unobserved writes, and without real
            // barriers no write is ever observed; keep universal.
            (*seg).summary = RefSet::UNIV;
            return;
        }
        (*seg).summary = summary;
        if summary == RefSet::UNIV {
            shield::lower(arena, seg, AccessSet::WRITE);
        } else {
            shield::raise(arena, seg, AccessSet::WRITE);
        }
    }
}

// ---- The fix protocol ----

/// The normal per-reference fix: dispatch to the owning pool.
///
/// # Safety
/// Called through a `ScanState` whose zone pre-test passed.
pub(crate) unsafe fn trace_fix(ss: &mut ScanState, refio: *mut Addr) -> Res {
    unsafe {
        stat_inc!(fix_count);
        let arena = ss.arena;
        let r = *refio;
        let seg = (*arena).segmap.of_addr(r);
        if seg.is_null() {
            // Only ambiguous candidates may be non-pointers; an exact or
            // stronger rank handing back unmanaged memory is a client
            // format bug.
            debug_assert!(
                ss.rank < Rank::Exact,
                "exact-or-higher rank reference to unmanaged memory"
            );
            return Res::Ok;
        }
        if (*seg).white.inter(ss.traces).is_empty() {
            // Not condemned for these traces; just record where it points.
            ss.fixed = ss.fixed.add(ss.zone_shift, r);
            return Res::Ok;
        }
        let res = amc::fix((*seg).pool, ss, seg, refio);
        if res == Res::Ok {
            ss.fixed = ss.fixed.add(ss.zone_shift, *refio);
        }
        res
    }
}

/// The emergency fix: pin instead of forwarding. Cannot fail for want of
/// memory (board creation failure degrades to whole-segment pinning).
///
/// # Safety
/// As for [`trace_fix`].
pub(crate) unsafe fn trace_fix_emergency(ss: &mut ScanState, refio: *mut Addr) -> Res {
    unsafe {
        stat_inc!(fix_count);
        let arena = ss.arena;
        let r = *refio;
        let seg = (*arena).segmap.of_addr(r);
        if seg.is_null() {
            debug_assert!(
                ss.rank < Rank::Exact,
                "exact-or-higher rank reference to unmanaged memory"
            );
            return Res::Ok;
        }
        if (*seg).white.inter(ss.traces).is_empty() {
            ss.fixed = ss.fixed.add(ss.zone_shift, r);
            return Res::Ok;
        }
        let res = amc::fix_emergency((*seg).pool, ss, seg, refio);
        if res == Res::Ok {
            ss.fixed = ss.fixed.add(ss.zone_shift, *refio);
        }
        res
    }
}

// ---- Lifecycle ----

/// Allocate a trace slot.
///
/// # Safety
/// Arena lock held.
pub(crate) unsafe fn create(arena: *mut Arena, why: &'static str) -> Result<usize> {
    unsafe {
        for ti in 0..TRACE_MAX {
            if !(*arena).traces[ti].busy {
                (*arena).traces[ti] = Trace::empty();
                let trace = &mut (*arena).traces[ti];
                trace.busy = true;
                trace.state = TraceState::Init;
                trace.why = why;
                (*arena).busy_traces = (*arena).busy_traces.add(ti);
                stat_inc!(trace_start_count);
                return Ok(ti);
            }
        }
        Err(Res::Limit)
    }
}

/// Free a trace slot.
///
/// # Safety
/// Arena lock held; the trace must be FINISHED (or freshly created and
/// abandoned).
pub(crate) unsafe fn destroy(arena: *mut Arena, ti: usize) {
    unsafe {
        (*arena).traces[ti].busy = false;
        (*arena).busy_traces = (*arena).busy_traces.del(ti);
        (*arena).flipped = (*arena).flipped.del(ti);
    }
}

/// Condemn every collectable segment whose zone set is within `set`.
///
/// # Safety
/// Arena lock held; trace `ti` in INIT state.
pub(crate) unsafe fn condemn_refset(arena: *mut Arena, ti: usize, set: RefSet) {
    unsafe {
        let shift = (*arena).zone_shift;
        let mut pool = (*arena).pools;
        while !pool.is_null() {
            amc::trace_start_hook(pool);
            let mut r#gen = (*pool).gens;
            while !r#gen.is_null() {
                let mut seg = (*r#gen).segs.head;
                while !seg.is_null() {
                    let seg_zones = (*seg).refset(shift);
                    if seg_zones.is_sub(set) {
                        if amc::whiten(pool, ti, seg) {
                            let trace = &mut (*arena).traces[ti];
                            trace.white = trace.white.union(seg_zones);
                            // AMC moves what it condemns.
                            trace.may_move = trace.may_move.union(seg_zones);
                        } else {
                            (*arena).traces[ti].not_condemned += (*seg).size();
                        }
                    } else {
                        (*arena).traces[ti].not_condemned += (*seg).size();
                    }
                    seg = (*seg).next;
                }
                r#gen = (*r#gen).next;
            }
            pool = (*pool).next;
        }
    }
}

/// Start a condemned trace: grey every segment that could refer into the
/// white set, compute the pacing rate, announce the collection.
///
/// # Safety
/// Arena lock held; trace `ti` condemned.
pub(crate) unsafe fn start(arena: *mut Arena, ti: usize, mortality: f64) {
    unsafe {
        let white = (*arena).traces[ti].white;
        let mut foundation: Size = 0;
        let mut pool = (*arena).pools;
        while !pool.is_null() {
            let mut r#gen = (*pool).gens;
            while !r#gen.is_null() {
                let mut seg = (*r#gen).segs.head;
                while !seg.is_null() {
                    if !(*seg).is_white(ti)
                        && !(*seg).rank_set.is_empty()
                        && (*seg).summary.intersects(white)
                    {
                        seg_set_grey(arena, seg, TraceSet::single(ti));
                        foundation += (*seg).size();
                    }
                    seg = (*seg).next;
                }
                r#gen = (*r#gen).next;
            }
            pool = (*pool).next;
        }

        let trace = &mut (*arena).traces[ti];
        trace.foundation = foundation;
        let survivors = (trace.condemned as f64 * (1.0 - mortality)) as Size;
        let finishing = if (*arena).commit_limit == usize::MAX {
            trace.condemned * 2
        } else {
            ((*arena).commit_limit - (*arena).committed).max(1)
        };
        let polls = (finishing / (*arena).config.poll_every).max(1);
        trace.rate = (foundation + survivors) / polls + 1;
        trace.state = TraceState::Unflipped;

        debug!(
            "trace {} start: condemned {} foundation {} rate {} ({})",
            ti, trace.condemned, foundation, trace.rate, trace.why
        );
        let msg = message::post(arena, MessageType::GcStart);
        if !msg.is_null() {
            (*msg).why = trace.why;
        }
    }
}

/// Scan every root of `rank`, with a single emergency retry on resource
/// exhaustion.
unsafe fn scan_roots(arena: *mut Arena, ti: usize, rank: Rank) -> Res {
    unsafe {
        let white = (*arena).traces[ti].white;
        let mut root_ptr = (*arena).roots;
        while !root_ptr.is_null() {
            if (*root_ptr).rank == rank {
                let mut ss = ScanState::init(arena, TraceSet::single(ti), rank, white);
                let mut res = root::scan_root(&mut ss, root_ptr);
                if res.is_alloc_failure() {
                    set_emergency(arena, TraceSet::single(ti));
                    let mut ss2 = ScanState::init(arena, TraceSet::single(ti), rank, white);
                    res = root::scan_root(&mut ss2, root_ptr);
                }
                if res != Res::Ok {
                    return res;
                }
                (*arena).traces[ti].root_scan_count += 1;
            }
            root_ptr = (*root_ptr).next;
        }
        // Finalization-message referents are strong until discarded.
        if rank == Rank::Exact {
            let white = (*arena).traces[ti].white;
            let mut ss = ScanState::init(arena, TraceSet::single(ti), Rank::Exact, white);
            let mut msg = (*arena).messages;
            while !msg.is_null() {
                if message::type_of(msg) == MessageType::Finalization {
                    let res = ss.fix(&raw mut (*msg).fin_ref);
                    if res != Res::Ok {
                        return res;
                    }
                }
                msg = (*msg).next;
            }
        }
        Res::Ok
    }
}

/// The flip: suspend mutators, trap allocation points, age location
/// dependencies, scan all roots, raise read barriers on what is grey, and
/// let the mutator back into the post-collection world.
///
/// # Safety
/// Arena lock held; trace `ti` in UNFLIPPED state.
unsafe fn flip(arena: *mut Arena, ti: usize) -> Res {
    unsafe {
        shield::suspend(arena);

        let mut pool = (*arena).pools;
        while !pool.is_null() {
            let mut buf = (*pool).buffers;
            while !buf.is_null() {
                Buffer::flip(buf);
                buf = (*buf).next;
            }
            pool = (*pool).next;
        }

        crate::ld::age(arena, (*arena).traces[ti].may_move);

        for rank in [Rank::Ambig, Rank::Exact] {
            let res = scan_roots(arena, ti, rank);
            if res != Res::Ok {
                shield::resume(arena);
                return res;
            }
        }

        // Raise the read barrier on every unnailed grey segment.
        let mut pool = (*arena).pools;
        while !pool.is_null() {
            let mut r#gen = (*pool).gens;
            while !r#gen.is_null() {
                let mut seg = (*r#gen).segs.head;
                while !seg.is_null() {
                    if (*seg).is_grey(ti) && (*seg).nailed.is_empty() {
                        shield::raise(arena, seg, AccessSet::READ);
                    }
                    seg = (*seg).next;
                }
                r#gen = (*r#gen).next;
            }
            pool = (*pool).next;
        }

        (*arena).traces[ti].state = TraceState::Flipped;
        (*arena).flipped = (*arena).flipped.add(ti);
        shield::resume(arena);
        debug!("trace {} flipped", ti);
        Res::Ok
    }
}

/// Find a grey segment to scan, lowest rank first.
unsafe fn find_grey(arena: *mut Arena, ti: usize) -> *mut Seg {
    unsafe {
        let mut best: *mut Seg = ptr::null_mut();
        let mut best_rank = Rank::Weak;
        let mut pool = (*arena).pools;
        while !pool.is_null() {
            let mut r#gen = (*pool).gens;
            while !r#gen.is_null() {
                let mut seg = (*r#gen).segs.head;
                while !seg.is_null() {
                    if (*seg).is_grey(ti)
                        && let Some(rank) = (*seg).rank_set.lowest()
                        && (best.is_null() || rank < best_rank)
                    {
                        best = seg;
                        best_rank = rank;
                        if rank == Rank::Ambig {
                            return best;
                        }
                    }
                    seg = (*seg).next;
                }
                r#gen = (*r#gen).next;
            }
            pool = (*pool).next;
        }
        best
    }
}

/// Scan one grey segment, clearing its greyness and installing the scan's
/// summary on success.
unsafe fn scan_seg(arena: *mut Arena, ti: usize, seg: *mut Seg) -> Res {
    unsafe {
        let ts = (*seg).grey.inter((*arena).flipped.add(ti));
        let white = (*arena).white_union(ts);
        let rank = (*seg).rank_set.lowest().unwrap_or(Rank::Exact);
        let mut ss = ScanState::init(arena, ts, rank, white);
        shield::expose(arena, seg);
        let res = amc::seg_scan((*seg).pool, &mut ss, seg);
        if res == Res::Ok {
            seg_set_greyless(arena, seg, ts);
            seg_set_summary(arena, seg, ss.summary());
        }
        shield::cover(arena, seg);
        let trace = &mut (*arena).traces[ti];
        trace.seg_scan_count += 1;
        trace.fix_count += ss.fix_count;
        res
    }
}

/// Service a read-barrier fault: scan the segment so it stops being grey
/// for any flipped trace, which lowers the barrier.
///
/// # Safety
/// Arena lock held; `seg` live.
pub(crate) unsafe fn seg_access(arena: *mut Arena, seg: *mut Seg) {
    unsafe {
        let ts = (*seg).grey.inter((*arena).flipped);
        let Some(ti) = ts.iter().next() else {
            // Stale protection; nothing is grey for a flipped trace.
            shield::lower(arena, seg, AccessSet::READ);
            return;
        };
        let res = scan_seg(arena, ti, seg);
        if res.is_alloc_failure() {
            set_emergency(arena, ts);
            let res = scan_seg(arena, ti, seg);
            debug_assert_eq!(res, Res::Ok);
        }
    }
}

/// Mark traces as being in emergency mode: forwarding space is exhausted,
/// so all further fixing pins in place.
pub(crate) unsafe fn set_emergency(arena: *mut Arena, traces: TraceSet) {
    unsafe {
        for ti in traces.iter() {
            if !(*arena).traces[ti].emergency {
                (*arena).traces[ti].emergency = true;
                stat_inc!(emergency_count);
                warn!("trace {} entering emergency mode", ti);
            }
        }
    }
}

/// Reclaim every segment still white for the trace.
unsafe fn reclaim_all(arena: *mut Arena, ti: usize) {
    unsafe {
        let mut pool = (*arena).pools;
        while !pool.is_null() {
            let mut r#gen = (*pool).gens;
            while !r#gen.is_null() {
                let mut seg = (*r#gen).segs.head;
                while !seg.is_null() {
                    let next = (*seg).next;
                    if (*seg).is_white(ti) {
                        amc::reclaim(pool, ti, seg);
                    }
                    seg = next;
                }
                r#gen = (*r#gen).next;
            }
            pool = (*pool).next;
        }
    }
}

/// Complete a trace: post accounting, run pool hooks, free the slot.
unsafe fn finish(arena: *mut Arena, ti: usize) {
    unsafe {
        {
            let trace = &mut (*arena).traces[ti];
            trace.state = TraceState::Finished;
        }
        (*arena).flipped = (*arena).flipped.del(ti);

        let mut pool = (*arena).pools;
        while !pool.is_null() {
            amc::trace_finish_hook(pool);
            pool = (*pool).next;
        }

        let trace = &(*arena).traces[ti];
        let live = trace.forwarded + trace.preserved_in_place;
        debug!(
            "trace {} finished: condemned {} live {} reclaimed {}{}",
            ti,
            trace.condemned,
            live,
            trace.reclaim_size,
            if trace.emergency { " (emergency)" } else { "" }
        );
        let msg = message::post(arena, MessageType::Gc);
        if !msg.is_null() {
            (*msg).live = live;
            (*msg).condemned = trace.condemned;
            (*msg).not_condemned = trace.not_condemned;
        }
        stat_inc!(trace_finish_count);
        destroy(arena, ti);
    }
}

/// Advance a trace by one quantum of work (about `rate` bytes of scan).
///
/// # Safety
/// Arena lock held; `ti` busy.
pub(crate) unsafe fn quantum(arena: *mut Arena, ti: usize) {
    unsafe {
        match (*arena).traces[ti].state {
            TraceState::Init => {}
            TraceState::Unflipped => {
                // Resource exhaustion during root scanning already retried
                // under the emergency fix, which cannot run out.
                let res = flip(arena, ti);
                debug_assert_eq!(res, Res::Ok);
            }
            TraceState::Flipped => {
                let mut scanned: Size = 0;
                let budget = (*arena).traces[ti].rate;
                loop {
                    if scanned >= budget {
                        break;
                    }
                    let seg = find_grey(arena, ti);
                    if seg.is_null() {
                        if !(*arena).traces[ti].fin_done {
                            (*arena).traces[ti].fin_done = true;
                            let white = (*arena).traces[ti].white;
                            let res = fin::pass(arena, ti, white);
                            if res.is_alloc_failure() {
                                // Rerun the pass under the emergency fix;
                                // already-converted entries are gone and
                                // already-fixed references are no longer
                                // white, so the rerun is idempotent.
                                set_emergency(arena, TraceSet::single(ti));
                                (*arena).traces[ti].fin_done = false;
                            }
                            continue;
                        }
                        if !(*arena).traces[ti].weak_done {
                            (*arena).traces[ti].weak_done = true;
                            let res = scan_roots(arena, ti, Rank::Weak);
                            debug_assert_eq!(res, Res::Ok);
                            continue;
                        }
                        (*arena).traces[ti].state = TraceState::Reclaim;
                        break;
                    }
                    let size = (*seg).size();
                    let res = scan_seg(arena, ti, seg);
                    if res.is_alloc_failure() {
                        // Re-scan under the emergency fix; the segment is
                        // still grey.
                        set_emergency(arena, TraceSet::single(ti));
                        continue;
                    }
                    debug_assert_eq!(res, Res::Ok);
                    scanned += size;
                }
            }
            TraceState::Reclaim => {
                reclaim_all(arena, ti);
                finish(arena, ti);
            }
            TraceState::Finished => {}
        }
    }
}

/// Drive a trace to completion in emergency mode.
///
/// # Safety
/// Arena lock held; `ti` busy.
pub(crate) unsafe fn expedite(arena: *mut Arena, ti: usize) {
    unsafe {
        set_emergency(arena, TraceSet::single(ti));
        while (*arena).traces[ti].busy {
            quantum(arena, ti);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_set_ops() {
        let ts = TraceSet::EMPTY;
        assert!(ts.is_empty());
        let ts = ts.add(0);
        assert!(ts.contains(0));
        assert!(TraceSet::single(0).is_sub(ts));
        assert!(ts.inter(TraceSet::EMPTY).is_empty());
        assert_eq!(ts.del(0), TraceSet::EMPTY);
        assert_eq!(ts.iter().count(), 1);
    }

    #[test]
    fn test_trace_slot_defaults() {
        let t = Trace::empty();
        assert!(!t.busy);
        assert_eq!(t.state, TraceState::Finished);
        assert_eq!(t.condemned, 0);
        assert!(!t.emergency);
    }
}
