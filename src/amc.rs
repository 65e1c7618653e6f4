//! AMC: the automatic mostly-copying pool class.
//!
//! AMC allocates formatted objects through bump-allocation points and
//! collects by copying live objects into the next generation's forwarding
//! buffer. "Mostly" copying: ambiguous references pin objects in place
//! (recorded in per-segment nailboards), and nailed segments are scanned
//! and reclaimed object-by-object, coalescing the dead into padding.
//!
//! AMCZ is the leaf variant: identical allocation and copying machinery,
//! but its segments carry no reference ranks, so they are never greyed or
//! scanned.
//!
//! Segment lifecycle: created on buffer fill (nursery for mutator buffers,
//! the promotion target for forwarding buffers), whitened at condemnation,
//! scanned while grey, reclaimed when the trace finishes. A segment whose
//! accounting is *deferred* (ramp allocation, hash arrays) does not count
//! toward its generation's new size until the deferral ends.

use crate::arena::Arena;
use crate::buffer::Buffer;
use crate::chain::Chain;
use crate::config::PAGE_SIZE;
use crate::format::Format;
use crate::nailboard::Nailboard;
use crate::platform;
use crate::rank::{Rank, RankSet};
use crate::refset::RefSet;
use crate::scan::ScanState;
use crate::seg::{Seg, SegList};
use crate::shield::{self, AccessSet};
use crate::trace;
use crate::{Addr, Res, Result, Size, align_up, stat_add, stat_inc};
use core::ptr;
use log::{debug, trace as log_trace};

/// Ramp pattern state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RampMode {
    /// No ramp declared.
    Outside,
    /// Ramp declared; no collection has begun since.
    Begin,
    /// A collection began inside the ramp; ramp-generation forwarding is
    /// redirected to the ramp generation itself.
    Ramping,
    /// Ramp ended; deferred accounting has materialized, the collection
    /// that will drain the ramp generation has not begun.
    Finish,
    /// The post-ramp collection is underway.
    Collecting,
}

/// One generation bucket of a pool.
#[repr(C)]
pub struct AmcGen {
    pub pool: *mut AmcPool,
    pub segs: SegList,
    /// Outgoing forwarding buffer; its `r#gen` field is the promotion
    /// target (the next generation, or this one for the last and during
    /// ramping).
    pub forward: *mut Buffer,
    /// Index in the pool's chain.
    pub index: usize,
    /// Bytes in segments allocated since this generation was last
    /// condemned; drives the collection trigger.
    pub new_size: Size,
    /// Bytes in segments that have been condemned at least once.
    pub old_size: Size,
    /// Bytes in deferred segments, excluded from `new_size`.
    pub deferred_size: Size,
    pub next: *mut AmcGen,
}

/// Pool creation options.
#[derive(Clone, Copy)]
pub struct AmcParams {
    /// Segment size granted to small-object fills.
    pub extend_by: Size,
    /// Objects at least this large get their own segment.
    pub large_size: Size,
    /// Interior pinning: an ambiguous reference anywhere inside an object
    /// pins it. With `false`, only references to the object base pin.
    pub interior_pinning: bool,
    /// Chain index of the ramp generation; defaults to the last.
    pub ramp_gen: Option<usize>,
}

impl Default for AmcParams {
    fn default() -> Self {
        AmcParams {
            extend_by: crate::config::DEFAULT_EXTEND_BY,
            large_size: crate::config::DEFAULT_LARGE_SIZE,
            interior_pinning: true,
            ramp_gen: None,
        }
    }
}

#[repr(C)]
pub struct AmcPool {
    pub arena: *mut Arena,
    pub format: *mut Format,
    pub chain: *mut Chain,
    /// `{EXACT}` for AMC, empty for the AMCZ leaf variant.
    pub rank_set: RankSet,
    /// Generations, youngest first.
    pub gens: *mut AmcGen,
    pub gen_count: usize,
    pub nursery: *mut AmcGen,
    pub ramp_gen: *mut AmcGen,
    pub after_ramp_gen: *mut AmcGen,
    pub ramp_mode: RampMode,
    pub ramp_count: usize,
    pub interior_pinning: bool,
    pub extend_by: Size,
    pub large_size: Size,
    /// All attached buffers, mutator and forwarding.
    pub buffers: *mut Buffer,
    pub next: *mut AmcPool,
}

impl AmcPool {
    /// Create an AMC pool (exact references, scanned and copied).
    ///
    /// # Safety
    /// `arena`, `format` and `chain` must be live and belong together.
    pub unsafe fn create(
        arena: *mut Arena,
        format: *mut Format,
        chain: *mut Chain,
        params: &AmcParams,
    ) -> Result<*mut AmcPool> {
        unsafe { Self::create_inner(arena, format, chain, params, RankSet::single(Rank::Exact)) }
    }

    /// Create an AMCZ pool: the leaf variant for reference-free objects.
    ///
    /// # Safety
    /// As for [`create`](Self::create).
    pub unsafe fn create_z(
        arena: *mut Arena,
        format: *mut Format,
        chain: *mut Chain,
        params: &AmcParams,
    ) -> Result<*mut AmcPool> {
        unsafe { Self::create_inner(arena, format, chain, params, RankSet::EMPTY) }
    }

    unsafe fn create_inner(
        arena: *mut Arena,
        format: *mut Format,
        chain: *mut Chain,
        params: &AmcParams,
        rank_set: RankSet,
    ) -> Result<*mut AmcPool> {
        if params.extend_by == 0 || params.large_size == 0 {
            return Err(Res::Param);
        }
        unsafe {
            if (*format).arena != arena || (*chain).arena != arena {
                return Err(Res::Param);
            }
            let gen_count = (*chain).gen_count;
            if let Some(rg) = params.ramp_gen
                && rg >= gen_count
            {
                return Err(Res::Param);
            }

            (*arena).enter();
            let pool = (*arena).control.alloc_obj::<AmcPool>();
            if pool.is_null() {
                (*arena).leave();
                return Err(Res::Memory);
            }
            (*pool).arena = arena;
            (*pool).format = format;
            (*pool).chain = chain;
            (*pool).rank_set = rank_set;
            (*pool).gen_count = gen_count;
            (*pool).ramp_mode = RampMode::Outside;
            (*pool).ramp_count = 0;
            (*pool).interior_pinning = params.interior_pinning;
            (*pool).extend_by = align_up(params.extend_by, PAGE_SIZE);
            (*pool).large_size = params.large_size;
            (*pool).buffers = ptr::null_mut();

            // Generations, youngest first, each with a forwarding buffer
            // targeting the next; the last forwards to itself.
            let mut gens: [*mut AmcGen; 64] = [ptr::null_mut(); 64];
            for (i, slot) in gens.iter_mut().enumerate().take(gen_count) {
                let g = (*arena).control.alloc_obj::<AmcGen>();
                if g.is_null() {
                    (*arena).leave();
                    return Err(Res::Memory);
                }
                (*g).pool = pool;
                (*g).segs = SegList::new();
                (*g).index = i;
                *slot = g;
            }
            for i in 0..gen_count {
                let g = gens[i];
                (*g).next = if i + 1 < gen_count {
                    gens[i + 1]
                } else {
                    ptr::null_mut()
                };
                let target = gens[(i + 1).min(gen_count - 1)];
                let fwd = Buffer::create_inner(pool, target, false, false);
                if fwd.is_null() {
                    (*arena).leave();
                    return Err(Res::Memory);
                }
                (*g).forward = fwd;
            }
            (*pool).gens = gens[0];
            (*pool).nursery = gens[0];
            let rg = params.ramp_gen.unwrap_or(gen_count - 1);
            (*pool).ramp_gen = gens[rg];
            (*pool).after_ramp_gen = gens[(rg + 1).min(gen_count - 1)];

            (*format).pool_count += 1;
            (*chain).pool_count += 1;
            (*pool).next = (*arena).pools;
            (*arena).pools = pool;
            (*arena).leave();
            debug!(
                "amc pool created: {} generations, {:?} ranks",
                gen_count, rank_set
            );
            Ok(pool)
        }
    }

    /// Destroy the pool: finish any busy trace, then free every buffer and
    /// segment.
    ///
    /// # Safety
    /// `pool` must come from a constructor; client allocation points on it
    /// must be destroyed first.
    pub unsafe fn destroy(pool: *mut AmcPool) {
        unsafe {
            let arena = (*pool).arena;
            (*arena).enter();
            (*arena).park_locked();

            while !(*pool).buffers.is_null() {
                Buffer::destroy_inner((*pool).buffers);
            }
            let mut r#gen = (*pool).gens;
            while !r#gen.is_null() {
                while !(*r#gen).segs.head.is_null() {
                    seg_free(pool, (*r#gen).segs.head);
                }
                let next = (*r#gen).next;
                (*arena).control.free_obj(r#gen);
                r#gen = next;
            }
            (*(*pool).format).pool_count -= 1;
            (*(*pool).chain).pool_count -= 1;
            let mut link = &raw mut (*arena).pools;
            while !(*link).is_null() && *link != pool {
                link = &raw mut (**link).next;
            }
            if *link == pool {
                *link = (*pool).next;
            }
            (*arena).control.free_obj(pool);
            (*arena).leave();
        }
    }

    /// Total bytes of segments owned by the pool.
    ///
    /// # Safety
    /// `pool` live.
    pub unsafe fn total_size(pool: *mut AmcPool) -> Size {
        unsafe {
            let arena = (*pool).arena;
            (*arena).enter();
            let mut total = 0;
            let mut r#gen = (*pool).gens;
            while !r#gen.is_null() {
                let mut seg = (*r#gen).segs.head;
                while !seg.is_null() {
                    total += (*seg).size();
                    seg = (*seg).next;
                }
                r#gen = (*r#gen).next;
            }
            (*arena).leave();
            total
        }
    }

    /// Bytes not yet handed to the client: the unallocated tails of
    /// attached buffers.
    ///
    /// # Safety
    /// `pool` live.
    pub unsafe fn free_size(pool: *mut AmcPool) -> Size {
        unsafe {
            let arena = (*pool).arena;
            (*arena).enter();
            let mut free = 0;
            let mut buf = (*pool).buffers;
            while !buf.is_null() {
                if !(*buf).seg.is_null() {
                    let limit = if (*buf).ap_limit != 0 {
                        (*buf).ap_limit
                    } else {
                        (*buf).pool_limit
                    };
                    free += limit - (*buf).ap_alloc;
                }
                buf = (*buf).next;
            }
            (*arena).leave();
            free
        }
    }

    /// Declare the start of a ramp allocation pattern.
    ///
    /// # Safety
    /// `pool` live.
    pub unsafe fn ramp_begin(pool: *mut AmcPool) {
        unsafe {
            let arena = (*pool).arena;
            (*arena).enter();
            (*pool).ramp_count += 1;
            if (*pool).ramp_count == 1 && (*pool).ramp_mode == RampMode::Outside {
                (*pool).ramp_mode = RampMode::Begin;
            }
            (*arena).leave();
        }
    }

    /// Declare the end of a ramp begun by [`ramp_begin`](Self::ramp_begin).
    /// When the outermost ramp ends, deferred accounting materializes.
    ///
    /// # Safety
    /// `pool` live; calls must pair with `ramp_begin`.
    pub unsafe fn ramp_end(pool: *mut AmcPool) {
        unsafe {
            let arena = (*pool).arena;
            (*arena).enter();
            debug_assert!((*pool).ramp_count > 0);
            (*pool).ramp_count -= 1;
            if (*pool).ramp_count == 0 {
                match (*pool).ramp_mode {
                    RampMode::Begin => {
                        (*pool).ramp_mode = RampMode::Outside;
                        undefer((*pool).ramp_gen);
                    }
                    RampMode::Ramping => {
                        (*pool).ramp_mode = RampMode::Finish;
                        undefer((*pool).ramp_gen);
                    }
                    _ => {}
                }
            }
            (*arena).leave();
        }
    }

    /// Visit every formatted object in the pool (including padding and
    /// forwarding markers; the visitor distinguishes them with its own
    /// knowledge of the format). Parks the arena first.
    ///
    /// # Safety
    /// `pool` live; `visitor` must not call back into the collector.
    pub unsafe fn walk(pool: *mut AmcPool, visitor: WalkMethod, closure: *mut u8) {
        unsafe {
            let arena = (*pool).arena;
            (*arena).enter();
            (*arena).park_locked();
            let fmt = (*pool).format;
            let header = (*fmt).header_size;
            let mut r#gen = (*pool).gens;
            while !r#gen.is_null() {
                let mut seg = (*r#gen).segs.head;
                while !seg.is_null() {
                    let walk_limit = seg_scan_frontier(seg);
                    if walk_limit > (*seg).base {
                        shield::expose(arena, seg);
                        let mut p = (*seg).base + header;
                        let limit = walk_limit + header;
                        while p < limit {
                            let next = ((*fmt).skip)(p);
                            visitor(p, fmt, pool, next - p, closure);
                            p = next;
                        }
                        shield::cover(arena, seg);
                    }
                    seg = (*seg).next;
                }
                r#gen = (*r#gen).next;
            }
            (*arena).leave();
        }
    }
}

/// Object visitor for [`AmcPool::walk`].
pub type WalkMethod =
    unsafe fn(client: Addr, fmt: *mut Format, pool: *mut AmcPool, size: Size, closure: *mut u8);

/// How far a segment's contents can be observed: up to the attached
/// buffer's scan limit, or the whole segment when unbuffered.
pub(crate) unsafe fn seg_scan_frontier(seg: *mut Seg) -> Addr {
    unsafe {
        let buf = (*seg).buffer;
        if buf.is_null() {
            (*seg).limit
        } else {
            (*buf).scan_limit()
        }
    }
}

// ---- Segment lifecycle ----

unsafe fn seg_alloc(
    pool: *mut AmcPool,
    r#gen: *mut AmcGen,
    size: Size,
    deferred: bool,
) -> Result<*mut Seg> {
    unsafe {
        let arena = (*pool).arena;
        debug_assert_eq!(size % PAGE_SIZE, 0);
        if (*arena).committed_total() + size > (*arena).commit_limit {
            return Err(Res::CommitLimit);
        }
        let mem = platform::page_alloc(size);
        if mem.is_null() {
            return Err(Res::Memory);
        }
        let seg = (*arena).control.alloc_obj::<Seg>();
        if seg.is_null() {
            platform::page_dealloc(mem, size);
            return Err(Res::Memory);
        }
        (*seg).base = mem as Addr;
        (*seg).limit = mem as Addr + size;
        (*seg).pool = pool;
        (*seg).r#gen = r#gen;
        (*seg).rank_set = (*pool).rank_set;
        (*seg).summary = if (*pool).rank_set.is_empty() {
            RefSet::EMPTY
        } else {
            RefSet::UNIV
        };
        (*seg).sm = AccessSet::empty();
        (*seg).deferred = deferred;
        (*arena).committed += size;
        if deferred {
            (*r#gen).deferred_size += size;
        } else {
            (*r#gen).new_size += size;
        }
        (*arena).segmap.register(seg);
        (*r#gen).segs.push(seg);
        stat_inc!(seg_alloc_count);
        stat_add!(seg_alloc_bytes, size);
        log_trace!(
            "seg alloc: [{:#x}, {:#x}) r#gen {}",
            (*seg).base,
            (*seg).limit,
            (*r#gen).index
        );
        Ok(seg)
    }
}

pub(crate) unsafe fn seg_free(pool: *mut AmcPool, seg: *mut Seg) {
    unsafe {
        let arena = (*pool).arena;
        let r#gen = (*seg).r#gen;
        debug_assert!((*seg).buffer.is_null());
        shield::lower(arena, seg, AccessSet::all());
        if !(*seg).board.is_null() {
            Nailboard::destroy(&mut (*arena).control, (*seg).board);
            (*seg).board = ptr::null_mut();
        }
        (*arena).segmap.unregister(seg);
        (*r#gen).segs.remove(seg);
        let size = (*seg).size();
        if (*seg).deferred {
            (*r#gen).deferred_size -= size;
        } else if (*seg).old {
            (*r#gen).old_size -= size;
        } else {
            (*r#gen).new_size -= size;
        }
        (*arena).committed -= size;
        let base = (*seg).base;
        platform::page_dealloc(base as *mut u8, size);
        (*arena).control.free_obj(seg);
        log_trace!("seg free: {:#x} ({} bytes)", base, size);
    }
}

fn undefer(r#gen: *mut AmcGen) {
    unsafe {
        let mut seg = (*r#gen).segs.head;
        while !seg.is_null() {
            if (*seg).deferred {
                let size = (*seg).size();
                (*seg).deferred = false;
                (*r#gen).deferred_size -= size;
                if (*seg).old {
                    (*r#gen).old_size += size;
                } else {
                    (*r#gen).new_size += size;
                }
            }
            seg = (*seg).next;
        }
    }
}

// ---- Buffer fill / empty ----

/// Give `buf` a fresh segment and reserve `size` bytes from it. Arena lock
/// held (the public entry is `Buffer::fill`).
pub(crate) unsafe fn buffer_fill(buf: *mut Buffer, size: Size) -> Result<Addr> {
    unsafe {
        let pool = (*buf).pool;
        let fmt = (*pool).format;
        debug_assert_eq!(size % (*fmt).align, 0, "allocation size must be aligned");
        debug_assert!((*buf).seg.is_null());

        let r#gen = (*buf).r#gen;
        let seg_size = if size >= (*pool).large_size {
            align_up(size, PAGE_SIZE)
        } else {
            (*pool).extend_by.max(align_up(size, PAGE_SIZE))
        };
        let deferred = (*buf).deferred
            || (matches!((*pool).ramp_mode, RampMode::Begin | RampMode::Ramping)
                && r#gen == (*pool).ramp_gen);
        let seg = seg_alloc(pool, r#gen, seg_size, deferred)?;

        // Large objects get the segment to themselves.
        let limit = if size >= (*pool).large_size {
            (*seg).base + size
        } else {
            (*seg).limit
        };
        Buffer::attach(buf, seg, (*seg).base, limit);
        (*buf).ap_alloc = (*buf).ap_init + size;
        Ok((*buf).ap_init)
    }
}

/// Detach `buf` from its segment, padding the unused tail so the segment
/// stays walkable, and charging in-trace allocation as condemned. Arena
/// lock held.
pub(crate) unsafe fn buffer_empty(buf: *mut Buffer) {
    unsafe {
        let seg = (*buf).seg;
        debug_assert!(!seg.is_null());
        let pool = (*buf).pool;
        let arena = (*pool).arena;
        let fmt = (*pool).format;
        debug_assert_eq!((*buf).ap_init, (*buf).ap_alloc, "reservation outstanding");

        let init = (*buf).ap_init;
        let limit = if (*buf).ap_limit != 0 {
            (*buf).ap_limit
        } else {
            (*buf).pool_limit
        };
        if init < limit {
            shield::expose(arena, seg);
            ((*fmt).pad)(init, limit - init);
            shield::cover(arena, seg);
        }
        // Allocation during a trace is immediately white.
        for ti in (*seg).white.iter() {
            (*arena).traces[ti].condemned += limit - (*buf).base;
        }
        Buffer::detach(buf);
    }
}

/// Refill a forwarding buffer from inside the fix protocol (arena lock
/// already held, no polling).
unsafe fn forward_refill(buf: *mut Buffer, size: Size) -> Result<Addr> {
    unsafe {
        (*buf).flipped = false;
        if !(*buf).seg.is_null() {
            buffer_empty(buf);
        }
        buffer_fill(buf, size)
    }
}

// ---- Condemnation ----

/// Whiten one segment for a trace. Returns false if the segment cannot be
/// condemned (a buffer covers everything observable).
///
/// # Safety
/// Arena lock held; `ti` is an INIT-state trace.
pub(crate) unsafe fn whiten(pool: *mut AmcPool, ti: usize, seg: *mut Seg) -> bool {
    unsafe {
        let arena = (*pool).arena;
        let r#gen = (*seg).r#gen;
        let buf = (*seg).buffer;
        let mut condemned = (*seg).size();

        if !buf.is_null() {
            let scan_limit = (*buf).scan_limit();
            if scan_limit == (*seg).base {
                // Nothing but buffer: not worth condemning.
                return false;
            }
            if (*seg).board.is_null() {
                let board = Nailboard::create(
                    &mut (*arena).control,
                    (*seg).base,
                    (*seg).limit,
                    (*(*pool).format).align,
                );
                if board.is_null() {
                    return false;
                }
                (*seg).board = board;
            }
            // Pin the reserved-but-uncommitted region: it will become a
            // valid object only if commit wins the race against the flip.
            if (*buf).ap_init < (*buf).ap_alloc {
                (*(*seg).board).set_range((*buf).ap_init, (*buf).ap_alloc);
            }
            // Future allocation is post-condemnation and observable as such.
            (*buf).base = scan_limit;
            (*seg).nailed = (*seg).nailed.add(ti);
            condemned = scan_limit - (*seg).base;
        }

        let size = (*seg).size();
        if (*seg).deferred {
            (*r#gen).deferred_size -= size;
            (*r#gen).old_size += size;
            (*seg).deferred = false;
            (*seg).old = true;
        } else if !(*seg).old {
            (*r#gen).new_size -= size;
            (*r#gen).old_size += size;
            (*seg).old = true;
        }

        (*seg).white = (*seg).white.add(ti);
        (*arena).traces[ti].condemned += condemned;
        stat_add!(condemned_bytes, condemned);
        true
    }
}

// ---- Scanning ----

/// Whether `client` is pinned in `seg` under the pool's pinning policy.
///
/// # Safety
/// Arena lock held; `seg` exposed if its memory will be read (the skip
/// call for interior pinning reads the object header).
pub(crate) unsafe fn is_pinned(seg: *mut Seg, client: Addr) -> bool {
    unsafe {
        if (*seg).nailed.is_empty() {
            return false;
        }
        let board = (*seg).board;
        if board.is_null() {
            return true;
        }
        let pool = (*seg).pool;
        let fmt = (*pool).format;
        if (*pool).interior_pinning {
            let next = ((*fmt).skip)(client);
            let header = (*fmt).header_size;
            !(*board).is_reset_range(client - header, next - header)
        } else {
            (*board).get(client)
        }
    }
}

/// Scan a grey segment under `ss`. Nailed segments use the pinned-object
/// loop, repeating while fixing creates new nails.
///
/// # Safety
/// Arena lock held; `seg` exposed by the caller.
pub(crate) unsafe fn seg_scan(pool: *mut AmcPool, ss: &mut ScanState, seg: *mut Seg) -> Res {
    unsafe {
        let fmt = (*pool).format;
        let header = (*fmt).header_size;
        let frontier = seg_scan_frontier(seg);
        if frontier <= (*seg).base {
            return Res::Ok;
        }
        stat_inc!(seg_scan_count);

        if (*seg).nailed.is_empty() {
            let res = ((*fmt).scan)(ss, (*seg).base + header, frontier + header);
            if res != Res::Ok {
                return res;
            }
            ss.scanned += frontier - (*seg).base;
            return Res::Ok;
        }

        // Nailed: scan pinned objects in place; unpinned objects may still
        // be copied away, so they are not scanned here. Fixing in
        // emergency mode can pin more objects, so loop until no new nails
        // appear.
        let board = (*seg).board;
        loop {
            if !board.is_null() {
                (*board).clear_new_nails();
            }
            let mut p = (*seg).base + header;
            let limit = frontier + header;
            while p < limit {
                let next = ((*fmt).skip)(p);
                let pinned = if board.is_null() {
                    true
                } else if (*pool).interior_pinning {
                    !(*board).is_reset_range(p - header, next - header)
                } else {
                    (*board).get(p)
                };
                if pinned && ((*fmt).isfwd)(p).is_none() {
                    let res = ((*fmt).scan)(ss, p, next);
                    if res != Res::Ok {
                        return res;
                    }
                }
                p = next;
            }
            ss.scanned += frontier - (*seg).base;
            if board.is_null() || !(*board).new_nails() {
                break;
            }
        }
        // Some references were re-seen after fixing; the unfixed summary
        // is no longer purely unfixed.
        let summary = ss.summary();
        ss.set_summary(summary);
        Res::Ok
    }
}

// ---- Fix ----

/// The AMC fix at ambiguous rank: nail, never move.
unsafe fn fix_ambig(pool: *mut AmcPool, ss: &mut ScanState, seg: *mut Seg, refio: *mut Addr) -> Res {
    unsafe {
        let arena = ss.arena;
        let r = *refio;

        if (*seg).nailed.is_empty() && (*seg).board.is_null() {
            let board = Nailboard::create(
                &mut (*arena).control,
                (*seg).base,
                (*seg).limit,
                (*(*pool).format).align,
            );
            // If the board cannot be built, fall through to board-less
            // nailing: the whole segment counts as pinned.
            if !board.is_null() {
                (*seg).board = board;
            }
        }

        let board = (*seg).board;
        if board.is_null() {
            // Nailed without a board: the segment is pinned wholesale. A
            // board must not be invented now: earlier fixes relied on the
            // whole-segment regime.
            if ss.traces.is_sub((*seg).nailed) {
                ss.was_marked = true;
                return Res::Ok;
            }
            ss.was_marked = false;
        } else {
            let was = (*board).set(r);
            if !was {
                stat_inc!(nail_count);
            }
            ss.was_marked = was;
            if was && ss.traces.is_sub((*seg).nailed) {
                return Res::Ok;
            }
        }

        (*seg).nailed = (*seg).nailed.union(ss.traces);
        if !(*seg).rank_set.is_empty() {
            trace::seg_set_grey(arena, seg, ss.traces);
        }
        Res::Ok
    }
}

/// The AMC fix: snap out, pin, or forward by copying.
///
/// # Safety
/// Called from the trace fix dispatch: arena lock held, `seg` white for
/// some trace in `ss.traces`, `refio` a valid slot.
pub(crate) unsafe fn fix(
    pool: *mut AmcPool,
    ss: &mut ScanState,
    seg: *mut Seg,
    refio: *mut Addr,
) -> Res {
    unsafe {
        if ss.rank == Rank::Ambig {
            return fix_ambig(pool, ss, seg, refio);
        }
        let arena = ss.arena;
        shield::expose(arena, seg);
        let res = fix_exact(pool, ss, seg, refio);
        shield::cover(arena, seg);
        res
    }
}

unsafe fn fix_exact(pool: *mut AmcPool, ss: &mut ScanState, seg: *mut Seg, refio: *mut Addr) -> Res {
    unsafe {
        let arena = ss.arena;
        let fmt = (*pool).format;
        let client = *refio;

        if let Some(new) = ((*fmt).isfwd)(client) {
            // Snap out to the forwarded copy.
            ss.was_marked = true;
            *refio = new;
            return Res::Ok;
        }

        if !(*seg).nailed.is_empty()
            && ((*seg).board.is_null() || {
                let next = ((*fmt).skip)(client);
                let header = (*fmt).header_size;
                let board = (*seg).board;
                if (*pool).interior_pinning {
                    !(*board).is_reset_range(client - header, next - header)
                } else {
                    (*board).get(client)
                }
            })
        {
            // Pinned: preserve in place; the nailed scan will visit it.
            ss.was_marked = true;
            if !(*seg).rank_set.is_empty() {
                trace::seg_set_grey(arena, seg, ss.traces);
            }
            return Res::Ok;
        }

        if ss.rank == Rank::Weak {
            // Nothing preserved the target: splat.
            *refio = 0;
            ss.was_marked = false;
            return Res::Ok;
        }

        // Forward: copy the whole block (header included) into the
        // generation's forwarding buffer. The reserve/commit pair loops
        // because a flip can trap the buffer between them.
        let next = ((*fmt).skip)(client);
        let len = next - client;
        let header = (*fmt).header_size;
        let fbuf = (*(*seg).r#gen).forward;

        let new_client = loop {
            let p = match Buffer::reserve(fbuf, len) {
                Some(p) => p,
                None => match forward_refill(fbuf, len) {
                    Ok(p) => p,
                    Err(res) => return res,
                },
            };
            let toseg = (*fbuf).seg;
            shield::expose(arena, toseg);
            ptr::copy_nonoverlapping((client - header) as *const u8, p as *mut u8, len);
            let committed = Buffer::commit(fbuf, p, len);
            if committed {
                // The copy's references are unfixed: the destination must
                // be scanned, and its summary must cover whatever the
                // source could reach.
                if !(*toseg).rank_set.is_empty() {
                    (*toseg).summary = (*toseg).summary.union((*seg).summary);
                    trace::seg_set_grey(arena, toseg, ss.traces);
                }
                shield::cover(arena, toseg);
                break p + header;
            }
            shield::cover(arena, toseg);
        };

        ((*fmt).fwd)(client, new_client);
        *refio = new_client;
        ss.was_marked = false;
        for ti in ss.traces.iter() {
            (*arena).traces[ti].forwarded += len;
        }
        stat_add!(forwarded_bytes, len);
        Res::Ok
    }
}

/// The emergency fix: forwarding space is exhausted, so pin instead of
/// copying. Snap-outs still happen (they need no space).
///
/// # Safety
/// As for [`fix`].
pub(crate) unsafe fn fix_emergency(
    pool: *mut AmcPool,
    ss: &mut ScanState,
    seg: *mut Seg,
    refio: *mut Addr,
) -> Res {
    unsafe {
        if ss.rank == Rank::Ambig {
            return fix_ambig(pool, ss, seg, refio);
        }
        let arena = ss.arena;
        let fmt = (*pool).format;
        shield::expose(arena, seg);
        let client = *refio;
        if let Some(new) = ((*fmt).isfwd)(client) {
            ss.was_marked = true;
            *refio = new;
            shield::cover(arena, seg);
            return Res::Ok;
        }
        shield::cover(arena, seg);

        // Pin in place.
        if (*seg).board.is_null() && (*seg).nailed.is_empty() {
            let board = Nailboard::create(
                &mut (*arena).control,
                (*seg).base,
                (*seg).limit,
                (*fmt).align,
            );
            if !board.is_null() {
                (*seg).board = board;
            }
        }
        if !(*seg).board.is_null() {
            let was = (*(*seg).board).set(client);
            ss.was_marked = was;
            if !was {
                stat_inc!(nail_count);
            }
        } else {
            ss.was_marked = !(*seg).nailed.inter(ss.traces).is_empty();
        }
        (*seg).nailed = (*seg).nailed.union(ss.traces);
        if !(*seg).rank_set.is_empty() {
            trace::seg_set_grey(arena, seg, ss.traces);
        }
        Res::Ok
    }
}

// ---- Reclaim ----

/// Reclaim one white segment after the trace's scanning is complete.
///
/// # Safety
/// Arena lock held; trace `ti` in RECLAIM state; `seg` white for `ti` and
/// not grey for any flipped trace.
pub(crate) unsafe fn reclaim(pool: *mut AmcPool, ti: usize, seg: *mut Seg) {
    unsafe {
        let arena = (*pool).arena;

        if !(*seg).nailed.contains(ti) {
            // Fully evacuated: survivors were copied out, everything left
            // is dead or a forwarding marker.
            debug_assert!((*seg).buffer.is_null());
            let size = (*seg).size();
            (*arena).traces[ti].reclaim_size += size;
            stat_add!(reclaimed_bytes, size);
            seg_free(pool, seg);
            return;
        }

        // Nailed: walk the observable extent, keep pinned survivors, and
        // coalesce each run of dead blocks into one padding object.
        let fmt = (*pool).format;
        let header = (*fmt).header_size;
        let frontier = seg_scan_frontier(seg);
        let board = (*seg).board;

        shield::expose(arena, seg);
        let mut preserved: Size = 0;
        let mut padded: Size = 0;
        let mut run_start: Addr = 0;
        let mut p = (*seg).base + header;
        let limit = frontier + header;
        while p < limit {
            let next = ((*fmt).skip)(p);
            let pinned = if board.is_null() {
                true
            } else if (*pool).interior_pinning {
                !(*board).is_reset_range(p - header, next - header)
            } else {
                (*board).get(p)
            };
            let keep = pinned && ((*fmt).isfwd)(p).is_none();
            if keep {
                preserved += next - p;
                if run_start != 0 {
                    ((*fmt).pad)(run_start, (p - header) - run_start);
                    padded += (p - header) - run_start;
                    run_start = 0;
                }
            } else if run_start == 0 {
                run_start = p - header;
            }
            p = next;
        }
        if run_start != 0 {
            ((*fmt).pad)(run_start, frontier - run_start);
            padded += frontier - run_start;
        }
        shield::cover(arena, seg);

        (*arena).traces[ti].preserved_in_place += preserved;
        stat_add!(preserved_bytes, preserved);

        if preserved == 0 && (*seg).buffer.is_null() {
            let size = (*seg).size();
            (*arena).traces[ti].reclaim_size += size;
            stat_add!(reclaimed_bytes, size);
            seg_free(pool, seg);
            return;
        }

        (*arena).traces[ti].reclaim_size += padded;
        stat_add!(reclaimed_bytes, padded);
        if !board.is_null() {
            Nailboard::destroy(&mut (*arena).control, board);
            (*seg).board = ptr::null_mut();
        }
        (*seg).nailed = (*seg).nailed.del(ti);
        (*seg).white = (*seg).white.del(ti);
    }
}

// ---- Ramp trace hooks ----

/// Called when a trace starts condemning: advance the ramp machine.
pub(crate) unsafe fn trace_start_hook(pool: *mut AmcPool) {
    unsafe {
        match (*pool).ramp_mode {
            RampMode::Begin => {
                // Collections inside the ramp keep ramp allocation in the
                // ramp generation instead of promoting it.
                (*pool).ramp_mode = RampMode::Ramping;
                retarget_forward((*pool).ramp_gen, (*pool).ramp_gen);
            }
            RampMode::Finish => {
                (*pool).ramp_mode = RampMode::Collecting;
                retarget_forward((*pool).ramp_gen, (*pool).after_ramp_gen);
            }
            _ => {}
        }
    }
}

/// Called when a trace finishes reclaiming.
pub(crate) unsafe fn trace_finish_hook(pool: *mut AmcPool) {
    unsafe {
        if (*pool).ramp_mode == RampMode::Collecting {
            (*pool).ramp_mode = RampMode::Outside;
            undefer((*pool).ramp_gen);
            retarget_forward((*pool).ramp_gen, default_forward_target(pool));
        }
    }
}

unsafe fn default_forward_target(pool: *mut AmcPool) -> *mut AmcGen {
    unsafe {
        let rg = (*(*pool).ramp_gen).index;
        let mut r#gen = (*pool).gens;
        let target = (rg + 1).min((*pool).gen_count - 1);
        while !(r#gen.is_null()) && (*r#gen).index != target {
            r#gen = (*r#gen).next;
        }
        debug_assert!(!r#gen.is_null());
        r#gen
    }
}

unsafe fn retarget_forward(r#gen: *mut AmcGen, target: *mut AmcGen) {
    unsafe {
        let fwd = (*r#gen).forward;
        if (*fwd).r#gen != target {
            if !(*fwd).seg.is_null() {
                buffer_empty(fwd);
            }
            (*fwd).r#gen = target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults() {
        let p = AmcParams::default();
        assert_eq!(p.extend_by, crate::config::DEFAULT_EXTEND_BY);
        assert_eq!(p.large_size, crate::config::DEFAULT_LARGE_SIZE);
        assert!(p.interior_pinning);
        assert!(p.ramp_gen.is_none());
    }
}
