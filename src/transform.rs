//! Transforms: atomic broadcast relocation.
//!
//! A transform collects (old, new) reference pairs and rewrites every
//! reference in the arena (roots, heap segments, finalization state) in
//! one parked pass, reusing the scan/fix machinery with a table-lookup fix
//! in place of the copying one. Location dependencies are aged by the old
//! zones, so clients relying on transformed addresses notice.

use crate::arena::Arena;
use crate::ld;
use crate::refset::RefSet;
use crate::root;
use crate::scan::ScanState;
use crate::shield;
use crate::trace::{self, TraceSet};
use crate::{Addr, Res, Result};

const PAIRS_PER_BLOCK: usize = 63;

#[repr(C)]
struct PairBlock {
    count: usize,
    pairs: [(Addr, Addr); PAIRS_PER_BLOCK],
    next: *mut PairBlock,
}

#[repr(C)]
pub struct Transform {
    pub arena: *mut Arena,
    blocks: *mut PairBlock,
    pair_count: usize,
    applied: bool,
}

impl Transform {
    /// Create an empty transform.
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn create(arena: *mut Arena) -> Result<*mut Transform> {
        unsafe {
            (*arena).enter();
            let t = (*arena).control.alloc_obj::<Transform>();
            (*arena).leave();
            if t.is_null() {
                return Err(Res::Memory);
            }
            (*t).arena = arena;
            Ok(t)
        }
    }

    /// Record that references to `old` should become references to `new`.
    ///
    /// # Safety
    /// `transform` live and not yet applied.
    pub unsafe fn add(transform: *mut Transform, old: Addr, new: Addr) -> Res {
        unsafe {
            let arena = (*transform).arena;
            (*arena).enter();
            if (*transform).applied {
                (*arena).leave();
                return Res::Param;
            }
            let head = (*transform).blocks;
            let block = if !head.is_null() && (*head).count < PAIRS_PER_BLOCK {
                head
            } else {
                let b = (*arena).control.alloc_obj::<PairBlock>();
                if b.is_null() {
                    (*arena).leave();
                    return Res::Memory;
                }
                (*b).next = head;
                (*transform).blocks = b;
                b
            };
            (*block).pairs[(*block).count] = (old, new);
            (*block).count += 1;
            (*transform).pair_count += 1;
            (*arena).leave();
            Res::Ok
        }
    }

    /// Apply the transform: park the arena and rewrite every reference.
    ///
    /// # Safety
    /// `transform` live; the new addresses must be valid references.
    pub unsafe fn apply(transform: *mut Transform) -> Res {
        unsafe {
            let arena = (*transform).arena;
            (*arena).enter();
            if (*transform).applied {
                (*arena).leave();
                return Res::Param;
            }
            (*arena).park_locked();
            (*transform).applied = true;
            if (*transform).pair_count == 0 {
                (*arena).leave();
                return Res::Ok;
            }

            let shift = (*arena).zone_shift;
            let mut old_zones = RefSet::EMPTY;
            let mut block = (*transform).blocks;
            while !block.is_null() {
                for i in 0..(*block).count {
                    old_zones = old_zones.add(shift, (*block).pairs[i].0);
                }
                block = (*block).next;
            }

            // Roots.
            let mut root_ptr = (*arena).roots;
            while !root_ptr.is_null() {
                let mut ss =
                    ScanState::init(arena, TraceSet::EMPTY, (*root_ptr).rank, old_zones);
                ss.set_fix(transform_fix, transform.cast());
                let res = root::scan_root(&mut ss, root_ptr);
                if res != Res::Ok {
                    (*arena).leave();
                    return res;
                }
                root_ptr = (*root_ptr).next;
            }

            // Heap segments that could refer into the old zones.
            let mut pool = (*arena).pools;
            while !pool.is_null() {
                let fmt = (*pool).format;
                let header = (*fmt).header_size;
                let mut r#gen = (*pool).gens;
                while !r#gen.is_null() {
                    let mut seg = (*r#gen).segs.head;
                    while !seg.is_null() {
                        if !(*seg).rank_set.is_empty() && (*seg).summary.intersects(old_zones) {
                            let rank = (*seg).rank_set.lowest().unwrap_or(crate::rank::Rank::Exact);
                            let mut ss =
                                ScanState::init(arena, TraceSet::EMPTY, rank, old_zones);
                            ss.set_fix(transform_fix, transform.cast());
                            let frontier = crate::amc::seg_scan_frontier(seg);
                            if frontier > (*seg).base {
                                shield::expose(arena, seg);
                                let res =
                                    ((*fmt).scan)(&mut ss, (*seg).base + header, frontier + header);
                                if res == Res::Ok {
                                    trace::seg_set_summary(arena, seg, ss.summary());
                                }
                                shield::cover(arena, seg);
                                if res != Res::Ok {
                                    (*arena).leave();
                                    return res;
                                }
                            }
                        }
                        seg = (*seg).next;
                    }
                    r#gen = (*r#gen).next;
                }
                pool = (*pool).next;
            }

            // Finalization registrations and pending message referents.
            let mut e = (*arena).fin_entries;
            while !e.is_null() {
                substitute(transform, &raw mut (*e).ref_);
                e = (*e).next;
            }
            let mut msg = (*arena).messages;
            while !msg.is_null() {
                if crate::message::type_of(msg) == crate::message::MessageType::Finalization {
                    substitute(transform, &raw mut (*msg).fin_ref);
                }
                msg = (*msg).next;
            }

            ld::age(arena, old_zones);
            (*arena).leave();
            Res::Ok
        }
    }

    /// Destroy a transform (applied or not).
    ///
    /// # Safety
    /// `transform` live; not used afterwards.
    pub unsafe fn destroy(transform: *mut Transform) {
        unsafe {
            let arena = (*transform).arena;
            (*arena).enter();
            let mut block = (*transform).blocks;
            while !block.is_null() {
                let next = (*block).next;
                (*arena).control.free_obj(block);
                block = next;
            }
            (*arena).control.free_obj(transform);
            (*arena).leave();
        }
    }
}

unsafe fn substitute(transform: *mut Transform, refio: *mut Addr) -> bool {
    unsafe {
        let r = *refio;
        let mut block = (*transform).blocks;
        while !block.is_null() {
            for i in 0..(*block).count {
                let (old, new) = (*block).pairs[i];
                if old == r {
                    *refio = new;
                    return true;
                }
            }
            block = (*block).next;
        }
        false
    }
}

/// The table-lookup fix installed while a transform applies.
unsafe fn transform_fix(ss: &mut ScanState, refio: *mut Addr) -> Res {
    unsafe {
        let transform = ss.fix_closure.cast::<Transform>();
        substitute(transform, refio);
        // Whether or not it was in the table, account the post-image so
        // segment summaries stay sound.
        ss.fixed = ss.fixed.add(ss.zone_shift, *refio);
        Res::Ok
    }
}
