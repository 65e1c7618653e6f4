//! Segment metadata and the per-generation segment list.
//!
//! A segment is a contiguous page-aligned range owned by one pool. The
//! collector tracks, per segment: the kinds of reference it may contain,
//! a zone summary of where those references may point, and per-trace
//! colour state (grey = reachable but unscanned, white = condemned,
//! nailed = pinned by ambiguous references).
//!
//! Seg structs come from the arena's control allocator and are linked into
//! a doubly-linked list anchored in their generation.

use crate::amc::{AmcGen, AmcPool};
use crate::buffer::Buffer;
use crate::nailboard::Nailboard;
use crate::rank::RankSet;
use crate::refset::RefSet;
use crate::shield::AccessSet;
use crate::trace::TraceSet;
use crate::{Addr, Size};
use core::ptr;

#[repr(C)]
pub struct Seg {
    /// First address of the range.
    pub base: Addr,
    /// One past the last address.
    pub limit: Addr,
    /// Owning pool.
    pub pool: *mut AmcPool,
    /// Owning generation within the pool.
    pub r#gen: *mut AmcGen,
    /// Kinds of reference contained; empty for leaf segments.
    pub rank_set: RankSet,
    /// Over-approximation of the targets of all references inside.
    pub summary: RefSet,
    /// Traces for which this segment is grey.
    pub grey: TraceSet,
    /// Traces for which this segment is condemned.
    pub white: TraceSet,
    /// Traces that have pinned this segment.
    pub nailed: TraceSet,
    /// Currently raised protection.
    pub sm: AccessSet,
    /// Shield exposure depth (collector accesses in progress).
    pub depth: u32,
    /// Attached allocation point, if any.
    pub buffer: *mut Buffer,
    /// Pin bitmap, present only while nailed with per-object precision.
    pub board: *mut Nailboard,
    /// Accounting deferral (ramp allocation or hash arrays).
    pub deferred: bool,
    /// Whether this segment's size is accounted old (condemned before).
    pub old: bool,
    /// Previous segment in the generation's list.
    pub prev: *mut Seg,
    /// Next segment in the generation's list.
    pub next: *mut Seg,
}

impl Seg {
    #[inline]
    pub fn size(&self) -> Size {
        self.limit - self.base
    }

    #[inline]
    pub fn is_white(&self, ti: usize) -> bool {
        self.white.contains(ti)
    }

    #[inline]
    pub fn is_grey(&self, ti: usize) -> bool {
        self.grey.contains(ti)
    }

    /// The zone set of the segment's own address range (not of its
    /// contents, which is `summary`).
    #[inline]
    pub fn refset(&self, zone_shift: usize) -> RefSet {
        RefSet::of_range(zone_shift, self.base, self.limit)
    }
}

/// A doubly-linked list of segments.
pub struct SegList {
    pub head: *mut Seg,
    pub count: usize,
}

impl Default for SegList {
    fn default() -> Self {
        Self::new()
    }
}

impl SegList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            count: 0,
        }
    }

    /// Prepend a segment.
    ///
    /// # Safety
    /// `seg` must be a valid pointer to a `Seg` not already in a list.
    pub unsafe fn push(&mut self, seg: *mut Seg) {
        unsafe {
            (*seg).next = self.head;
            (*seg).prev = ptr::null_mut();
            if !self.head.is_null() {
                (*self.head).prev = seg;
            }
            self.head = seg;
            self.count += 1;
        }
    }

    /// Remove a specific segment from the list.
    ///
    /// # Safety
    /// `seg` must be a valid pointer to a `Seg` currently in this list.
    pub unsafe fn remove(&mut self, seg: *mut Seg) {
        unsafe {
            let prev = (*seg).prev;
            let next = (*seg).next;
            if !prev.is_null() {
                (*prev).next = next;
            } else {
                self.head = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*seg).prev = ptr::null_mut();
            (*seg).next = ptr::null_mut();
            self.count -= 1;
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn make_seg(base: Addr, limit: Addr) -> *mut Seg {
        Box::into_raw(Box::new(Seg {
            base,
            limit,
            pool: ptr::null_mut(),
            r#gen: ptr::null_mut(),
            rank_set: RankSet::EMPTY,
            summary: RefSet::EMPTY,
            grey: TraceSet::EMPTY,
            white: TraceSet::EMPTY,
            nailed: TraceSet::EMPTY,
            sm: AccessSet::empty(),
            depth: 0,
            buffer: ptr::null_mut(),
            board: ptr::null_mut(),
            deferred: false,
            old: false,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }))
    }

    fn drop_seg(seg: *mut Seg) {
        unsafe { drop(Box::from_raw(seg)) };
    }

    #[test]
    fn test_seg_colour_sets() {
        let seg = make_seg(0x10000, 0x14000);
        unsafe {
            assert_eq!((*seg).size(), 0x4000);
            assert!(!(*seg).is_white(0));
            (*seg).white = (*seg).white.add(0);
            assert!((*seg).is_white(0));
            (*seg).grey = (*seg).grey.add(0);
            assert!((*seg).is_grey(0));
        }
        drop_seg(seg);
    }

    #[test]
    fn test_seg_refset_covers_range(){
        let seg = make_seg(0x40_0000, 0x44_0000);
        unsafe {
            let rs = (*seg).refset(16);
            let mut a = (*seg).base;
            while a < (*seg).limit {
                assert!(RefSet::of_addr(16, a).is_sub(rs));
                a += 0x1000;
            }
        }
        drop_seg(seg);
    }

    #[test]
    fn test_seg_list() {
        let mut list = SegList::new();
        assert!(list.is_empty());

        let s1 = make_seg(0x1000, 0x2000);
        let s2 = make_seg(0x2000, 0x3000);
        let s3 = make_seg(0x3000, 0x4000);

        unsafe {
            list.push(s1);
            list.push(s2);
            list.push(s3);
            assert_eq!(list.count, 3);
            assert_eq!(list.head, s3);

            // Remove middle element
            list.remove(s2);
            assert_eq!(list.count, 2);
            assert_eq!((*s3).next, s1);

            list.remove(s3);
            assert_eq!(list.head, s1);
            list.remove(s1);
            assert!(list.is_empty());
        }

        drop_seg(s1);
        drop_seg(s2);
        drop_seg(s3);
    }
}
