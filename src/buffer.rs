//! Allocation points: bump-allocator views into a segment.
//!
//! The mutator allocates with a lock-free reserve/commit pair:
//!
//! ```ignore
//! let p = loop {
//!     let p = match ap.reserve(size) {
//!         Some(p) => p,
//!         None => unsafe { Buffer::fill(ap, size)? },
//!     };
//!     // initialize the object at p
//!     if unsafe { Buffer::commit(ap, p, size) } {
//!         break p;
//!     }
//!     // a flip intervened: reinitialize and retry
//! };
//! ```
//!
//! The invariant `base ≤ scan_limit ≤ init ≤ alloc ≤ limit` holds
//! throughout: `init` separates initialized from uninitialized memory, and
//! `scan_limit` bounds what the collector may observe. A flip traps the
//! buffer by zeroing `limit`; the next commit takes the trip slow path and
//! fails, forcing the client to re-initialize in the post-flip world.
//!
//! Forwarding buffers use the same mechanics, driven by the fix protocol
//! instead of the mutator.

use crate::amc::{self, AmcGen, AmcPool};
use crate::arena::Arena;
use crate::seg::Seg;
use crate::{Addr, Res, Result, Size};
use core::ptr;

#[repr(C)]
pub struct Buffer {
    pub arena: *mut Arena,
    pub pool: *mut AmcPool,
    /// Generation new segments are allocated in: the nursery for mutator
    /// buffers, the promotion target for forwarding buffers.
    pub r#gen: *mut AmcGen,
    pub seg: *mut Seg,
    /// Start of the region this buffer owns within `seg`. Condemnation may
    /// advance it so post-condemn allocation is observable as such.
    pub base: Addr,
    /// `init` captured at the last flip; bounds collector observation.
    pub init_at_flip: Addr,
    pub ap_init: Addr,
    pub ap_alloc: Addr,
    /// Zero while trapped (flipped or detached).
    pub ap_limit: Addr,
    /// The real limit, preserved across trapping.
    pub pool_limit: Addr,
    pub flipped: bool,
    pub is_mutator: bool,
    /// Segments filled for this buffer defer generation accounting
    /// (the hash-array keyword option).
    pub deferred: bool,
    pub next: *mut Buffer,
}

/// Options for allocation point creation.
#[derive(Clone, Copy, Default)]
pub struct BufferParams {
    /// Defer generation accounting for segments this buffer fills.
    pub hash_arrays: bool,
}

impl Buffer {
    /// Create a mutator allocation point on `pool`.
    ///
    /// # Safety
    /// `pool` must be live; the buffer must be destroyed before the pool.
    pub unsafe fn create(pool: *mut AmcPool) -> Result<*mut Buffer> {
        unsafe { Self::create_with(pool, &BufferParams::default()) }
    }

    /// Create a mutator allocation point with options.
    ///
    /// # Safety
    /// As for [`create`](Self::create).
    pub unsafe fn create_with(pool: *mut AmcPool, params: &BufferParams) -> Result<*mut Buffer> {
        unsafe {
            let arena = (*pool).arena;
            (*arena).enter();
            let buf = Self::create_inner(pool, (*pool).nursery, true, params.hash_arrays);
            (*arena).leave();
            if buf.is_null() { Err(Res::Memory) } else { Ok(buf) }
        }
    }

    /// Create a buffer under the arena lock (also used for forwarding
    /// buffers at pool creation).
    pub(crate) unsafe fn create_inner(
        pool: *mut AmcPool,
        r#gen: *mut AmcGen,
        is_mutator: bool,
        deferred: bool,
    ) -> *mut Buffer {
        unsafe {
            let arena = (*pool).arena;
            let buf = (*arena).control.alloc_obj::<Buffer>();
            if buf.is_null() {
                return ptr::null_mut();
            }
            (*buf).arena = arena;
            (*buf).pool = pool;
            (*buf).r#gen = r#gen;
            (*buf).seg = ptr::null_mut();
            (*buf).is_mutator = is_mutator;
            (*buf).deferred = deferred;
            (*buf).next = (*pool).buffers;
            (*pool).buffers = buf;
            buf
        }
    }

    /// Destroy an allocation point, padding out any unused tail of its
    /// current segment.
    ///
    /// # Safety
    /// `buf` must come from [`create`](Self::create); no reservation may be
    /// outstanding.
    pub unsafe fn destroy(buf: *mut Buffer) {
        unsafe {
            let arena = (*buf).arena;
            (*arena).enter();
            Self::destroy_inner(buf);
            (*arena).leave();
        }
    }

    pub(crate) unsafe fn destroy_inner(buf: *mut Buffer) {
        unsafe {
            let arena = (*buf).arena;
            let pool = (*buf).pool;
            if !(*buf).seg.is_null() {
                amc::buffer_empty(buf);
            }
            let mut link = &raw mut (*pool).buffers;
            while !(*link).is_null() && *link != buf {
                link = &raw mut (**link).next;
            }
            if *link == buf {
                *link = (*buf).next;
            }
            (*arena).control.free_obj(buf);
        }
    }

    /// Lock-free fast-path reservation. Returns the block address, or None
    /// when the slow path ([`fill`](Self::fill)) is needed.
    ///
    /// # Safety
    /// Only the owning mutator (or the fix protocol, for forwarding
    /// buffers) may call this; one reservation may be outstanding at a
    /// time.
    #[inline]
    pub unsafe fn reserve(buf: *mut Buffer, size: Size) -> Option<Addr> {
        unsafe {
            debug_assert!(size > 0);
            debug_assert_eq!((*buf).ap_init, (*buf).ap_alloc, "reservation outstanding");
            let alloc = (*buf).ap_alloc;
            let limit = (*buf).ap_limit;
            if limit != 0 && alloc + size > alloc && alloc + size <= limit {
                (*buf).ap_alloc = alloc + size;
                Some((*buf).ap_init)
            } else {
                None
            }
        }
    }

    /// Commit the outstanding reservation. Returns false if a flip
    /// intervened since the reserve, in which case the object is discarded
    /// and the client must reserve, reinitialize and commit again.
    ///
    /// # Safety
    /// `p` and `size` must match the outstanding reservation, and the
    /// object must be fully initialized.
    #[inline]
    pub unsafe fn commit(buf: *mut Buffer, p: Addr, size: Size) -> bool {
        unsafe {
            debug_assert_eq!(p, (*buf).ap_init);
            debug_assert_eq!(p + size, (*buf).ap_alloc);
            (*buf).ap_init = (*buf).ap_alloc;
            (*buf).ap_limit != 0 || Self::trip(buf, p, size)
        }
    }

    /// Slow-path commit: the buffer was trapped. Decides whether the
    /// freshly initialized object is valid.
    #[cold]
    unsafe fn trip(buf: *mut Buffer, p: Addr, size: Size) -> bool {
        unsafe {
            let _ = size;
            let arena = (*buf).arena;
            // Forwarding buffers trip from inside the collector, where the
            // arena lock is already held.
            let locked = (*arena).lock_held_by_me();
            if !locked {
                (*arena).enter();
            }
            let ok = if (*buf).flipped {
                // The object was initialized against the pre-flip world:
                // roll the buffer back over it, then detach the segment so
                // the retry allocates from a fresh post-flip one. The old
                // segment may be condemned; nothing may be committed into
                // it past its scan limit.
                (*buf).ap_init = p;
                (*buf).ap_alloc = p;
                (*buf).flipped = false;
                amc::buffer_empty(buf);
                false
            } else {
                // Trapped for another reason (e.g. detach); the commit
                // itself is fine.
                true
            };
            if !locked {
                (*arena).leave();
            }
            ok
        }
    }

    /// Slow-path reserve: detach the exhausted segment (padding its tail)
    /// and fill from a fresh one. May poll the collector first. Returns
    /// the reserved block address; commit is still required.
    ///
    /// # Safety
    /// As for [`reserve`](Self::reserve).
    pub unsafe fn fill(buf: *mut Buffer, size: Size) -> Result<Addr> {
        unsafe {
            let arena = (*buf).arena;
            (*arena).enter();
            if (*buf).is_mutator {
                (*arena).poll();
            }
            (*buf).flipped = false;
            if !(*buf).seg.is_null() {
                amc::buffer_empty(buf);
            }
            let res = amc::buffer_fill(buf, size);
            (*arena).leave();
            res
        }
    }

    /// Reserve with the slow path folded in: the common client loop.
    ///
    /// # Safety
    /// As for [`reserve`](Self::reserve).
    #[inline]
    pub unsafe fn reserve_or_fill(buf: *mut Buffer, size: Size) -> Result<Addr> {
        unsafe {
            match Self::reserve(buf, size) {
                Some(p) => Ok(p),
                None => Self::fill(buf, size),
            }
        }
    }

    /// Trap the buffer at a flip. Runs under the arena lock with mutators
    /// suspended.
    pub(crate) unsafe fn flip(buf: *mut Buffer) {
        unsafe {
            if (*buf).seg.is_null() {
                // Nothing attached: the next fill starts post-flip.
                return;
            }
            (*buf).init_at_flip = (*buf).ap_init;
            if (*buf).ap_limit != 0 {
                (*buf).pool_limit = (*buf).ap_limit;
                (*buf).ap_limit = 0;
            }
            (*buf).flipped = true;
        }
    }

    /// The frontier of what the collector may observe in this buffer's
    /// segment: allocation beyond it is post-flip and invisible to scans.
    #[inline]
    pub fn scan_limit(&self) -> Addr {
        if self.flipped {
            self.init_at_flip
        } else {
            self.ap_init
        }
    }

    /// Attach a freshly filled segment region `[base, limit)`.
    pub(crate) unsafe fn attach(buf: *mut Buffer, seg: *mut Seg, base: Addr, limit: Addr) {
        unsafe {
            debug_assert!((*buf).seg.is_null());
            (*buf).seg = seg;
            (*seg).buffer = buf;
            (*buf).base = base;
            (*buf).init_at_flip = base;
            (*buf).ap_init = base;
            (*buf).ap_alloc = base;
            (*buf).ap_limit = limit;
            (*buf).pool_limit = limit;
        }
    }

    /// Detach from the current segment.
    pub(crate) unsafe fn detach(buf: *mut Buffer) {
        unsafe {
            let seg = (*buf).seg;
            if !seg.is_null() {
                (*seg).buffer = ptr::null_mut();
            }
            (*buf).seg = ptr::null_mut();
            (*buf).base = 0;
            (*buf).init_at_flip = 0;
            (*buf).ap_init = 0;
            (*buf).ap_alloc = 0;
            (*buf).ap_limit = 0;
            (*buf).pool_limit = 0;
        }
    }

    /// Allocation frames would support stacked freeing in manual pools;
    /// the copying pools have no use for them.
    pub fn frame_push(_buf: *mut Buffer) -> Res {
        Res::Unimpl
    }

    /// See [`frame_push`](Self::frame_push).
    pub fn frame_pop(_buf: *mut Buffer) -> Res {
        Res::Unimpl
    }
}
