//! 3-level radix tree mapping page numbers to segments.
//!
//! For 48-bit virtual addresses and a 12-bit page shift there are 36 bits
//! of page number, split 12/12/12. The root lives inline in the arena; mid
//! and leaf nodes are lazily allocated from the OS. Reads are lock-free
//! (`AtomicPtr` with Acquire) so the fix path and the barrier fault handler
//! can look up segments without taking the arena lock; writes happen under
//! the arena lock.

use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::platform;
use crate::seg::Seg;
use crate::{Addr, Size, align_up};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const ROOT_BITS: usize = 12;
const MID_BITS: usize = 12;
const LEAF_BITS: usize = 12;

const ROOT_LEN: usize = 1 << ROOT_BITS; // 4096
const MID_LEN: usize = 1 << MID_BITS; // 4096
const LEAF_LEN: usize = 1 << LEAF_BITS; // 4096

const MID_SHIFT: usize = LEAF_BITS; // 12
const ROOT_SHIFT: usize = LEAF_BITS + MID_BITS; // 24

const MID_MASK: usize = (1 << MID_BITS) - 1;
const LEAF_MASK: usize = (1 << LEAF_BITS) - 1;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; MID_LEN],
}

#[repr(C)]
struct LeafNode {
    segs: [AtomicPtr<Seg>; LEAF_LEN],
}

/// Helper to create a const-initialized array of null AtomicPtrs.
macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        // SAFETY: AtomicPtr<T>::new(null_mut()) is just a null pointer,
        // which has the same bit pattern as zeroed memory.
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

/// Page-number → `*mut Seg` lookup for one arena.
pub struct SegMap {
    root: [AtomicPtr<MidNode>; ROOT_LEN],
    committed: Size,
}

unsafe impl Send for SegMap {}
unsafe impl Sync for SegMap {}

impl SegMap {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            root: null_atomic_array!(ROOT_LEN, MidNode),
            committed: 0,
        }
    }

    /// Bytes of OS memory held by mid and leaf nodes.
    #[inline]
    pub fn committed(&self) -> Size {
        self.committed
    }

    /// Look up the segment covering `addr`. Returns null if none. Lock-free.
    #[inline]
    pub fn of_addr(&self, addr: Addr) -> *mut Seg {
        self.get(addr >> PAGE_SHIFT)
    }

    /// Look up the segment for a page number. Returns null if not set.
    /// Lock-free.
    #[inline]
    pub fn get(&self, page: usize) -> *mut Seg {
        let root_idx = page >> ROOT_SHIFT;
        let mid_idx = (page >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page & LEAF_MASK;

        if root_idx >= ROOT_LEN {
            return ptr::null_mut();
        }

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }

        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }

        unsafe { (*leaf).segs[leaf_idx].load(Ordering::Acquire) }
    }

    /// Set the segment for a page number.
    ///
    /// # Safety
    /// Must be called under the arena lock. `seg` must be valid or null.
    pub unsafe fn set(&mut self, page: usize, seg: *mut Seg) {
        let root_idx = page >> ROOT_SHIFT;
        let mid_idx = (page >> MID_SHIFT) & MID_MASK;
        let leaf_idx = page & LEAF_MASK;

        assert!(root_idx < ROOT_LEN, "page number out of range for seg map");

        let mut mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            mid = unsafe { self.alloc_node::<MidNode>() };
            assert!(!mid.is_null(), "failed to allocate seg map mid node");
            // Store with Release so lock-free readers see the zeroed node
            self.root[root_idx].store(mid, Ordering::Release);
        }

        let mut leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            leaf = unsafe { self.alloc_node::<LeafNode>() };
            assert!(!leaf.is_null(), "failed to allocate seg map leaf node");
            unsafe { (*mid).children[mid_idx].store(leaf, Ordering::Release) };
        }

        unsafe { (*leaf).segs[leaf_idx].store(seg, Ordering::Release) };
    }

    /// Register `seg` for every page it covers.
    ///
    /// # Safety
    /// Must be called under the arena lock.
    pub unsafe fn register(&mut self, seg: *mut Seg) {
        let base = unsafe { (*seg).base };
        let limit = unsafe { (*seg).limit };
        for page in (base >> PAGE_SHIFT)..(limit >> PAGE_SHIFT) {
            unsafe { self.set(page, seg) };
        }
    }

    /// Clear every page `seg` covers.
    ///
    /// # Safety
    /// Must be called under the arena lock.
    pub unsafe fn unregister(&mut self, seg: *mut Seg) {
        let base = unsafe { (*seg).base };
        let limit = unsafe { (*seg).limit };
        for page in (base >> PAGE_SHIFT)..(limit >> PAGE_SHIFT) {
            unsafe { self.set(page, ptr::null_mut()) };
        }
    }

    unsafe fn alloc_node<T>(&mut self) -> *mut T {
        let size = align_up(core::mem::size_of::<T>(), PAGE_SIZE);
        let ptr = unsafe { platform::page_alloc(size) };
        if !ptr.is_null() {
            self.committed += size;
        }
        // page_alloc returns zeroed memory, which is valid for AtomicPtr
        ptr.cast::<T>()
    }

    /// Free all mid and leaf nodes.
    ///
    /// # Safety
    /// Must be called under the arena lock, with no further lookups.
    pub unsafe fn destroy(&mut self) {
        for root_entry in self.root.iter() {
            let mid = root_entry.swap(ptr::null_mut(), Ordering::AcqRel);
            if mid.is_null() {
                continue;
            }
            unsafe {
                for child in (*mid).children.iter() {
                    let leaf = child.load(Ordering::Acquire);
                    if !leaf.is_null() {
                        platform::page_dealloc(
                            leaf.cast::<u8>(),
                            align_up(core::mem::size_of::<LeafNode>(), PAGE_SIZE),
                        );
                    }
                }
                platform::page_dealloc(
                    mid.cast::<u8>(),
                    align_up(core::mem::size_of::<MidNode>(), PAGE_SIZE),
                );
            }
        }
        self.committed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn make_map() -> Box<SegMap> {
        Box::new(SegMap::new())
    }

    #[test]
    fn test_get_empty() {
        let map = make_map();
        assert!(map.get(0).is_null());
        assert!(map.get(1000).is_null());
        assert!(map.get(123_456).is_null());
    }

    #[test]
    fn test_set_get_clear() {
        let mut map = make_map();
        let fake = 0x1000 as *mut Seg;
        unsafe {
            map.set(42, fake);
            assert_eq!(map.get(42), fake);
            assert!(map.get(41).is_null());
            assert!(map.get(43).is_null());

            map.set(42, ptr::null_mut());
            assert!(map.get(42).is_null());
            map.destroy();
        }
    }

    #[test]
    fn test_high_page_number() {
        let mut map = make_map();
        let fake = 0x2000 as *mut Seg;
        // Exercises all three levels.
        let page = (1 << 30) + (1 << 18) + 7;
        unsafe {
            map.set(page, fake);
            assert_eq!(map.get(page), fake);
            assert!(map.get(page - 1).is_null());
            assert!(map.get(page + 1).is_null());
            map.destroy();
        }
    }

    #[test]
    fn test_committed_tracks_nodes() {
        let mut map = make_map();
        assert_eq!(map.committed(), 0);
        unsafe {
            map.set(1, 0x10 as *mut Seg);
            assert!(map.committed() > 0);
            let after_one = map.committed();
            // Same leaf: no new nodes.
            map.set(2, 0x20 as *mut Seg);
            assert_eq!(map.committed(), after_one);
            map.destroy();
        }
        assert_eq!(map.committed(), 0);
    }
}
