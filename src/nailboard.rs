//! Nailboards: per-segment pin bitmaps.
//!
//! When an ambiguous reference lands in a condemned segment the target
//! cannot move: the reference might not be a pointer, so it cannot be
//! updated. The nailboard records which positions are pinned, at the
//! owning format's alignment granularity, so the rest of the segment can
//! still be evacuated and the pinned survivors scanned in place.
//!
//! `set` reports whether the bit was already set: the fix path uses this
//! to short-circuit re-nailing, and the nailed scan loop uses the
//! new-nails flag to decide whether another pass is needed.

use crate::control::{self, ControlAlloc};
use crate::platform;
use crate::{Addr, Size, WORD_BITS, Word, align_up};
use core::ptr;

#[repr(C)]
pub struct Nailboard {
    base: Addr,
    limit: Addr,
    align_shift: usize,
    /// Set by `set` when it creates a nail; cleared by `clear_new_nails`.
    new_nails: bool,
    words: *mut Word,
    word_count: usize,
    /// Bitmap storage came straight from the OS (too big for the control
    /// allocator).
    bits_from_pages: bool,
}

impl Nailboard {
    fn bitmap_bytes(base: Addr, limit: Addr, align: usize) -> (usize, Size) {
        let grains = (limit - base) >> align.trailing_zeros();
        let word_count = grains.div_ceil(WORD_BITS);
        (word_count, word_count * core::mem::size_of::<Word>())
    }

    /// Create a cleared board covering `[base, limit)` at `align`
    /// granularity. Returns null if the OS refuses memory.
    pub unsafe fn create(
        ca: &mut ControlAlloc,
        base: Addr,
        limit: Addr,
        align: usize,
    ) -> *mut Nailboard {
        debug_assert!(align.is_power_of_two());
        debug_assert!(base < limit);
        let (word_count, bytes) = Self::bitmap_bytes(base, limit, align);

        let bits_from_pages = bytes > control::MAX_BLOCK;
        let words = if bits_from_pages {
            unsafe { platform::page_alloc(align_up(bytes, crate::config::PAGE_SIZE)) }
        } else {
            unsafe { ca.alloc(bytes) }
        }
        .cast::<Word>();
        if words.is_null() {
            return ptr::null_mut();
        }

        let board = unsafe { ca.alloc_obj::<Nailboard>() };
        if board.is_null() {
            if bits_from_pages {
                unsafe {
                    platform::page_dealloc(
                        words.cast::<u8>(),
                        align_up(bytes, crate::config::PAGE_SIZE),
                    )
                };
            } else {
                unsafe { ca.free(words.cast::<u8>(), bytes) };
            }
            return ptr::null_mut();
        }
        unsafe {
            (*board).base = base;
            (*board).limit = limit;
            (*board).align_shift = align.trailing_zeros() as usize;
            (*board).new_nails = false;
            (*board).words = words;
            (*board).word_count = word_count;
            (*board).bits_from_pages = bits_from_pages;
        }
        board
    }

    /// Release the board and its bitmap.
    ///
    /// # Safety
    /// `board` must come from [`create`](Self::create) on the same
    /// allocator and must not be used afterwards.
    pub unsafe fn destroy(ca: &mut ControlAlloc, board: *mut Nailboard) {
        unsafe {
            let bytes = (*board).word_count * core::mem::size_of::<Word>();
            if (*board).bits_from_pages {
                platform::page_dealloc(
                    (*board).words.cast::<u8>(),
                    align_up(bytes, crate::config::PAGE_SIZE),
                );
            } else {
                ca.free((*board).words.cast::<u8>(), bytes);
            }
            ca.free_obj(board);
        }
    }

    #[inline]
    fn index(&self, addr: Addr) -> usize {
        debug_assert!(addr >= self.base && addr < self.limit);
        (addr - self.base) >> self.align_shift
    }

    /// Grain index range covering `[base, limit)`.
    #[inline]
    fn index_range(&self, base: Addr, limit: Addr) -> (usize, usize) {
        debug_assert!(base < limit);
        let lo = (base - self.base) >> self.align_shift;
        let hi = (limit - self.base).div_ceil(1 << self.align_shift);
        (lo, hi)
    }

    /// Set the nail for `addr`; returns whether it was already set.
    pub fn set(&mut self, addr: Addr) -> bool {
        let i = self.index(addr);
        let word = unsafe { &mut *self.words.add(i / WORD_BITS) };
        let mask = 1 << (i % WORD_BITS);
        let was = *word & mask != 0;
        if !was {
            *word |= mask;
            self.new_nails = true;
        }
        was
    }

    /// Whether the nail for `addr` is set.
    pub fn get(&self, addr: Addr) -> bool {
        let i = self.index(addr);
        let word = unsafe { *self.words.add(i / WORD_BITS) };
        word & (1 << (i % WORD_BITS)) != 0
    }

    /// True iff no nails fall in `[base, limit)`.
    pub fn is_reset_range(&self, base: Addr, limit: Addr) -> bool {
        let (lo, hi) = self.index_range(base, limit);
        for i in lo..hi {
            let word = unsafe { *self.words.add(i / WORD_BITS) };
            if word & (1 << (i % WORD_BITS)) != 0 {
                return false;
            }
        }
        true
    }

    /// Set every nail in `[base, limit)`.
    pub fn set_range(&mut self, base: Addr, limit: Addr) {
        let (lo, hi) = self.index_range(base, limit);
        for i in lo..hi {
            let word = unsafe { &mut *self.words.add(i / WORD_BITS) };
            *word |= 1 << (i % WORD_BITS);
        }
        if lo < hi {
            self.new_nails = true;
        }
    }

    /// True iff every nail in `[base, limit)` is set.
    pub fn is_set_range(&self, base: Addr, limit: Addr) -> bool {
        let (lo, hi) = self.index_range(base, limit);
        for i in lo..hi {
            let word = unsafe { *self.words.add(i / WORD_BITS) };
            if word & (1 << (i % WORD_BITS)) == 0 {
                return false;
            }
        }
        true
    }

    /// Whether any nail has been set since the last `clear_new_nails`.
    #[inline]
    pub fn new_nails(&self) -> bool {
        self.new_nails
    }

    #[inline]
    pub fn clear_new_nails(&mut self) {
        self.new_nails = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_board(size: usize, align: usize, f: impl FnOnce(&mut Nailboard)) {
        let mut ca = ControlAlloc::new();
        unsafe {
            let board = Nailboard::create(&mut ca, 0x10000, 0x10000 + size, align);
            assert!(!board.is_null());
            f(&mut *board);
            Nailboard::destroy(&mut ca, board);
            ca.destroy();
        }
    }

    #[test]
    fn test_set_get() {
        with_board(0x1000, 8, |board| {
            assert!(!board.get(0x10008));
            assert!(!board.set(0x10008));
            assert!(board.get(0x10008));
            // Second set reports it was already there.
            assert!(board.set(0x10008));
            // Neighbours untouched.
            assert!(!board.get(0x10000));
            assert!(!board.get(0x10010));
        });
    }

    #[test]
    fn test_new_nails_flag() {
        with_board(0x1000, 8, |board| {
            assert!(!board.new_nails());
            board.set(0x10100);
            assert!(board.new_nails());
            board.clear_new_nails();
            assert!(!board.new_nails());
            // Re-setting an existing nail is not a new nail.
            board.set(0x10100);
            assert!(!board.new_nails());
        });
    }

    #[test]
    fn test_ranges() {
        with_board(0x1000, 8, |board| {
            assert!(board.is_reset_range(0x10000, 0x11000));
            board.set(0x10800);
            assert!(!board.is_reset_range(0x10000, 0x11000));
            assert!(!board.is_reset_range(0x107F8, 0x10808));
            assert!(board.is_reset_range(0x10000, 0x10800));
            assert!(board.is_reset_range(0x10808, 0x11000));

            board.set_range(0x10100, 0x10200);
            assert!(board.is_set_range(0x10100, 0x10200));
            assert!(!board.is_set_range(0x10100, 0x10210));
            assert!(board.get(0x10100));
            assert!(board.get(0x101F8));
            assert!(!board.get(0x10200));
        });
    }

    #[test]
    fn test_large_board_uses_pages() {
        // 1 MiB at align 8 → 16 KiB of bitmap, beyond the control slab cap.
        with_board(1 << 20, 8, |board| {
            assert!(board.bits_from_pages);
            board.set(0x10000 + (1 << 20) - 8);
            assert!(board.get(0x10000 + (1 << 20) - 8));
            assert!(board.is_reset_range(0x10000, 0x10000 + (1 << 19)));
        });
    }
}
