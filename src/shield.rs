//! The shield: memory-protection barriers between collector and mutator.
//!
//! Segments carry a raised-mode set (`AccessSet`) and an exposure depth.
//! While the collector works on a segment it *exposes* it, which lifts the
//! physical protection without forgetting the logical barrier; *cover*
//! restores it. Raising READ protects against all mutator access (the
//! post-flip read barrier on grey segments); raising WRITE alone leaves
//! reads possible and is used to keep tightened summaries sound.
//!
//! Physical protection is synced eagerly on every transition. Arenas
//! created with `barriers: false` keep the logical state only.

use crate::arena::Arena;
use crate::platform::{self, Prot};
use crate::seg::Seg;
use bitflags::bitflags;

bitflags! {
    /// Raised protection modes.
    pub struct AccessSet: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Recompute the physical protection of `seg` from its logical state.
unsafe fn sync(arena: *mut Arena, seg: *mut Seg) {
    unsafe {
        if !(*arena).config.barriers {
            return;
        }
        let prot = if (*seg).depth > 0 || (*seg).sm.is_empty() {
            Prot::ReadWrite
        } else if (*seg).sm.contains(AccessSet::READ) {
            Prot::None
        } else {
            Prot::Read
        };
        platform::protect((*seg).base as *mut u8, (*seg).size(), prot);
    }
}

/// Raise barrier modes on a segment.
///
/// # Safety
/// Arena lock held; `seg` live.
pub unsafe fn raise(arena: *mut Arena, seg: *mut Seg, mode: AccessSet) {
    unsafe {
        if (*seg).sm.contains(mode) {
            return;
        }
        (*seg).sm.insert(mode);
        sync(arena, seg);
    }
}

/// Lower barrier modes on a segment.
///
/// # Safety
/// Arena lock held; `seg` live.
pub unsafe fn lower(arena: *mut Arena, seg: *mut Seg, mode: AccessSet) {
    unsafe {
        if ((*seg).sm & mode).is_empty() {
            return;
        }
        (*seg).sm.remove(mode);
        sync(arena, seg);
    }
}

/// Begin collector access to a segment: lift physical protection while
/// keeping the logical barrier raised.
///
/// # Safety
/// Arena lock held; every `expose` must be matched by a [`cover`].
pub unsafe fn expose(arena: *mut Arena, seg: *mut Seg) {
    unsafe {
        (*seg).depth += 1;
        if (*seg).depth == 1 && !(*seg).sm.is_empty() {
            sync(arena, seg);
        }
    }
}

/// End collector access begun by [`expose`].
///
/// # Safety
/// Arena lock held; pairs with a previous `expose`.
pub unsafe fn cover(arena: *mut Arena, seg: *mut Seg) {
    unsafe {
        debug_assert!((*seg).depth > 0);
        (*seg).depth -= 1;
        if (*seg).depth == 0 && !(*seg).sm.is_empty() {
            sync(arena, seg);
        }
    }
}

/// Suspend every registered mutator thread except the caller, recording
/// each thread's stopped stack pointer for ambiguous stack scanning.
///
/// # Safety
/// Arena lock held. Must be paired with [`resume`].
pub unsafe fn suspend(arena: *mut Arena) {
    unsafe {
        let me = platform::thread_self();
        let mut t = (*arena).threads;
        while !t.is_null() {
            if (*t).handle != me && !(*t).suspended {
                let sp = platform::thread_suspend((*t).handle);
                (*t).sp_at_suspend = sp;
                (*t).suspended = sp != 0;
            }
            t = (*t).next;
        }
    }
}

/// Resume threads stopped by [`suspend`].
///
/// # Safety
/// Arena lock held; pairs with a previous `suspend`.
pub unsafe fn resume(arena: *mut Arena) {
    unsafe {
        let mut t = (*arena).threads;
        while !t.is_null() {
            if (*t).suspended {
                platform::thread_resume((*t).handle);
                (*t).suspended = false;
                (*t).sp_at_suspend = 0;
            }
            t = (*t).next;
        }
    }
}

