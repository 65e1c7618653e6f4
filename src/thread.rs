//! Mutator thread registry.
//!
//! Threads register so the collector can suspend them around the flip and
//! scan their stacks ambiguously. Registration records the cold end of the
//! thread's stack; the hot end is the suspension-time stack pointer (for
//! stopped threads) or the collector entry stack pointer (for the thread
//! driving the collection).

use crate::arena::Arena;
use crate::platform;
use crate::{Addr, Res, Result};

#[repr(C)]
pub struct Thread {
    pub arena: *mut Arena,
    /// Platform thread handle, from `platform::thread_self`.
    pub handle: usize,
    /// Cold end of the stack: the highest address worth scanning.
    pub cold: Addr,
    /// Stack pointer captured when this thread was suspended; 0 otherwise.
    pub sp_at_suspend: Addr,
    pub suspended: bool,
    pub next: *mut Thread,
}

impl Thread {
    /// Register the calling thread. `cold` is an address in the caller's
    /// outermost frame of interest; stack scanning covers from the
    /// suspension stack pointer up to it.
    ///
    /// # Safety
    /// `arena` live; the thread must deregister before it exits.
    pub unsafe fn register(arena: *mut Arena, cold: Addr) -> Result<*mut Thread> {
        unsafe {
            (*arena).enter();
            let thread = (*arena).control.alloc_obj::<Thread>();
            if thread.is_null() {
                (*arena).leave();
                return Err(Res::Memory);
            }
            (*thread).arena = arena;
            (*thread).handle = platform::thread_self();
            (*thread).cold = cold;
            (*thread).sp_at_suspend = 0;
            (*thread).suspended = false;
            (*thread).next = (*arena).threads;
            (*arena).threads = thread;
            (*arena).leave();
            Ok(thread)
        }
    }

    /// Deregister a thread. Any thread roots naming it must be destroyed
    /// first.
    ///
    /// # Safety
    /// `thread` must come from [`register`](Self::register) and not be
    /// used again.
    pub unsafe fn deregister(thread: *mut Thread) -> Res {
        unsafe {
            let arena = (*thread).arena;
            (*arena).enter();
            let mut link = &raw mut (*arena).threads;
            while !(*link).is_null() && *link != thread {
                link = &raw mut (**link).next;
            }
            if *link != thread {
                (*arena).leave();
                return Res::Param;
            }
            *link = (*thread).next;
            (*arena).control.free_obj(thread);
            (*arena).leave();
            Res::Ok
        }
    }

    /// The hot end for stack scanning, or 0 if unknown.
    pub(crate) unsafe fn scan_hot(thread: *mut Thread) -> Addr {
        unsafe {
            if (*thread).suspended {
                (*thread).sp_at_suspend
            } else if (*thread).handle == platform::thread_self() {
                // The thread driving the collection: scan from where the
                // mutator entered the collector.
                (*(*thread).arena).entry_sp
            } else {
                0
            }
        }
    }
}
