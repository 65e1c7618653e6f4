//! Synchronization for the collector.
//!
//! `std::sync::Mutex` allocates and the collector must not, so locking is
//! built on atomics directly. Two locks are enough: `RawLock`, a bare
//! test-and-set spin lock for the process-wide bookkeeping the platform
//! layer and the arena ring need, and `ArenaLock`, the big lock that
//! serializes all collector operations on one arena.
//!
//! `ArenaLock` is not a wrapper around a plain lock: its single word *is*
//! the owner's thread handle (zero when free), acquired by compare and
//! swap. Folding ownership into the lock word is what the collector
//! actually needs from it: the commit trip path must ask "do I already
//! hold this?" (forwarding buffers trip from inside the collector), debug
//! builds must catch re-entry (the barrier fault handler may only run when
//! the faulting thread is outside the collector), and `postmortem` must be
//! able to wrest the lock from a wedged owner.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A bare test-and-set spin lock for process-global state. No guard, no
/// data; callers pair `acquire`/`release` explicitly.
pub struct RawLock {
    held: AtomicBool,
}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn acquire(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            // Wait on a plain load so the spin doesn't bounce the line.
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }
}

unsafe impl Send for RawLock {}
unsafe impl Sync for RawLock {}

/// The big lock serializing collector operations on one arena.
///
/// The lock word holds the owning thread's platform handle; zero means
/// free. Owner tracking is load-bearing, not diagnostic: `held_by_me`
/// lets the allocation-point trip path run both under the collector and
/// from the mutator, re-entry (which would mean the barrier fault handler
/// fired while the faulting thread was inside the collector; the shield
/// discipline forbids that) is caught in debug builds, and `force_release`
/// lets `postmortem` free a wedged arena for inspection.
pub struct ArenaLock {
    owner: AtomicUsize,
}

impl ArenaLock {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn enter(&self) {
        let me = crate::platform::thread_self();
        debug_assert_ne!(
            self.owner.load(Ordering::Relaxed),
            me,
            "arena lock re-entered by its owner"
        );
        loop {
            if self
                .owner
                .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            while self.owner.load(Ordering::Relaxed) != 0 {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn leave(&self) {
        debug_assert!(self.held_by_me(), "arena lock released by a non-owner");
        self.owner.store(0, Ordering::Release);
    }

    /// Whether the calling thread holds the lock.
    #[inline]
    pub fn held_by_me(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == crate::platform::thread_self()
    }

    /// Unconditionally release, whoever owns it. Only for postmortem
    /// debugging; the arena is unusable for collection afterwards.
    pub fn force_release(&self) {
        self.owner.store(0, Ordering::Release);
    }
}

unsafe impl Send for ArenaLock {}
unsafe impl Sync for ArenaLock {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use core::cell::UnsafeCell;
    use std::sync::Arc;

    #[test]
    fn test_raw_lock_pairs() {
        let lock = RawLock::new();
        lock.acquire();
        lock.release();
        lock.acquire();
        lock.release();
    }

    #[test]
    fn test_arena_lock_owner() {
        let lock = ArenaLock::new();
        assert!(!lock.held_by_me());
        lock.enter();
        assert!(lock.held_by_me());
        lock.leave();
        assert!(!lock.held_by_me());
    }

    #[test]
    fn test_arena_lock_force_release() {
        let lock = ArenaLock::new();
        lock.enter();
        lock.force_release();
        assert!(!lock.held_by_me());
        // Usable again after the forced release.
        lock.enter();
        lock.leave();
    }

    struct Counter {
        lock: ArenaLock,
        value: UnsafeCell<u64>,
    }

    // SAFETY: value is only touched between enter and leave.
    unsafe impl Sync for Counter {}

    #[test]
    fn test_arena_lock_excludes() {
        let counter = Arc::new(Counter {
            lock: ArenaLock::new(),
            value: UnsafeCell::new(0),
        });
        let num_threads = 8;
        let iterations = 10_000;

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let c = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        c.lock.enter();
                        unsafe { *c.value.get() += 1 };
                        c.lock.leave();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        counter.lock.enter();
        let total = unsafe { *counter.value.get() };
        counter.lock.leave();
        assert_eq!(total, num_threads * iterations);
    }
}
