//! Location dependencies.
//!
//! A location dependency lets the client rely on the *current* address of
//! a movable object (say, as a hash key) and find out later whether any
//! relevant object may have moved since. It records the arena epoch and
//! accumulates the zones of depended-on addresses; each flip ages the
//! arena by one epoch, recording the zones that cycle may move.
//!
//! Staleness checks are lock-free: they read the atomic epoch and the
//! history ring without taking the arena lock, so a false "stale" under a
//! racing flip is possible and safe (the client revalidates), while false
//! "fresh" is not.

use crate::arena::Arena;
use crate::config::LD_HISTORY;
use crate::refset::RefSet;
use crate::{Addr, Word};
use core::sync::atomic::Ordering;

/// Client-embedded dependency record. `reset` before first use.
#[derive(Clone, Copy, Debug)]
pub struct LocationDependency {
    epoch: Word,
    rs: RefSet,
}

impl LocationDependency {
    pub const fn new() -> LocationDependency {
        LocationDependency {
            epoch: 0,
            rs: RefSet::EMPTY,
        }
    }

    /// Forget everything: depend on nothing as of the current epoch.
    pub fn reset(&mut self, arena: *mut Arena) {
        self.epoch = unsafe { (*arena).epoch.load(Ordering::Acquire) };
        self.rs = RefSet::EMPTY;
    }

    /// Record a dependency on the current location of `addr`.
    pub fn add(&mut self, arena: *mut Arena, addr: Addr) {
        let shift = unsafe { (*arena).zone_shift };
        self.rs = self.rs.add(shift, addr);
    }

    /// Merge another dependency into this one.
    pub fn merge(&mut self, _arena: *mut Arena, other: &LocationDependency) {
        self.epoch = self.epoch.min(other.epoch);
        self.rs = self.rs.union(other.rs);
    }

    /// Whether any completed flip since the recorded epoch may have moved
    /// an object in the depended-on zones. `addr` is accepted for
    /// interface compatibility; the answer covers the whole recorded set.
    pub fn is_stale(&self, arena: *mut Arena, addr: Addr) -> bool {
        let _ = addr;
        self.is_stale_any(arena)
    }

    /// [`is_stale`](Self::is_stale) without a distinguished address.
    pub fn is_stale_any(&self, arena: *mut Arena) -> bool {
        let current = unsafe { (*arena).epoch.load(Ordering::Acquire) };
        if current == self.epoch {
            return false;
        }
        if self.rs.is_empty() {
            return false;
        }
        if current - self.epoch > LD_HISTORY {
            // Too old for the ring: compare against everything ever moved.
            return unsafe { (*arena).prehistory.intersects(self.rs) };
        }
        let mut moved = RefSet::EMPTY;
        for e in self.epoch..current {
            moved = moved.union(unsafe { (*arena).history[e % LD_HISTORY] });
        }
        moved.intersects(self.rs)
    }
}

impl Default for LocationDependency {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance the arena epoch, recording that the zones in `moved` may move
/// during the cycle now flipping. Called at flip, under the arena lock
/// with mutators suspended.
///
/// # Safety
/// Arena lock held.
pub unsafe fn age(arena: *mut Arena, moved: RefSet) {
    unsafe {
        let epoch = (*arena).epoch.load(Ordering::Relaxed);
        (*arena).history[epoch % LD_HISTORY] = moved;
        (*arena).prehistory = (*arena).prehistory.union(moved);
        (*arena).epoch.store(epoch + 1, Ordering::Release);
    }
}
