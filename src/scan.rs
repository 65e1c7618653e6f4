//! Scan state: the cursor carried through every scan.
//!
//! A `ScanState` names the traces being advanced, the rank of the
//! references being scanned, and the union of those traces' white sets.
//! Format scan methods call [`ScanState::fix`] on each reference slot; the
//! zone pre-test filters out references that cannot possibly be white, and
//! survivors dispatch to the trace fix (or the emergency fix when any
//! trace in the set is in emergency mode).
//!
//! The state accumulates two summaries: `unfixed` (every reference seen,
//! as it was) and `fixed` (every reference that went through the fix, as
//! it ended up). The summary of a completed scan is
//! `fixed ∪ (unfixed − white)`: white references are guaranteed to have
//! been translated, so the post-scan summary reflects their post-images.

use crate::arena::Arena;
use crate::rank::Rank;
use crate::refset::RefSet;
use crate::trace::TraceSet;
use crate::{Addr, Res, Size};

/// The per-reference fix operation installed in a scan state.
pub type FixMethod = unsafe fn(&mut ScanState, *mut Addr) -> Res;

pub struct ScanState {
    pub arena: *mut Arena,
    /// Traces being advanced by this scan.
    pub traces: TraceSet,
    /// Rank of the references being scanned.
    pub rank: Rank,
    /// Cached from the arena: zone shift for all summary arithmetic.
    pub zone_shift: usize,
    /// Union of the white sets of `traces`.
    pub white: RefSet,
    /// Zones of references seen, pre-fix.
    pub unfixed: RefSet,
    /// Zones of references after fixing.
    pub fixed: RefSet,
    fix_method: FixMethod,
    /// Closure data for special fixes (transforms).
    pub fix_closure: *mut u8,
    /// Set by the last fix: whether the target had already been preserved.
    pub was_marked: bool,
    /// References dispatched past the zone test.
    pub fix_count: u64,
    /// Bytes of segment scanned under this state.
    pub scanned: Size,
}

impl ScanState {
    /// Build a scan state for `traces` at `rank` over `white`.
    ///
    /// # Safety
    /// Arena lock held; `traces` must all be busy traces of `arena`.
    pub unsafe fn init(arena: *mut Arena, traces: TraceSet, rank: Rank, white: RefSet) -> ScanState {
        let emergency = unsafe { (*arena).any_emergency(traces) };
        ScanState {
            arena,
            traces,
            rank,
            zone_shift: unsafe { (*arena).zone_shift },
            white,
            unfixed: RefSet::EMPTY,
            fixed: RefSet::EMPTY,
            fix_method: if emergency {
                crate::trace::trace_fix_emergency
            } else {
                crate::trace::trace_fix
            },
            fix_closure: core::ptr::null_mut(),
            was_marked: true,
            fix_count: 0,
            scanned: 0,
        }
    }

    /// Install a special fix (transforms use this).
    pub fn set_fix(&mut self, fix: FixMethod, closure: *mut u8) {
        self.fix_method = fix;
        self.fix_closure = closure;
    }

    /// Fix one reference slot. Reads `*refio`, possibly updates it.
    ///
    /// # Safety
    /// `refio` must be a valid, writable reference slot; the arena lock
    /// must be held by the scanning thread.
    #[inline]
    pub unsafe fn fix(&mut self, refio: *mut Addr) -> Res {
        let r = unsafe { *refio };
        self.unfixed = self.unfixed.add(self.zone_shift, r);
        if self.white.contains_addr(self.zone_shift, r) {
            self.fix_count += 1;
            unsafe { (self.fix_method)(self, refio) }
        } else {
            Res::Ok
        }
    }

    /// The sound post-scan summary.
    #[inline]
    pub fn summary(&self) -> RefSet {
        self.fixed.union(self.unfixed.diff(self.white))
    }

    /// Replace the accumulated summaries wholesale. Needed after passes in
    /// which already-fixed references were re-seen as inputs (nailed
    /// rescans, emergency passes): `unfixed` is no longer purely unfixed,
    /// so it is folded into `fixed` and reset.
    pub fn set_summary(&mut self, summary: RefSet) {
        self.fixed = summary;
        self.unfixed = RefSet::EMPTY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_state(white: RefSet, zone_shift: usize) -> ScanState {
        unsafe fn count_fix(ss: &mut ScanState, refio: *mut Addr) -> Res {
            // Pretend every white ref forwards to a fixed location in zone 0.
            unsafe { *refio = 0 };
            ss.fixed = ss.fixed.add(ss.zone_shift, 0);
            Res::Ok
        }
        ScanState {
            arena: core::ptr::null_mut(),
            traces: TraceSet::EMPTY,
            rank: Rank::Exact,
            zone_shift,
            white,
            unfixed: RefSet::EMPTY,
            fixed: RefSet::EMPTY,
            fix_method: count_fix,
            fix_closure: core::ptr::null_mut(),
            was_marked: true,
            fix_count: 0,
            scanned: 0,
        }
    }

    #[test]
    fn test_zone_pretest_skips_nonwhite() {
        const SHIFT: usize = 16;
        let white = RefSet::of_addr(SHIFT, 0x9_0000);
        let mut ss = raw_state(white, SHIFT);

        let mut miss: Addr = 0x20_0000;
        assert_eq!(unsafe { ss.fix(&mut miss) }, Res::Ok);
        assert_eq!(ss.fix_count, 0);
        assert_eq!(miss, 0x20_0000);

        let mut hit: Addr = 0x9_0040;
        assert_eq!(unsafe { ss.fix(&mut hit) }, Res::Ok);
        assert_eq!(ss.fix_count, 1);
        assert_eq!(hit, 0);
    }

    #[test]
    fn test_summary_translates_white() {
        const SHIFT: usize = 16;
        let white = RefSet::of_addr(SHIFT, 0x9_0000);
        let mut ss = raw_state(white, SHIFT);

        let mut hit: Addr = 0x9_0040;
        let mut miss: Addr = 0x20_0000;
        unsafe {
            ss.fix(&mut hit);
            ss.fix(&mut miss);
        }
        let summary = ss.summary();
        // The white pre-image must not appear; its post-image (zone 0) and
        // the non-white reference must.
        assert!(!RefSet::of_addr(SHIFT, 0x9_0000).is_sub(summary));
        assert!(RefSet::of_addr(SHIFT, 0).is_sub(summary));
        assert!(RefSet::of_addr(SHIFT, 0x20_0000).is_sub(summary));
    }

    #[test]
    fn test_set_summary_resets_unfixed() {
        const SHIFT: usize = 16;
        let mut ss = raw_state(RefSet::EMPTY, SHIFT);
        let mut r: Addr = 0x12_0000;
        unsafe { ss.fix(&mut r) };
        assert!(!ss.unfixed.is_empty());
        ss.set_summary(RefSet(0b1010));
        assert_eq!(ss.unfixed, RefSet::EMPTY);
        assert_eq!(ss.fixed, RefSet(0b1010));
        assert_eq!(ss.summary(), RefSet(0b1010));
    }
}
