//! The arena: root container for one collected world.
//!
//! An arena owns the segment map, the control allocator, the rings of
//! pools, formats, chains, roots and threads, the trace slots, commit
//! accounting, the message queue and the location-dependency epoch. A
//! single lock serializes all collector operations; the mutator-facing
//! reserve/commit fast path is the only thing that runs outside it.
//!
//! Arenas register in a process-wide ring so the access-violation handler
//! can route barrier faults: a fault on a shielded segment scans it (read
//! barrier) or widens its summary (write barrier) and retries the access.

use crate::amc::AmcPool;
use crate::chain::Chain;
use crate::config::{LD_HISTORY, PAGE_SIZE};
use crate::control::ControlAlloc;
use crate::fin::FinEntry;
use crate::format::Format;
use crate::message::Message;
use crate::platform;
use crate::refset::RefSet;
use crate::root::Root;
use crate::segmap::SegMap;
use crate::shield::AccessSet;
use crate::sync::{ArenaLock, RawLock};
use crate::thread::Thread;
use crate::trace::{self, TRACE_MAX, Trace, TraceSet};
use crate::{Addr, Res, Result, Size, align_up, stat_inc};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use log::debug;

/// Per-arena tuning. Nothing here is process-global; two arenas in one
/// process may be configured differently.
#[derive(Clone, Copy)]
pub struct ArenaConfig {
    /// Zone granularity for all RefSet arithmetic.
    pub zone_shift: usize,
    /// Hard ceiling on committed memory (segments plus collector
    /// metadata).
    pub commit_limit: Size,
    /// Accepted and recorded; segment memory is returned to the OS
    /// eagerly, so no spare committed pool is kept.
    pub spare_commit_limit: Size,
    /// Pause-time target for [`Arena::step`].
    pub pause_time_ns: u64,
    /// Normalizer for the trace pacing rate: expected bytes of allocation
    /// between polls.
    pub poll_every: Size,
    /// Raise real page protection for barriers. Disabling keeps the
    /// logical colour discipline only.
    pub barriers: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            zone_shift: crate::config::DEFAULT_ZONE_SHIFT,
            commit_limit: usize::MAX,
            spare_commit_limit: usize::MAX,
            pause_time_ns: 100_000_000,
            poll_every: crate::config::DEFAULT_POLL_EVERY,
            barriers: true,
        }
    }
}

#[repr(C)]
pub struct Arena {
    pub(crate) lock: ArenaLock,
    pub config: ArenaConfig,
    pub zone_shift: usize,
    pub control: ControlAlloc,
    pub segmap: SegMap,
    pub pools: *mut AmcPool,
    pub roots: *mut Root,
    pub threads: *mut Thread,
    pub formats: *mut Format,
    pub chains: *mut Chain,
    pub messages: *mut Message,
    pub message_enabled: u8,
    pub fin_entries: *mut FinEntry,
    pub traces: [Trace; TRACE_MAX],
    pub busy_traces: TraceSet,
    pub flipped: TraceSet,
    /// Bytes committed for segments and the arena block itself; metadata
    /// slabs and map nodes are added by `committed_total`.
    pub committed: Size,
    pub commit_limit: Size,
    pub spare_commit_limit: Size,
    pub pause_time_ns: u64,
    /// Location-dependency epoch; one tick per flip.
    pub epoch: AtomicUsize,
    pub history: [RefSet; LD_HISTORY],
    pub prehistory: RefSet,
    /// Stack pointer at the current collector entry; the hot bound for
    /// scanning the entering thread's stack.
    pub entry_sp: Addr,
    pub inside_poll: bool,
    /// Clamped arenas take no collection action from polls.
    pub clamped: bool,
    next: *mut Arena,
}

/// Process-wide arena list, consulted by the barrier fault handler. The
/// head is read lock-free (the handler must not block on bookkeeping);
/// insertion and removal happen under `ARENAS_LOCK`.
static ARENAS: AtomicPtr<Arena> = AtomicPtr::new(ptr::null_mut());
static ARENAS_LOCK: RawLock = RawLock::new();

fn access_trampoline(addr: usize) -> bool {
    // The list head and the segment map reads are lock-free, so ownership
    // can be probed before taking any arena lock.
    let mut arena = ARENAS.load(Ordering::Acquire);
    while !arena.is_null() {
        unsafe {
            if !(*arena).segmap.of_addr(addr).is_null() {
                return Arena::access(arena, addr);
            }
            arena = (*arena).next;
        }
    }
    false
}

impl Arena {
    /// Create an arena.
    pub fn create(config: ArenaConfig) -> Result<*mut Arena> {
        if !(12..40).contains(&config.zone_shift) || config.poll_every == 0 {
            return Err(Res::Param);
        }
        let size = align_up(core::mem::size_of::<Arena>(), PAGE_SIZE);
        let mem = unsafe { platform::page_alloc(size) };
        if mem.is_null() {
            return Err(Res::Memory);
        }
        let arena = mem.cast::<Arena>();
        unsafe {
            ptr::write(
                arena,
                Arena {
                    lock: ArenaLock::new(),
                    config,
                    zone_shift: config.zone_shift,
                    control: ControlAlloc::new(),
                    segmap: SegMap::new(),
                    pools: ptr::null_mut(),
                    roots: ptr::null_mut(),
                    threads: ptr::null_mut(),
                    formats: ptr::null_mut(),
                    chains: ptr::null_mut(),
                    messages: ptr::null_mut(),
                    message_enabled: 0,
                    fin_entries: ptr::null_mut(),
                    traces: [const { Trace::empty() }; TRACE_MAX],
                    busy_traces: TraceSet::EMPTY,
                    flipped: TraceSet::EMPTY,
                    committed: size,
                    commit_limit: config.commit_limit,
                    spare_commit_limit: config.spare_commit_limit,
                    pause_time_ns: config.pause_time_ns,
                    epoch: AtomicUsize::new(1),
                    history: [RefSet::EMPTY; LD_HISTORY],
                    prehistory: RefSet::EMPTY,
                    entry_sp: 0,
                    inside_poll: false,
                    clamped: false,
                    next: ptr::null_mut(),
                },
            );
            ARENAS_LOCK.acquire();
            (*arena).next = ARENAS.load(Ordering::Relaxed);
            ARENAS.store(arena, Ordering::Release);
            ARENAS_LOCK.release();
            if config.barriers {
                platform::install_access_handler(access_trampoline);
            }
        }
        debug!("arena created, zone shift {}", config.zone_shift);
        Ok(arena)
    }

    /// Destroy the arena. Pools, roots, threads, formats and chains
    /// should already be destroyed; whatever remains is torn down with
    /// the metadata slabs.
    ///
    /// # Safety
    /// `arena` must come from [`create`](Self::create) and must not be
    /// used afterwards by any thread.
    pub unsafe fn destroy(arena: *mut Arena) {
        unsafe {
            (*arena).enter();
            (*arena).clamped = true;
            (*arena).park_locked();
            debug_assert!((*arena).pools.is_null(), "pools outlive their arena");

            // Tolerate leftover pools: unmap their segments before the
            // metadata disappears.
            let mut pool = (*arena).pools;
            while !pool.is_null() {
                let mut r#gen = (*pool).gens;
                while !r#gen.is_null() {
                    let mut seg = (*r#gen).segs.head;
                    while !seg.is_null() {
                        let next = (*seg).next;
                        crate::shield::lower(arena, seg, AccessSet::all());
                        platform::page_dealloc((*seg).base as *mut u8, (*seg).size());
                        seg = next;
                    }
                    r#gen = (*r#gen).next;
                }
                pool = (*pool).next;
            }

            ARENAS_LOCK.acquire();
            let mut cur = ARENAS.load(Ordering::Relaxed);
            if cur == arena {
                ARENAS.store((*arena).next, Ordering::Release);
            } else {
                while !cur.is_null() && (*cur).next != arena {
                    cur = (*cur).next;
                }
                if !cur.is_null() {
                    (*cur).next = (*arena).next;
                }
            }
            ARENAS_LOCK.release();

            (*arena).segmap.destroy();
            (*arena).control.destroy();
            (*arena).leave();
            let size = align_up(core::mem::size_of::<Arena>(), PAGE_SIZE);
            platform::page_dealloc(arena.cast::<u8>(), size);
        }
    }

    // ---- Lock discipline ----

    pub(crate) fn enter(&mut self) {
        self.lock.enter();
        let marker: usize = 0;
        self.entry_sp = &marker as *const usize as usize;
    }

    pub(crate) fn leave(&mut self) {
        self.lock.leave();
    }

    pub(crate) fn lock_held_by_me(&self) -> bool {
        self.lock.held_by_me()
    }

    // ---- Trace helpers ----

    /// Total committed bytes: segments, the arena block itself, metadata
    /// slabs and map nodes. The commit limit binds this figure.
    pub(crate) fn committed_total(&self) -> Size {
        self.committed + self.control.committed() + self.segmap.committed()
    }

    pub(crate) fn white_union(&self, traces: TraceSet) -> RefSet {
        let mut white = RefSet::EMPTY;
        for ti in traces.iter() {
            white = white.union(self.traces[ti].white);
        }
        white
    }

    pub(crate) fn any_emergency(&self, traces: TraceSet) -> bool {
        traces.iter().any(|ti| self.traces[ti].emergency)
    }

    /// Condemn and start one trace. Lock held.
    fn start_trace(&mut self, white: RefSet, mortality: f64, why: &'static str) -> Result<usize> {
        let arena: *mut Arena = self;
        unsafe {
            let ti = trace::create(arena, why)?;
            trace::condemn_refset(arena, ti, white);
            if self.traces[ti].condemned == 0 {
                trace::destroy(arena, ti);
                return Err(Res::Fail);
            }
            trace::start(arena, ti, mortality);
            Ok(ti)
        }
    }

    /// Is a generation over capacity? Returns the condemnation set,
    /// mortality and reason for the most pressing pool.
    fn start_condition(&mut self) -> Option<(RefSet, f64, &'static str)> {
        unsafe {
            let shift = self.zone_shift;
            let mut pool = self.pools;
            while !pool.is_null() {
                let chain = (*pool).chain;
                let mut r#gen = (*pool).gens;
                while !r#gen.is_null() {
                    let index = (*r#gen).index;
                    // The last generation only collects on request; its
                    // survivors would re-fill it and re-trigger forever.
                    if index + 1 < (*pool).gen_count
                        && (*r#gen).new_size > (*chain).r#gen(index).capacity
                    {
                        // Condemn this generation and everything younger.
                        let mut white = RefSet::EMPTY;
                        let mut g = (*pool).gens;
                        loop {
                            let mut seg = (*g).segs.head;
                            while !seg.is_null() {
                                white = white.union((*seg).refset(shift));
                                seg = (*seg).next;
                            }
                            if (*g).index == index {
                                break;
                            }
                            g = (*g).next;
                        }
                        let mortality = (*chain).r#gen(index).mortality;
                        return Some((white, mortality, "generation over capacity"));
                    }
                    r#gen = (*r#gen).next;
                }
                pool = (*pool).next;
            }
            None
        }
    }

    /// The poll driver: called from allocation slow paths. Advances the
    /// busy trace by one quantum, or starts a due collection.
    pub(crate) fn poll(&mut self) {
        if self.clamped || self.inside_poll {
            return;
        }
        self.inside_poll = true;
        let arena: *mut Arena = self;
        unsafe {
            if let Some(ti) = self.busy_traces.iter().next() {
                trace::quantum(arena, ti);
                // An emergency trace is making no copying progress; there
                // is nothing to pace, so drive it straight to the end.
                if self.traces[ti].busy && self.traces[ti].emergency {
                    trace::expedite(arena, ti);
                }
            } else if let Some((white, mortality, why)) = self.start_condition() {
                let _ = self.start_trace(white, mortality, why);
            }
        }
        self.inside_poll = false;
    }

    /// Finish all collection activity, starting any collections that are
    /// already due. Leaves the arena clamped.
    pub(crate) fn park_locked(&mut self) {
        let arena: *mut Arena = self;
        unsafe {
            loop {
                if let Some(ti) = self.busy_traces.iter().next() {
                    while self.traces[ti].busy {
                        trace::quantum(arena, ti);
                    }
                } else if !self.clamped
                    && let Some((white, mortality, why)) = self.start_condition()
                {
                    let _ = self.start_trace(white, mortality, why);
                } else {
                    break;
                }
            }
        }
        self.clamped = true;
    }

    // ---- Public collection control ----

    /// Wait for all collection activity to finish; the arena stays
    /// clamped until [`release`](Self::release).
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn park(arena: *mut Arena) {
        unsafe {
            (*arena).enter();
            (*arena).park_locked();
            (*arena).leave();
        }
    }

    /// Forbid collection activity from polls without waiting for current
    /// traces.
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn clamp(arena: *mut Arena) {
        unsafe {
            (*arena).enter();
            (*arena).clamped = true;
            (*arena).leave();
        }
    }

    /// Allow collection activity again.
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn release(arena: *mut Arena) {
        unsafe {
            (*arena).enter();
            (*arena).clamped = false;
            (*arena).leave();
        }
    }

    /// Collect the whole arena now and park it.
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn collect(arena: *mut Arena) {
        unsafe {
            (*arena).enter();
            (*arena).park_locked();
            let started = (*arena).start_trace(RefSet::UNIV, 0.5, "client requests collection");
            if let Ok(ti) = started {
                while (*arena).traces[ti].busy {
                    trace::quantum(arena, ti);
                }
            }
            (*arena).leave();
        }
    }

    /// Begin a full collection without waiting for it; polls (and
    /// [`step`](Self::step)) advance it incrementally.
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn start_collect(arena: *mut Arena) -> Res {
        unsafe {
            (*arena).enter();
            (*arena).clamped = false;
            let res = if (*arena).busy_traces.is_empty() {
                match (*arena).start_trace(RefSet::UNIV, 0.5, "client starts collection") {
                    Ok(_) => Res::Ok,
                    Err(r) => r,
                }
            } else {
                Res::Ok
            };
            (*arena).leave();
            res
        }
    }

    /// Do some collection work if any is pending, for at most
    /// `interval_ns` (0 means the configured pause target). Returns
    /// whether any work was done.
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn step(arena: *mut Arena, interval_ns: u64) -> bool {
        unsafe {
            (*arena).enter();
            let budget = if interval_ns == 0 {
                (*arena).pause_time_ns
            } else {
                interval_ns
            };
            let deadline = platform::clock_ns() + budget;
            let mut worked = false;
            while platform::clock_ns() < deadline {
                let Some(ti) = (*arena).busy_traces.iter().next() else {
                    break;
                };
                trace::quantum(arena, ti);
                worked = true;
            }
            (*arena).leave();
            worked
        }
    }

    /// Barrier-fault entry: service a read or write barrier at `addr`.
    /// Returns whether the fault was ours and the access can retry.
    pub(crate) fn access(arena: *mut Arena, addr: Addr) -> bool {
        unsafe {
            (*arena).enter();
            let seg = (*arena).segmap.of_addr(addr);
            if seg.is_null() {
                (*arena).leave();
                return false;
            }
            if (*seg).sm.is_empty() {
                // Raced with a lower; the retry will succeed.
                (*arena).leave();
                return true;
            }
            stat_inc!(barrier_fault_count);
            if (*seg).sm.contains(AccessSet::READ) {
                trace::seg_access(arena, seg);
            }
            if (*seg).sm.contains(AccessSet::WRITE) {
                // The mutator is writing: the tightened summary is no
                // longer sound.
                trace::seg_set_summary(arena, seg, RefSet::UNIV);
            }
            (*arena).leave();
            true
        }
    }

    /// Release the arena lock unconditionally so a debugger or crash
    /// handler can inspect state. The arena must not be used for
    /// collection afterwards.
    ///
    /// # Safety
    /// Only for postmortem diagnostics.
    pub unsafe fn postmortem(arena: *mut Arena) {
        unsafe {
            (*arena).clamped = true;
            (*arena).lock.force_release();
        }
    }

    // ---- Accounting knobs ----

    /// Bytes currently committed (segments plus collector metadata).
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn committed(arena: *mut Arena) -> Size {
        unsafe {
            (*arena).enter();
            let total = (*arena).committed_total();
            (*arena).leave();
            total
        }
    }

    /// Set the commit limit; fails if already above it.
    ///
    /// # Safety
    /// `arena` live.
    pub unsafe fn set_commit_limit(arena: *mut Arena, limit: Size) -> Res {
        unsafe {
            (*arena).enter();
            let res = if limit < (*arena).committed_total() {
                Res::Param
            } else {
                (*arena).commit_limit = limit;
                Res::Ok
            };
            (*arena).leave();
            res
        }
    }

    /// # Safety
    /// `arena` live.
    pub unsafe fn set_spare_commit_limit(arena: *mut Arena, limit: Size) {
        unsafe {
            (*arena).enter();
            (*arena).spare_commit_limit = limit;
            (*arena).leave();
        }
    }

    /// # Safety
    /// `arena` live.
    pub unsafe fn set_pause_time(arena: *mut Arena, ns: u64) {
        unsafe {
            (*arena).enter();
            (*arena).pause_time_ns = ns;
            (*arena).leave();
        }
    }
}

/// Fault-handler probe used by tests: whether `addr` belongs to a managed
/// segment of any arena.
pub fn managed_address(addr: Addr) -> bool {
    let mut arena = ARENAS.load(Ordering::Acquire);
    while !arena.is_null() {
        unsafe {
            if !(*arena).segmap.of_addr(addr).is_null() {
                return true;
            }
            arena = (*arena).next;
        }
    }
    false
}
