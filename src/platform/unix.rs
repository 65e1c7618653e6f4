//! Unix implementation: mmap/mprotect virtual memory, clock_gettime,
//! pthread-based thread control, and signal-driven barrier faults.
//!
//! Thread suspension uses a rendezvous signal (SIGPWR, following the
//! convention of other collectors on Linux): the target's handler records
//! its stack pointer and parks in a spin loop until resumed. Suspensions
//! are serialized process-wide, so a single pending-slot cell is enough to
//! hand the target its parking slot.

use crate::sync::RawLock;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const PROT_NONE: i32 = 0x0;
const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;
const MADV_DONTNEED: i32 = 4;

const CLOCK_MONOTONIC: i32 = 1;

const SIG_SUSPEND: i32 = 30; // SIGPWR
const SIGSEGV: i32 = 11;

const SA_SIGINFO: i32 = 4;
const SA_RESTART: i32 = 0x1000_0000;

#[repr(C)]
struct Timespec {
    tv_sec: i64,
    tv_nsec: i64,
}

/// glibc/musl layout on 64-bit Linux: handler word, 1024-bit mask, flags,
/// restorer.
#[repr(C)]
struct SigAction {
    sa_sigaction: usize,
    sa_mask: [u64; 16],
    sa_flags: i32,
    sa_restorer: usize,
}

impl SigAction {
    const fn zeroed() -> Self {
        SigAction {
            sa_sigaction: 0,
            sa_mask: [0; 16],
            sa_flags: 0,
            sa_restorer: 0,
        }
    }
}

/// Prefix of siginfo_t; only `si_addr` is consumed.
#[repr(C)]
struct SigInfo {
    si_signo: i32,
    si_errno: i32,
    si_code: i32,
    _pad: i32,
    si_addr: *mut c_void,
}

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;
    fn munmap(addr: *mut c_void, length: usize) -> i32;
    fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
    fn clock_gettime(clockid: i32, tp: *mut Timespec) -> i32;
    fn pthread_self() -> usize;
    fn pthread_kill(thread: usize, sig: i32) -> i32;
    fn sigaction(signum: i32, act: *const SigAction, oldact: *mut SigAction) -> i32;
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    // mmap only guarantees system-page alignment; over-allocate and trim so
    // the result is aligned to our page size even if it is larger.
    let align = crate::config::PAGE_SIZE;

    let raw = unsafe {
        mmap(
            core::ptr::null_mut(),
            size + align,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == MAP_FAILED {
        return core::ptr::null_mut();
    }

    let raw_addr = raw as usize;
    let aligned_addr = (raw_addr + align - 1) & !(align - 1);

    let lead = aligned_addr - raw_addr;
    if lead > 0 {
        unsafe { munmap(raw_addr as *mut c_void, lead) };
    }
    let trail = (raw_addr + size + align) - (aligned_addr + size);
    if trail > 0 {
        unsafe { munmap((aligned_addr + size) as *mut c_void, trail) };
    }

    aligned_addr as *mut u8
}

pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}

pub unsafe fn page_decommit(ptr: *mut u8, size: usize) {
    unsafe { madvise(ptr as *mut c_void, size, MADV_DONTNEED) };
}

pub unsafe fn protect(ptr: *mut u8, size: usize, prot: super::Prot) {
    let flags = match prot {
        super::Prot::None => PROT_NONE,
        super::Prot::Read => PROT_READ,
        super::Prot::ReadWrite => PROT_READ | PROT_WRITE,
    };
    let rc = unsafe { mprotect(ptr as *mut c_void, size, flags) };
    debug_assert_eq!(rc, 0, "mprotect failed");
}

pub fn clock_ns() -> u64 {
    let mut ts = Timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { clock_gettime(CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub fn thread_self() -> usize {
    unsafe { pthread_self() }
}

// ---- Thread suspension rendezvous ----

const SLOT_FREE: usize = 0;
const SLOT_PENDING: usize = 1;
const SLOT_PARKED: usize = 2;
const SLOT_RESUME: usize = 3;

const MAX_SUSPENDED: usize = 64;

struct SuspendSlot {
    handle: AtomicUsize,
    sp: AtomicUsize,
    state: AtomicUsize,
}

#[allow(clippy::declare_interior_mutable_const)]
const SLOT_INIT: SuspendSlot = SuspendSlot {
    handle: AtomicUsize::new(0),
    sp: AtomicUsize::new(0),
    state: AtomicUsize::new(SLOT_FREE),
};

static SLOTS: [SuspendSlot; MAX_SUSPENDED] = [SLOT_INIT; MAX_SUSPENDED];
static PENDING: AtomicUsize = AtomicUsize::new(0);
static SUSPEND_LOCK: RawLock = RawLock::new();
static SUSPEND_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn suspend_handler(_sig: i32, _info: *mut c_void, _ctx: *mut c_void) {
    let idx = PENDING.load(Ordering::Acquire);
    if idx == 0 {
        return;
    }
    let slot = &SLOTS[idx - 1];
    let marker: usize = 0;
    slot.sp.store(&marker as *const usize as usize, Ordering::Relaxed);
    slot.state.store(SLOT_PARKED, Ordering::Release);
    while slot.state.load(Ordering::Acquire) != SLOT_RESUME {
        core::hint::spin_loop();
    }
    slot.handle.store(0, Ordering::Relaxed);
    slot.state.store(SLOT_FREE, Ordering::Release);
}

type RawHandler = extern "C" fn(i32, *mut c_void, *mut c_void);

fn install_suspend_handler() {
    if SUSPEND_HANDLER_INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut act = SigAction::zeroed();
    act.sa_sigaction = suspend_handler as RawHandler as usize;
    act.sa_flags = SA_SIGINFO | SA_RESTART;
    let rc = unsafe { sigaction(SIG_SUSPEND, &act, core::ptr::null_mut()) };
    debug_assert_eq!(rc, 0);
}

pub unsafe fn thread_suspend(handle: usize) -> usize {
    install_suspend_handler();
    SUSPEND_LOCK.acquire();
    let mut found = usize::MAX;
    for (i, slot) in SLOTS.iter().enumerate() {
        if slot.state.load(Ordering::Acquire) == SLOT_FREE {
            found = i;
            break;
        }
    }
    if found == usize::MAX {
        SUSPEND_LOCK.release();
        return 0;
    }
    let slot = &SLOTS[found];
    slot.handle.store(handle, Ordering::Relaxed);
    slot.sp.store(0, Ordering::Relaxed);
    slot.state.store(SLOT_PENDING, Ordering::Release);
    PENDING.store(found + 1, Ordering::Release);
    if unsafe { pthread_kill(handle, SIG_SUSPEND) } != 0 {
        slot.state.store(SLOT_FREE, Ordering::Release);
        PENDING.store(0, Ordering::Release);
        SUSPEND_LOCK.release();
        return 0;
    }
    while slot.state.load(Ordering::Acquire) != SLOT_PARKED {
        core::hint::spin_loop();
    }
    PENDING.store(0, Ordering::Release);
    SUSPEND_LOCK.release();
    slot.sp.load(Ordering::Relaxed)
}

pub unsafe fn thread_resume(handle: usize) {
    for slot in SLOTS.iter() {
        if slot.state.load(Ordering::Acquire) == SLOT_PARKED
            && slot.handle.load(Ordering::Relaxed) == handle
        {
            slot.state.store(SLOT_RESUME, Ordering::Release);
            return;
        }
    }
}

// ---- Barrier fault handler ----

static ACCESS_HANDLER: AtomicUsize = AtomicUsize::new(0);
static SEGV_INSTALLED: AtomicBool = AtomicBool::new(false);
static mut OLD_SEGV: SigAction = SigAction::zeroed();

extern "C" fn segv_handler(sig: i32, info: *mut SigInfo, ctx: *mut c_void) {
    let h = ACCESS_HANDLER.load(Ordering::Acquire);
    if h != 0 {
        let f: fn(usize) -> bool = unsafe { core::mem::transmute(h) };
        let addr = unsafe { (*info).si_addr as usize };
        if f(addr) {
            // Barrier serviced; retry the faulting access.
            return;
        }
    }
    // Not ours: hand over to the previous disposition. If that was a
    // SA_SIGINFO handler, chain directly; otherwise reinstall it and return
    // so the retried access re-faults under it.
    unsafe {
        let old = &raw const OLD_SEGV;
        if (*old).sa_flags & SA_SIGINFO != 0 && (*old).sa_sigaction != 0 {
            let f: extern "C" fn(i32, *mut SigInfo, *mut c_void) =
                core::mem::transmute((*old).sa_sigaction);
            f(sig, info, ctx);
        } else {
            sigaction(SIGSEGV, old, core::ptr::null_mut());
        }
    }
}

pub fn install_access_handler(handler: fn(usize) -> bool) {
    ACCESS_HANDLER.store(handler as usize, Ordering::Release);
    if SEGV_INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    let mut act = SigAction::zeroed();
    act.sa_sigaction =
        segv_handler as extern "C" fn(i32, *mut SigInfo, *mut c_void) as usize;
    act.sa_flags = SA_SIGINFO | SA_RESTART;
    let rc = unsafe { sigaction(SIGSEGV, &act, &raw mut OLD_SEGV) };
    debug_assert_eq!(rc, 0);
}
