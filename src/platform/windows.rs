//! Windows implementation using VirtualAlloc/VirtualProtect.
//!
//! The thread-suspension path compiles but reports no stopped stack
//! pointer; only the unix half is exercised by the test suite.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const MEM_DECOMMIT: u32 = 0x4000;

const PAGE_NOACCESS: u32 = 0x01;
const PAGE_READONLY: u32 = 0x02;
const PAGE_READWRITE: u32 = 0x04;

const THREAD_SUSPEND_RESUME: u32 = 0x0002;

#[link(name = "kernel32")]
unsafe extern "system" {
    fn VirtualAlloc(addr: *mut c_void, size: usize, alloc_type: u32, protect: u32) -> *mut c_void;
    fn VirtualFree(addr: *mut c_void, size: usize, free_type: u32) -> i32;
    fn VirtualProtect(addr: *mut c_void, size: usize, protect: u32, old: *mut u32) -> i32;
    fn QueryPerformanceCounter(count: *mut i64) -> i32;
    fn QueryPerformanceFrequency(freq: *mut i64) -> i32;
    fn GetCurrentThreadId() -> u32;
    fn OpenThread(access: u32, inherit: i32, thread_id: u32) -> *mut c_void;
    fn SuspendThread(thread: *mut c_void) -> u32;
    fn ResumeThread(thread: *mut c_void) -> u32;
    fn CloseHandle(handle: *mut c_void) -> i32;
}

pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    // VirtualAlloc reservations are 64 KiB aligned, which covers any
    // supported PAGE_SIZE.
    let ptr = unsafe {
        VirtualAlloc(
            core::ptr::null_mut(),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    ptr.cast::<u8>()
}

pub unsafe fn page_dealloc(ptr: *mut u8) {
    unsafe { VirtualFree(ptr.cast::<c_void>(), 0, MEM_RELEASE) };
}

pub unsafe fn page_decommit(ptr: *mut u8, size: usize) {
    unsafe { VirtualFree(ptr.cast::<c_void>(), size, MEM_DECOMMIT) };
}

pub unsafe fn protect(ptr: *mut u8, size: usize, prot: super::Prot) {
    let flags = match prot {
        super::Prot::None => PAGE_NOACCESS,
        super::Prot::Read => PAGE_READONLY,
        super::Prot::ReadWrite => PAGE_READWRITE,
    };
    let mut old = 0u32;
    unsafe { VirtualProtect(ptr.cast::<c_void>(), size, flags, &mut old) };
}

pub fn clock_ns() -> u64 {
    let mut count = 0i64;
    let mut freq = 0i64;
    unsafe {
        QueryPerformanceCounter(&mut count);
        QueryPerformanceFrequency(&mut freq);
    }
    if freq <= 0 {
        return 0;
    }
    (count as u128 * 1_000_000_000u128 / freq as u128) as u64
}

pub fn thread_self() -> usize {
    unsafe { GetCurrentThreadId() as usize }
}

pub unsafe fn thread_suspend(handle: usize) -> usize {
    unsafe {
        let h = OpenThread(THREAD_SUSPEND_RESUME, 0, handle as u32);
        if h.is_null() {
            return 0;
        }
        SuspendThread(h);
        CloseHandle(h);
    }
    // No stopped stack pointer is recovered here; thread stack roots are
    // rescanned from their registered cold end only.
    0
}

pub unsafe fn thread_resume(handle: usize) {
    unsafe {
        let h = OpenThread(THREAD_SUSPEND_RESUME, 0, handle as u32);
        if h.is_null() {
            return;
        }
        ResumeThread(h);
        CloseHandle(h);
    }
}

pub fn install_access_handler(_handler: fn(usize) -> bool) {
    // Vectored exception handling is not wired up on this platform.
}
