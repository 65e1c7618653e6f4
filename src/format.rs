//! Object formats: the client's description of its object layout.
//!
//! A format is a capability set of function pointers the collector calls
//! to walk, relocate and mark client objects. All addresses passed to and
//! returned from format methods are *client* addresses, `header_size`
//! bytes past the start of the underlying block.
//!
//! Format methods run under tight constraints. They may be called from a
//! signal handler, so they must be async-signal-safe; they must be
//! re-entrant, must not allocate, must stay within 64 words of stack, and
//! must not call back into the collector other than through the fix
//! operation on the supplied scan state. They have exclusive access to the
//! object for the duration of the call.

use crate::arena::Arena;
use crate::scan::ScanState;
use crate::{Addr, Res, Result, Size};

/// Scan `[base, limit)` of client addresses, calling `ss.fix` on every
/// reference slot. Returns the first non-ok fix result.
pub type ScanMethod = unsafe fn(ss: &mut ScanState, base: Addr, limit: Addr) -> Res;
/// Given a client address, return the client address of the next object.
pub type SkipMethod = unsafe fn(object: Addr) -> Addr;
/// Install a forwarding marker at `old` pointing to `new`.
pub type ForwardMethod = unsafe fn(old: Addr, new: Addr);
/// If `object` is a forwarding marker, return the new client address.
pub type IsForwardedMethod = unsafe fn(object: Addr) -> Option<Addr>;
/// Fill `[base, base+size)` with a padding object (raw block addresses).
pub type PadMethod = unsafe fn(base: Addr, size: Size);
/// Optional: the class/wrapper of an object, for introspection.
pub type ClassMethod = unsafe fn(object: Addr) -> Addr;

/// The recognized option set for format creation.
#[derive(Clone, Copy)]
pub struct FormatSpec {
    /// Object alignment; a power of two.
    pub align: usize,
    /// Bytes of header before each client address.
    pub header_size: Size,
    pub scan: ScanMethod,
    pub skip: SkipMethod,
    pub fwd: ForwardMethod,
    pub isfwd: IsForwardedMethod,
    pub pad: PadMethod,
    pub class: Option<ClassMethod>,
}

#[repr(C)]
pub struct Format {
    pub arena: *mut Arena,
    pub align: usize,
    pub header_size: Size,
    pub scan: ScanMethod,
    pub skip: SkipMethod,
    pub fwd: ForwardMethod,
    pub isfwd: IsForwardedMethod,
    pub pad: PadMethod,
    pub class: Option<ClassMethod>,
    /// Pools currently using this format; must be zero at destroy.
    pub pool_count: usize,
    pub next: *mut Format,
}

impl Format {
    /// Create a format in `arena` from `spec`.
    ///
    /// # Safety
    /// `arena` must be a live arena. The methods in `spec` must obey the
    /// format-method contract in the module docs.
    pub unsafe fn create(arena: *mut Arena, spec: &FormatSpec) -> Result<*mut Format> {
        if !spec.align.is_power_of_two() || spec.align > crate::config::PAGE_SIZE {
            return Err(Res::Param);
        }
        if spec.header_size % spec.align != 0 {
            return Err(Res::Param);
        }
        unsafe {
            (*arena).enter();
            let fmt = (*arena).control.alloc_obj::<Format>();
            if fmt.is_null() {
                (*arena).leave();
                return Err(Res::Memory);
            }
            (*fmt).arena = arena;
            (*fmt).align = spec.align;
            (*fmt).header_size = spec.header_size;
            (*fmt).scan = spec.scan;
            (*fmt).skip = spec.skip;
            (*fmt).fwd = spec.fwd;
            (*fmt).isfwd = spec.isfwd;
            (*fmt).pad = spec.pad;
            (*fmt).class = spec.class;
            (*fmt).pool_count = 0;
            (*fmt).next = (*arena).formats;
            (*arena).formats = fmt;
            (*arena).leave();
            Ok(fmt)
        }
    }

    /// Destroy a format. All pools using it must be destroyed first.
    ///
    /// # Safety
    /// `fmt` must come from [`create`](Self::create) and not be used again.
    pub unsafe fn destroy(fmt: *mut Format) -> Res {
        unsafe {
            let arena = (*fmt).arena;
            (*arena).enter();
            if (*fmt).pool_count != 0 {
                (*arena).leave();
                return Res::Fail;
            }
            // Unlink from the arena's format list.
            let mut link = &raw mut (*arena).formats;
            while !(*link).is_null() && *link != fmt {
                link = &raw mut (**link).next;
            }
            if *link == fmt {
                *link = (*fmt).next;
            }
            (*arena).control.free_obj(fmt);
            (*arena).leave();
            Res::Ok
        }
    }
}


