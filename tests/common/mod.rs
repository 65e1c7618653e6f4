//! Shared client format and helpers for the collector tests.
//!
//! Objects are word arrays. The first word is a header: the block size in
//! bytes shifted left two, with a tag in the low bits (object, padding, or
//! forwarded). Object fields follow the header; a field is a reference iff
//! it is nonzero with the low bit clear, so scalars are stored shifted
//! left one with the low bit set.

#![allow(dead_code)]

use rsmps::buffer::Buffer;
use rsmps::chain::{Chain, GenParam};
use rsmps::format::{Format, FormatSpec};
use rsmps::scan::ScanState;
use rsmps::{AmcParams, AmcPool, Arena, ArenaConfig};
use rsmps::{Addr, Res, Size, align_up};

pub const ALIGN: usize = 16;
pub const WORD: usize = core::mem::size_of::<usize>();

pub const TAG_OBJ: usize = 0;
pub const TAG_PAD: usize = 1;
pub const TAG_FWD: usize = 2;

#[inline]
pub unsafe fn header(p: Addr) -> usize {
    unsafe { *(p as *const usize) }
}

#[inline]
pub unsafe fn block_tag(p: Addr) -> usize {
    unsafe { header(p) & 3 }
}

pub unsafe fn skip(p: Addr) -> Addr {
    unsafe { p + (header(p) >> 2) }
}

pub unsafe fn scan(ss: &mut ScanState, base: Addr, limit: Addr) -> Res {
    unsafe {
        let mut p = base;
        while p < limit {
            let h = header(p);
            let size = h >> 2;
            assert!(size >= ALIGN, "walked into an unformatted block");
            if h & 3 == TAG_OBJ {
                for i in 1..size / WORD {
                    let slot = (p + i * WORD) as *mut usize;
                    let v = *slot;
                    if v != 0 && v & 1 == 0 {
                        let res = ss.fix(slot);
                        if res != Res::Ok {
                            return res;
                        }
                    }
                }
            }
            p += size;
        }
        Res::Ok
    }
}

pub unsafe fn fwd(old: Addr, new: Addr) {
    unsafe {
        let size = header(old) >> 2;
        *(old as *mut usize) = (size << 2) | TAG_FWD;
        *((old + WORD) as *mut usize) = new;
    }
}

pub unsafe fn isfwd(p: Addr) -> Option<Addr> {
    unsafe {
        if header(p) & 3 == TAG_FWD {
            Some(*((p + WORD) as *const usize))
        } else {
            None
        }
    }
}

pub unsafe fn pad(base: Addr, size: Size) {
    unsafe {
        *(base as *mut usize) = (size << 2) | TAG_PAD;
    }
}

pub fn spec() -> FormatSpec {
    FormatSpec {
        align: ALIGN,
        header_size: 0,
        scan,
        skip,
        fwd,
        isfwd,
        pad,
        class: None,
    }
}

/// Tag a scalar for storage in an object field.
#[inline]
pub fn scalar(v: usize) -> usize {
    (v << 1) | 1
}

/// Block size for an object with `nfields` fields.
pub fn block_size(nfields: usize) -> Size {
    align_up((1 + nfields.max(1)) * WORD, ALIGN)
}

pub unsafe fn init_obj(p: Addr, size: Size, fields: &[usize]) {
    unsafe {
        *(p as *mut usize) = (size << 2) | TAG_OBJ;
        for i in 1..size / WORD {
            let v = fields.get(i - 1).copied().unwrap_or(scalar(0));
            *((p + i * WORD) as *mut usize) = v;
        }
    }
}

/// Allocate an object with the given fields, retrying on commit failure.
pub unsafe fn alloc(ap: *mut Buffer, fields: &[usize]) -> Addr {
    unsafe { alloc_sized(ap, block_size(fields.len()), fields) }
}

/// Allocate a block of exactly `size` bytes (a multiple of the alignment).
pub unsafe fn alloc_sized(ap: *mut Buffer, size: Size, fields: &[usize]) -> Addr {
    unsafe {
        loop {
            let p = Buffer::reserve_or_fill(ap, size).expect("allocation failed");
            init_obj(p, size, fields);
            if Buffer::commit(ap, p, size) {
                return p;
            }
        }
    }
}

pub unsafe fn field(p: Addr, i: usize) -> usize {
    unsafe { *((p + (i + 1) * WORD) as *const usize) }
}

pub unsafe fn set_field(p: Addr, i: usize, v: usize) {
    unsafe { *((p + (i + 1) * WORD) as *mut usize) = v }
}

/// Everything a collector test needs, wired together.
pub struct Env {
    pub arena: *mut Arena,
    pub fmt: *mut Format,
    pub chain: *mut Chain,
    pub pool: *mut AmcPool,
    pub ap: *mut Buffer,
}

pub fn setup(gens: &[GenParam], params: &AmcParams, leaf: bool) -> Env {
    setup_with(ArenaConfig::default(), gens, params, leaf)
}

pub fn setup_with(
    config: ArenaConfig,
    gens: &[GenParam],
    params: &AmcParams,
    leaf: bool,
) -> Env {
    unsafe {
        let arena = Arena::create(config).expect("arena");
        let fmt = Format::create(arena, &spec()).expect("format");
        let chain = Chain::create(arena, gens).expect("chain");
        let pool = if leaf {
            AmcPool::create_z(arena, fmt, chain, params)
        } else {
            AmcPool::create(arena, fmt, chain, params)
        }
        .expect("pool");
        let ap = Buffer::create(pool).expect("allocation point");
        Env {
            arena,
            fmt,
            chain,
            pool,
            ap,
        }
    }
}

pub fn teardown(env: Env) {
    unsafe {
        Buffer::destroy(env.ap);
        AmcPool::destroy(env.pool);
        assert_eq!(Chain::destroy(env.chain), Res::Ok);
        assert_eq!(Format::destroy(env.fmt), Res::Ok);
        Arena::destroy(env.arena);
    }
}
