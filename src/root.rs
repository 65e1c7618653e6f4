//! Roots: where tracing starts.
//!
//! A root names references held outside the managed heap: a table of
//! reference words, a caller-scanned area, a region of formatted objects,
//! or a mutator thread's stack. Roots are scanned at the flip, ambiguous
//! ranks first, so by the time the mutator resumes every root has been
//! fixed.
//!
//! Tagged variants take a (mask, pattern) pair: a word is considered a
//! candidate reference iff `word & mask == pattern`, letting clients with
//! tagged pointers declare their scheme without a custom scanner.

use crate::arena::Arena;
use crate::format::Format;
use crate::rank::Rank;
use crate::scan::ScanState;
use crate::thread::Thread;
use crate::{Addr, Res, Result, WORD_BYTES, Word, align_up};

/// A caller-provided area scanner: fix every reference in `[base, limit)`.
pub type AreaScanMethod =
    unsafe fn(ss: &mut ScanState, base: Addr, limit: Addr, closure: *mut u8) -> Res;

#[derive(Clone, Copy)]
pub enum RootVariant {
    /// A table of reference words, every word a reference.
    Table { base: *mut Addr, count: usize },
    /// A table of words, only those matching (mask, pattern) scanned.
    TableMasked {
        base: *mut Addr,
        count: usize,
        mask: Word,
        pattern: Word,
    },
    /// A region scanned by a client callback.
    Area {
        scan: AreaScanMethod,
        base: Addr,
        limit: Addr,
        closure: *mut u8,
    },
    /// A region of words scanned with tag filtering.
    AreaTagged {
        base: Addr,
        limit: Addr,
        mask: Word,
        pattern: Word,
    },
    /// A registered thread's stack, scanned with tag filtering.
    Thread {
        thread: *mut Thread,
        mask: Word,
        pattern: Word,
    },
    /// A region of formatted objects scanned via the format.
    Fmt {
        fmt: *mut Format,
        base: Addr,
        limit: Addr,
    },
}

#[repr(C)]
pub struct Root {
    pub arena: *mut Arena,
    pub rank: Rank,
    pub variant: RootVariant,
    pub next: *mut Root,
}

unsafe fn create(arena: *mut Arena, rank: Rank, variant: RootVariant) -> Result<*mut Root> {
    unsafe {
        (*arena).enter();
        let root = (*arena).control.alloc_obj::<Root>();
        if root.is_null() {
            (*arena).leave();
            return Err(crate::Res::Memory);
        }
        core::ptr::write(
            root,
            Root {
                arena,
                rank,
                variant,
                next: (*arena).roots,
            },
        );
        (*arena).roots = root;
        (*arena).leave();
        Ok(root)
    }
}

impl Root {
    /// Create a root from a table of references.
    ///
    /// # Safety
    /// `[base, base+count)` must stay valid and contain references (or
    /// null) until the root is destroyed.
    pub unsafe fn create_table(
        arena: *mut Arena,
        rank: Rank,
        base: *mut Addr,
        count: usize,
    ) -> Result<*mut Root> {
        unsafe { create(arena, rank, RootVariant::Table { base, count }) }
    }

    /// Create a root from a table of tagged words.
    ///
    /// # Safety
    /// As for [`create_table`](Self::create_table).
    pub unsafe fn create_table_masked(
        arena: *mut Arena,
        rank: Rank,
        base: *mut Addr,
        count: usize,
        mask: Word,
        pattern: Word,
    ) -> Result<*mut Root> {
        unsafe {
            create(
                arena,
                rank,
                RootVariant::TableMasked {
                    base,
                    count,
                    mask,
                    pattern,
                },
            )
        }
    }

    /// Create a root scanned by a client callback.
    ///
    /// # Safety
    /// `scan` must obey the format-method constraints; the region must
    /// outlive the root.
    pub unsafe fn create_area(
        arena: *mut Arena,
        rank: Rank,
        scan: AreaScanMethod,
        base: Addr,
        limit: Addr,
        closure: *mut u8,
    ) -> Result<*mut Root> {
        unsafe {
            create(
                arena,
                rank,
                RootVariant::Area {
                    scan,
                    base,
                    limit,
                    closure,
                },
            )
        }
    }

    /// Create a tag-filtered area root.
    ///
    /// # Safety
    /// The region must outlive the root.
    pub unsafe fn create_area_tagged(
        arena: *mut Arena,
        rank: Rank,
        base: Addr,
        limit: Addr,
        mask: Word,
        pattern: Word,
    ) -> Result<*mut Root> {
        unsafe {
            create(
                arena,
                rank,
                RootVariant::AreaTagged {
                    base,
                    limit,
                    mask,
                    pattern,
                },
            )
        }
    }

    /// Create a root covering a registered thread's stack; always
    /// ambiguous.
    ///
    /// # Safety
    /// `thread` must stay registered until the root is destroyed.
    pub unsafe fn create_thread(
        arena: *mut Arena,
        thread: *mut Thread,
        mask: Word,
        pattern: Word,
    ) -> Result<*mut Root> {
        unsafe {
            create(
                arena,
                Rank::Ambig,
                RootVariant::Thread {
                    thread,
                    mask,
                    pattern,
                },
            )
        }
    }

    /// Create a root over a region of formatted objects.
    ///
    /// # Safety
    /// The region must hold walkable objects of `fmt` and outlive the
    /// root.
    pub unsafe fn create_fmt(
        arena: *mut Arena,
        rank: Rank,
        fmt: *mut Format,
        base: Addr,
        limit: Addr,
    ) -> Result<*mut Root> {
        unsafe { create(arena, rank, RootVariant::Fmt { fmt, base, limit }) }
    }

    /// Destroy a root.
    ///
    /// # Safety
    /// `root` must come from one of the constructors and not be used
    /// again.
    pub unsafe fn destroy(root: *mut Root) {
        unsafe {
            let arena = (*root).arena;
            (*arena).enter();
            let mut link = &raw mut (*arena).roots;
            while !(*link).is_null() && *link != root {
                link = &raw mut (**link).next;
            }
            if *link == root {
                *link = (*root).next;
            }
            (*arena).control.free_obj(root);
            (*arena).leave();
        }
    }
}

/// Fix each word in `[base, limit)` whose tag matches.
///
/// # Safety
/// The range must be readable and word-aligned-writable; arena lock held.
pub unsafe fn scan_area_tagged(
    ss: &mut ScanState,
    base: Addr,
    limit: Addr,
    mask: Word,
    pattern: Word,
) -> Res {
    let mut p = align_up(base, WORD_BYTES);
    while p + WORD_BYTES <= limit {
        let slot = p as *mut Word;
        let w = unsafe { *slot };
        if w & mask == pattern {
            let res = unsafe { ss.fix(slot) };
            if res != Res::Ok {
                return res;
            }
        }
        p += WORD_BYTES;
    }
    Res::Ok
}

/// Scan one root under `ss`. Called at the flip for each rank in order.
///
/// # Safety
/// Arena lock held; mutators suspended.
pub(crate) unsafe fn scan_root(ss: &mut ScanState, root: *mut Root) -> Res {
    unsafe {
        match (*root).variant {
            RootVariant::Table { base, count } => {
                for i in 0..count {
                    let res = ss.fix(base.add(i));
                    if res != Res::Ok {
                        return res;
                    }
                }
                Res::Ok
            }
            RootVariant::TableMasked {
                base,
                count,
                mask,
                pattern,
            } => scan_area_tagged(
                ss,
                base as Addr,
                base.add(count) as Addr,
                mask,
                pattern,
            ),
            RootVariant::Area {
                scan,
                base,
                limit,
                closure,
            } => scan(ss, base, limit, closure),
            RootVariant::AreaTagged {
                base,
                limit,
                mask,
                pattern,
            } => scan_area_tagged(ss, base, limit, mask, pattern),
            RootVariant::Thread {
                thread,
                mask,
                pattern,
            } => {
                let hot = Thread::scan_hot(thread);
                let cold = (*thread).cold;
                if hot == 0 || hot >= cold {
                    return Res::Ok;
                }
                scan_area_tagged(ss, hot, cold, mask, pattern)
            }
            RootVariant::Fmt { fmt, base, limit } => ((*fmt).scan)(ss, base, limit),
        }
    }
}
