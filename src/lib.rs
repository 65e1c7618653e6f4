#![no_std]

//! rsmps: a memory pool system for language runtimes.
//!
//! An embeddable, incremental, generational, moving tracing garbage
//! collector. The client describes object layout through an object format;
//! the collector discovers references, copies live objects between
//! generations, reclaims dead ones, and coordinates with mutator threads
//! through memory-protection barriers.
//!
//! Layering, leaves first:
//! - Zone summaries ([`refset`]) and pin bitmaps ([`nailboard`])
//! - Segments and the address-to-segment radix tree ([`seg`], [`segmap`])
//! - Allocation points ([`buffer`]) and the client format contract
//!   ([`format`])
//! - The trace state machine, fix protocol and poll driver ([`trace`],
//!   [`scan`])
//! - The copying pool classes AMC and AMCZ ([`amc`]) over generation
//!   chains ([`chain`])
//! - The arena that owns all of it ([`arena`])
//!
//! # Usage
//!
//! ```ignore
//! let arena = Arena::create(ArenaConfig::default())?;
//! let fmt = Format::create(arena, &my_format_spec)?;
//! let chain = Chain::create(arena, &[GenParam::new(160 << 10, 0.85)])?;
//! let pool = AmcPool::create(arena, fmt, chain, &AmcParams::default())?;
//! let ap = Buffer::create(pool)?;
//! // mutator: reserve / initialize / commit, retrying on commit failure
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod amc;
pub mod arena;
pub mod buffer;
pub mod chain;
pub mod control;
pub mod fin;
pub mod format;
pub mod ld;
pub mod macros;
pub mod message;
pub mod nailboard;
pub mod platform;
pub mod rank;
pub mod refset;
pub mod root;
pub mod scan;
pub mod seg;
pub mod segmap;
pub mod shield;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;
pub mod thread;
pub mod trace;
pub mod transform;

/// Build-time tuning defaults (generated by build.rs from an optional
/// `gcconfig.toml`). Runtime knobs live in [`arena::ArenaConfig`]; nothing
/// tunable is process-global.
pub mod config {
    include!(concat!(env!("OUT_DIR"), "/config.rs"));
}

/// A machine address. Kept as an integer because the collector does zone
/// and range arithmetic on addresses far more often than it dereferences
/// them; casts to pointers happen at the access sites.
pub type Addr = usize;
/// A machine word, the unit of reference scanning.
pub type Word = usize;
/// A size in bytes.
pub type Size = usize;

pub const WORD_BYTES: usize = core::mem::size_of::<Word>();
pub const WORD_BITS: usize = Word::BITS as usize;

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Round `addr` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Operation result codes surfaced to the client.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Res {
    /// Success.
    Ok = 0,
    /// Unspecified failure.
    Fail,
    /// A needed resource (other than memory) could not be obtained; for
    /// the collector this is typically forwarding space.
    Resource,
    /// The operating system refused memory.
    Memory,
    /// The arena commit limit would be exceeded.
    CommitLimit,
    /// No free slot (e.g. all trace ids busy).
    Limit,
    /// Invalid parameter.
    Param,
    /// Operation not implemented for this pool or configuration.
    Unimpl,
}

impl Res {
    /// The allocation-failure family: codes the poll driver treats as "try
    /// again after collecting" rather than hard errors.
    #[inline]
    pub fn is_alloc_failure(self) -> bool {
        matches!(self, Res::Resource | Res::Memory | Res::CommitLimit)
    }
}

impl core::fmt::Display for Res {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Res::Ok => "ok",
            Res::Fail => "unspecified failure",
            Res::Resource => "resource exhausted",
            Res::Memory => "out of memory",
            Res::CommitLimit => "commit limit exceeded",
            Res::Limit => "internal limit reached",
            Res::Param => "invalid parameter",
            Res::Unimpl => "not implemented",
        };
        f.write_str(s)
    }
}

/// Result alias for fallible constructors; bulk scanning internals return
/// bare [`Res`] so the format fix path stays a plain function call.
pub type Result<T> = core::result::Result<T, Res>;

pub use amc::{AmcParams, AmcPool};
pub use arena::{Arena, ArenaConfig};
pub use buffer::Buffer;
pub use chain::{Chain, GenParam};
pub use format::{Format, FormatSpec};
pub use ld::LocationDependency;
pub use rank::{Rank, RankSet};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 16), 16);
        assert_eq!(align_down(15, 8), 8);
        assert_eq!(align_down(16, 8), 16);
    }

    #[test]
    fn test_res_alloc_failure_family() {
        assert!(Res::Resource.is_alloc_failure());
        assert!(Res::Memory.is_alloc_failure());
        assert!(Res::CommitLimit.is_alloc_failure());
        assert!(!Res::Ok.is_alloc_failure());
        assert!(!Res::Param.is_alloc_failure());
        assert!(!Res::Limit.is_alloc_failure());
    }
}
