//! Generation chains: the shape of a pool's generational hierarchy.
//!
//! A chain is an ordered list of generation descriptors, each giving a
//! capacity (how much new allocation the generation tolerates before a
//! collection of it is due) and a mortality estimate (the expected
//! fraction that dies per collection, used for pacing). Pools attach to a
//! chain and keep their own per-generation accounting; the final
//! generation forwards to itself, so nothing is promoted beyond it.

use crate::arena::Arena;
use crate::{Res, Result, Size};

/// Client-supplied description of one generation.
#[derive(Clone, Copy, Debug)]
pub struct GenParam {
    /// Bytes of new allocation before collection of this generation is due.
    pub capacity: Size,
    /// Expected death fraction per collection, in `0.0..=1.0`.
    pub mortality: f64,
}

impl GenParam {
    pub fn new(capacity: Size, mortality: f64) -> GenParam {
        GenParam {
            capacity,
            mortality,
        }
    }
}

/// Resolved per-generation descriptor inside a chain.
#[repr(C)]
pub struct GenDesc {
    pub capacity: Size,
    pub mortality: f64,
}

#[repr(C)]
pub struct Chain {
    pub arena: *mut Arena,
    gens: *mut GenDesc,
    pub gen_count: usize,
    /// Pools currently attached; must be zero at destroy.
    pub pool_count: usize,
    pub next: *mut Chain,
}

impl Chain {
    /// Create a chain in `arena` from generation parameters, youngest
    /// first.
    ///
    /// # Safety
    /// `arena` must be live.
    pub unsafe fn create(arena: *mut Arena, params: &[GenParam]) -> Result<*mut Chain> {
        if params.is_empty() || params.len() > 64 {
            return Err(Res::Param);
        }
        for p in params {
            if p.capacity == 0 || !(0.0..=1.0).contains(&p.mortality) {
                return Err(Res::Param);
            }
        }
        unsafe {
            (*arena).enter();
            let chain = (*arena).control.alloc_obj::<Chain>();
            let gens = (*arena)
                .control
                .alloc(params.len() * core::mem::size_of::<GenDesc>())
                .cast::<GenDesc>();
            if chain.is_null() || gens.is_null() {
                (*arena).leave();
                return Err(Res::Memory);
            }
            for (i, p) in params.iter().enumerate() {
                *gens.add(i) = GenDesc {
                    capacity: p.capacity,
                    mortality: p.mortality,
                };
            }
            (*chain).arena = arena;
            (*chain).gens = gens;
            (*chain).gen_count = params.len();
            (*chain).pool_count = 0;
            (*chain).next = (*arena).chains;
            (*arena).chains = chain;
            (*arena).leave();
            Ok(chain)
        }
    }

    /// Create a chain from the build-time default shape.
    ///
    /// # Safety
    /// `arena` must be live.
    pub unsafe fn create_default(arena: *mut Arena) -> Result<*mut Chain> {
        let mut params = [GenParam::new(1, 0.5); 8];
        let defaults = crate::config::DEFAULT_CHAIN;
        debug_assert!(defaults.len() <= params.len());
        let n = defaults.len().min(params.len());
        for (slot, &(capacity, mortality)) in params.iter_mut().zip(defaults.iter()).take(n) {
            *slot = GenParam::new(capacity, mortality);
        }
        unsafe { Self::create(arena, &params[..n]) }
    }

    /// Destroy a chain. Pools using it must be destroyed first.
    ///
    /// # Safety
    /// `chain` must come from [`create`](Self::create) and not be used
    /// again.
    pub unsafe fn destroy(chain: *mut Chain) -> Res {
        unsafe {
            let arena = (*chain).arena;
            (*arena).enter();
            if (*chain).pool_count != 0 {
                (*arena).leave();
                return Res::Fail;
            }
            let mut link = &raw mut (*arena).chains;
            while !(*link).is_null() && *link != chain {
                link = &raw mut (**link).next;
            }
            if *link == chain {
                *link = (*chain).next;
            }
            (*arena)
                .control
                .free((*chain).gens.cast(), (*chain).gen_count * core::mem::size_of::<GenDesc>());
            (*arena).control.free_obj(chain);
            (*arena).leave();
            Res::Ok
        }
    }

    /// Descriptor of generation `index`.
    ///
    /// # Safety
    /// `index < gen_count`.
    #[inline]
    pub unsafe fn r#gen(&self, index: usize) -> &GenDesc {
        debug_assert!(index < self.gen_count);
        unsafe { &*self.gens.add(index) }
    }
}
