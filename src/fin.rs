//! Finalization.
//!
//! A registered reference does not keep its target alive. When a trace
//! proves the target unreachable at every rank up to FINAL, the entry is
//! converted into a finalization message: the object is preserved one more
//! time (so the client can inspect it from the message) and delivery is
//! the client's cue to tear it down. Message referents are scanned as
//! strong roots until the message is discarded; after that the object is
//! ordinary garbage for the next cycle.

use crate::amc;
use crate::arena::Arena;
use crate::message::{self, MessageType};
use crate::rank::Rank;
use crate::refset::RefSet;
use crate::scan::ScanState;
use crate::shield;
use crate::trace::TraceSet;
use crate::{Addr, Res, Result};

#[repr(C)]
pub struct FinEntry {
    pub ref_: Addr,
    pub next: *mut FinEntry,
}

/// Register `ref_` for finalization. The referent must be a managed
/// object. Enable [`MessageType::Finalization`] to receive deliveries;
/// with the type disabled, dying registered objects are simply dropped.
///
/// # Safety
/// `arena` live; `ref_` a current client address of a managed object.
pub unsafe fn finalize(arena: *mut Arena, ref_: Addr) -> Result<()> {
    unsafe {
        (*arena).enter();
        if (*arena).segmap.of_addr(ref_).is_null() {
            (*arena).leave();
            return Err(Res::Param);
        }
        let entry = (*arena).control.alloc_obj::<FinEntry>();
        if entry.is_null() {
            (*arena).leave();
            return Err(Res::Memory);
        }
        (*entry).ref_ = ref_;
        (*entry).next = (*arena).fin_entries;
        (*arena).fin_entries = entry;
        (*arena).leave();
        Ok(())
    }
}

/// Remove one finalization registration of `ref_` (by current address).
///
/// # Safety
/// `arena` live.
pub unsafe fn definalize(arena: *mut Arena, ref_: Addr) -> Res {
    unsafe {
        (*arena).enter();
        let mut link = &raw mut (*arena).fin_entries;
        while !(*link).is_null() {
            let e = *link;
            if (*e).ref_ == ref_ {
                *link = (*e).next;
                (*arena).control.free_obj(e);
                (*arena).leave();
                return Res::Ok;
            }
            link = &raw mut (*e).next;
        }
        (*arena).leave();
        Res::Param
    }
}

/// The FINAL-rank pass of a trace: runs once per trace, after grey
/// segments at ranks up to EXACT are exhausted. Entries whose referent was
/// not otherwise preserved become messages; the fix preserves the referent
/// either way, so entry references stay current.
///
/// # Safety
/// Arena lock held; trace `ti` flipped.
pub(crate) unsafe fn pass(arena: *mut Arena, ti: usize, white: RefSet) -> Res {
    unsafe {
        let mut ss = ScanState::init(arena, TraceSet::single(ti), Rank::Final, white);
        let deliver = message::enabled(arena, MessageType::Finalization);
        let mut link = &raw mut (*arena).fin_entries;
        while !(*link).is_null() {
            let e = *link;
            let mut remove = false;
            let seg = (*arena).segmap.of_addr((*e).ref_);
            if !seg.is_null() && (*seg).is_white(ti) {
                if deliver {
                    ss.was_marked = true;
                    let res = ss.fix(&raw mut (*e).ref_);
                    if res != Res::Ok {
                        return res;
                    }
                    if !ss.was_marked {
                        // Nothing stronger preserved it: deliver and drop
                        // the registration. The message now holds the only
                        // strong reference.
                        let msg = message::post(arena, MessageType::Finalization);
                        if !msg.is_null() {
                            (*msg).fin_ref = (*e).ref_;
                        }
                        remove = true;
                    }
                } else {
                    // No delivery channel: follow a move if there was one,
                    // otherwise let a dead referent die with its entry.
                    let fmt = (*(*seg).pool).format;
                    shield::expose(arena, seg);
                    match ((*fmt).isfwd)((*e).ref_) {
                        Some(new) => (*e).ref_ = new,
                        None => remove = !amc::is_pinned(seg, (*e).ref_),
                    }
                    shield::cover(arena, seg);
                }
            }
            if remove {
                *link = (*e).next;
                (*arena).control.free_obj(e);
            } else {
                link = &raw mut (*e).next;
            }
        }
        Res::Ok
    }
}
