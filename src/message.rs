//! Client messages.
//!
//! The collector tells the client things (a collection began, a
//! collection finished, an object you asked about is about to die) by
//! posting messages to a per-arena queue. Message types must be enabled
//! before they are posted; disabled types are dropped silently.
//!
//! A gotten message stays live (and its finalization referent stays
//! strongly reachable) until the client discards it.

use crate::arena::Arena;
use crate::{Addr, Size};
use core::ptr;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MessageType {
    /// An object registered for finalization is otherwise unreachable.
    Finalization = 0,
    /// A collection finished; carries its byte accounting.
    Gc = 1,
    /// A collection began; carries the reason.
    GcStart = 2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum MessageState {
    /// Posted, not yet delivered by `get`.
    Queued,
    /// Delivered; awaiting `discard`.
    Held,
}

#[repr(C)]
pub struct Message {
    mtype: MessageType,
    state: MessageState,
    /// Posting time, from the monotonic clock.
    pub clock: u64,
    /// Finalization referent. Scanned as a strong root until discard, so
    /// it stays exact across moves.
    pub fin_ref: Addr,
    pub live: Size,
    pub condemned: Size,
    pub not_condemned: Size,
    pub why: &'static str,
    pub next: *mut Message,
}

#[inline]
fn bit(t: MessageType) -> u8 {
    1 << t as u8
}

/// Enable posting of a message type.
///
/// # Safety
/// `arena` live.
pub unsafe fn enable(arena: *mut Arena, t: MessageType) {
    unsafe {
        (*arena).enter();
        (*arena).message_enabled |= bit(t);
        (*arena).leave();
    }
}

/// Disable a message type, dropping any queued (undelivered) messages of
/// that type.
///
/// # Safety
/// `arena` live.
pub unsafe fn disable(arena: *mut Arena, t: MessageType) {
    unsafe {
        (*arena).enter();
        (*arena).message_enabled &= !bit(t);
        let mut link = &raw mut (*arena).messages;
        while !(*link).is_null() {
            let msg = *link;
            if (*msg).mtype == t && (*msg).state == MessageState::Queued {
                *link = (*msg).next;
                (*arena).control.free_obj(msg);
            } else {
                link = &raw mut (*msg).next;
            }
        }
        (*arena).leave();
    }
}

/// Whether any message is queued.
///
/// # Safety
/// `arena` live.
pub unsafe fn poll(arena: *mut Arena) -> bool {
    unsafe { queue_type(arena).is_some() }
}

/// The type of the oldest queued message, if any.
///
/// # Safety
/// `arena` live.
pub unsafe fn queue_type(arena: *mut Arena) -> Option<MessageType> {
    unsafe {
        (*arena).enter();
        // The list is push-front; the oldest queued message is the last.
        let mut oldest = None;
        let mut msg = (*arena).messages;
        while !msg.is_null() {
            if (*msg).state == MessageState::Queued {
                oldest = Some((*msg).mtype);
            }
            msg = (*msg).next;
        }
        (*arena).leave();
        oldest
    }
}

/// Take the oldest queued message of type `t`. The message (and, for
/// finalization, its referent) stays live until [`discard`].
///
/// # Safety
/// `arena` live.
pub unsafe fn get(arena: *mut Arena, t: MessageType) -> *mut Message {
    unsafe {
        (*arena).enter();
        let mut found: *mut Message = ptr::null_mut();
        let mut msg = (*arena).messages;
        while !msg.is_null() {
            if (*msg).state == MessageState::Queued && (*msg).mtype == t {
                found = msg;
            }
            msg = (*msg).next;
        }
        if !found.is_null() {
            (*found).state = MessageState::Held;
        }
        (*arena).leave();
        found
    }
}

/// Release a message obtained with [`get`].
///
/// # Safety
/// `msg` must come from `get` on `arena` and not be used again.
pub unsafe fn discard(arena: *mut Arena, msg: *mut Message) {
    unsafe {
        (*arena).enter();
        debug_assert_eq!((*msg).state, MessageState::Held);
        let mut link = &raw mut (*arena).messages;
        while !(*link).is_null() && *link != msg {
            link = &raw mut (**link).next;
        }
        if *link == msg {
            *link = (*msg).next;
        }
        (*arena).control.free_obj(msg);
        (*arena).leave();
    }
}

/// The type of a delivered message.
pub unsafe fn type_of(msg: *mut Message) -> MessageType {
    unsafe { (*msg).mtype }
}

/// Finalization referent; exact and kept current across moves.
pub unsafe fn fin_ref(msg: *mut Message) -> Addr {
    unsafe {
        debug_assert_eq!((*msg).mtype, MessageType::Finalization);
        (*msg).fin_ref
    }
}

pub unsafe fn gc_live(msg: *mut Message) -> Size {
    unsafe { (*msg).live }
}

pub unsafe fn gc_condemned(msg: *mut Message) -> Size {
    unsafe { (*msg).condemned }
}

pub unsafe fn gc_not_condemned(msg: *mut Message) -> Size {
    unsafe { (*msg).not_condemned }
}

pub unsafe fn gc_start_why(msg: *mut Message) -> &'static str {
    unsafe {
        debug_assert_eq!((*msg).mtype, MessageType::GcStart);
        (*msg).why
    }
}

/// Whether a type is currently enabled. Internal; arena lock held.
pub(crate) unsafe fn enabled(arena: *mut Arena, t: MessageType) -> bool {
    unsafe { (*arena).message_enabled & bit(t) != 0 }
}

/// Post a message if its type is enabled. Internal; arena lock held.
pub(crate) unsafe fn post(arena: *mut Arena, mtype: MessageType) -> *mut Message {
    unsafe {
        if (*arena).message_enabled & bit(mtype) == 0 {
            return ptr::null_mut();
        }
        let msg = (*arena).control.alloc_obj::<Message>();
        if msg.is_null() {
            return ptr::null_mut();
        }
        (*msg).mtype = mtype;
        (*msg).state = MessageState::Queued;
        (*msg).clock = crate::platform::clock_ns();
        (*msg).why = "";
        (*msg).next = (*arena).messages;
        (*arena).messages = msg;
        msg
    }
}
