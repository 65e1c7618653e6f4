//! Thread registration and ambiguous stack scanning: a value held only in
//! the mutator's stack frame pins its object.

mod common;

use common::*;
use rsmps::chain::GenParam;
use rsmps::root::Root;
use rsmps::thread::Thread;
use rsmps::{AmcParams, Arena};
use std::hint::black_box;

#[inline(never)]
fn body(env: &Env) {
    unsafe {
        let p = alloc(env.ap, &[scalar(123), scalar(124)]);
        // Keep the reference in stack memory, not just a register.
        let slots = [p, 0];
        black_box(&slots);

        Arena::collect(env.arena);

        // The only reference was ambiguous (a stack word): the object was
        // pinned, not moved, and survived.
        let q = black_box(&slots)[0];
        assert_eq!(q, p);
        assert_eq!(isfwd(p), None);
        assert_eq!(field(p, 0), scalar(123));
        assert_eq!(field(p, 1), scalar(124));
    }
}

#[test]
fn stack_reference_pins_object() {
    let env = setup(
        &[GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)],
        &AmcParams::default(),
        false,
    );
    unsafe {
        let cold_marker: usize = 0;
        let cold = &cold_marker as *const usize as usize;
        let thread = Thread::register(env.arena, cold).expect("thread");
        let root = Root::create_thread(env.arena, thread, 0, 0).expect("thread root");

        body(&env);

        Root::destroy(root);
        assert_eq!(Thread::deregister(thread), rsmps::Res::Ok);
    }
    teardown(env);
}
