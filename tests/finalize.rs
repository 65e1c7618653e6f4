//! Finalization: unreachable registered objects become messages, stay
//! inspectable until the message is discarded, and then die for real.

mod common;

use common::*;
use rsmps::chain::GenParam;
use rsmps::message::{self, MessageType};
use rsmps::{AmcParams, Arena, Res, fin};

fn quiet_gens() -> [GenParam; 2] {
    [GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)]
}

#[test]
fn dying_registered_object_is_delivered() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        message::enable(env.arena, MessageType::Finalization);

        let f = alloc(env.ap, &[scalar(7), scalar(8)]);
        fin::finalize(env.arena, f).expect("finalize");

        // Registration alone does not keep it alive; the collection
        // notices and posts a message instead of reclaiming it.
        Arena::collect(env.arena);

        assert_eq!(message::queue_type(env.arena), Some(MessageType::Finalization));
        let msg = message::get(env.arena, MessageType::Finalization);
        assert!(!msg.is_null());
        let r = message::fin_ref(msg);
        assert_ne!(r, 0);
        // The referent was preserved for the message and is intact.
        assert_eq!(field(r, 0), scalar(7));
        assert_eq!(field(r, 1), scalar(8));

        message::discard(env.arena, msg);

        // With the message gone, nothing preserves it; the next cycle
        // must not deliver it again.
        Arena::collect(env.arena);
        assert!(!message::poll(env.arena));
    }
    teardown(env);
}

#[test]
fn definalize_cancels_delivery() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        message::enable(env.arena, MessageType::Finalization);

        let g = alloc(env.ap, &[scalar(5)]);
        fin::finalize(env.arena, g).expect("finalize");
        assert_eq!(fin::definalize(env.arena, g), Res::Ok);
        // Unknown reference: nothing registered.
        assert_eq!(fin::definalize(env.arena, g), Res::Param);

        Arena::collect(env.arena);
        assert!(!message::poll(env.arena));
    }
    teardown(env);
}

#[test]
fn reachable_registered_object_is_not_delivered() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        message::enable(env.arena, MessageType::Finalization);

        let h = alloc(env.ap, &[scalar(6)]);
        let mut roots: [usize; 1] = [h];
        let root = rsmps::root::Root::create_table(
            env.arena,
            rsmps::Rank::Exact,
            roots.as_mut_ptr(),
            1,
        )
        .expect("root");
        fin::finalize(env.arena, h).expect("finalize");

        Arena::collect(env.arena);
        // Still strongly reachable: no delivery yet.
        assert!(!message::poll(env.arena));
        assert_eq!(field(roots[0], 0), scalar(6));

        // Drop the strong reference; now it delivers.
        rsmps::root::Root::destroy(root);
        Arena::collect(env.arena);
        assert_eq!(message::queue_type(env.arena), Some(MessageType::Finalization));
        let msg = message::get(env.arena, MessageType::Finalization);
        assert_eq!(field(message::fin_ref(msg), 0), scalar(6));
        message::discard(env.arena, msg);
    }
    teardown(env);
}
