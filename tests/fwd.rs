//! Forwarding: collection copies live objects, updates the references
//! that reached them, and frees their old segments.

mod common;

use common::*;
use rsmps::chain::GenParam;
use rsmps::root::Root;
use rsmps::{AmcParams, Arena, Rank};

fn quiet_gens() -> [GenParam; 2] {
    // Capacities far above what the tests allocate, so only explicit
    // collections run.
    [GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)]
}

#[test]
fn forwarding_chain_is_followed() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        let b = alloc(env.ap, &[scalar(42), scalar(43)]);
        let a = alloc(env.ap, &[b, scalar(7)]);

        let mut roots: [usize; 1] = [a];
        let root = Root::create_table(env.arena, Rank::Exact, roots.as_mut_ptr(), 1)
            .expect("root");

        Arena::collect(env.arena);

        // The root was updated to A's new location, A's field to B's new
        // location, and the contents came along.
        let a2 = roots[0];
        assert_ne!(a2, 0);
        assert_ne!(a2, a, "a live object in a condemned segment must move");
        let b2 = field(a2, 0);
        assert_ne!(b2, b, "the referenced object must move too");
        assert_eq!(field(a2, 1), scalar(7));
        assert_eq!(field(b2, 0), scalar(42));
        assert_eq!(field(b2, 1), scalar(43));

        // The pool holds the survivors' segment plus the (padded-out)
        // nursery segment its allocation point still sits on; the rest
        // was reclaimed.
        let total = rsmps::AmcPool::total_size(env.pool);
        assert!(
            total <= 3 * rsmps::config::DEFAULT_EXTEND_BY,
            "old segments were not reclaimed: {} bytes",
            total
        );

        // A second collection is a no-op for the data: everything moves
        // again but stays intact.
        Arena::collect(env.arena);
        let a3 = roots[0];
        let b3 = field(a3, 0);
        assert_eq!(field(b3, 0), scalar(42));

        Root::destroy(root);
    }
    teardown(env);
}

#[test]
fn unreferenced_objects_die_while_referenced_survive() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        let keep = alloc(env.ap, &[scalar(1)]);
        for i in 0..100 {
            let _garbage = alloc(env.ap, &[scalar(i)]);
        }
        let mut roots: [usize; 1] = [keep];
        let root = Root::create_table(env.arena, Rank::Exact, roots.as_mut_ptr(), 1)
            .expect("root");

        Arena::collect(env.arena);

        assert_eq!(field(roots[0], 0), scalar(1));

        Root::destroy(root);
    }
    teardown(env);
}
