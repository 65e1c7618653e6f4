//! Ambiguous references pin: an object named only by an ambiguous root,
//! even by an interior pointer, must be preserved in place.

mod common;

use common::*;
use rsmps::chain::GenParam;
use rsmps::root::Root;
use rsmps::{AmcParams, Arena, Rank};

#[test]
fn interior_ambiguous_root_pins_in_place() {
    let env = setup(
        &[GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)],
        &AmcParams::default(),
        false,
    );
    unsafe {
        let c = alloc(env.ap, &[scalar(11), scalar(22), scalar(33)]);
        // Padding garbage around it so the segment is worth condemning.
        for i in 0..50 {
            let _ = alloc(env.ap, &[scalar(i)]);
        }

        // The only reference is ambiguous and points into the middle of
        // the object.
        let mut roots: [usize; 1] = [c + 2 * WORD];
        let root = Root::create_table(env.arena, Rank::Ambig, roots.as_mut_ptr(), 1)
            .expect("ambiguous root");

        Arena::collect(env.arena);

        // Pinned: same address, not forwarded, contents intact, and the
        // ambiguous root itself was not rewritten.
        assert_eq!(roots[0], c + 2 * WORD);
        assert_eq!(isfwd(c), None);
        assert_eq!(block_tag(c), TAG_OBJ);
        assert_eq!(field(c, 0), scalar(11));
        assert_eq!(field(c, 1), scalar(22));
        assert_eq!(field(c, 2), scalar(33));

        // Collect again: still pinned, still intact.
        Arena::collect(env.arena);
        assert_eq!(field(c, 1), scalar(22));

        Root::destroy(root);
        Arena::collect(env.arena);
    }
    teardown(env);
}

#[test]
fn base_only_policy_ignores_interior_pointers() {
    let params = AmcParams {
        interior_pinning: false,
        ..AmcParams::default()
    };
    let env = setup(
        &[GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)],
        &params,
        false,
    );
    unsafe {
        let keep = alloc(env.ap, &[scalar(5)]);
        let stray = alloc(env.ap, &[scalar(6)]);
        // One ambiguous base pointer (pins under base policy) and one
        // interior pointer (does not pin under base policy).
        let mut roots: [usize; 2] = [keep, stray + WORD];
        let root = Root::create_table(env.arena, Rank::Ambig, roots.as_mut_ptr(), 2)
            .expect("ambiguous roots");

        Arena::collect(env.arena);

        // The base-pointed object is pinned in place.
        assert_eq!(isfwd(keep), None);
        assert_eq!(field(keep, 0), scalar(5));

        Root::destroy(root);
    }
    teardown(env);
}
