//! Emergency mode: when forwarding space cannot be committed, the trace
//! pins live objects in place and still runs to completion.

mod common;

use common::*;
use rsmps::chain::GenParam;
use rsmps::root::Root;
use rsmps::{AmcParams, Arena, Rank, Res};

#[test]
fn commit_limit_forces_pinning_not_crashing() {
    let env = setup(
        &[GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)],
        &AmcParams::default(),
        false,
    );
    unsafe {
        // A good amount of live data spread over several segments.
        let filler: Vec<usize> = (0..127).map(scalar).collect();
        let per_object = block_size(127);
        let mut roots = [0usize; 64];
        for (i, slot) in roots.iter_mut().enumerate() {
            let p = alloc_sized(env.ap, per_object, &filler);
            set_field(p, 0, scalar(i + 1000));
            *slot = p;
        }
        let root = Root::create_table(env.arena, Rank::Exact, roots.as_mut_ptr(), 64)
            .expect("roots");

        // Leave room for at most one forwarding segment: copying all 64 KiB
        // of live data is impossible.
        let committed = Arena::committed(env.arena);
        assert_eq!(
            Arena::set_commit_limit(env.arena, committed + 8192),
            Res::Ok
        );

        // Must terminate, not crash, and must preserve every live object.
        Arena::collect(env.arena);

        for (i, &p) in roots.iter().enumerate() {
            assert_ne!(p, 0);
            assert_eq!(field(p, 0), scalar(i + 1000), "object {} corrupted", i);
            assert_eq!(field(p, 126), scalar(126));
        }

        // With the limit lifted, normal copying collection works again.
        assert_eq!(
            Arena::set_commit_limit(env.arena, usize::MAX),
            Res::Ok
        );
        Arena::collect(env.arena);
        for (i, &p) in roots.iter().enumerate() {
            assert_eq!(field(p, 0), scalar(i + 1000), "object {} lost after recovery", i);
        }

        Root::destroy(root);
    }
    teardown(env);
}
