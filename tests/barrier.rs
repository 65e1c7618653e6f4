//! Read barriers: after the flip, grey segments are protected; a mutator
//! touching one takes a fault that scans the segment and retries.

mod common;

use common::*;
use rsmps::buffer::Buffer;
use rsmps::chain::GenParam;
use rsmps::root::Root;
use rsmps::{AmcParams, Arena, Rank};

#[test]
fn mutator_access_to_grey_segment_is_serviced() {
    let env = setup(
        &[GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)],
        &AmcParams::default(),
        false,
    );
    unsafe {
        // Enough live data that the flip leaves plenty grey.
        let filler: Vec<usize> = (0..127).map(scalar).collect();
        let per_object = block_size(127);
        let mut roots = [0usize; 32];
        for (i, slot) in roots.iter_mut().enumerate() {
            let p = alloc_sized(env.ap, per_object, &filler);
            set_field(p, 0, scalar(i + 77));
            *slot = p;
        }
        let root = Root::create_table(env.arena, Rank::Exact, roots.as_mut_ptr(), 32)
            .expect("roots");

        // Begin an incremental collection, then drive exactly one quantum
        // (the flip) through an allocation-point refill.
        Arena::start_collect(env.arena);
        let p = Buffer::fill(env.ap, per_object).expect("fill");
        init_obj(p, per_object, &filler);
        assert!(Buffer::commit(env.ap, p, per_object));

        // The roots were fixed at the flip; their copies sit in grey,
        // read-protected segments. These reads fault; the handler scans
        // the segment and the access retries.
        assert_eq!(field(roots[0], 0), scalar(77));
        assert_eq!(field(roots[31], 0), scalar(31 + 77));

        // Let the collection finish and verify everything.
        Arena::park(env.arena);
        for (i, &q) in roots.iter().enumerate() {
            assert_eq!(field(q, 0), scalar(i + 77), "object {} corrupted", i);
            assert_eq!(field(q, 126), scalar(126));
        }

        Root::destroy(root);
    }
    teardown(env);
}
