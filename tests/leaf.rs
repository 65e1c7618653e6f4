//! Leaf (AMCZ) collection: reference-free objects with no roots must all
//! be reclaimed, and committed memory must come back down.

mod common;

use common::*;
use rsmps::chain::GenParam;
use rsmps::{AmcParams, AmcPool, Arena};

#[test]
fn leaf_garbage_is_reclaimed() {
    let params = AmcParams {
        extend_by: 8192,
        large_size: 32768,
        ..AmcParams::default()
    };
    let env = setup(
        &[GenParam::new(64 << 10, 0.9), GenParam::new(256 << 10, 0.5)],
        &params,
        true,
    );
    unsafe {
        // Far more than the nursery capacity; collections trigger from
        // the allocation polls along the way.
        let per_object = block_size(127); // ~1 KiB
        let filler: Vec<usize> = (0..127).map(scalar).collect();
        for i in 0..600 {
            let p = alloc_sized(env.ap, per_object, &filler);
            set_field(p, 0, scalar(i));
            assert_eq!(field(p, 0), scalar(i));
            assert_eq!(field(p, 126), scalar(126));
        }
        Arena::collect(env.arena);

        // Nothing held any of it: at most the active buffer segment (and
        // a forwarding remnant) survives.
        let total = AmcPool::total_size(env.pool);
        assert!(
            total <= 4 * params.extend_by,
            "leaf pool retained {} bytes of garbage (allocated {})",
            total,
            600 * per_object,
        );
        // No message types were enabled, so nothing may be queued.
        assert!(!rsmps::message::poll(env.arena));
    }
    teardown(env);
}

#[test]
fn leaf_large_objects_get_own_segments_and_die() {
    let params = AmcParams {
        extend_by: 8192,
        large_size: 32768,
        ..AmcParams::default()
    };
    let env = setup(
        &[GenParam::new(64 << 10, 0.9), GenParam::new(256 << 10, 0.5)],
        &params,
        true,
    );
    unsafe {
        // Exactly large_size: must get its own segment.
        let big = alloc_sized(env.ap, params.large_size, &[scalar(1)]);
        let small = alloc(env.ap, &[scalar(2)]);
        assert_eq!(field(big, 0), scalar(1));
        assert_eq!(field(small, 0), scalar(2));
        // The large block is alone in its segment, so the small one went
        // elsewhere.
        assert!(small < big || small >= big + params.large_size);

        Arena::collect(env.arena);
        let total = AmcPool::total_size(env.pool);
        assert!(
            total <= 4 * params.extend_by,
            "large leaf segment survived parking: {} bytes",
            total
        );
    }
    teardown(env);
}
