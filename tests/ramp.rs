//! Ramp allocation pattern: allocation declared short-lived-as-a-group
//! defers its accounting, so it does not provoke collection until the
//! ramp ends.

mod common;

use common::*;
use rsmps::amc::RampMode;
use rsmps::chain::GenParam;
use rsmps::message::{self, MessageType};
use rsmps::{AmcParams, AmcPool, Arena};

#[test]
fn ramp_defers_collection_until_ramp_end() {
    let params = AmcParams {
        extend_by: 8192,
        large_size: 32768,
        interior_pinning: true,
        ramp_gen: Some(0),
    };
    let env = setup(
        &[
            GenParam::new(32 << 10, 0.9),
            GenParam::new(256 << 10, 0.6),
            GenParam::new(1 << 20, 0.5),
        ],
        &params,
        false,
    );
    unsafe {
        message::enable(env.arena, MessageType::GcStart);
        message::enable(env.arena, MessageType::Gc);

        AmcPool::ramp_begin(env.pool);
        assert_eq!((*env.pool).ramp_mode, RampMode::Begin);

        // Ten times the ramp generation's capacity, all garbage.
        let filler: Vec<usize> = (0..127).map(scalar).collect();
        let per_object = block_size(127);
        let count = (10 * (32 << 10)) / per_object;
        for _ in 0..count {
            let _ = alloc_sized(env.ap, per_object, &filler);
        }

        // Deferred accounting: nothing triggered a collection.
        assert!(
            !message::poll(env.arena),
            "a collection started during the ramp"
        );

        AmcPool::ramp_end(env.pool);
        assert_eq!((*env.pool).ramp_mode, RampMode::Outside);

        // The deferred accounting materialized; parking runs the due
        // collection and the ramp garbage dies.
        Arena::park(env.arena);
        assert!(
            message::poll(env.arena),
            "no collection ran after the ramp ended"
        );
        let start = message::get(env.arena, MessageType::GcStart);
        assert!(!start.is_null());
        assert!(!message::gc_start_why(start).is_empty());
        message::discard(env.arena, start);

        let done = message::get(env.arena, MessageType::Gc);
        assert!(!done.is_null());
        assert!(message::gc_condemned(done) > 0);
        message::discard(env.arena, done);

        let total = AmcPool::total_size(env.pool);
        assert!(
            total <= 4 * params.extend_by,
            "ramp garbage survived: {} bytes",
            total
        );
    }
    teardown(env);
}

#[test]
fn nested_ramps_balance() {
    let env = setup(
        &[GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)],
        &AmcParams {
            ramp_gen: Some(0),
            ..AmcParams::default()
        },
        false,
    );
    unsafe {
        assert_eq!((*env.pool).ramp_mode, RampMode::Outside);
        AmcPool::ramp_begin(env.pool);
        AmcPool::ramp_begin(env.pool);
        assert_eq!((*env.pool).ramp_mode, RampMode::Begin);
        AmcPool::ramp_end(env.pool);
        // Still inside the outer ramp.
        assert_eq!((*env.pool).ramp_mode, RampMode::Begin);
        AmcPool::ramp_end(env.pool);
        assert_eq!((*env.pool).ramp_mode, RampMode::Outside);
    }
    teardown(env);
}
