//! Location dependencies: clients notice when depended-on objects may
//! have moved.

mod common;

use common::*;
use rsmps::chain::GenParam;
use rsmps::root::Root;
use rsmps::{AmcParams, Arena, LocationDependency, Rank};

#[test]
fn staleness_tracks_moves() {
    let env = setup(
        &[GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)],
        &AmcParams::default(),
        false,
    );
    unsafe {
        let p = alloc(env.ap, &[scalar(1)]);
        let mut roots: [usize; 1] = [p];
        let root = Root::create_table(env.arena, Rank::Exact, roots.as_mut_ptr(), 1)
            .expect("root");

        let mut ld = LocationDependency::new();
        ld.reset(env.arena);
        ld.add(env.arena, p);
        assert!(
            !ld.is_stale(env.arena, p),
            "fresh dependency reported stale"
        );

        // The collection moves the object; the dependency must go stale.
        Arena::collect(env.arena);
        let p2 = roots[0];
        assert_ne!(p2, p);
        assert!(ld.is_stale(env.arena, p));
        assert!(ld.is_stale_any(env.arena));

        // Re-recording against the new location is fresh again.
        ld.reset(env.arena);
        ld.add(env.arena, p2);
        assert!(!ld.is_stale(env.arena, p2));

        Root::destroy(root);
    }
    teardown(env);
}

#[test]
fn merge_unions_dependencies() {
    let env = setup(
        &[GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)],
        &AmcParams::default(),
        false,
    );
    unsafe {
        let a = alloc(env.ap, &[scalar(1)]);
        let mut roots: [usize; 1] = [a];
        let root = Root::create_table(env.arena, Rank::Exact, roots.as_mut_ptr(), 1)
            .expect("root");

        let mut ld_a = LocationDependency::new();
        ld_a.reset(env.arena);
        ld_a.add(env.arena, a);

        let mut ld_empty = LocationDependency::new();
        ld_empty.reset(env.arena);

        let mut merged = LocationDependency::new();
        merged.reset(env.arena);
        merged.merge(env.arena, &ld_a);
        merged.merge(env.arena, &ld_empty);

        Arena::collect(env.arena);
        assert!(merged.is_stale_any(env.arena));
        // An empty dependency never goes stale.
        assert!(!ld_empty.is_stale_any(env.arena));

        Root::destroy(root);
    }
    teardown(env);
}
