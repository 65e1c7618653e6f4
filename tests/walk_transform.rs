//! Formatted-object walking and broadcast reference transforms.

mod common;

use common::*;
use rsmps::chain::GenParam;
use rsmps::format::Format;
use rsmps::root::Root;
use rsmps::transform::Transform;
use rsmps::{Addr, AmcParams, AmcPool, Arena, Rank, Res, Size};

fn quiet_gens() -> [GenParam; 2] {
    [GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)]
}

struct WalkCounts {
    objects: usize,
    pads: usize,
}

unsafe fn count_visitor(
    client: Addr,
    _fmt: *mut Format,
    _pool: *mut AmcPool,
    _size: Size,
    closure: *mut u8,
) {
    unsafe {
        let counts = &mut *closure.cast::<WalkCounts>();
        match block_tag(client) {
            TAG_OBJ => counts.objects += 1,
            TAG_PAD => counts.pads += 1,
            _ => {}
        }
    }
}

#[test]
fn walk_visits_every_live_object() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        let mut roots = [0usize; 5];
        for (i, slot) in roots.iter_mut().enumerate() {
            *slot = alloc(env.ap, &[scalar(i)]);
        }
        let root = Root::create_table(env.arena, Rank::Exact, roots.as_mut_ptr(), 5)
            .expect("roots");
        Arena::collect(env.arena);

        let mut counts = WalkCounts {
            objects: 0,
            pads: 0,
        };
        AmcPool::walk(env.pool, count_visitor, (&mut counts as *mut WalkCounts).cast());
        assert!(
            counts.objects >= 5,
            "walk saw {} objects, expected at least 5",
            counts.objects
        );

        Root::destroy(root);
    }
    teardown(env);
}

#[test]
fn transform_rewrites_references_everywhere() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        let old = alloc(env.ap, &[scalar(1)]);
        let new = alloc(env.ap, &[scalar(2)]);
        let holder = alloc(env.ap, &[old, scalar(3)]);

        let mut roots: [usize; 3] = [old, new, holder];
        let root = Root::create_table(env.arena, Rank::Exact, roots.as_mut_ptr(), 3)
            .expect("roots");

        // Depend on the old location first: applying the transform counts
        // as movement.
        let mut ld = rsmps::LocationDependency::new();
        ld.reset(env.arena);
        ld.add(env.arena, old);

        let t = Transform::create(env.arena).expect("transform");
        assert_eq!(Transform::add(t, old, new), Res::Ok);
        assert_eq!(Transform::apply(t), Res::Ok);
        Transform::destroy(t);

        // The root slot and the heap field both now name `new`.
        assert_eq!(roots[0], new);
        assert_eq!(field(roots[2], 0), new);
        assert_eq!(field(new, 0), scalar(2));
        // Untouched values stay put.
        assert_eq!(field(roots[2], 1), scalar(3));

        assert!(ld.is_stale_any(env.arena));

        Root::destroy(root);
    }
    teardown(env);
}
