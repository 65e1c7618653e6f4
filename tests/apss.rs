//! Allocation point protocol: the reserve/commit fast path, its ordering
//! invariant, and the commit race against a flip.

mod common;

use common::*;
use rsmps::buffer::Buffer;
use rsmps::chain::GenParam;
use rsmps::{AmcParams, Arena};

fn quiet_gens() -> [GenParam; 2] {
    [GenParam::new(8 << 20, 0.9), GenParam::new(32 << 20, 0.5)]
}

unsafe fn check_ap_invariant(ap: *mut Buffer) {
    unsafe {
        if (*ap).seg.is_null() {
            return;
        }
        let limit = if (*ap).ap_limit != 0 {
            (*ap).ap_limit
        } else {
            (*ap).pool_limit
        };
        assert!((*ap).base <= (*ap).scan_limit());
        assert!((*ap).scan_limit() <= (*ap).ap_init);
        assert!((*ap).ap_init <= (*ap).ap_alloc);
        assert!((*ap).ap_alloc <= limit);
    }
}

#[test]
fn commit_fails_across_a_flip_and_retry_succeeds() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        // Some committed content so the buffer's segment is condemnable.
        let prior = alloc(env.ap, &[scalar(9)]);
        check_ap_invariant(env.ap);

        let size = block_size(2);
        let p = Buffer::reserve_or_fill(env.ap, size).expect("reserve");
        init_obj(p, size, &[scalar(1), scalar(2)]);

        // A whole collection happens between reserve and commit.
        Arena::collect(env.arena);

        assert!(
            !Buffer::commit(env.ap, p, size),
            "commit must fail when a flip intervened"
        );
        check_ap_invariant(env.ap);

        // The client retries: reserve, reinitialize, commit.
        let q = Buffer::reserve_or_fill(env.ap, size).expect("re-reserve");
        init_obj(q, size, &[scalar(1), scalar(2)]);
        assert!(Buffer::commit(env.ap, q, size), "retried commit succeeds");
        assert_eq!(field(q, 0), scalar(1));
        assert_eq!(field(q, 1), scalar(2));
        check_ap_invariant(env.ap);

        // The pre-collection object was garbage (no roots) and is gone;
        // only its address remains meaningless. The new object is sound.
        let _ = prior;
    }
    teardown(env);
}

#[test]
fn commit_succeeds_without_a_flip() {
    let env = setup(&quiet_gens(), &AmcParams::default(), false);
    unsafe {
        let size = block_size(1);
        let p = Buffer::reserve_or_fill(env.ap, size).expect("reserve");
        init_obj(p, size, &[scalar(3)]);
        assert!(Buffer::commit(env.ap, p, size));
        assert_eq!(field(p, 0), scalar(3));
        check_ap_invariant(env.ap);

        // Reserve after commit continues from the same segment.
        let r = Buffer::reserve(env.ap, size);
        assert_eq!(r, Some(p + size));
        let q = r.unwrap();
        init_obj(q, size, &[scalar(4)]);
        assert!(Buffer::commit(env.ap, q, size));
    }
    teardown(env);
}
