//! End-to-end cross-module scenarios, built entirely from the crate's
//! public object API the way an external evaluator/stdlib collaborator
//! would use it.

use omni_rt::barrier::omni_store_repair;
use omni_rt::channel::{make_channel, SelectCase};
use omni_rt::component::{sym_acquire_handle, sym_component_add_member, sym_component_new, sym_release_handle};
use omni_rt::constructors::{
    box_get, box_set, mk_box_region, mk_int, mk_pair_region, obj_to_int, pair_a, pair_b,
};
use omni_rt::fiber::{fiber_join, spawn_fiber, with_fibers};
use omni_rt::region::{omni_region_set_parent, owner_of, region_create};
use omni_rt::value::NIL;

/// S1. Local cycle freed by component.
#[test]
fn local_cycle_freed_by_component() {
    let r = region_create();
    let a = mk_box_region(&r, NIL);
    let b = mk_box_region(&r, a);
    assert!(box_set(a, b, 4096)); // close the cycle: a -> b -> a

    let c = sym_component_new();
    sym_component_add_member(c, a);
    sym_component_add_member(c, b);

    sym_acquire_handle(c);
    sym_release_handle(c); // drops to zero handles/tethers: dismantles
}

/// S2. Younger-region value stored into an older box gets transmigrated.
#[test]
fn younger_into_older_box_triggers_repair() {
    let dst = region_create();
    let src = region_create();
    omni_region_set_parent(&src, &dst);

    let v = mk_pair_region(&src, mk_int(42), mk_int(99));
    let b = mk_box_region(&dst, NIL);
    assert!(box_set(b, v, 0)); // threshold 0: merge if permitted, else copy

    let stored = box_get(b);
    assert_eq!(owner_of(stored), dst.id);
    assert_eq!(obj_to_int(pair_a(stored)), Some(42));
    assert_eq!(obj_to_int(pair_b(stored)), Some(99));
}

/// S3. Buffered channel transmigrates a sent value into its own region.
#[test]
fn buffered_channel_transmigrates_sent_value() {
    let dst = region_create();
    let src = region_create();
    let ch = make_channel(10, &dst);
    let v = mk_pair_region(&src, mk_int(1), mk_int(2));
    ch.send(4096, v).unwrap();
    let w = ch.recv().unwrap();
    assert_eq!(owner_of(w), dst.id);
    assert_eq!(obj_to_int(pair_a(w)), Some(1));
    assert_eq!(obj_to_int(pair_b(w)), Some(2));
}

/// S4. Unbuffered channel hands off an immediate directly; no
/// transmigration needed since immediates bypass the barrier entirely.
#[test]
fn unbuffered_channel_bypasses_repair_for_immediates() {
    with_fibers(|sched| {
        let ch = std::sync::Arc::new(make_channel(0, &region_create()));
        let ch_send = ch.clone();
        let sender = spawn_fiber(sched, move || {
            ch_send.send(4096, mk_int(5)).unwrap();
            NIL
        });
        let ch_recv = ch.clone();
        let receiver = spawn_fiber(sched, move || ch_recv.recv().unwrap());
        fiber_join(&sender);
        let received = fiber_join(&receiver);
        assert_eq!(obj_to_int(received), Some(5));
    });
}

/// S5. `select` with a default case and nothing ready returns the default.
#[test]
fn select_with_default_and_nothing_ready() {
    let r1 = region_create();
    let r2 = region_create();
    let ch1 = make_channel(1, &r1);
    let ch2 = make_channel(1, &r2);
    let result = omni_rt::channel::fiber_select(
        4096,
        &[SelectCase::Recv(&ch1), SelectCase::Recv(&ch2)],
        true,
    );
    assert!(matches!(result, omni_rt::channel::SelectResult::Default));
}

/// S6. Atomic counter under contention from two threads.
#[test]
fn atomic_counter_under_contention() {
    let r = region_create();
    let a = omni_rt::atom::make_atom(mk_int(0), &r, 4096);
    std::thread::scope(|scope| {
        for _ in 0..2 {
            let r = &r;
            scope.spawn(move || {
                for _ in 0..100 {
                    loop {
                        let cur = omni_rt::atom::atom_deref(a);
                        let cur_n = obj_to_int(cur).unwrap();
                        if omni_rt::atom::atom_cas(a, cur, mk_int(cur_n + 1), r, 4096) {
                            break;
                        }
                    }
                }
            });
        }
    });
    assert_eq!(obj_to_int(omni_rt::atom::atom_deref(a)), Some(200));
}

#[test]
fn repair_is_noop_for_same_region() {
    let r = region_create();
    let v = mk_pair_region(&r, mk_int(1), NIL);
    let repaired = omni_store_repair(v, &r, 4096);
    assert_eq!(repaired.identity(), v.identity());
}
