//! L4: component engine — union-find grouping of cyclic objects.
//!
//! Refcounting alone leaks cycles (spec.md §9, "Cyclic graphs without a
//! tracing collector"). Rather than a tracing collector, cycles are
//! confined to explicit *components*: a union-find structure over the
//! objects the evaluator has identified as mutually reachable. A component
//! is freed as a whole once both its handles and its tethers reach zero.
//!
//! The union-find shape here plays the same role `resolve_region`
//! (`region.rs`) plays for merged regions — path-compressed canonical
//! lookup over a forest of unioned nodes — reused because it is the right
//! tool for both "N things collapse into one owner" problems in this
//! runtime.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::value::{Object, Value};

thread_local! {
    /// Per-thread tether fast-path cache (spec.md §4.5): once a tether has
    /// been taken for a component on this thread, nested
    /// `sym_tether_begin` calls for the *same* component reuse the cached
    /// depth counter instead of touching the atomic `tether_count` again.
    static TETHER_CACHE: Cell<Option<(*mut ComponentInner, u32)>> = Cell::new(None);
}

pub struct ComponentInner {
    /// Union-find parent; `self` (i.e. points to itself) for a canonical
    /// root.
    parent: AtomicPtr<ComponentInner>,
    members: Mutex<Vec<NonNull<Object>>>,
    handle_count: AtomicUsize,
    tether_count: AtomicUsize,
    internal_rc: AtomicUsize,
}

unsafe impl Send for ComponentInner {}
unsafe impl Sync for ComponentInner {}

/// An external strong reference to a component. `Drop` is intentionally
/// not implemented — component lifetime is the explicit handle/tether
/// protocol from spec.md §4.5, not Rust RAII, so callers must pair
/// `sym_acquire_handle`/`sym_release_handle` themselves (exactly like
/// `inc_ref`/`dec_ref`).
pub type Component = NonNull<ComponentInner>;

pub fn sym_component_new() -> Component {
    let inner = Box::new(ComponentInner {
        parent: AtomicPtr::new(std::ptr::null_mut()),
        members: Mutex::new(Vec::new()),
        handle_count: AtomicUsize::new(0),
        tether_count: AtomicUsize::new(0),
        internal_rc: AtomicUsize::new(0),
    });
    let ptr = Box::into_raw(inner);
    unsafe { (*ptr).parent.store(ptr, Ordering::Relaxed) };
    NonNull::new(ptr).unwrap()
}

/// Canonical representative of `c`'s union-find tree, with path
/// compression.
pub fn sym_component_find(c: Component) -> Component {
    unsafe {
        let mut cur = c.as_ptr();
        loop {
            let parent = (*cur).parent.load(Ordering::Acquire);
            if parent == cur {
                break;
            }
            cur = parent;
        }
        let root = cur;
        // path compression: point every node on the path directly at root
        let mut cur = c.as_ptr();
        while cur != root {
            let parent = (*cur).parent.load(Ordering::Acquire);
            (*cur).parent.store(root, Ordering::Release);
            cur = parent;
        }
        NonNull::new(root).unwrap()
    }
}

pub fn sym_component_add_member(c: Component, o: Value) {
    debug_assert!(o.is_boxed());
    let root = sym_component_find(c);
    unsafe {
        let obj_ptr = NonNull::new(o.object_mut() as *mut Object).unwrap();
        o.object().header.component.store(root.as_ptr(), Ordering::Release);
        (*root.as_ptr()).members.lock().push(obj_ptr);
    }
}

/// Guard against a combined member count that would overflow `usize / 2`,
/// per spec.md §4.5.
const MAX_SAFE_MEMBERS: usize = usize::MAX / 2;

/// Union two components with path compression, choosing the tree with more
/// members as the new root and appending the smaller member list to it.
/// Rejects (no-ops) merges whose combined size would overflow
/// `MAX_SAFE_MEMBERS`.
pub fn sym_component_union(a: Component, b: Component) -> Component {
    let ra = sym_component_find(a);
    let rb = sym_component_find(b);
    if ra == rb {
        return ra;
    }
    unsafe {
        let (big, small) = {
            let la = (*ra.as_ptr()).members.lock().len();
            let lb = (*rb.as_ptr()).members.lock().len();
            if la >= lb {
                (ra, rb)
            } else {
                (rb, ra)
            }
        };
        let combined = {
            let lbig = (*big.as_ptr()).members.lock().len();
            let lsmall = (*small.as_ptr()).members.lock().len();
            lbig.checked_add(lsmall)
        };
        let combined = match combined {
            Some(n) if n <= MAX_SAFE_MEMBERS => n,
            _ => {
                warn!("sym_component_union: rejecting merge, combined member count would overflow");
                return big;
            }
        };
        let _ = combined;
        (*small.as_ptr()).parent.store(big.as_ptr(), Ordering::Release);
        let mut small_members = (*small.as_ptr()).members.lock();
        let mut big_members = (*big.as_ptr()).members.lock();
        for m in small_members.drain(..) {
            m.as_ref().header.component.store(big.as_ptr(), Ordering::Release);
            big_members.push(m);
        }
        let small_handles = (*small.as_ptr()).handle_count.load(Ordering::Relaxed);
        let small_tethers = (*small.as_ptr()).tether_count.load(Ordering::Relaxed);
        let small_rc = (*small.as_ptr()).internal_rc.load(Ordering::Relaxed);
        (*big.as_ptr()).handle_count.fetch_add(small_handles, Ordering::Relaxed);
        (*big.as_ptr()).tether_count.fetch_add(small_tethers, Ordering::Relaxed);
        (*big.as_ptr()).internal_rc.fetch_add(small_rc, Ordering::Relaxed);
        trace!("sym_component_union: merged {:?} into {:?}", small, big);
        big
    }
}

pub fn sym_acquire_handle(c: Component) {
    let root = sym_component_find(c);
    unsafe { (*root.as_ptr()).handle_count.fetch_add(1, Ordering::AcqRel) };
}

/// Decrement the handle count; dismantles the component if both handles
/// and tethers have reached zero.
pub fn sym_release_handle(c: Component) {
    let root = sym_component_find(c);
    let prev = unsafe { (*root.as_ptr()).handle_count.fetch_sub(1, Ordering::AcqRel) };
    debug_assert!(prev > 0, "sym_release_handle underflow");
    maybe_dismantle(root);
}

pub fn sym_tether_begin(c: Component) -> TetherToken {
    let root = sym_component_find(c);
    let cached = TETHER_CACHE.with(|cell| cell.get());
    match cached {
        Some((cached_root, depth)) if cached_root == root.as_ptr() => {
            TETHER_CACHE.with(|cell| cell.set(Some((cached_root, depth + 1))));
        }
        _ => {
            unsafe { (*root.as_ptr()).tether_count.fetch_add(1, Ordering::AcqRel) };
            TETHER_CACHE.with(|cell| cell.set(Some((root.as_ptr(), 1))));
        }
    }
    TetherToken { component: root }
}

pub struct TetherToken {
    component: Component,
}

/// Ends a read-scope borrow; flushes the per-thread fast-path cache back
/// to the atomic `tether_count` once nesting depth returns to zero.
pub fn sym_tether_end(token: TetherToken) {
    let root = token.component;
    let done = TETHER_CACHE.with(|cell| {
        let cached = cell.get();
        match cached {
            Some((cached_root, depth)) if cached_root == root.as_ptr() => {
                if depth > 1 {
                    cell.set(Some((cached_root, depth - 1)));
                    false
                } else {
                    cell.set(None);
                    true
                }
            }
            _ => true,
        }
    });
    if done {
        let prev = unsafe { (*root.as_ptr()).tether_count.fetch_sub(1, Ordering::AcqRel) };
        debug_assert!(prev > 0, "sym_tether_end underflow");
        maybe_dismantle(root);
    }
}

fn maybe_dismantle(root: Component) {
    unsafe {
        if (*root.as_ptr()).handle_count.load(Ordering::Acquire) == 0
            && (*root.as_ptr()).tether_count.load(Ordering::Acquire) == 0
        {
            dismantle(root);
        }
    }
}

/// Free every member's payload and the component struct itself in one
/// pass. Members are detached from the refcount path first: a final
/// `dec_ref` arriving on a stray external pointer to a member after
/// dismantle finds no component and becomes a no-op, matching spec.md
/// §4.5's invariant.
fn dismantle(root: Component) {
    unsafe {
        let members = std::mem::take(&mut *(*root.as_ptr()).members.lock());
        debug!("component dismantle: {} members", members.len());
        for m in &members {
            m.as_ref().header.component.store(std::ptr::null_mut(), Ordering::Release);
        }
        for m in members {
            drop(Box::from_raw(m.as_ptr()));
        }
        drop(Box::from_raw(root.as_ptr()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::GLOBAL_REGION;
    use crate::value::{Object, ObjectHeader, Payload, Tag};
    use std::cell::Cell as StdCell;

    fn mk_test_pair() -> Value {
        let region = GLOBAL_REGION.id;
        let obj = Box::new(Object {
            header: ObjectHeader::new(Tag::Pair, region),
            payload: Payload::Pair(StdCell::new(crate::value::NIL), StdCell::new(crate::value::NIL)),
        });
        unsafe { Value::from_raw(Box::into_raw(obj) as usize) }
    }

    #[test]
    fn handle_and_tether_gate_dismantle() {
        let c = sym_component_new();
        let a = mk_test_pair();
        let b = mk_test_pair();
        sym_component_add_member(c, a);
        sym_component_add_member(c, b);

        sym_acquire_handle(c);
        let tether = sym_tether_begin(c);
        sym_release_handle(c); // handles -> 0 but tether still held
        assert_eq!(
            unsafe { (*sym_component_find(c).as_ptr()).handle_count.load(Ordering::Relaxed) },
            0
        );
        sym_tether_end(tether); // now both are zero: dismantles
    }

    #[test]
    fn union_combines_members_and_counts() {
        let a = sym_component_new();
        let b = sym_component_new();
        sym_component_add_member(a, mk_test_pair());
        sym_component_add_member(b, mk_test_pair());
        sym_acquire_handle(a);
        sym_acquire_handle(b);
        let merged = sym_component_union(a, b);
        assert_eq!(sym_component_find(a), merged);
        assert_eq!(sym_component_find(b), merged);
        unsafe {
            assert_eq!((*merged.as_ptr()).members.lock().len(), 2);
            assert_eq!((*merged.as_ptr()).handle_count.load(Ordering::Relaxed), 2);
        }
        sym_release_handle(merged);
        sym_release_handle(merged);
    }

    #[test]
    fn nested_tethers_use_fast_path_cache() {
        let c = sym_component_new();
        sym_acquire_handle(c);
        let t1 = sym_tether_begin(c);
        let t2 = sym_tether_begin(c);
        assert_eq!(
            unsafe { (*sym_component_find(c).as_ptr()).tether_count.load(Ordering::Relaxed) },
            1,
            "nested tethers on one thread should only touch the atomic once"
        );
        sym_tether_end(t2);
        sym_tether_end(t1);
        sym_release_handle(c);
    }

    proptest::proptest! {
        // P4: a component is dismantled iff both its handle and tether
        // counts are zero, whatever order the acquires/releases happen in
        // (tested here by varying how many handles are taken before the
        // single tether is opened and closed).
        #[test]
        fn p4_dismantle_exactly_when_both_counts_are_zero(n_handles in 1u32..6) {
            let c = sym_component_new();
            let member = mk_test_pair();
            sym_component_add_member(c, member);
            for _ in 0..n_handles {
                sym_acquire_handle(c);
            }
            let tether = sym_tether_begin(c);
            for _ in 0..n_handles {
                sym_release_handle(c);
            }
            // handles are zero but the tether is still open: must not be
            // dismantled — a dismantled component nulls out the member's
            // header.component field, so check that's still set.
            assert!(!unsafe { &*member.object_ptr() }.header.component.load(Ordering::Acquire).is_null());
            sym_tether_end(tether); // now both are zero: dismantles
        }
    }
}
