//! L5: reference counting — `inc_ref`/`dec_ref`, finalization, and the
//! small-object recycling pool.
//!
//! Finalization walks a worklist instead of recursing through
//! `Payload::Pair`/`Array`/etc, because a deeply nested list built by the
//! evaluator is exactly the shape that would blow the host stack on a
//! naive recursive drop (spec.md §4.5/§9, "no host-language recursion").
//! Components are the exception: a member's refcount can reach zero
//! without the object being freed, because the component (not refcounting)
//! owns the decision to dismantle its members together.

use std::sync::atomic::Ordering;

use log::trace;
use parking_lot::Mutex;

use crate::region::{owner_of, GLOBAL_REGION_ID};
use crate::value::{Object, Payload, Tag, Value};

/// Recycling pool for boxed objects, keyed by tag. Reusing a same-tag,
/// same-shape allocation skips `Box::into_raw`/`Box::from_raw`'s
/// round trip through the global allocator for the hot path (short-lived
/// pairs and boxes), the same trade the teacher's page pool makes for
/// small GC objects. Disabled under `memdebug` so allocator bugs aren't
/// masked by a cached free object.
struct Pool {
    pairs: Mutex<Vec<*mut Object>>,
    boxes: Mutex<Vec<*mut Object>>,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

const POOL_MAX_PER_TAG: usize = 256;

static POOL: Pool = Pool {
    pairs: Mutex::new(Vec::new()),
    boxes: Mutex::new(Vec::new()),
};

fn pool_bucket(tag: Tag) -> Option<&'static Mutex<Vec<*mut Object>>> {
    match tag {
        Tag::Pair => Some(&POOL.pairs),
        Tag::Box => Some(&POOL.boxes),
        _ => None,
    }
}

/// Take a recycled object of the given tag if the pool has one and
/// `memdebug` isn't forcing fresh allocation. Caller overwrites the
/// payload before use.
pub(crate) fn pool_take(tag: Tag) -> Option<*mut Object> {
    if cfg!(feature = "memdebug") {
        return None;
    }
    pool_bucket(tag).and_then(|b| b.lock().pop())
}

fn pool_try_recycle(obj: *mut Object, tag: Tag) -> bool {
    if cfg!(feature = "memdebug") {
        return false;
    }
    match pool_bucket(tag) {
        Some(bucket) => {
            let mut guard = bucket.lock();
            if guard.len() < POOL_MAX_PER_TAG {
                guard.push(obj);
                true
            } else {
                false
            }
        }
        None => false,
    }
}

/// Increment `v`'s refcount. No-op on immediates and on objects owned by
/// the global region: global-region objects are immortal and never
/// touched by refcounting in either direction (spec.md §4.1).
pub fn inc_ref(v: Value) {
    if v.is_immediate() {
        return;
    }
    if owner_of(v) == GLOBAL_REGION_ID {
        return;
    }
    unsafe {
        v.object().header.refcount.fetch_add(1, Ordering::AcqRel);
    }
}

/// Decrement `v`'s refcount; finalizes (and transitively decrements
/// children) once it reaches zero, unless `v` is a live component member.
/// No-op on immediates and on objects owned by the global region, which
/// never reach zero by refcounting (spec.md §4.1).
pub fn dec_ref(v: Value) {
    if v.is_immediate() {
        return;
    }
    let mut worklist = vec![v];
    while let Some(cur) = worklist.pop() {
        if cur.is_immediate() {
            continue;
        }
        if owner_of(cur) == GLOBAL_REGION_ID {
            continue;
        }
        let header = unsafe { &cur.object().header };
        let prev = header.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "dec_ref underflow on {:?}", cur);
        if prev != 1 {
            continue;
        }
        if !header.component.load(Ordering::Acquire).is_null() {
            // Owned by a component: the component's own handle/tether
            // accounting decides when this member is actually freed (see
            // component.rs dismantle). A zeroed individual refcount just
            // means no *external* reference keeps it alive outside the
            // cycle; the member stays put until the component goes away.
            continue;
        }
        finalize(cur, &mut worklist);
    }
}

/// Drop `v`'s payload, pushing any directly-contained values onto
/// `worklist` instead of recursing, then free the object (or hand it to
/// the pool).
fn finalize(v: Value, worklist: &mut Vec<Value>) {
    let tag = unsafe { v.object().header.tag };
    trace!("finalize: {:?} tag={:?}", v, tag);
    let obj_ptr = unsafe { v.object_ptr() };
    unsafe {
        match &(*obj_ptr).payload {
            Payload::Pair(a, b) => {
                worklist.push(a.get());
                worklist.push(b.get());
            }
            Payload::Array(items) => {
                worklist.extend(items.borrow().iter().copied());
            }
            Payload::Dict(entries) => {
                worklist.extend(entries.borrow().iter().map(|(k, v)| [k.0, *v]).flatten());
            }
            Payload::Set(entries) => {
                worklist.extend(entries.borrow().iter().map(|k| k.0));
            }
            Payload::Boxed(cell) => {
                worklist.push(cell.get());
            }
            Payload::Closure(c) => {
                worklist.extend(c.captured.borrow().iter().copied());
            }
            _ => {}
        }
        std::ptr::drop_in_place(obj_ptr);
        if !pool_try_recycle(obj_ptr, tag) {
            dealloc_object(obj_ptr);
        }
    }
}

unsafe fn dealloc_object(obj_ptr: *mut Object) {
    // payload was already dropped in place by `finalize`; reclaim the raw
    // allocation via the same layout `Box::new` used to create it.
    let layout = std::alloc::Layout::for_value(&*obj_ptr);
    std::alloc::dealloc(obj_ptr as *mut u8, layout);
}
