//! L2: transmigration — deep-copy an object graph into a target region.
//!
//! Iterative, not recursive: a worklist plus an identity map from
//! already-visited source addresses to their freshly allocated
//! destination counterparts, exactly the shape `refcount::dec_ref`'s
//! finalization worklist uses for the same "caller graphs can be
//! arbitrarily deep" reason (spec.md §4.3/§9). The identity map is what
//! preserves both sharing (two edges into the same sub-object stay merged
//! after the copy) and cycles (a self-referential pair doesn't infinite
//! loop the copy).

use std::collections::HashMap;

use log::trace;

use crate::region::Region;
use crate::value::{ClosureData, Object, ObjectHeader, Payload, Tag, Value};

/// Deep-copy `root` into `dst`, returning the value a container in `dst`
/// should now hold in `root`'s place. Immediates pass through unchanged —
/// they aren't owned by any region.
pub fn transmigrate(root: Value, dst: &Region) -> Value {
    if root.is_immediate() {
        return root;
    }
    let mut seen: HashMap<usize, Value> = HashMap::new();
    let mut worklist: Vec<Value> = vec![root];

    // Phase 1: allocate a destination shell for every reachable boxed
    // value, without yet filling in fields that point at other boxed
    // values (those get patched in phase 2, once every shell exists and
    // `seen` is complete).
    while let Some(v) = worklist.pop() {
        if !v.is_boxed() || seen.contains_key(&v.identity()) {
            continue;
        }
        let shell = allocate_shell(v, dst);
        seen.insert(v.identity(), shell);
        push_children(v, &mut worklist);
    }

    // Phase 2: patch every shell's fields to point at the copies in `seen`
    // (or at immediates, passed straight through).
    for (&src_id, &dst_val) in seen.iter() {
        patch_shell(src_id, dst_val, &seen);
    }

    trace!("transmigrate: copied {} objects into {:?}", seen.len(), dst.id);
    *seen.get(&root.identity()).expect("root was visited in phase 1")
}

fn remap(v: Value, seen: &HashMap<usize, Value>) -> Value {
    if v.is_immediate() {
        v
    } else {
        *seen.get(&v.identity()).expect("transmigrate: child not visited in phase 1")
    }
}

fn push_children(v: Value, worklist: &mut Vec<Value>) {
    unsafe {
        match &v.object().payload {
            Payload::Pair(a, b) => {
                worklist.push(a.get());
                worklist.push(b.get());
            }
            Payload::Array(items) => worklist.extend(items.borrow().iter().copied()),
            Payload::Dict(entries) => {
                for (k, val) in entries.borrow().iter() {
                    worklist.push(k.0);
                    worklist.push(*val);
                }
            }
            Payload::Set(entries) => worklist.extend(entries.borrow().iter().map(|k| k.0)),
            Payload::Boxed(cell) => worklist.push(cell.get()),
            Payload::Closure(c) => worklist.extend(c.captured.borrow().iter().copied()),
            _ => {}
        }
    }
}

/// Allocate an empty-bodied destination object of the same tag as `v`,
/// copying any fields that don't themselves hold a `Value` (scalars,
/// strings, symbols) directly since those never need remapping.
fn allocate_shell(v: Value, dst: &Region) -> Value {
    let tag = unsafe { v.object().header.tag };
    let payload = unsafe {
        match &v.object().payload {
            Payload::Int(n) => Payload::Int(*n),
            Payload::Float(f) => Payload::Float(*f),
            Payload::Str(s) => Payload::Str(std::cell::RefCell::new(s.borrow().clone())),
            Payload::Symbol(s) => Payload::Symbol(s.clone()),
            Payload::Keyword(s) => Payload::Keyword(s.clone()),
            Payload::Pair(_, _) => Payload::Pair(
                std::cell::Cell::new(crate::value::NIL),
                std::cell::Cell::new(crate::value::NIL),
            ),
            Payload::Array(items) => {
                Payload::Array(std::cell::RefCell::new(vec![crate::value::NIL; items.borrow().len()]))
            }
            Payload::Dict(_) => Payload::Dict(std::cell::RefCell::new(HashMap::new())),
            Payload::Set(_) => Payload::Set(std::collections::HashSet::new().into()),
            Payload::Boxed(_) => Payload::Boxed(std::cell::Cell::new(crate::value::NIL)),
            Payload::Closure(c) => Payload::Closure(ClosureData {
                captured: std::cell::RefCell::new(vec![crate::value::NIL; c.captured.borrow().len()]),
                code_ptr: c.code_ptr,
            }),
            Payload::Error(e) => Payload::Error(crate::value::ErrorData {
                message: e.message.clone(),
                code: e.code,
            }),
            Payload::Atom(bits) => Payload::Atom(std::sync::atomic::AtomicUsize::new(
                bits.load(std::sync::atomic::Ordering::Relaxed),
            )),
            Payload::Channel(c) => Payload::Channel(c.clone()),
            Payload::Thread(t) => Payload::Thread(t.clone()),
        }
    };
    let obj = Box::new(Object {
        header: ObjectHeader::new(tag, dst.id),
        payload,
    });
    unsafe { Value::from_raw(Box::into_raw(obj) as usize) }
}

/// Fill in `dst_val`'s `Value`-typed fields from the source object
/// identified by `src_id`, remapping each child through `seen`.
fn patch_shell(src_id: usize, dst_val: Value, seen: &HashMap<usize, Value>) {
    let src = unsafe { Value::from_raw(src_id) };
    unsafe {
        match (&src.object().payload, &dst_val.object().payload) {
            (Payload::Pair(sa, sb), Payload::Pair(da, db)) => {
                da.set(remap(sa.get(), seen));
                db.set(remap(sb.get(), seen));
            }
            (Payload::Array(sitems), Payload::Array(ditems)) => {
                let mut d = ditems.borrow_mut();
                for (i, item) in sitems.borrow().iter().enumerate() {
                    d[i] = remap(*item, seen);
                }
            }
            (Payload::Dict(sentries), Payload::Dict(dentries)) => {
                let mut d = dentries.borrow_mut();
                for (k, val) in sentries.borrow().iter() {
                    let new_key = remap(k.0, seen);
                    let new_val = remap(*val, seen);
                    d.insert(crate::value::ValueKey(new_key), new_val);
                }
            }
            (Payload::Set(sentries), Payload::Set(dentries)) => {
                let mut d = dentries.borrow_mut();
                for k in sentries.borrow().iter() {
                    d.insert(crate::value::ValueKey(remap(k.0, seen)));
                }
            }
            (Payload::Boxed(scell), Payload::Boxed(dcell)) => {
                dcell.set(remap(scell.get(), seen));
            }
            (Payload::Closure(sc), Payload::Closure(dc)) => {
                let mut d = dc.captured.borrow_mut();
                for (i, val) in sc.captured.borrow().iter().enumerate() {
                    d[i] = remap(*val, seen);
                }
            }
            _ => {}
        }
    }
}
