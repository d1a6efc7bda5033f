//! L8: atoms — a lock-free single-cell mutable reference.
//!
//! Backed by the raw bits of a `Value` in an `AtomicUsize` (the same field
//! `Payload::Atom` declares in `value.rs`), swapped with real CAS rather
//! than a mutex — the one place in this runtime where concurrent mutation
//! of a single cell is common enough on the evaluator's hot path
//! (counters, flags) to be worth a lock-free path instead of going through
//! `parking_lot::Mutex` like every other container.
//!
//! Refcounting is handled manually here instead of through the store
//! barrier: an atom never holds a value longer than the atom itself lives
//! (both are bumped the same way pairs are), but swapping its contents
//! means the old value's refcount must drop and the new one's must rise,
//! exactly once, with no window where both or neither has happened.

use std::sync::atomic::Ordering;

use crate::barrier::omni_store_repair;
use crate::refcount::{dec_ref, inc_ref};
use crate::region::Region;
use crate::value::{Object, ObjectHeader, Payload, Tag, Value};

pub fn make_atom(initial: Value, region: &Region, merge_threshold: usize) -> Value {
    let repaired = omni_store_repair(initial, region, merge_threshold);
    inc_ref(repaired);
    let obj = Box::new(Object {
        header: ObjectHeader::new(Tag::Atom, region.id),
        payload: Payload::Atom(std::sync::atomic::AtomicUsize::new(repaired.raw())),
    });
    unsafe { Value::from_raw(Box::into_raw(obj) as usize) }
}

fn atom_bits(atom: Value) -> &'static std::sync::atomic::AtomicUsize {
    unsafe {
        match &atom.object().payload {
            Payload::Atom(bits) => bits,
            _ => panic!("atom_deref: value is not an atom"),
        }
    }
}

pub fn atom_deref(atom: Value) -> Value {
    unsafe { Value::from_raw(atom_bits(atom).load(Ordering::Acquire)) }
}

/// Unconditionally replace the atom's contents, returning the previous
/// value (caller is responsible for `dec_ref`-ing it if they don't keep
/// it alive some other way — mirrors spec.md's `atom_reset` contract).
pub fn atom_reset(atom: Value, new_value: Value, region: &Region, merge_threshold: usize) -> Value {
    let repaired = omni_store_repair(new_value, region, merge_threshold);
    inc_ref(repaired);
    let old_bits = atom_bits(atom).swap(repaired.raw(), Ordering::AcqRel);
    let old = unsafe { Value::from_raw(old_bits) };
    dec_ref(old);
    old
}

/// Functional update: read the atom's current value, apply `f` to it, and
/// CAS the result in; on contention, re-read and retry with the new
/// current value (spec.md §4.8). Returns the value that was installed.
pub fn atom_swap<F>(atom: Value, region: &Region, merge_threshold: usize, mut f: F) -> Value
where
    F: FnMut(Value) -> Value,
{
    loop {
        let cur = atom_deref(atom);
        let next = f(cur);
        if atom_cas(atom, cur, next, region, merge_threshold) {
            return next;
        }
    }
}

/// Compare-and-swap: replace the atom's contents with `new_value` only if
/// its current contents are bit-identical to `expected`. Returns whether
/// the swap happened.
pub fn atom_cas(
    atom: Value,
    expected: Value,
    new_value: Value,
    region: &Region,
    merge_threshold: usize,
) -> bool {
    let repaired = omni_store_repair(new_value, region, merge_threshold);
    let bits = atom_bits(atom);
    match bits.compare_exchange(
        expected.raw(),
        repaired.raw(),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(old_bits) => {
            inc_ref(repaired);
            dec_ref(unsafe { Value::from_raw(old_bits) });
            true
        }
        Err(_) => false,
    }
}
