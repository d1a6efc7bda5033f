//! `extern "C"` surface binding every name in spec.md §6 to the safe API,
//! in the same spirit as the teacher's `c_interface.rs` (`#[no_mangle] pub
//! extern fn neptune_*`): thin wrappers around opaque pointers, no logic
//! beyond translating between C-friendly representations and the safe
//! Rust types.
//!
//! `Value` is already a single `usize`, so it crosses the boundary as one
//! directly (`CValue`) rather than behind an extra pointer indirection —
//! collaborators pass it by value exactly like a `jl_value_t*` in C.
//! `Region` is reference-counted (`Arc<RegionInner>`); handles cross as
//! `*const RegionInner` via `Arc::into_raw`/`Arc::from_raw`, mirroring how
//! `region_retain_internal`/`region_release_internal` already model
//! explicit retain/release at the safe-API layer.

use std::os::raw::{c_char, c_int};
use std::sync::Arc;

use crate::region::{Region, RegionInner};
use crate::value::Value;

pub type CValue = usize;

const C_NOTHING: CValue = crate::value::NOTHING.raw();
const C_NIL: CValue = crate::value::NIL.raw();

#[inline]
unsafe fn to_value(v: CValue) -> Value {
    Value::from_raw(v)
}

#[inline]
fn from_value(v: Value) -> CValue {
    v.raw()
}

/// Borrow a region handle without consuming the caller's reference.
/// Callers must have obtained `ptr` from one of this module's
/// region-returning functions.
unsafe fn borrow_region(ptr: *const RegionInner) -> Region {
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

fn region_into_raw(r: Region) -> *const RegionInner {
    Arc::into_raw(r)
}

// --- object construction & inspection ---------------------------------

#[no_mangle]
pub extern "C" fn omni_mk_int(n: i64) -> CValue {
    from_value(crate::constructors::mk_int(n))
}

#[no_mangle]
pub extern "C" fn omni_mk_float(f: f64) -> CValue {
    from_value(crate::constructors::mk_float(f))
}

#[no_mangle]
pub extern "C" fn omni_mk_bool(b: c_int) -> CValue {
    from_value(crate::constructors::mk_bool(b != 0))
}

#[no_mangle]
pub extern "C" fn omni_mk_nil() -> CValue {
    C_NIL
}

#[no_mangle]
pub extern "C" fn omni_mk_nothing() -> CValue {
    C_NOTHING
}

/// `s` must be a valid, NUL-terminated UTF-8 C string; invalid UTF-8
/// yields `nothing` rather than trapping (spec.md §7: type/domain errors
/// are in-band, never a panic across the FFI boundary).
#[no_mangle]
pub unsafe extern "C" fn omni_mk_string(s: *const c_char) -> CValue {
    match std::ffi::CStr::from_ptr(s).to_str() {
        Ok(s) => from_value(crate::constructors::mk_string(s)),
        Err(_) => C_NOTHING,
    }
}

#[no_mangle]
pub unsafe extern "C" fn omni_mk_symbol(s: *const c_char) -> CValue {
    match std::ffi::CStr::from_ptr(s).to_str() {
        Ok(s) => from_value(crate::constructors::mk_symbol(s)),
        Err(_) => C_NOTHING,
    }
}

#[no_mangle]
pub extern "C" fn omni_mk_pair(a: CValue, b: CValue) -> CValue {
    unsafe { from_value(crate::constructors::mk_pair(to_value(a), to_value(b))) }
}

#[no_mangle]
pub extern "C" fn omni_mk_pair_region(region: *const RegionInner, a: CValue, b: CValue) -> CValue {
    unsafe {
        let r = borrow_region(region);
        from_value(crate::constructors::mk_pair_region(&r, to_value(a), to_value(b)))
    }
}

#[no_mangle]
pub extern "C" fn omni_mk_array(capacity: usize) -> CValue {
    from_value(crate::constructors::mk_array(capacity))
}

#[no_mangle]
pub extern "C" fn omni_mk_dict() -> CValue {
    from_value(crate::constructors::mk_dict())
}

#[no_mangle]
pub extern "C" fn omni_mk_set() -> CValue {
    from_value(crate::constructors::mk_set())
}

#[no_mangle]
pub extern "C" fn omni_mk_box(initial: CValue) -> CValue {
    unsafe { from_value(crate::constructors::mk_box(to_value(initial))) }
}

#[no_mangle]
pub extern "C" fn omni_obj_tag(v: CValue) -> c_int {
    unsafe { to_value(v).tag() as c_int }
}

#[no_mangle]
pub extern "C" fn omni_is_pair(v: CValue) -> c_int {
    unsafe { crate::constructors::is_pair(to_value(v)) as c_int }
}

#[no_mangle]
pub extern "C" fn omni_obj_to_int(v: CValue, out: *mut i64, ok: *mut c_int) {
    unsafe {
        match crate::constructors::obj_to_int(to_value(v)) {
            Some(n) => {
                *out = n;
                *ok = 1;
            }
            None => *ok = 0,
        }
    }
}

#[no_mangle]
pub extern "C" fn omni_pair_a(p: CValue) -> CValue {
    unsafe { from_value(crate::constructors::pair_a(to_value(p))) }
}

#[no_mangle]
pub extern "C" fn omni_pair_b(p: CValue) -> CValue {
    unsafe { from_value(crate::constructors::pair_b(to_value(p))) }
}

#[no_mangle]
pub extern "C" fn omni_array_length(a: CValue) -> usize {
    unsafe { crate::constructors::array_length(to_value(a)) }
}

#[no_mangle]
pub extern "C" fn omni_array_get(a: CValue, index: usize) -> CValue {
    unsafe { from_value(crate::constructors::array_get(to_value(a), index)) }
}

#[no_mangle]
pub extern "C" fn omni_array_push(a: CValue, v: CValue, merge_threshold: usize) -> c_int {
    unsafe { crate::constructors::array_push(to_value(a), to_value(v), merge_threshold) as c_int }
}

#[no_mangle]
pub extern "C" fn omni_dict_get(d: CValue, k: CValue) -> CValue {
    unsafe { from_value(crate::constructors::dict_get(to_value(d), to_value(k))) }
}

#[no_mangle]
pub extern "C" fn omni_dict_set(d: CValue, k: CValue, v: CValue, merge_threshold: usize) -> c_int {
    unsafe {
        crate::constructors::dict_set(to_value(d), to_value(k), to_value(v), merge_threshold) as c_int
    }
}

#[no_mangle]
pub extern "C" fn omni_array_set(a: CValue, index: usize, v: CValue, merge_threshold: usize) -> c_int {
    unsafe { crate::constructors::array_set(to_value(a), index, to_value(v), merge_threshold) as c_int }
}

#[no_mangle]
pub extern "C" fn omni_set_add(s: CValue, v: CValue, merge_threshold: usize) -> c_int {
    unsafe { crate::constructors::set_add(to_value(s), to_value(v), merge_threshold) as c_int }
}

#[no_mangle]
pub extern "C" fn omni_set_remove(s: CValue, v: CValue) -> c_int {
    unsafe { crate::constructors::set_remove(to_value(s), to_value(v)) as c_int }
}

#[no_mangle]
pub extern "C" fn omni_set_contains(s: CValue, v: CValue) -> c_int {
    unsafe { crate::constructors::set_contains(to_value(s), to_value(v)) as c_int }
}

#[no_mangle]
pub extern "C" fn omni_set_size(s: CValue) -> usize {
    unsafe { crate::constructors::set_size(to_value(s)) }
}

#[no_mangle]
pub extern "C" fn omni_obj_to_float(v: CValue, out: *mut f64, ok: *mut c_int) {
    unsafe {
        match crate::constructors::obj_to_float(to_value(v)) {
            Some(f) => {
                *out = f;
                *ok = 1;
            }
            None => *ok = 0,
        }
    }
}

#[no_mangle]
pub extern "C" fn omni_obj_to_bool(v: CValue, out: *mut c_int, ok: *mut c_int) {
    unsafe {
        match crate::constructors::obj_to_bool(to_value(v)) {
            Some(b) => {
                *out = b as c_int;
                *ok = 1;
            }
            None => *ok = 0,
        }
    }
}

/// Writes the UTF-8 bytes of a `string`/`symbol` value into `buf` (not
/// NUL-terminated by this call), returning the byte length, or `-1` if `v`
/// isn't a string-like value or the buffer is too small.
#[no_mangle]
pub extern "C" fn omni_obj_to_cstr_safe(v: CValue, buf: *mut u8, buf_len: usize) -> isize {
    unsafe {
        match crate::constructors::obj_to_cstr_safe(to_value(v)) {
            Some(s) if s.len() <= buf_len => {
                std::ptr::copy_nonoverlapping(s.as_ptr(), buf, s.len());
                s.len() as isize
            }
            _ => -1,
        }
    }
}

// --- lifetime ------------------------------------------------------------

#[no_mangle]
pub extern "C" fn omni_inc_ref(v: CValue) {
    unsafe { crate::refcount::inc_ref(to_value(v)) }
}

#[no_mangle]
pub extern "C" fn omni_dec_ref(v: CValue) {
    unsafe { crate::refcount::dec_ref(to_value(v)) }
}

#[no_mangle]
pub extern "C" fn omni_box_get(b: CValue) -> CValue {
    unsafe { from_value(crate::constructors::box_get(to_value(b))) }
}

#[no_mangle]
pub extern "C" fn omni_box_set(b: CValue, v: CValue, merge_threshold: usize) -> c_int {
    unsafe { crate::constructors::box_set(to_value(b), to_value(v), merge_threshold) as c_int }
}

// --- regions ---------------------------------------------------------------

#[no_mangle]
pub extern "C" fn omni_region_create() -> *const RegionInner {
    region_into_raw(crate::region::region_create())
}

#[no_mangle]
pub extern "C" fn omni_region_alloc(region: *const RegionInner, n: usize, align: usize) -> *mut u8 {
    unsafe {
        let r = borrow_region(region);
        crate::region::region_alloc(&r, n, align)
    }
}

#[no_mangle]
pub extern "C" fn omni_region_exit(region: *const RegionInner) {
    unsafe {
        let r = borrow_region(region);
        crate::region::region_exit(&r);
    }
}

#[no_mangle]
pub extern "C" fn omni_region_destroy_if_dead(region: *const RegionInner) {
    unsafe {
        let r = borrow_region(region);
        crate::region::region_destroy_if_dead(&r);
    }
}

#[no_mangle]
pub extern "C" fn omni_region_reset(region: *const RegionInner) {
    unsafe {
        let r = borrow_region(region);
        crate::region::region_reset(&r);
    }
}

#[no_mangle]
pub extern "C" fn omni_region_set_parent(region: *const RegionInner, parent: *const RegionInner) {
    unsafe {
        let r = borrow_region(region);
        let p = borrow_region(parent);
        crate::region::omni_region_set_parent(&r, &p);
    }
}

#[no_mangle]
pub extern "C" fn omni_region_set_lifetime_rank(region: *const RegionInner, k: u32) {
    unsafe {
        let r = borrow_region(region);
        crate::region::omni_region_set_lifetime_rank(&r, k);
    }
}

#[no_mangle]
pub extern "C" fn omni_region_get_lifetime_rank(region: *const RegionInner) -> u32 {
    unsafe {
        let r = borrow_region(region);
        crate::region::omni_region_get_lifetime_rank(&r)
    }
}

#[no_mangle]
pub extern "C" fn omni_region_outlives(a: *const RegionInner, b: *const RegionInner) -> c_int {
    unsafe {
        let ra = if a.is_null() { None } else { Some(borrow_region(a)) };
        let rb = if b.is_null() { None } else { Some(borrow_region(b)) };
        crate::region::omni_region_outlives(ra.as_ref(), rb.as_ref()) as c_int
    }
}

#[no_mangle]
pub extern "C" fn omni_region_retain_internal(region: *const RegionInner) {
    unsafe {
        let r = borrow_region(region);
        crate::region::region_retain_internal(&r);
    }
}

#[no_mangle]
pub extern "C" fn omni_region_release_internal(region: *const RegionInner) {
    unsafe {
        let r = borrow_region(region);
        crate::region::region_release_internal(&r);
    }
}

#[no_mangle]
pub extern "C" fn omni_region_merge_permitted(src: *const RegionInner, dst: *const RegionInner) -> c_int {
    unsafe {
        let rs = borrow_region(src);
        let rd = borrow_region(dst);
        crate::region::region_merge_permitted(&rs, &rd) as c_int
    }
}

#[no_mangle]
pub extern "C" fn omni_region_merge_safe(src: *const RegionInner, dst: *const RegionInner) {
    unsafe {
        let rs = borrow_region(src);
        let rd = borrow_region(dst);
        crate::region::region_merge_safe(&rs, &rd);
    }
}

// --- store barrier -----------------------------------------------------------

#[no_mangle]
pub extern "C" fn omni_store_repair(holder_region: *const RegionInner, value: CValue, merge_threshold: usize) -> CValue {
    unsafe {
        let r = borrow_region(holder_region);
        from_value(crate::barrier::omni_store_repair(to_value(value), &r, merge_threshold))
    }
}

// --- components ---------------------------------------------------------------

pub type CComponent = *mut std::ffi::c_void;

fn component_into_raw(c: crate::component::Component) -> CComponent {
    c.as_ptr() as CComponent
}

unsafe fn component_from_raw(c: CComponent) -> crate::component::Component {
    std::ptr::NonNull::new(c as *mut crate::component::ComponentInner).expect("null component handle")
}

#[no_mangle]
pub extern "C" fn omni_sym_component_new() -> CComponent {
    component_into_raw(crate::component::sym_component_new())
}

#[no_mangle]
pub extern "C" fn omni_sym_component_find(c: CComponent) -> CComponent {
    unsafe { component_into_raw(crate::component::sym_component_find(component_from_raw(c))) }
}

#[no_mangle]
pub extern "C" fn omni_sym_component_union(a: CComponent, b: CComponent) -> CComponent {
    unsafe {
        component_into_raw(crate::component::sym_component_union(
            component_from_raw(a),
            component_from_raw(b),
        ))
    }
}

#[no_mangle]
pub extern "C" fn omni_sym_component_add_member(c: CComponent, o: CValue) {
    unsafe { crate::component::sym_component_add_member(component_from_raw(c), to_value(o)) }
}

#[no_mangle]
pub extern "C" fn omni_sym_acquire_handle(c: CComponent) {
    unsafe { crate::component::sym_acquire_handle(component_from_raw(c)) }
}

#[no_mangle]
pub extern "C" fn omni_sym_release_handle(c: CComponent) {
    unsafe { crate::component::sym_release_handle(component_from_raw(c)) }
}

/// Returns an opaque tether token; pass it back to `omni_sym_tether_end`.
#[no_mangle]
pub extern "C" fn omni_sym_tether_begin(c: CComponent) -> *mut std::ffi::c_void {
    unsafe {
        let token = Box::new(crate::component::sym_tether_begin(component_from_raw(c)));
        Box::into_raw(token) as *mut std::ffi::c_void
    }
}

#[no_mangle]
pub extern "C" fn omni_sym_tether_end(token: *mut std::ffi::c_void) {
    unsafe {
        let token = Box::from_raw(token as *mut crate::component::TetherToken);
        crate::component::sym_tether_end(*token);
    }
}

// --- atoms -----------------------------------------------------------------

pub type CAtom = CValue;

#[no_mangle]
pub extern "C" fn omni_make_atom(initial: CValue, region: *const RegionInner, merge_threshold: usize) -> CAtom {
    unsafe {
        let r = borrow_region(region);
        from_value(crate::atom::make_atom(to_value(initial), &r, merge_threshold))
    }
}

#[no_mangle]
pub extern "C" fn omni_atom_deref(atom: CAtom) -> CValue {
    unsafe { from_value(crate::atom::atom_deref(to_value(atom))) }
}

#[no_mangle]
pub extern "C" fn omni_atom_reset(
    atom: CAtom,
    new_value: CValue,
    region: *const RegionInner,
    merge_threshold: usize,
) -> CValue {
    unsafe {
        let r = borrow_region(region);
        from_value(crate::atom::atom_reset(to_value(atom), to_value(new_value), &r, merge_threshold))
    }
}

#[no_mangle]
pub extern "C" fn omni_atom_cas(
    atom: CAtom,
    expected: CValue,
    new_value: CValue,
    region: *const RegionInner,
    merge_threshold: usize,
) -> c_int {
    unsafe {
        let r = borrow_region(region);
        crate::atom::atom_cas(to_value(atom), to_value(expected), to_value(new_value), &r, merge_threshold)
            as c_int
    }
}

// --- fibers, threads & channels -----------------------------------------------

/// Case kinds for `omni_fiber_select`, matching spec.md §6's
/// `{SEND, RECV, DEFAULT}`. `Default` is an output-only kind (reported
/// back when no case was ready); a `CSelectCase` passed as input must use
/// `Send` or `Recv`.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CSelectKind {
    Send = 0,
    Recv = 1,
    Default = 2,
}

pub type CChannel = *const crate::channel::ChannelInner;

/// One arm of a `select`, marshaled across the C boundary as a flat
/// struct. `send_value` is read only when `kind == CSelectKind::Send`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CSelectCase {
    pub kind: CSelectKind,
    pub channel: CChannel,
    pub send_value: CValue,
}

pub type CThreadHandle = *const crate::fiber::ThreadHandleInner;
pub type COsThreadHandle = *const crate::fiber::OsThreadHandle;

unsafe fn borrow_thread_handle(ptr: CThreadHandle) -> Arc<crate::fiber::ThreadHandleInner> {
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

unsafe fn borrow_os_thread_handle(ptr: COsThreadHandle) -> Arc<crate::fiber::OsThreadHandle> {
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

#[no_mangle]
pub extern "C" fn omni_make_channel(capacity: usize, region: *const RegionInner) -> CChannel {
    unsafe {
        let r = borrow_region(region);
        Box::into_raw(Box::new(crate::channel::make_channel(capacity, &r)))
    }
}

#[no_mangle]
pub extern "C" fn omni_channel_send(ch: CChannel, v: CValue, merge_threshold: usize) -> c_int {
    unsafe {
        match (*ch).send(merge_threshold, to_value(v)) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }
}

#[no_mangle]
pub extern "C" fn omni_channel_recv(ch: CChannel) -> CValue {
    unsafe {
        match (*ch).recv() {
            Ok(v) => from_value(v),
            Err(_) => C_NOTHING,
        }
    }
}

#[no_mangle]
pub extern "C" fn omni_channel_try_send(ch: CChannel, v: CValue, merge_threshold: usize) -> c_int {
    unsafe { matches!((*ch).try_send(merge_threshold, to_value(v)), Ok(true)) as c_int }
}

#[no_mangle]
pub extern "C" fn omni_channel_try_recv(ch: CChannel, out: *mut CValue, ok: *mut c_int) {
    unsafe {
        match (*ch).try_recv() {
            Ok(Some(v)) => {
                *out = from_value(v);
                *ok = 1;
            }
            _ => *ok = 0,
        }
    }
}

#[no_mangle]
pub extern "C" fn omni_channel_close(ch: CChannel) {
    unsafe { (*ch).close() }
}

#[no_mangle]
pub extern "C" fn omni_fiber_yield() {
    crate::fiber::fiber_yield();
}

/// Block until `handle`'s fiber has finished, returning the value it
/// produced. `handle` crosses the boundary the same way a region handle
/// does: a borrowed `Arc`, not consumed by this call.
#[no_mangle]
pub extern "C" fn omni_fiber_join(handle: CThreadHandle) -> CValue {
    unsafe {
        let h = borrow_thread_handle(handle);
        from_value(crate::fiber::fiber_join(&h))
    }
}

/// Block until `handle`'s Tier-1 OS thread has finished, returning the
/// value it produced.
#[no_mangle]
pub extern "C" fn omni_thread_join(handle: COsThreadHandle) -> CValue {
    unsafe {
        let h = borrow_os_thread_handle(handle);
        from_value(crate::fiber::thread_join(&h))
    }
}

/// Poll `cases` (an array of `n_cases` `CSelectCase`s, each `Send` or
/// `Recv`) and write the outcome into the `out_*` pointers: `out_kind` is
/// `Send`/`Recv` for whichever case fired or `Default` if `default_case`
/// was set and nothing was ready on the first sweep; `out_index` is that
/// case's position in `cases`; `out_value` is the received value (`Recv`)
/// or `nothing` otherwise.
#[no_mangle]
pub extern "C" fn omni_fiber_select(
    cases: *const CSelectCase,
    n_cases: usize,
    default_case: c_int,
    merge_threshold: usize,
    out_kind: *mut CSelectKind,
    out_index: *mut usize,
    out_value: *mut CValue,
) {
    unsafe {
        let raw_cases = std::slice::from_raw_parts(cases, n_cases);
        let owned_cases: Vec<crate::channel::SelectCase> = raw_cases
            .iter()
            .map(|c| match c.kind {
                CSelectKind::Send => crate::channel::SelectCase::Send(&*c.channel, to_value(c.send_value)),
                CSelectKind::Recv => crate::channel::SelectCase::Recv(&*c.channel),
                CSelectKind::Default => {
                    panic!("omni_fiber_select: CSelectKind::Default is not a valid input case kind")
                }
            })
            .collect();
        match crate::channel::fiber_select(merge_threshold, &owned_cases, default_case != 0) {
            crate::channel::SelectResult::Sent(i) => {
                *out_kind = CSelectKind::Send;
                *out_index = i;
                *out_value = C_NOTHING;
            }
            crate::channel::SelectResult::Received(i, v) => {
                *out_kind = CSelectKind::Recv;
                *out_index = i;
                *out_value = from_value(v);
            }
            crate::channel::SelectResult::Default => {
                *out_kind = CSelectKind::Default;
                *out_index = 0;
                *out_value = C_NOTHING;
            }
        }
    }
}
