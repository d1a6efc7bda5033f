//! L1: region allocator — inline buffer + chunk list, accounting, lifetime
//! ranks, ancestry and merge.
//!
//! The teacher runtime's `PageMgr`/`Region` (`pages.rs`, `gc.rs`) carve a
//! process-wide mmap'd page space into fixed 16 KiB pages for a tracing
//! collector's pools. This runtime's regions are a different animal — a
//! caller-scoped arena with a lifetime rank, not a GC generation — but the
//! bump-pointer-then-chunk-list allocation strategy and the
//! mmap-a-new-block-on-overflow fallback are carried over directly.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::thread::ThreadId;

use log::{debug, trace};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use crate::value::Value;

/// 16-bit owning-region id, per spec.md §3. `0` is reserved for the
/// process-wide global region.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct RegionId(pub u16);

pub const GLOBAL_REGION_ID: RegionId = RegionId(0);

/// Default size for the region's embedded inline buffer, matching the
/// teacher's practice of keeping small, common-case allocations out of any
/// chunk list entirely.
pub const INLINE_BUF_SIZE: usize = 256;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

static NEXT_REGION_ID: AtomicU16 = AtomicU16::new(1);

struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    offset: AtomicUsize,
}

unsafe impl Send for Chunk {}

impl Chunk {
    fn new(size: usize) -> Chunk {
        let layout = Layout::from_size_align(size, 16).expect("region chunk layout");
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr).expect("region chunk allocation failed");
        Chunk {
            ptr,
            layout,
            capacity: size,
            offset: AtomicUsize::new(0),
        }
    }

    /// Bump-allocate `n` bytes from this chunk's remaining space, aligned to
    /// `align`. Returns `None` if the chunk can't satisfy the request.
    fn try_alloc(&self, n: usize, align: usize) -> Option<*mut u8> {
        loop {
            let cur = self.offset.load(Ordering::Relaxed);
            let aligned = (cur + align - 1) & !(align - 1);
            let new_off = aligned.checked_add(n)?;
            if new_off > self.capacity {
                return None;
            }
            if self
                .offset
                .compare_exchange(cur, new_off, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(unsafe { self.ptr.as_ptr().add(aligned) });
            }
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

struct InlineBuffer {
    data: [u8; INLINE_BUF_SIZE],
    offset: usize,
    handed_out: bool,
}

impl InlineBuffer {
    fn new() -> Self {
        InlineBuffer {
            data: [0; INLINE_BUF_SIZE],
            offset: 0,
            handed_out: false,
        }
    }

    fn try_alloc(&mut self, n: usize, align: usize) -> Option<*mut u8> {
        let base = self.data.as_mut_ptr() as usize;
        let aligned = (base + self.offset + align - 1) & !(align - 1);
        let new_off = aligned - base + n;
        if new_off > INLINE_BUF_SIZE {
            return None;
        }
        self.offset = new_off;
        self.handed_out = true;
        Some(aligned as *mut u8)
    }
}

/// Accounting counters, reset to zero by [`RegionInner::reset`].
#[derive(Default)]
pub struct RegionStats {
    pub bytes_allocated_total: AtomicUsize,
    pub bytes_allocated_peak: AtomicUsize,
    pub chunk_count: AtomicUsize,
    pub inline_buf_used_bytes: AtomicUsize,
}

impl RegionStats {
    fn record_alloc(&self, n: usize) {
        let total = self.bytes_allocated_total.fetch_add(n, Ordering::Relaxed) + n;
        self.bytes_allocated_peak.fetch_max(total, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.bytes_allocated_total.store(0, Ordering::Relaxed);
        self.bytes_allocated_peak.store(0, Ordering::Relaxed);
        self.chunk_count.store(0, Ordering::Relaxed);
        self.inline_buf_used_bytes.store(0, Ordering::Relaxed);
    }
}

pub struct RegionInner {
    pub id: RegionId,
    rank: AtomicU32,
    rank_explicit: AtomicBool,
    parent: RwLock<Option<RegionId>>,
    pub owner_thread: ThreadId,
    external_rc: AtomicU32,
    exited: AtomicBool,
    /// Non-zero once this region has been merged into another; merges are
    /// resolved lazily (like the component engine's union-find) instead of
    /// rewriting every object's stored region id.
    redirect: AtomicU16,
    inline_buf: Mutex<InlineBuffer>,
    chunks: Mutex<Vec<Chunk>>,
    pub stats: RegionStats,
}

/// Handle type used throughout the public API. Regions are reference
/// counted by the registry below plus the explicit `external_rc` field;
/// the `Arc` only buys us safe shared access to the same `RegionInner`
/// from multiple call sites, it is not itself the ownership mechanism
/// spec.md describes (that's `region_retain_internal`/`region_release_internal`).
pub type Region = std::sync::Arc<RegionInner>;

struct Registry {
    regions: RwLock<HashMap<RegionId, Region>>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    regions: RwLock::new(HashMap::new()),
});

fn register(region: Region) {
    REGISTRY.regions.write().insert(region.id, region);
}

fn lookup(id: RegionId) -> Option<Region> {
    REGISTRY.regions.read().get(&id).cloned()
}

/// Public lookup for callers outside this module (the store barrier needs
/// the full `Region` handle, not just its resolved id).
pub fn lookup_for_barrier(id: RegionId) -> Option<Region> {
    lookup(resolve_region(id))
}

fn unregister(id: RegionId) {
    REGISTRY.regions.write().remove(&id);
}

/// Resolve a region id through any merge redirects (union-find style path
/// compression), returning the id objects allocated under `id` should now
/// be considered owned by. A region's `redirect` field points at itself
/// until it is merged away, so the loop terminates as soon as it reaches a
/// region that hasn't been merged (or the global region, which is never
/// merged).
pub fn resolve_region(id: RegionId) -> RegionId {
    if id == GLOBAL_REGION_ID {
        return id;
    }
    let mut cur = id;
    loop {
        match lookup(cur) {
            Some(r) => {
                let next = RegionId(r.redirect.load(Ordering::Acquire));
                if next == cur {
                    return cur;
                }
                cur = next;
            }
            None => return cur,
        }
    }
}

/// Owning region of a value, resolved through merges. Immediates have no
/// owner; callers must check `is_boxed()` first.
pub fn owner_of(v: Value) -> RegionId {
    debug_assert!(v.is_boxed());
    let raw = unsafe { v.object().header.region_id() };
    resolve_region(raw)
}

pub fn region_create() -> Region {
    let id = RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed));
    let region = std::sync::Arc::new(RegionInner {
        id,
        rank: AtomicU32::new(0),
        rank_explicit: AtomicBool::new(false),
        parent: RwLock::new(None),
        owner_thread: std::thread::current().id(),
        external_rc: AtomicU32::new(0),
        exited: AtomicBool::new(false),
        redirect: AtomicU16::new(id.0),
        inline_buf: Mutex::new(InlineBuffer::new()),
        chunks: Mutex::new(Vec::new()),
        stats: RegionStats::default(),
    });
    register(region.clone());
    trace!("region_create: {:?}", id);
    region
}

/// The reserved global region: process lifetime, outlived by nothing,
/// created lazily on first use.
pub static GLOBAL_REGION: Lazy<Region> = Lazy::new(|| {
    let region = std::sync::Arc::new(RegionInner {
        id: GLOBAL_REGION_ID,
        rank: AtomicU32::new(0),
        rank_explicit: AtomicBool::new(true),
        parent: RwLock::new(None),
        owner_thread: std::thread::current().id(),
        external_rc: AtomicU32::new(1),
        exited: AtomicBool::new(false),
        redirect: AtomicU16::new(GLOBAL_REGION_ID.0),
        inline_buf: Mutex::new(InlineBuffer::new()),
        chunks: Mutex::new(Vec::new()),
        stats: RegionStats::default(),
    });
    register(region.clone());
    region
});

pub fn omni_region_set_parent(r: &Region, parent: &Region) {
    *r.parent.write() = Some(parent.id);
    if !r.rank_explicit.load(Ordering::Relaxed) {
        let new_rank = parent.rank.load(Ordering::Relaxed) + 1;
        r.rank.store(new_rank, Ordering::Relaxed);
    }
}

pub fn omni_region_set_lifetime_rank(r: &Region, k: u32) {
    r.rank.store(k, Ordering::Relaxed);
    r.rank_explicit.store(true, Ordering::Relaxed);
}

pub fn omni_region_get_lifetime_rank(r: &Region) -> u32 {
    r.rank.load(Ordering::Relaxed)
}

/// True iff `a` outlives `b`: `a == b`, or `a` is an ancestor of `b`.
/// Equal-rank siblings never outlive each other (spec.md §9, deliberately
/// conservative). `None` never outlives anything.
pub fn omni_region_outlives(a: Option<&Region>, b: Option<&Region>) -> bool {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };
    if a.id == b.id {
        return true;
    }
    let mut cur = *b.parent.read();
    let mut hops = 0u32;
    while let Some(id) = cur {
        if id == a.id {
            return true;
        }
        hops += 1;
        if hops > 1 << 20 {
            // corrupt/cyclic ancestry: bug, not a recoverable condition
            panic!("omni_region_outlives: ancestry chain too long, likely cyclic parent links");
        }
        cur = match lookup(id) {
            Some(r) => *r.parent.read(),
            None => None,
        };
    }
    false
}

/// Allocate `n` bytes aligned to `align`, trying the inline buffer, then
/// the head chunk's bump frontier, then a fresh chunk.
pub fn region_alloc(r: &Region, n: usize, align: usize) -> *mut u8 {
    if let Some(p) = r.inline_buf.lock().try_alloc(n, align) {
        r.stats.inline_buf_used_bytes.fetch_add(n, Ordering::Relaxed);
        r.stats.record_alloc(n);
        return p;
    }
    let mut chunks = r.chunks.lock();
    if let Some(head) = chunks.last() {
        if let Some(p) = head.try_alloc(n, align) {
            r.stats.record_alloc(n);
            return p;
        }
    }
    let size = std::cmp::max(DEFAULT_CHUNK_SIZE, round_up(n, align));
    let chunk = Chunk::new(size);
    let p = chunk.try_alloc(n, align).expect("fresh chunk must satisfy its own sizing allocation");
    chunks.push(chunk);
    r.stats.chunk_count.fetch_add(1, Ordering::Relaxed);
    r.stats.record_alloc(n);
    p
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Tag-aware allocation, identical to `region_alloc` except it additionally
/// records which tag the bytes were requested for (used only for
/// diagnostics/`memdebug` bookkeeping, never for behavior).
pub fn region_alloc_typed(r: &Region, n: usize, tag: crate::value::Tag) -> *mut u8 {
    let p = region_alloc(r, n, 16);
    if cfg!(feature = "memdebug") {
        debug!("region_alloc_typed: {:?} bytes for {:?} in {:?}", n, tag, r.id);
    }
    p
}

/// `region_realloc` per spec.md §4.2: arena semantics, old space is never
/// reclaimed.
pub unsafe fn region_realloc(r: &Region, p: *mut u8, old: usize, new: usize) -> *mut u8 {
    if new <= old {
        return p;
    }
    if p.is_null() && old == 0 {
        return region_alloc(r, new, 16);
    }
    let fresh = region_alloc(r, new, 16);
    std::ptr::copy_nonoverlapping(p, fresh, old);
    fresh
}

pub fn region_exit(r: &Region) {
    r.exited.store(true, Ordering::Relaxed);
    if r.external_rc.load(Ordering::Relaxed) == 0 {
        region_destroy_if_dead(r);
    }
}

pub fn region_destroy_if_dead(r: &Region) {
    if r.exited.load(Ordering::Relaxed) && r.external_rc.load(Ordering::Relaxed) == 0 {
        r.chunks.lock().clear();
        unregister(r.id);
        debug!("region destroyed: {:?}", r.id);
    }
}

pub fn region_reset(r: &Region) {
    r.chunks.lock().clear();
    let mut inline = r.inline_buf.lock();
    inline.offset = 0;
    inline.handed_out = false;
    r.stats.reset();
}

pub fn region_retain_internal(r: &Region) {
    r.external_rc.fetch_add(1, Ordering::AcqRel);
}

pub fn region_release_internal(r: &Region) {
    let prev = r.external_rc.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "region_release_internal underflow");
    if prev == 1 {
        region_destroy_if_dead(r);
    }
}

/// `false` if the regions live on different owner threads, if `src` has
/// handed out an inline-buffer pointer (those can't move), or if `src`
/// and `dst` are the same region.
pub fn region_merge_permitted(src: &Region, dst: &Region) -> bool {
    if src.id == dst.id {
        return false;
    }
    if src.owner_thread != dst.owner_thread {
        return false;
    }
    if src.inline_buf.lock().handed_out {
        return false;
    }
    true
}

/// Splice `src`'s chunks onto `dst` and mark `src` as redirected to `dst`,
/// so that subsequent `owner_of` lookups for objects allocated under `src`
/// resolve to `dst` without visiting the heap.
pub fn region_merge_safe(src: &Region, dst: &Region) {
    debug_assert!(region_merge_permitted(src, dst));
    let mut src_chunks = src.chunks.lock();
    let mut dst_chunks = dst.chunks.lock();
    dst_chunks.append(&mut src_chunks);
    dst.stats.bytes_allocated_total.fetch_add(
        src.stats.bytes_allocated_total.load(Ordering::Relaxed),
        Ordering::Relaxed,
    );
    dst.stats.chunk_count.fetch_add(src.stats.chunk_count.load(Ordering::Relaxed), Ordering::Relaxed);
    src.redirect.store(dst.id.0, Ordering::Release);
    src.stats.reset();
    debug!("region_merge_safe: {:?} -> {:?}", src.id, dst.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outlives_reflexive_and_ancestry() {
        let dst = region_create();
        let src = region_create();
        omni_region_set_parent(&src, &dst);
        assert!(omni_region_outlives(Some(&dst), Some(&dst)));
        assert!(omni_region_outlives(Some(&dst), Some(&src)));
        assert!(!omni_region_outlives(Some(&src), Some(&dst)));
    }

    #[test]
    fn siblings_do_not_outlive() {
        let parent = region_create();
        let a = region_create();
        let b = region_create();
        omni_region_set_parent(&a, &parent);
        omni_region_set_parent(&b, &parent);
        assert_eq!(omni_region_get_lifetime_rank(&a), omni_region_get_lifetime_rank(&b));
        assert!(!omni_region_outlives(Some(&a), Some(&b)));
        assert!(!omni_region_outlives(Some(&b), Some(&a)));
    }

    #[test]
    fn none_never_outlives() {
        let r = region_create();
        assert!(!omni_region_outlives(None, Some(&r)));
        assert!(!omni_region_outlives(Some(&r), None));
        assert!(!omni_region_outlives(None, None));
    }

    #[test]
    fn alloc_inline_then_chunk() {
        let r = region_create();
        let p1 = region_alloc(&r, 32, 8);
        assert!(!p1.is_null());
        assert_eq!(r.stats.bytes_allocated_total.load(Ordering::Relaxed), 32);
        let p2 = region_alloc(&r, INLINE_BUF_SIZE * 2, 8);
        assert!(!p2.is_null());
        assert!(r.stats.chunk_count.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn realloc_noop_when_shrinking() {
        let r = region_create();
        let p = region_alloc(&r, 64, 8);
        let p2 = unsafe { region_realloc(&r, p, 64, 32) };
        assert_eq!(p, p2);
    }

    #[test]
    fn reset_zeroes_counters() {
        let r = region_create();
        region_alloc(&r, 64, 8);
        region_reset(&r);
        assert_eq!(r.stats.bytes_allocated_total.load(Ordering::Relaxed), 0);
        assert_eq!(r.stats.chunk_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn exit_survives_external_retain() {
        let r = region_create();
        region_retain_internal(&r);
        region_exit(&r);
        assert!(lookup(r.id).is_some());
        region_release_internal(&r);
        assert!(lookup(r.id).is_none());
    }

    #[test]
    fn merge_permitted_rejects_same_region_and_inline_handout() {
        let a = region_create();
        let b = region_create();
        assert!(!region_merge_permitted(&a, &a));
        assert!(region_merge_permitted(&a, &b));
        region_alloc(&a, 4, 4); // hands out an inline pointer
        assert!(!region_merge_permitted(&a, &b));
    }

    #[test]
    fn exit_twice_is_idempotent() {
        let r = region_create();
        region_exit(&r);
        region_exit(&r);
        assert!(lookup(r.id).is_none());
    }

    proptest::proptest! {
        // P3: once external_rc drops to zero after exit, the region is gone
        // no matter how many retains/releases preceded it.
        #[test]
        fn p3_dead_region_is_unreachable_after_balanced_retains(n_retains in 0u32..8) {
            let r = region_create();
            for _ in 0..n_retains {
                region_retain_internal(&r);
            }
            for _ in 0..n_retains {
                region_release_internal(&r);
            }
            region_exit(&r);
            region_destroy_if_dead(&r);
            assert!(lookup(r.id).is_none());
        }

        // P6: region_reset always leaves every counter at zero, regardless
        // of how much was allocated beforehand.
        #[test]
        fn p6_reset_zeroes_counters_after_any_allocation(n_allocs in 0usize..16, size in 1usize..512) {
            let r = region_create();
            for _ in 0..n_allocs {
                region_alloc(&r, size, 8);
            }
            region_reset(&r);
            assert_eq!(r.stats.bytes_allocated_total.load(Ordering::Relaxed), 0);
            assert_eq!(r.stats.chunk_count.load(Ordering::Relaxed), 0);
            assert_eq!(r.stats.inline_buf_used_bytes.load(Ordering::Relaxed), 0);
        }

        // I1: region_exit is idempotent no matter how many times it's called.
        #[test]
        fn i1_exit_is_idempotent_for_any_call_count(n_calls in 1u32..6) {
            let r = region_create();
            for _ in 0..n_calls {
                region_exit(&r);
            }
            assert!(lookup(r.id).is_none());
        }

        // L3: a merge always leaves every byte previously accounted to `src`
        // folded into `dst`'s stats, whatever the pre-merge allocation size.
        #[test]
        fn l3_merge_transfers_accounted_bytes(size in (INLINE_BUF_SIZE + 1)..2000) {
            let src = region_create();
            let dst = region_create();
            // size exceeds the inline buffer so this always lands in a
            // chunk, keeping `region_merge_permitted` satisfied below.
            region_alloc(&src, size, 8);
            let src_bytes = src.stats.bytes_allocated_total.load(Ordering::Relaxed);
            let dst_before = dst.stats.bytes_allocated_total.load(Ordering::Relaxed);
            region_merge_safe(&src, &dst);
            assert_eq!(
                dst.stats.bytes_allocated_total.load(Ordering::Relaxed),
                dst_before + src_bytes
            );
            assert_eq!(resolve_region(src.id), dst.id);
        }
    }
}
