//! L6: cooperative fiber scheduling.
//!
//! Each fiber is backed by a real OS thread, but a single scheduler mutex
//! plus condvar ensures only one fiber's thread actually runs at a time
//! within a given [`Scheduler`] scope — the externally visible contract
//! (FIFO ready queue, suspension only at `fiber_yield`/a blocking channel
//! op/`fiber_join`, no preemption between suspension points) is identical
//! to real stack-switching, just implemented without it. See DESIGN.md for
//! why this port takes that trade instead of hand-written stack-switch
//! assembly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::value::Value;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FiberId(pub u64);

/// Internal scheduler state shared by every fiber spawned within one
/// [`Scheduler`] scope.
struct SchedulerState {
    ready: VecDeque<FiberId>,
    running: Option<FiberId>,
    finished: std::collections::HashMap<FiberId, Value>,
    cancelled: std::collections::HashSet<FiberId>,
    live_count: usize,
}

pub struct Scheduler {
    state: Mutex<SchedulerState>,
    cv: Condvar,
}

impl Scheduler {
    fn new() -> Arc<Scheduler> {
        Arc::new(Scheduler {
            state: Mutex::new(SchedulerState {
                ready: VecDeque::new(),
                running: None,
                finished: std::collections::HashMap::new(),
                cancelled: std::collections::HashSet::new(),
                live_count: 0,
            }),
            cv: Condvar::new(),
        })
    }

    /// Block the calling OS thread until `id` is at the front of the ready
    /// queue (or is the only live fiber left), then mark it running.
    fn wait_for_turn(&self, id: FiberId) {
        let mut state = self.state.lock();
        loop {
            let my_turn = state.running.is_none()
                && (state.ready.front() == Some(&id) || state.ready.is_empty());
            if my_turn {
                if let Some(pos) = state.ready.iter().position(|x| *x == id) {
                    state.ready.remove(pos);
                }
                state.running = Some(id);
                return;
            }
            self.cv.wait(&mut state);
        }
    }

    /// Hand control to the next ready fiber (or leave the scheduler idle
    /// if the ready queue is empty).
    fn yield_turn(&self, id: FiberId, requeue: bool) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.running, Some(id));
        state.running = None;
        if requeue {
            state.ready.push_back(id);
        }
        self.cv.notify_all();
    }
}

/// Handle stored inside a `Payload::Thread`, giving callers a way to join
/// a fiber and retrieve its result through the object graph.
pub struct ThreadHandleInner {
    pub id: FiberId,
    scheduler: Arc<Scheduler>,
    cancel_flag: Arc<AtomicBool>,
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

thread_local! {
    static CURRENT: std::cell::Cell<Option<(Arc<Scheduler>, FiberId)>> = std::cell::Cell::new(None);
}

/// Run `body` as a scheduler scope: every `spawn_fiber` call inside it
/// joins the same cooperative ready queue, and the scope itself blocks
/// until every fiber spawned within it has finished (spec.md §4.6,
/// "a scheduler scope owns its fibers").
pub fn with_fibers<F, R>(body: F) -> R
where
    F: FnOnce(&Arc<Scheduler>) -> R,
{
    let scheduler = Scheduler::new();
    let r = body(&scheduler);
    loop {
        let done = {
            let state = scheduler.state.lock();
            state.live_count == 0
        };
        if done {
            break;
        }
        std::thread::yield_now();
    }
    r
}

/// Spawn a fiber running `body` on the given scheduler. Returns a
/// `Payload::Thread`-ready handle.
pub fn spawn_fiber<F>(scheduler: &Arc<Scheduler>, body: F) -> Arc<ThreadHandleInner>
where
    F: FnOnce() -> Value + Send + 'static,
{
    let id = FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed));
    let cancel_flag = Arc::new(AtomicBool::new(false));
    {
        let mut state = scheduler.state.lock();
        state.ready.push_back(id);
        state.live_count += 1;
    }
    let scheduler_clone = scheduler.clone();
    let cancel_clone = cancel_flag.clone();
    let thread = std::thread::Builder::new()
        .name(format!("fiber-{}", id.0))
        .spawn(move || {
            CURRENT.with(|c| c.set(Some((scheduler_clone.clone(), id))));
            scheduler_clone.wait_for_turn(id);
            trace!("fiber {:?} started", id);
            let result = if cancel_clone.load(Ordering::Acquire) {
                crate::value::NOTHING
            } else {
                body()
            };
            let mut state = scheduler_clone.state.lock();
            state.finished.insert(id, result);
            state.running = None;
            state.live_count -= 1;
            scheduler_clone.cv.notify_all();
            debug!("fiber {:?} finished", id);
        })
        .expect("failed to spawn fiber OS thread");

    Arc::new(ThreadHandleInner {
        id,
        scheduler: scheduler.clone(),
        cancel_flag,
        join_handle: Mutex::new(Some(thread)),
    })
}

/// Suspend the calling fiber, allowing the next ready fiber to run, then
/// resume when it's this fiber's turn again. No-op if called outside a
/// fiber (e.g. from the thread that opened the scheduler scope).
pub fn fiber_yield() {
    let cur = CURRENT.with(|c| c.get());
    if let Some((scheduler, id)) = cur {
        scheduler.yield_turn(id, true);
        scheduler.wait_for_turn(id);
    }
}

/// Block until `handle`'s fiber has finished, returning the value it
/// produced (or `nothing` if it was cancelled before running).
pub fn fiber_join(handle: &ThreadHandleInner) -> Value {
    // Release our own scheduling slot while blocked on the join, so other
    // ready fibers can make progress (spec.md §4.6: joining suspends).
    let cur = CURRENT.with(|c| c.get());
    if let Some((scheduler, id)) = &cur {
        scheduler.yield_turn(*id, false);
    }
    if let Some(jh) = handle.join_handle.lock().take() {
        let _ = jh.join();
    }
    let result = {
        let state = handle.scheduler.state.lock();
        state.finished.get(&handle.id).copied()
    };
    if let Some((scheduler, id)) = cur {
        scheduler.wait_for_turn(id);
    }
    result.unwrap_or(crate::value::NOTHING)
}

/// Request cancellation of a not-yet-started fiber. A fiber already
/// running is left to finish; cancellation only takes effect before its
/// body begins (spec.md §4.6 edge case).
pub fn fiber_cancel(handle: &ThreadHandleInner) {
    handle.cancel_flag.store(true, Ordering::Release);
}

pub fn current_fiber() -> Option<FiberId> {
    CURRENT.with(|c| c.get()).map(|(_, id)| id)
}

/// Tier-1 concurrency (spec.md §5): a bare OS thread with no scheduler
/// coordination, for callers that want real parallelism rather than the
/// cooperative fiber scheduler's one-thread-at-a-time contract.
pub struct OsThreadHandle {
    join_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    result: Arc<Mutex<Option<Value>>>,
}

pub fn spawn_thread<F>(body: F) -> Arc<OsThreadHandle>
where
    F: FnOnce() -> Value + Send + 'static,
{
    let result = Arc::new(Mutex::new(None));
    let result_clone = result.clone();
    let jh = std::thread::spawn(move || {
        *result_clone.lock() = Some(body());
    });
    Arc::new(OsThreadHandle {
        join_handle: Mutex::new(Some(jh)),
        result,
    })
}

pub fn thread_join(handle: &OsThreadHandle) -> Value {
    if let Some(jh) = handle.join_handle.lock().take() {
        let _ = jh.join();
    }
    handle.result.lock().take().unwrap_or(crate::value::NOTHING)
}
