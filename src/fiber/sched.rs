//! The fiber scheduler.
//!
//! Fibers are backed by OS threads, one thread per fiber, but at most one of
//! them executes user code at any instant. The whole scheduler state lives
//! behind a single process-wide mutex (the "gate"); every fiber owns a
//! condition variable waited with the gate's guard. A context switch is a
//! hand-off: the outgoing thread signals the incoming fiber's condvar and
//! parks on its own, so the kernel threads serve as stack-preserving
//! continuations rather than as a source of parallelism.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use once_cell::sync::OnceCell;

use crate::error::Error;
use crate::traceback;

/// Priority of the event loop fiber. User fibers are capped one below it.
pub(crate) const IDLE_PRIORITY: u8 = 127;
pub(crate) const MAX_PRIORITY: u8 = IDLE_PRIORITY - 1;

pub type FiberId = u64;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // The fiber bound to this OS thread. Fibers never migrate between
    // threads, so "who am I" needs no locking.
    static CURRENT_FCB: RefCell<Option<Arc<Fcb>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// FiberState
////////////////////////////////////////////////////////////////////////////////

/// The five states of a fiber's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FiberState {
    /// Not runnable, not queued, not executing.
    Suspended = 0,
    /// Runnable, present on the ready queue.
    Ready = 1,
    /// Executing. Exactly one fiber is in this state at any time.
    Current = 2,
    /// A resume arrived while the fiber was already running; the next
    /// suspend degrades to a yield instead of a true suspension.
    Resumed = 3,
    /// The fiber's body returned or unwound. Terminal.
    Stopped = 4,
}

impl FiberState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Suspended,
            1 => Self::Ready,
            2 => Self::Current,
            3 => Self::Resumed,
            4 => Self::Stopped,
            _ => unreachable!("corrupt fiber state"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fcb
////////////////////////////////////////////////////////////////////////////////

/// Fiber control block: all per-fiber runtime state.
///
/// The state machine fields are only mutated under the gate; the atomics make
/// the block shareable across the backing threads without extra locking on
/// the hot read paths.
pub(crate) struct Fcb {
    pub(crate) id: FiberId,
    pub(crate) name: String,
    pub(crate) prio: u8,
    state: AtomicU8,
    pub(crate) cancelled: AtomicBool,
    /// Context switches out of this fiber, for introspection.
    pub(crate) csw: AtomicU64,
    /// Retires pending timer entries: an expiry only resumes the fiber while
    /// its recorded sequence number is still the latest one.
    pub(crate) sleep_seq: AtomicU64,
    /// Signaled to hand the execution slot to this fiber.
    cond: Condvar,
    /// Fibers blocked in `join` on this one, released in arrival order.
    waiters: Mutex<Vec<Arc<Fcb>>>,
    saved_traceback: Mutex<traceback::Saved>,
    /// The backing OS thread, reaped after the fiber stops.
    pub(crate) thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Fcb {
    fn new(name: String, prio: u8) -> Self {
        Fcb {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            name,
            prio,
            state: AtomicU8::new(FiberState::Suspended as u8),
            cancelled: AtomicBool::new(false),
            csw: AtomicU64::new(0),
            sleep_seq: AtomicU64::new(0),
            cond: Condvar::new(),
            waiters: Mutex::new(Vec::new()),
            saved_traceback: Mutex::new(traceback::Saved::default()),
            thread: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Fcb {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fcb")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("prio", &self.prio)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

/// State behind the gate.
pub(crate) struct Sched {
    current: Arc<Fcb>,
    /// Sorted by descending priority, FIFO within a priority.
    ready: VecDeque<Arc<Fcb>>,
    main: Arc<Fcb>,
    idle: Option<Arc<Fcb>>,
}

pub(crate) struct Scheduler {
    gate: Mutex<Sched>,
}

static SCHEDULER: OnceCell<Scheduler> = OnceCell::new();

/// Abort with a diagnostic. Scheduler invariant violations and API misuse
/// never propagate as errors.
pub(crate) fn fatal(msg: &str) -> ! {
    eprintln!("{}", msg);
    std::process::abort();
}

fn instance() -> &'static Scheduler {
    match SCHEDULER.get() {
        Some(s) => s,
        None => fatal("fiber runtime is not initialized, call fiber::init() first"),
    }
}

pub(crate) fn is_initialized() -> bool {
    SCHEDULER.get().is_some()
}

fn lock_gate() -> MutexGuard<'static, Sched> {
    instance()
        .gate
        .lock()
        .unwrap_or_else(|_| fatal("scheduler gate poisoned"))
}

impl Sched {
    /// Insert preserving descending priority, appending at the end of the
    /// tie group so equal priorities dequeue first-in first-out.
    fn ready_push(&mut self, fcb: Arc<Fcb>) {
        let pos = self
            .ready
            .iter()
            .position(|f| f.prio < fcb.prio)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, fcb);
    }

    fn ready_pop(&mut self) -> Arc<Fcb> {
        match self.ready.pop_front() {
            Some(fcb) => fcb,
            // The idle fiber must always be present; an empty queue means it
            // was dequeued without being re-enqueued.
            None => fatal("no ready fiber"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Context switch
////////////////////////////////////////////////////////////////////////////////

/// Hand the execution slot from `out` (the caller's fiber) to `in_f`.
///
/// The outgoing thread snapshots the running traceback, signals the incoming
/// fiber and parks on its own condvar; the gate travels with the hand-off.
/// Returns once somebody hands the slot back, except when `out` has stopped,
/// in which case the backing thread is done and must exit.
fn swap(mut gate: MutexGuard<'static, Sched>, in_f: Arc<Fcb>, out: &Arc<Fcb>) {
    gate.current = Arc::clone(&in_f);
    out.csw.fetch_add(1, Ordering::Relaxed);
    traceback::save_into(&out.saved_traceback);
    in_f.cond.notify_one();

    if out.state() == FiberState::Stopped {
        // Final hand-off, nothing will ever wake this fiber again.
        return;
    }

    while out.state() != FiberState::Current {
        gate = out
            .cond
            .wait(gate)
            .unwrap_or_else(|_| fatal("scheduler gate poisoned"));
    }
    traceback::restore_from(&out.saved_traceback);
}

/// Precondition: the caller runs on the current fiber's thread and has
/// already moved its own state out of `Current` (to `Ready`, `Suspended` or
/// `Stopped`). Picks the best ready fiber and switches to it.
fn reschedule(mut gate: MutexGuard<'static, Sched>) {
    let in_f = gate.ready_pop();
    in_f.set_state(FiberState::Current);
    let out = Arc::clone(&gate.current);
    if Arc::ptr_eq(&in_f, &out) {
        // Self-ready fast path: the caller re-queued itself and is still the
        // best candidate, no switch happens.
        return;
    }
    swap(gate, in_f, &out);
}

fn suspend_locked(mut gate: MutexGuard<'static, Sched>, me: &Arc<Fcb>) {
    if me.state() == FiberState::Resumed {
        // Someone resumed us while we were running: this suspension is a
        // plain yield.
        me.set_state(FiberState::Ready);
        gate.ready_push(Arc::clone(me));
    } else {
        me.set_state(FiberState::Suspended);
    }
    reschedule(gate);
}

fn resume_locked(gate: &mut Sched, fcb: &Arc<Fcb>) {
    match fcb.state() {
        FiberState::Suspended => {
            fcb.set_state(FiberState::Ready);
            gate.ready_push(Arc::clone(fcb));
        }
        // Memoize the resume so the next suspend becomes a yield.
        FiberState::Current => fcb.set_state(FiberState::Resumed),
        // Idempotent on fibers that are already runnable or done.
        FiberState::Ready | FiberState::Resumed | FiberState::Stopped => {}
    }
}

////////////////////////////////////////////////////////////////////////////////
// Primitives
////////////////////////////////////////////////////////////////////////////////

/// The fiber bound to the calling thread.
pub(crate) fn current_fcb() -> Arc<Fcb> {
    CURRENT_FCB.with(|c| match &*c.borrow() {
        Some(fcb) => Arc::clone(fcb),
        None => fatal("fiber API used from a thread that is not a fiber"),
    })
}

/// Like [`current_fcb`] but usable from any thread, e.g. inside the logger.
pub(crate) fn current_name() -> Option<String> {
    CURRENT_FCB.with(|c| c.borrow().as_ref().map(|fcb| fcb.name.clone()))
}

/// Block the current fiber until somebody resumes it.
///
/// Returns `false` iff the fiber was cancelled, either before the call or
/// while suspended.
pub(crate) fn suspend_current() -> bool {
    let gate = lock_gate();
    let me = Arc::clone(&gate.current);
    if me.cancelled.load(Ordering::Relaxed) {
        return false;
    }
    suspend_locked(gate, &me);
    !me.cancelled.load(Ordering::Relaxed)
}

/// Re-enqueue the current fiber and give every higher- or equal-priority
/// ready fiber (the event loop included) a chance to run.
pub(crate) fn yield_current() {
    let mut gate = lock_gate();
    let me = Arc::clone(&gate.current);
    if me.state() == FiberState::Resumed {
        // The memoized resume already bought us the slot.
        me.set_state(FiberState::Current);
        return;
    }
    me.set_state(FiberState::Ready);
    gate.ready_push(Arc::clone(&me));
    reschedule(gate);
}

/// Make `fcb` runnable. Safe to call from event loop completion callbacks
/// (which run on the idle fiber's thread). Idempotent on `Ready`, `Resumed`
/// and `Stopped` fibers.
pub(crate) fn resume_fcb(fcb: &Arc<Fcb>) {
    let mut gate = lock_gate();
    resume_locked(&mut gate, fcb);
}

/// Set the cooperative cancellation flag. A suspended fiber is woken so its
/// pending suspension observes the flag; a pending sleep expiry is retired.
pub(crate) fn cancel_fcb(fcb: &Arc<Fcb>) {
    let mut gate = lock_gate();
    if let Some(idle) = &gate.idle {
        if Arc::ptr_eq(idle, fcb) {
            fatal("the idle fiber cannot be cancelled");
        }
    }
    if fcb.state() == FiberState::Stopped {
        return;
    }
    fcb.cancelled.store(true, Ordering::Relaxed);
    fcb.sleep_seq.fetch_add(1, Ordering::Relaxed);
    if fcb.state() == FiberState::Suspended {
        fcb.set_state(FiberState::Ready);
        gate.ready_push(Arc::clone(fcb));
    }
}

/// Wait until `target` stops. Returns `true` on completion, `false` if the
/// calling fiber was cancelled first.
///
/// Spurious wake-ups (an explicit resume of the joiner, a memoized resume
/// turning the suspension into a yield) re-enter the wait, so `true` always
/// means the target's body has returned.
pub(crate) fn join_fcb(target: &Arc<Fcb>) -> bool {
    loop {
        let gate = lock_gate();
        if target.state() == FiberState::Stopped {
            return true;
        }
        let me = Arc::clone(&gate.current);
        if Arc::ptr_eq(&me, target) {
            fatal("fiber cannot join itself");
        }
        let mut waiters = target
            .waiters
            .lock()
            .unwrap_or_else(|_| fatal("waiter list poisoned"));
        if me.cancelled.load(Ordering::Relaxed) {
            // Unlink so the eventual release cannot wake an unrelated
            // suspension of this fiber.
            waiters.retain(|w| w.id != me.id);
            return false;
        }
        if !waiters.iter().any(|w| w.id == me.id) {
            waiters.push(Arc::clone(&me));
        }
        drop(waiters);
        suspend_locked(gate, &me);
    }
}

/// Arm the fiber's sleep timer and suspend. Returns `false` iff cancelled
/// before the timer fired.
pub(crate) fn sleep_current(duration: std::time::Duration) -> bool {
    let me = current_fcb();
    if me.cancelled.load(Ordering::Relaxed) {
        return false;
    }
    let seq = me.sleep_seq.fetch_add(1, Ordering::Relaxed) + 1;
    crate::coio::instance().arm_sleep(std::time::Instant::now() + duration, &me, seq);
    let ok = suspend_current();
    // Retire the timer slot whether it fired or not.
    me.sleep_seq.fetch_add(1, Ordering::Relaxed);
    ok
}

////////////////////////////////////////////////////////////////////////////////
// Spawning
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn spawn(
    name: String,
    prio: u8,
    stack_size: Option<usize>,
    body: Box<dyn FnOnce() + Send + 'static>,
) -> crate::Result<Arc<Fcb>> {
    let fcb = Arc::new(Fcb::new(name.clone(), prio));
    let mut builder = thread::Builder::new().name(name);
    if let Some(stack_size) = stack_size {
        builder = builder.stack_size(stack_size);
    }
    let thread_fcb = Arc::clone(&fcb);
    let handle = builder
        .spawn(move || fiber_main(thread_fcb, body))
        .map_err(Error::ThreadSpawn)?;
    *fcb.thread
        .lock()
        .unwrap_or_else(|_| fatal("fcb thread slot poisoned")) = Some(handle);

    let mut gate = lock_gate();
    fcb.set_state(FiberState::Ready);
    gate.ready_push(Arc::clone(&fcb));
    log::trace!("fiber '{}' (id {}, prio {}) started", fcb.name, fcb.id, fcb.prio);
    Ok(fcb)
}

/// Entry of every fiber's backing thread: park until scheduled for the first
/// time, run the body under a catch-all, stop, release the joiners and hand
/// the slot off for the last time.
fn fiber_main(fcb: Arc<Fcb>, body: Box<dyn FnOnce() + Send>) {
    CURRENT_FCB.with(|c| *c.borrow_mut() = Some(Arc::clone(&fcb)));
    {
        let mut gate = lock_gate();
        while fcb.state() != FiberState::Current {
            gate = fcb
                .cond
                .wait(gate)
                .unwrap_or_else(|_| fatal("scheduler gate poisoned"));
        }
        // A fresh fiber's empty snapshot initializes its traceback roots.
        traceback::restore_from(&fcb.saved_traceback);
    }

    let result = panic::catch_unwind(AssertUnwindSafe(body));
    if result.is_err() {
        log::error!("fiber '{}' terminated with an unhandled error", fcb.name);
        traceback::print_stderr();
    }

    let mut gate = lock_gate();
    fcb.set_state(FiberState::Stopped);
    let waiters: Vec<_> = fcb
        .waiters
        .lock()
        .unwrap_or_else(|_| fatal("waiter list poisoned"))
        .drain(..)
        .collect();
    for waiter in waiters {
        resume_locked(&mut gate, &waiter);
    }
    reschedule(gate);
    // The hand-off saw the Stopped state and returned: the thread is done.
    log::trace!("fiber '{}' (id {}) stopped", fcb.name, fcb.id);
}

////////////////////////////////////////////////////////////////////////////////
// Idle fiber
////////////////////////////////////////////////////////////////////////////////

/// Body of the event loop fiber: one event loop iteration per scheduling
/// turn. It blocks in the poll exactly when no other fiber is ready, and it
/// aborts the process when the loop has no pending work and every fiber is
/// suspended, which can never resolve itself.
fn idle_main() {
    let event_loop = crate::coio::instance();
    loop {
        let block = lock_gate().ready.is_empty();
        let active = event_loop.run_once(block);

        let mut gate = lock_gate();
        if !active && gate.ready.is_empty() {
            eprintln!("all fibers suspended and no pending IO");
            std::process::exit(1);
        }

        let me = Arc::clone(&gate.current);
        me.set_state(FiberState::Ready);
        gate.ready_push(Arc::clone(&me));
        idle_handoff(gate, &me);
    }
}

/// Hand the slot to the best ready *user* fiber while staying queued at the
/// head, so that the very next yield or suspend returns the slot to the
/// event loop. With no user fiber ready this degenerates to the self-ready
/// fast path and the loop polls again, blocking.
fn idle_handoff(mut gate: MutexGuard<'static, Sched>, me: &Arc<Fcb>) {
    let next = gate.ready.iter().position(|f| !Arc::ptr_eq(f, me));
    match next {
        None => reschedule(gate),
        Some(pos) => {
            let in_f = gate.ready.remove(pos).expect("position was just found");
            in_f.set_state(FiberState::Current);
            swap(gate, in_f, me);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Init
////////////////////////////////////////////////////////////////////////////////

/// Bind the calling thread as the main fiber and spawn the idle fiber. The
/// event loop must already exist.
pub(crate) fn init() -> crate::Result<()> {
    let main = Arc::new(Fcb::new("main".into(), 0));
    main.set_state(FiberState::Current);
    let scheduler = Scheduler {
        gate: Mutex::new(Sched {
            current: Arc::clone(&main),
            ready: VecDeque::new(),
            main: Arc::clone(&main),
            idle: None,
        }),
    };
    if SCHEDULER.set(scheduler).is_err() {
        fatal("fiber runtime is already initialized");
    }
    CURRENT_FCB.with(|c| *c.borrow_mut() = Some(main));

    let idle = spawn("idle".into(), IDLE_PRIORITY, None, Box::new(idle_main))?;
    lock_gate().idle = Some(idle);
    Ok(())
}

/// The main fiber's control block.
pub(crate) fn main_fcb() -> Arc<Fcb> {
    Arc::clone(&lock_gate().main)
}
