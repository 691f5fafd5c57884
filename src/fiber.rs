//! Cooperative multitasking module.
//!
//! With the fiber module you can create, run and manage
//! [fibers](struct.Fiber.html): units of cooperative concurrency, each with
//! its own stack, multiplexed so that exactly one of them executes at any
//! instant. Scheduling is strictly cooperative: a fiber runs until it
//! suspends, yields, joins, sleeps or blocks in a [`coio`](crate::coio)
//! primitive, and higher-priority runnable fibers always run first.
//!
//! A fiber has five possible states: **suspended**, **ready**, **current**,
//! **resumed** and **stopped** (see [`FiberState`]). A fiber that misbehaves
//! can be stopped cooperatively with [`cancel`]: the flag makes every
//! subsequent suspending call on the target return `false`, and a fiber that
//! never suspends cannot be cancelled at all.
//!
//! Example:
//! ```no_run
//! use filament::fiber;
//!
//! fiber::init().unwrap();
//! let jh = fiber::start(|| {
//!     println!("I'm a fiber");
//!     69
//! });
//! let res = jh.join();
//! assert_eq!(res, Some(69));
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) mod sched;

pub mod cond;
mod csw;

pub use cond::Cond;
pub use csw::check_yield;
pub use csw::csw;
pub use csw::YieldResult;
pub use sched::{FiberId, FiberState};

use crate::error::Error;

macro_rules! impl_debug_stub {
    ($t:ident $($p:tt)*) => {
        impl $($p)* ::std::fmt::Debug for $t $($p)* {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                f.debug_struct(::std::stringify!($t))
                    .finish_non_exhaustive()
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// init
////////////////////////////////////////////////////////////////////////////////

/// Initialize the fiber runtime.
///
/// Must be the first runtime call in the process. It ignores `SIGPIPE`
/// process-wide, creates the event loop, binds the calling thread as the
/// **main fiber** (priority 0, already running) and spawns the **idle
/// fiber**: the highest-priority runtime-owned fiber which drives one event
/// loop iteration per scheduling turn and is the only party that blocks on
/// I/O.
///
/// OS resource failures (thread creation, event loop setup) are returned to
/// the caller. Calling `init` twice is a programmer error and aborts.
pub fn init() -> crate::Result<()> {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    crate::coio::init()?;
    sched::init()
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A cheap cloneable handle to a fiber.
///
/// The handle stays valid after the fiber stops; state queries keep working
/// and [`resume`](Self::resume) / [`cancel`](Self::cancel) become no-ops.
#[derive(Clone)]
pub struct Fiber {
    pub(crate) fcb: Arc<sched::Fcb>,
}

impl Fiber {
    /// Unique id, never reused within a process.
    #[inline]
    pub fn id(&self) -> FiberId {
        self.fcb.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.fcb.name
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.fcb.state()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.fcb.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// See the free function [`resume`].
    #[inline]
    pub fn resume(&self) {
        sched::resume_fcb(&self.fcb);
    }

    /// See the free function [`cancel`].
    #[inline]
    pub fn cancel(&self) {
        sched::cancel_fcb(&self.fcb);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        self.fcb.id == other.fcb.id
    }
}

impl Eq for Fiber {}

impl std::hash::Hash for Fiber {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fcb.id.hash(state)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// Methods can be chained on it in order to configure it.
///
/// The currently supported configurations are:
///
/// * `name`:       specifies an associated name for the fiber
/// * `priority`:   scheduling priority, `0..=126`, higher runs first
/// * `stack_size`: specifies the desired stack size for the fiber
/// * `func`/`proc`: specifies the fiber function (or procedure)
///
/// The [`start`](#method.start) method takes ownership of the builder and
/// returns a [`Result`] to the fiber's join handle.
///
/// [`Result`]: crate::Result
pub struct Builder<F> {
    name: Option<String>,
    priority: u8,
    stack_size: Option<usize>,
    f: F,
}

impl_debug_stub! {Builder<F>}

/// This is a *typestate* helper type representing the state of a [`Builder`]
/// that hasn't been assigned a fiber function yet.
pub struct NoFunc;

impl Builder<NoFunc> {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Builder {
            name: None,
            priority: 0,
            stack_size: None,
            f: NoFunc,
        }
    }

    /// Sets the callee function for the new fiber.
    pub fn func<F, T>(self, f: F) -> Builder<FiberFunc<F, T>>
    where
        F: FnOnce() -> T,
        F: Send + 'static,
        T: Send + 'static,
    {
        Builder {
            name: self.name,
            priority: self.priority,
            stack_size: self.stack_size,
            f: FiberFunc {
                f,
                marker: std::marker::PhantomData,
            },
        }
    }

    /// Sets the callee procedure for the new fiber.
    pub fn proc<F>(self, f: F) -> Builder<FiberProc<F>>
    where
        F: FnOnce(),
        F: Send + 'static,
    {
        Builder {
            name: self.name,
            priority: self.priority,
            stack_size: self.stack_size,
            f: FiberProc { f },
        }
    }
}

impl Default for Builder<NoFunc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Builder<F> {
    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the scheduling priority, `0..=126`. Higher priorities run first;
    /// equal priorities run in enqueue order. The topmost level is reserved
    /// for the idle fiber, so [`Error::InvalidPriority`] is returned for it.
    pub fn priority(mut self, priority: u8) -> crate::Result<Self> {
        if priority > sched::MAX_PRIORITY {
            return Err(Error::InvalidPriority(priority));
        }
        self.priority = priority;
        Ok(self)
    }

    /// Sets the size of the stack (in bytes) for the new fiber.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}

impl<C> Builder<C>
where
    C: Callee,
{
    /// Spawns a new fiber by taking ownership of the `Builder`, and returns
    /// a [`Result`] to its join handle.
    ///
    /// The new fiber becomes ready immediately but the current fiber keeps
    /// the execution slot; the newcomer runs at the caller's next suspension
    /// point (subject to priorities).
    ///
    /// Errors iff the OS refuses to create the backing thread.
    ///
    /// [`Result`]: crate::Result
    pub fn start(self) -> crate::Result<C::JoinHandle> {
        let Self {
            name,
            priority,
            stack_size,
            f,
        } = self;
        let name = name.unwrap_or_else(|| "<rust>".into());
        f.spawn(name, priority, stack_size)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Callee
////////////////////////////////////////////////////////////////////////////////

/// Types implementing this trait represent [`Builder`] configurations
/// relating to the kind of the fiber function. Currently 2 kinds are
/// supported:
/// - [`FiberFunc`]: a no arguments function that returns a value
/// - [`FiberProc`]: a no arguments function that doesn't return a value
pub trait Callee {
    /// JoinHandle type which will be returned from [`Builder::start`].
    type JoinHandle;

    /// Spawn the backing thread and schedule the fiber.
    fn spawn(self, name: String, priority: u8, stack_size: Option<usize>)
        -> crate::Result<Self::JoinHandle>;
}

/// This is a helper type used to configure [`Builder`] with the appropriate
/// behavior for the fiber function that returns a value.
pub struct FiberFunc<F, T> {
    f: F,
    marker: std::marker::PhantomData<T>,
}

impl<F, T> Callee for FiberFunc<F, T>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    type JoinHandle = JoinHandle<T>;

    fn spawn(
        self,
        name: String,
        priority: u8,
        stack_size: Option<usize>,
    ) -> crate::Result<Self::JoinHandle> {
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let f = self.f;
        let body = move || {
            let value = f();
            *slot.lock().expect("result slot poisoned") = Some(value);
        };
        let fcb = sched::spawn(name, priority, stack_size, Box::new(body))?;
        Ok(JoinHandle {
            fiber: Some(Fiber { fcb }),
            result,
        })
    }
}

/// This is a helper type used to configure [`Builder`] with the appropriate
/// behavior for the fiber procedure (function which doesn't return a value).
pub struct FiberProc<F> {
    f: F,
}

impl<F> Callee for FiberProc<F>
where
    F: FnOnce(),
    F: Send + 'static,
{
    type JoinHandle = UnitJoinHandle;

    fn spawn(
        self,
        name: String,
        priority: u8,
        stack_size: Option<usize>,
    ) -> crate::Result<Self::JoinHandle> {
        let fcb = sched::spawn(name, priority, stack_size, Box::new(self.f))?;
        Ok(UnitJoinHandle {
            fiber: Some(Fiber { fcb }),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// JoinHandle
////////////////////////////////////////////////////////////////////////////////

/// An owned permission to join on a fiber (block on its termination).
pub struct JoinHandle<T> {
    fiber: Option<Fiber>,
    result: Arc<Mutex<Option<T>>>,
}

impl_debug_stub! {JoinHandle<T>}

impl<T> JoinHandle<T> {
    /// A handle to the underlying fiber, e.g. for [`cancel`] or [`resume`].
    pub fn fiber(&self) -> Fiber {
        self.fiber
            .clone()
            .expect("armed until the join handle is consumed")
    }

    /// Block until the fiber's termination and return its result value.
    ///
    /// Returns `None` if the joining fiber was cancelled before the target
    /// stopped (the target keeps running), or if the fiber's body terminated
    /// with an unhandled panic and produced no value.
    pub fn join(mut self) -> Option<T> {
        let fiber = self.fiber.take().expect("join is called at most once");
        if !sched::join_fcb(&fiber.fcb) {
            return None;
        }
        reap(&fiber.fcb);
        let mut slot = self.result.lock().expect("result slot poisoned");
        slot.take()
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.fiber.is_some() {
            panic!("JoinHandle dropped before being joined")
        }
    }
}

/// An owned permission to join on a fiber (block on its termination).
///
/// This is an optimized case of [`JoinHandle`]`<()>`.
pub struct UnitJoinHandle {
    fiber: Option<Fiber>,
}

impl_debug_stub! {UnitJoinHandle}

impl UnitJoinHandle {
    /// A handle to the underlying fiber, e.g. for [`cancel`] or [`resume`].
    pub fn fiber(&self) -> Fiber {
        self.fiber
            .clone()
            .expect("armed until the join handle is consumed")
    }

    /// Block until the fiber's termination.
    ///
    /// Returns `true` on completion, `false` if the joining fiber was
    /// cancelled first (the target keeps running).
    pub fn join(mut self) -> bool {
        let fiber = self.fiber.take().expect("join is called at most once");
        if !sched::join_fcb(&fiber.fcb) {
            return false;
        }
        reap(&fiber.fcb);
        true
    }
}

impl Drop for UnitJoinHandle {
    fn drop(&mut self) {
        if self.fiber.is_some() {
            panic!("UnitJoinHandle dropped before being joined")
        }
    }
}

/// The backing thread exits right after the fiber's final hand-off; collect
/// it so nothing leaks.
fn reap(fcb: &Arc<sched::Fcb>) {
    let handle = fcb
        .thread
        .lock()
        .expect("fcb thread slot poisoned")
        .take();
    if let Some(handle) = handle {
        let _ = handle.join();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Creates a new fiber and schedules it for execution, returning a
/// [`JoinHandle`] for it.
///
/// **NOTE**: The argument `f` is a function that returns `T`. In case when
/// `T = ()` (no return value) one should instead use [`start_proc`].
///
/// This creates a fiber with the default parameters of [`Builder`]; to
/// specify a name, priority or stack size, use the builder API instead.
pub fn start<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    Builder::new().func(f).start().unwrap()
}

/// Creates a new proc fiber and schedules it for execution, returning a
/// [`UnitJoinHandle`] for it.
///
/// The *proc fiber* is a special case of a fiber whose function does not
/// return a value; `UnitJoinHandle` is identical to `JoinHandle<()>` in all
/// aspects except that it is implemented slightly more efficiently.
///
/// For more details see: [`start`]
pub fn start_proc<F>(f: F) -> UnitJoinHandle
where
    F: FnOnce(),
    F: Send + 'static,
{
    Builder::new().proc(f).start().unwrap()
}

/// Block the current fiber until somebody [`resume`]s it.
///
/// Returns `false` iff the fiber was cancelled, either before the call or
/// while suspended. If a resume arrived while the fiber was still running
/// (see [`FiberState::Resumed`]) the call degrades to a [`yield_now`] and
/// returns without a true suspension.
pub fn suspend() -> bool {
    sched::suspend_current()
}

/// Make `fiber` runnable.
///
/// - on a **suspended** fiber: moves it to the ready queue;
/// - on the **current** fiber: memoizes the resume so that its next suspend
///   becomes a yield;
/// - on a **ready** or **stopped** fiber: a no-op (resume is idempotent).
///
/// Safe to call from event loop completion callbacks.
pub fn resume(fiber: &Fiber) {
    fiber.resume()
}

/// Reenqueue the current fiber and let every runnable fiber of higher or
/// equal priority run (the idle fiber drives one event loop iteration in
/// between). Never fails.
pub fn yield_now() {
    sched::yield_current()
}

/// Returns the handle of the fiber bound to the calling thread.
pub fn current() -> Fiber {
    Fiber {
        fcb: sched::current_fcb(),
    }
}

/// Returns the handle of the main fiber (the thread that called [`init`]).
pub fn main_fiber() -> Fiber {
    Fiber {
        fcb: sched::main_fcb(),
    }
}

/// Put the current fiber to sleep for at least `duration`.
///
/// The lower bound is honored against the monotonic clock. Returns `false`
/// if the fiber was [`cancel`]led before the timer fired, `true` otherwise.
///
/// `sleep(Duration::ZERO)` is an effective way to yield through the event
/// loop.
pub fn sleep(duration: Duration) -> bool {
    sched::sleep_current(duration)
}

/// Wait until `fiber` stops.
///
/// Returns `true` on completion (pass-through when the target has already
/// stopped), `false` if the calling fiber was cancelled first. Waiters are
/// released in arrival order.
///
/// This is the raw rendezvous; [`JoinHandle::join`] additionally transfers
/// the fiber function's result.
pub fn join(fiber: &Fiber) -> bool {
    sched::join_fcb(&fiber.fcb)
}

/// Cooperatively cancel `fiber`.
///
/// Sets the sticky cancellation flag; if the target is suspended it is woken
/// so the pending suspension observes the flag. The affected suspending
/// calls ([`suspend`], [`sleep`], [`join`], [`Cond::wait`]) return `false`;
/// no unwinding happens. A fiber that never suspends cannot be cancelled.
/// No-op on a stopped fiber.
pub fn cancel(fiber: &Fiber) {
    fiber.cancel()
}

/// Check the current fiber for cancellation (it must be checked manually).
pub fn is_cancelled() -> bool {
    sched::current_fcb()
        .cancelled
        .load(std::sync::atomic::Ordering::Relaxed)
}

/// Register interest in a POSIX signal: each delivery is translated by the
/// event loop into a [`resume`] of the calling fiber.
///
/// Replaces the previous registration for `signum`, if any. Fails with
/// [`Error::UnsupportedSignal`] for signals the OS refuses to route (e.g.
/// `SIGKILL`).
pub fn enable_signal(signum: i32) -> crate::Result<()> {
    crate::coio::instance().enable_signal(signum, &sched::current_fcb())
}

/// Drop the interest registered with [`enable_signal`]. A no-op if the
/// signal was never enabled.
pub fn disable_signal(signum: i32) -> crate::Result<()> {
    crate::coio::instance().disable_signal(signum)
}

/// Fiber name annotation for log records; `None` when called off-runtime.
pub(crate) fn current_name_for_diagnostics() -> Option<String> {
    if !sched::is_initialized() {
        return None;
    }
    sched::current_name()
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;

    #[crate::test(filament = "crate")]
    fn memoized_resume_turns_suspend_into_yield() {
        let me = current();
        resume(&me);
        assert_eq!(me.state(), FiberState::Resumed);
        // No one will resume us again; without the memoized resume this
        // would deadlock-abort.
        assert!(suspend());
        assert_eq!(me.state(), FiberState::Current);
    }

    #[crate::test(filament = "crate")]
    fn builder_rejects_idle_priority() {
        let err = Builder::new().priority(127).unwrap_err();
        assert_eq!(err.variant_name(), "InvalidPriority");
        assert!(Builder::new().priority(126).is_ok());
    }

    #[crate::test(filament = "crate")]
    fn handles_compare_by_identity() {
        let me = current();
        assert_eq!(me, current());
        let jh = start_proc(|| ());
        assert_ne!(jh.fiber(), me);
        assert!(jh.join());
    }
}
