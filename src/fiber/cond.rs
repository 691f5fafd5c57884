//! Conditional variable for cooperative multitasking (fibers).
//!
//! A cond (short for "condition variable") is a synchronization primitive
//! that allows fibers to yield until some predicate is satisfied. Fiber
//! conditions have two basic operations - [`wait`](Cond::wait) and
//! [`signal`](Cond::signal): `wait` suspends the calling fiber until
//! `signal` is called (or the wait times out / the fiber is cancelled).
//!
//! Like `pthread_cond`, a [`Cond`] can issue spurious wake ups caused by an
//! explicit [`resume`](crate::fiber::resume) of the waiting fiber. It is
//! highly recommended to wrap calls to [`wait`](Cond::wait) into a loop
//! checking an actual predicate.
//!
//! Unlike `pthread_cond`, [`Cond`] doesn't require mutex/latch wrapping: the
//! scheduler already guarantees at most one running fiber.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::fiber::sched::{self, fatal, Fcb};

/// Fiber condition variable.
///
/// Example:
///
/// ```no_run
/// use std::sync::Arc;
/// use filament::fiber::{self, Cond};
///
/// let cond = Arc::new(Cond::new());
/// let peer = Arc::clone(&cond);
/// let jh = fiber::start_proc(move || {
///     peer.signal();
/// });
/// cond.wait();
/// jh.join();
/// ```
#[derive(Debug, Default)]
pub struct Cond {
    waiters: Mutex<VecDeque<Arc<Fcb>>>,
}

impl Cond {
    /// Instantiate a new fiber cond object.
    pub fn new() -> Self {
        Cond {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<VecDeque<Arc<Fcb>>> {
        self.waiters
            .lock()
            .unwrap_or_else(|_| fatal("cond waiter list poisoned"))
    }

    /// Wake one fiber waiting for the cond, the longest-waiting one first.
    /// Does nothing if no one is waiting. Does not yield.
    pub fn signal(&self) {
        let woken = self.lock_waiters().pop_front();
        if let Some(fcb) = woken {
            sched::resume_fcb(&fcb);
        }
    }

    /// Wake up all fibers waiting for the cond, in arrival order.
    /// Does not yield.
    pub fn broadcast(&self) {
        let woken: Vec<_> = self.lock_waiters().drain(..).collect();
        for fcb in woken {
            sched::resume_fcb(&fcb);
        }
    }

    /// Suspend the execution of the current fiber (i.e. yield) until
    /// [`signal`](Self::signal) is called.
    ///
    /// Returns `true` on a signal or a spurious wake up, `false` if the
    /// fiber was cancelled.
    pub fn wait(&self) -> bool {
        let me = sched::current_fcb();
        self.lock_waiters().push_back(Arc::clone(&me));
        let ok = sched::suspend_current();
        // A signal unlinks the waiter before resuming it; anything still
        // linked here was woken some other way.
        self.lock_waiters().retain(|w| w.id != me.id);
        ok
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`.
    ///
    /// Returns:
    /// - `true` on a signal or a spurious wake up,
    /// - `false` on timeout or if the fiber was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let me = sched::current_fcb();
        let deadline = Instant::now() + timeout;
        self.lock_waiters().push_back(Arc::clone(&me));

        let seq = me
            .sleep_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        crate::coio::instance().arm_sleep(deadline, &me, seq);

        let ok = sched::suspend_current();
        me.sleep_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut waiters = self.lock_waiters();
        let signaled = !waiters.iter().any(|w| w.id == me.id);
        waiters.retain(|w| w.id != me.id);
        drop(waiters);

        ok && (signaled || Instant::now() < deadline)
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;
    use crate::fiber;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[crate::test(filament = "crate")]
    fn signal_wakes_in_arrival_order() {
        let cond = Arc::new(Cond::new());
        let first_done = Arc::new(AtomicBool::new(false));

        let c = Arc::clone(&cond);
        let fd = Arc::clone(&first_done);
        let first = fiber::start_proc(move || {
            assert!(c.wait());
            fd.store(true, Ordering::Relaxed);
        });
        let c = Arc::clone(&cond);
        let fd = Arc::clone(&first_done);
        let second = fiber::start_proc(move || {
            assert!(c.wait());
            // The earlier waiter was signaled before us.
            assert!(fd.load(Ordering::Relaxed));
        });

        // Both fibers must be parked in wait() before signaling.
        assert!(fiber::sleep(Duration::from_millis(1)));
        cond.signal();
        cond.signal();
        assert!(first.join());
        assert!(second.join());
    }

    #[crate::test(filament = "crate")]
    fn wait_timeout_expires() {
        let cond = Cond::new();
        let before = Instant::now();
        assert!(!cond.wait_timeout(Duration::from_millis(20)));
        assert!(before.elapsed() >= Duration::from_millis(20));
    }

    #[crate::test(filament = "crate")]
    fn broadcast_wakes_everyone() {
        let cond = Arc::new(Cond::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let c = Arc::clone(&cond);
            handles.push(fiber::start_proc(move || {
                assert!(c.wait());
            }));
        }
        assert!(fiber::sleep(Duration::from_millis(1)));
        cond.broadcast();
        for jh in handles {
            assert!(jh.join());
        }
    }
}
