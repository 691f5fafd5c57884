//! Cooperative input/output.
//!
//! This is the bridge between fibers and the OS: a poll-based event loop
//! driven by the idle fiber, one iteration per scheduling turn. Fibers never
//! block in the kernel themselves; they register interest (an fd, a timer
//! deadline, a signal), suspend, and are resumed by the completion dispatch.
//! Every completion callback body is exactly one `resume` of the fiber
//! recorded in the registration.

use std::collections::{BinaryHeap, HashMap};
use std::io::{self, Read, Write};
use std::mem::forget;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use once_cell::sync::OnceCell;
use signal_hook::low_level::pipe as signal_pipe;
use signal_hook::SigId;

use crate::error::Error;
use crate::fiber::sched::{self, fatal, Fcb};

bitflags! {
    /// Readiness event set for [`wait`].
    pub struct CoIoFlags: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

const SIGNAL_PIPE_TOKEN_BASE: usize = usize::MAX / 2;

////////////////////////////////////////////////////////////////////////////////
// EventLoop
////////////////////////////////////////////////////////////////////////////////

struct PollParts {
    poll: Poll,
    events: Events,
}

struct TimerEntry {
    deadline: Instant,
    /// Matched against the fiber's `sleep_seq`; a mismatch means the sleep
    /// was cancelled or already over and the expiry must be discarded.
    seq: u64,
    fiber: Weak<Fcb>,
}

// Min-heap by deadline.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.deadline.cmp(&self.deadline)
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}

struct FdWaiter {
    fd: RawFd,
    fiber: Weak<Fcb>,
    /// Readiness observed by the dispatch, read back by the suspended fiber.
    ready: Arc<AtomicU32>,
}

struct SignalWaiter {
    signum: i32,
    sig_id: SigId,
    /// Read end of the per-signal self-pipe; the handler writes one byte per
    /// delivery.
    pipe: UnixStream,
    fiber: Weak<Fcb>,
}

pub(crate) struct EventLoop {
    poll: Mutex<PollParts>,
    registry: Registry,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    fd_waiters: Mutex<HashMap<Token, FdWaiter>>,
    signal_waiters: Mutex<HashMap<Token, SignalWaiter>>,
    next_token: AtomicUsize,
}

static EVENT_LOOP: OnceCell<EventLoop> = OnceCell::new();

pub(crate) fn instance() -> &'static EventLoop {
    match EVENT_LOOP.get() {
        Some(lp) => lp,
        None => fatal("event loop is not initialized, call fiber::init() first"),
    }
}

pub(crate) fn init() -> crate::Result<()> {
    let poll = Poll::new()?;
    let registry = poll.registry().try_clone()?;
    let event_loop = EventLoop {
        poll: Mutex::new(PollParts {
            poll,
            events: Events::with_capacity(1024),
        }),
        registry,
        timers: Mutex::new(BinaryHeap::new()),
        fd_waiters: Mutex::new(HashMap::new()),
        signal_waiters: Mutex::new(HashMap::new()),
        next_token: AtomicUsize::new(1),
    };
    if EVENT_LOOP.set(event_loop).is_err() {
        fatal("event loop is already initialized");
    }
    Ok(())
}

impl EventLoop {
    fn alloc_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn alloc_signal_token(&self) -> Token {
        Token(SIGNAL_PIPE_TOKEN_BASE + self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a sleep expiry for `fcb`. The entry only fires while `seq`
    /// is still the fiber's latest sleep sequence number.
    pub(crate) fn arm_sleep(&self, deadline: Instant, fcb: &Arc<Fcb>, seq: u64) {
        self.timers
            .lock()
            .unwrap_or_else(|_| fatal("timer heap poisoned"))
            .push(TimerEntry {
                deadline,
                seq,
                fiber: Arc::downgrade(fcb),
            });
    }

    /// Earliest live timer deadline; retired entries are pruned on the way.
    fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self
            .timers
            .lock()
            .unwrap_or_else(|_| fatal("timer heap poisoned"));
        while let Some(top) = timers.peek() {
            let stale = match top.fiber.upgrade() {
                None => true,
                Some(fcb) => fcb.sleep_seq.load(Ordering::Relaxed) != top.seq,
            };
            if stale {
                timers.pop();
                continue;
            }
            return Some(top.deadline);
        }
        None
    }

    /// Route `signum` to `fcb`: each delivery becomes one `resume`. Replaces
    /// a previous registration for the same signal.
    pub(crate) fn enable_signal(&self, signum: i32, fcb: &Arc<Fcb>) -> crate::Result<()> {
        self.disable_signal(signum)?;

        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;
        let sig_id = signal_pipe::register(signum, write).map_err(|e| {
            if e.raw_os_error() == Some(libc::EINVAL) {
                Error::UnsupportedSignal(signum)
            } else {
                Error::IO(e)
            }
        })?;

        let token = self.alloc_signal_token();
        self.registry
            .register(&mut SourceFd(&read.as_raw_fd()), token, Interest::READABLE)?;
        self.signal_waiters
            .lock()
            .unwrap_or_else(|_| fatal("signal table poisoned"))
            .insert(
                token,
                SignalWaiter {
                    signum,
                    sig_id,
                    pipe: read,
                    fiber: Arc::downgrade(fcb),
                },
            );
        log::debug!("signal {} routed to fiber '{}'", signum, fcb.name);
        Ok(())
    }

    /// Stop routing `signum`. A no-op when the signal was never enabled.
    pub(crate) fn disable_signal(&self, signum: i32) -> crate::Result<()> {
        let mut waiters = self
            .signal_waiters
            .lock()
            .unwrap_or_else(|_| fatal("signal table poisoned"));
        let token = match waiters.iter().find(|(_, w)| w.signum == signum) {
            Some((token, _)) => *token,
            None => return Ok(()),
        };
        let waiter = waiters.remove(&token).expect("token was just found");
        drop(waiters);
        signal_hook::low_level::unregister(waiter.sig_id);
        self.registry
            .deregister(&mut SourceFd(&waiter.pipe.as_raw_fd()))?;
        Ok(())
    }

    /// One event loop iteration.
    ///
    /// Returns `false` without polling when no handle (timer, fd interest,
    /// signal route) is active; the idle fiber turns that into the deadlock
    /// diagnostic when no fiber is ready either. With `block` the poll waits
    /// for the next event or timer deadline, otherwise it only collects
    /// whatever is already pending.
    pub(crate) fn run_once(&self, block: bool) -> bool {
        let next_deadline = self.next_deadline();
        let have_handles = next_deadline.is_some()
            || !self
                .fd_waiters
                .lock()
                .unwrap_or_else(|_| fatal("fd table poisoned"))
                .is_empty()
            || !self
                .signal_waiters
                .lock()
                .unwrap_or_else(|_| fatal("signal table poisoned"))
                .is_empty();
        if !have_handles {
            return false;
        }

        let timeout = if block {
            next_deadline.map(|d| d.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };

        let mut to_resume: Vec<Arc<Fcb>> = Vec::new();
        {
            let mut parts = self
                .poll
                .lock()
                .unwrap_or_else(|_| fatal("event loop poisoned"));
            let PollParts { poll, events } = &mut *parts;
            if let Err(e) = poll.poll(events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    fatal(&format!("event loop poll failed: {}", e));
                }
            }
            for event in events.iter() {
                let token = event.token();
                if token.0 >= SIGNAL_PIPE_TOKEN_BASE {
                    let mut waiters = self
                        .signal_waiters
                        .lock()
                        .unwrap_or_else(|_| fatal("signal table poisoned"));
                    if let Some(waiter) = waiters.get_mut(&token) {
                        drain_pipe(&mut waiter.pipe);
                        if let Some(fcb) = waiter.fiber.upgrade() {
                            to_resume.push(fcb);
                        }
                    }
                } else {
                    let mut waiters = self
                        .fd_waiters
                        .lock()
                        .unwrap_or_else(|_| fatal("fd table poisoned"));
                    if let Some(waiter) = waiters.remove(&token) {
                        let mut flags = CoIoFlags::empty();
                        if event.is_readable() {
                            flags |= CoIoFlags::READ;
                        }
                        if event.is_writable() {
                            flags |= CoIoFlags::WRITE;
                        }
                        waiter.ready.store(flags.bits(), Ordering::Relaxed);
                        let _ = self.registry.deregister(&mut SourceFd(&waiter.fd));
                        if let Some(fcb) = waiter.fiber.upgrade() {
                            to_resume.push(fcb);
                        }
                    }
                }
            }
        }

        let now = Instant::now();
        {
            let mut timers = self
                .timers
                .lock()
                .unwrap_or_else(|_| fatal("timer heap poisoned"));
            while let Some(top) = timers.peek() {
                if top.deadline > now {
                    break;
                }
                let entry = timers.pop().expect("peek returned an entry");
                if let Some(fcb) = entry.fiber.upgrade() {
                    if fcb.sleep_seq.load(Ordering::Relaxed) == entry.seq {
                        to_resume.push(fcb);
                    }
                }
            }
        }

        for fcb in &to_resume {
            sched::resume_fcb(fcb);
        }
        true
    }
}

// The registration is edge-triggered: leave nothing behind or the next
// delivery is silent.
fn drain_pipe(pipe: &mut UnixStream) {
    let mut sink = [0u8; 64];
    while let Ok(n) = pipe.read(&mut sink) {
        if n == 0 {
            break;
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// wait
////////////////////////////////////////////////////////////////////////////////

/// Suspend the current fiber until `fd` reports one of the requested
/// readiness `flags`, the `timeout` expires, or the fiber is cancelled.
///
/// Returns the observed readiness; an empty set means the wait timed out.
/// The fd should be in non-blocking mode, the caller is expected to retry
/// its I/O operation and come back on `WouldBlock`.
pub fn wait(fd: RawFd, flags: CoIoFlags, timeout: Option<Duration>) -> crate::Result<CoIoFlags> {
    let event_loop = instance();
    let me = sched::current_fcb();
    if me.cancelled.load(Ordering::Relaxed) {
        return Err(Error::Cancelled);
    }

    let interest = match (flags.contains(CoIoFlags::READ), flags.contains(CoIoFlags::WRITE)) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => return Err(Error::other("empty readiness set")),
    };

    let token = event_loop.alloc_token();
    let ready = Arc::new(AtomicU32::new(0));
    event_loop
        .registry
        .register(&mut SourceFd(&fd), token, interest)?;
    event_loop
        .fd_waiters
        .lock()
        .unwrap_or_else(|_| fatal("fd table poisoned"))
        .insert(
            token,
            FdWaiter {
                fd,
                fiber: Arc::downgrade(&me),
                ready: Arc::clone(&ready),
            },
        );

    if let Some(timeout) = timeout {
        let seq = me.sleep_seq.fetch_add(1, Ordering::Relaxed) + 1;
        event_loop.arm_sleep(Instant::now() + timeout, &me, seq);
    }

    let ok = sched::suspend_current();
    me.sleep_seq.fetch_add(1, Ordering::Relaxed);

    // Still registered means nobody dispatched us: timeout or cancellation.
    let registered = event_loop
        .fd_waiters
        .lock()
        .unwrap_or_else(|_| fatal("fd table poisoned"))
        .remove(&token)
        .is_some();
    if registered {
        let _ = event_loop.registry.deregister(&mut SourceFd(&fd));
    }

    if !ok {
        return Err(Error::Cancelled);
    }
    Ok(CoIoFlags::from_bits_truncate(ready.load(Ordering::Relaxed)))
}

////////////////////////////////////////////////////////////////////////////////
// read / write
////////////////////////////////////////////////////////////////////////////////

/// Pull some bytes from `fd`, suspending the fiber until the descriptor is
/// readable. Returns the number of bytes read, or 0 on timeout.
pub fn read(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        match wait(fd, CoIoFlags::READ, timeout) {
            Ok(flags) if flags.is_empty() => return Ok(0),
            Ok(_) => continue,
            Err(e) => return Err(into_io_error(e)),
        }
    }
}

/// Write a buffer into `fd`, suspending the fiber until the descriptor is
/// writable. Returns the number of bytes written, or 0 on timeout.
pub fn write(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err);
        }
        match wait(fd, CoIoFlags::WRITE, timeout) {
            Ok(flags) if flags.is_empty() => return Ok(0),
            Ok(_) => continue,
            Err(e) => return Err(into_io_error(e)),
        }
    }
}

fn into_io_error(e: Error) -> io::Error {
    match e {
        Error::IO(e) => e,
        Error::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "fiber was cancelled"),
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIoStream
////////////////////////////////////////////////////////////////////////////////

/// Uses the event loop to poll read/write events from the wrapped socket.
pub struct CoIoStream {
    fd: RawFd,
}

impl CoIoStream {
    /// Convert an fd-like object to a CoIo stream.
    pub fn new<T>(inner: T) -> io::Result<CoIoStream>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 } {
            Err(io::Error::last_os_error())
        } else {
            Ok(CoIoStream { fd })
        }
    }

    /// Connect to a remote TCP socket.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<CoIoStream> {
        let inner_stream = TcpStream::connect(addr)?;
        inner_stream.set_nonblocking(true)?;
        Ok(CoIoStream {
            fd: inner_stream.into_raw_fd(),
        })
    }

    /// Opens a TCP connection to a remote host with a timeout.
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> io::Result<CoIoStream> {
        let inner_stream = TcpStream::connect_timeout(addr, timeout)?;
        inner_stream.set_nonblocking(true)?;
        Ok(CoIoStream {
            fd: inner_stream.into_raw_fd(),
        })
    }

    /// Pull some bytes from this source into the specified buffer. Returns
    /// how many bytes were read, or 0 on timeout.
    pub fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        read(self.fd, buf, timeout)
    }

    /// Write a buffer into this writer. Returns how many bytes were written,
    /// or 0 on timeout.
    pub fn write_with_timeout(&mut self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        write(self.fd, buf, timeout)
    }
}

impl Read for CoIoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.fd, buf, None)
    }
}

impl Write for CoIoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write(self.fd, buf, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl IntoRawFd for CoIoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        forget(self);
        fd
    }
}

impl AsRawFd for CoIoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoIoStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIoListener
////////////////////////////////////////////////////////////////////////////////

/// Incoming connection listener backed by the event loop.
pub struct CoIoListener {
    fd: RawFd,
}

impl CoIoListener {
    /// Bind to the specified address.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<CoIoListener> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(CoIoListener {
            fd: inner.into_raw_fd(),
        })
    }

    /// The local address this listener is bound to. Useful after binding to
    /// port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let addr = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
                let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
            }
            libc::AF_INET6 => {
                let addr = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in6) };
                let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
                Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin6_port)))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                "unsupported address family",
            )),
        }
    }

    /// Accept a connection, suspending the fiber until one arrives.
    pub fn accept(&self) -> io::Result<CoIoStream> {
        loop {
            let fd = unsafe { libc::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd >= 0 {
                let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
                if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
                    let err = io::Error::last_os_error();
                    unsafe { libc::close(fd) };
                    return Err(err);
                }
                return Ok(CoIoStream { fd });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
            match wait(self.fd, CoIoFlags::READ, None) {
                Ok(_) => continue,
                Err(e) => return Err(into_io_error(e)),
            }
        }
    }
}

impl std::convert::TryFrom<TcpListener> for CoIoListener {
    type Error = io::Error;

    fn try_from(inner: TcpListener) -> io::Result<CoIoListener> {
        inner.set_nonblocking(true)?;
        Ok(CoIoListener {
            fd: inner.into_raw_fd(),
        })
    }
}

impl AsRawFd for CoIoListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoIoListener {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
