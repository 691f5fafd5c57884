//! Per-fiber traceback stack.
//!
//! Generated code pushes a [`Frame`] on function entry and pops it on scope
//! exit (see [`traceback_scope!`]). The stack of the *running* fiber lives in
//! a process-wide slot; the scheduler snapshots it into the outgoing fiber
//! and restores the incoming fiber's snapshot on every context switch, so
//! call sites pay nothing for the bookkeeping.
//!
//! When the `traceback` feature is disabled the entry/exit macros compile to
//! nothing and [`print_to`] renders an empty traceback.

use std::io::{self, Write};
use std::mem;
use std::sync::Mutex;

////////////////////////////////////////////////////////////////////////////////
// Frame
////////////////////////////////////////////////////////////////////////////////

/// One call-site record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub module: &'static str,
    pub function: &'static str,
    pub file: &'static str,
    pub line: u32,
}

/// A fiber's saved traceback stack, exchanged with the process-wide slot at
/// every context switch.
#[derive(Debug, Default)]
pub(crate) struct Saved {
    frames: Vec<Frame>,
}

// The running fiber's stack. Only the current fiber's thread touches this
// (the scheduler serializes all user code), the mutex is never contended.
static CURRENT: Mutex<Vec<Frame>> = Mutex::new(Vec::new());

////////////////////////////////////////////////////////////////////////////////
// Scope
////////////////////////////////////////////////////////////////////////////////

/// RAII guard for one traceback frame: pushed on construction, popped on
/// drop. Constructed by [`traceback_scope!`].
#[must_use = "the frame is popped when the scope is dropped"]
pub struct Scope {
    _priv: (),
}

impl Scope {
    #[cfg(feature = "traceback")]
    pub fn enter(module: &'static str, function: &'static str, file: &'static str, line: u32) -> Self {
        CURRENT.lock().expect("traceback stack poisoned").push(Frame {
            module,
            function,
            file,
            line,
        });
        Scope { _priv: () }
    }

    #[cfg(not(feature = "traceback"))]
    #[inline(always)]
    pub fn enter(_: &'static str, _: &'static str, _: &'static str, _: u32) -> Self {
        Scope { _priv: () }
    }
}

impl Drop for Scope {
    #[inline]
    fn drop(&mut self) {
        #[cfg(feature = "traceback")]
        CURRENT.lock().expect("traceback stack poisoned").pop();
    }
}

/// Record the line currently executing in the innermost frame.
///
/// Generated code calls this before every statement that can unwind.
#[inline]
pub fn set_line(line: u32) {
    #[cfg(feature = "traceback")]
    if let Some(top) = CURRENT.lock().expect("traceback stack poisoned").last_mut() {
        top.line = line;
    }
    #[cfg(not(feature = "traceback"))]
    let _ = line;
}

/// Opens a traceback frame for the current function; the frame closes at the
/// end of the enclosing scope.
///
/// ```no_run
/// fn frobnicate() {
///     filament::traceback_scope!("frobnicate");
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! traceback_scope {
    ($function:expr) => {
        let _traceback_scope = $crate::traceback::Scope::enter(
            ::std::module_path!(),
            $function,
            ::std::file!(),
            ::std::line!(),
        );
    };
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler hooks
////////////////////////////////////////////////////////////////////////////////

/// Snapshot the running stack into `saved`. Called for the outgoing fiber
/// right before the context-switch hand-off.
pub(crate) fn save_into(saved: &Mutex<Saved>) {
    let mut current = CURRENT.lock().expect("traceback stack poisoned");
    let mut saved = saved.lock().expect("traceback snapshot poisoned");
    saved.frames = mem::take(&mut *current);
}

/// Install `saved` as the running stack. Called by the incoming fiber right
/// after it wakes up; a fresh fiber's empty snapshot doubles as its root
/// initialization.
pub(crate) fn restore_from(saved: &Mutex<Saved>) {
    let mut saved = saved.lock().expect("traceback snapshot poisoned");
    *CURRENT.lock().expect("traceback stack poisoned") = mem::take(&mut saved.frames);
}

////////////////////////////////////////////////////////////////////////////////
// Rendering
////////////////////////////////////////////////////////////////////////////////

/// Write the current fiber's traceback, oldest frame first.
pub fn print_to(w: &mut dyn Write) -> io::Result<()> {
    let frames = CURRENT.lock().expect("traceback stack poisoned");
    writeln!(w, "Traceback (most recent call last):")?;
    for frame in frames.iter() {
        writeln!(
            w,
            "  File \"{}\", line {}, in {}::{}",
            frame.file, frame.line, frame.module, frame.function
        )?;
    }
    Ok(())
}

/// [`print_to`] aimed at standard error, ignoring write failures.
pub(crate) fn print_stderr() {
    let stderr = io::stderr();
    let _ = print_to(&mut stderr.lock());
}

/// The current fiber's frames, oldest first. Mostly useful in tests.
pub fn frames() -> Vec<Frame> {
    CURRENT.lock().expect("traceback stack poisoned").clone()
}
