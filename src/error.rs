//! Error handling utils.
//!
//! The runtime distinguishes programmer errors from OS resource errors.
//! Programmer errors (scheduler invariant violations, use of the fiber API
//! before [`fiber::init`]) abort the process with a diagnostic and never
//! propagate as [`Error`] values. OS resource errors (thread creation, event
//! loop setup) are returned to the caller of [`fiber::init`] or
//! [`Builder::start`].
//!
//! [`fiber::init`]: crate::fiber::init
//! [`Builder::start`]: crate::fiber::Builder::start

use std::io;

/// A specialized [`Result`] type for the crate
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// The OS refused to create the backing thread for a new fiber.
    #[error("failed to spawn fiber thread: {0}")]
    ThreadSpawn(io::Error),

    /// Fiber priorities are `0..=126`, the topmost level is reserved for the
    /// event loop fiber.
    #[error("invalid fiber priority {0}, valid range is 0..=126")]
    InvalidPriority(u8),

    /// The signal cannot be routed through the event loop (e.g. `SIGKILL`).
    #[error("signal {0} cannot be routed through the event loop")]
    UnsupportedSignal(i32),

    /// The current fiber was cancelled while blocked in an I/O primitive.
    ///
    /// Cancellation is not an error for the plain suspension points
    /// ([`suspend`], [`join`], [`sleep`] report it via their `bool` return
    /// value), but an interrupted I/O wait has no result to hand back.
    ///
    /// [`suspend`]: crate::fiber::suspend
    /// [`join`]: crate::fiber::join
    /// [`sleep`]: crate::fiber::sleep
    #[error("fiber was cancelled")]
    Cancelled,

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::IO(_) => "IO",
            Self::ThreadSpawn(_) => "ThreadSpawn",
            Self::InvalidPriority(_) => "InvalidPriority",
            Self::UnsupportedSignal(_) => "UnsupportedSignal",
            Self::Cancelled => "Cancelled",
            Self::Other(_) => "Other",
        }
    }
}
