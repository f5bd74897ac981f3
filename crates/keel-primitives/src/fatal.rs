//! Unrecoverable-error signal.
//!
//! Misuse of a lock, a lock acquisition that never completes, a lock-order
//! cycle and a broken reclamation invariant are all programmer bugs. None of
//! them is reported through a `Result`: they are raised through a
//! [`FatalHandler`], which never returns.
//!
//! The default handler is [`AbortHandler`], which logs the cause and aborts
//! the process. [`PanicHandler`] turns the signal into a panic carrying the
//! same message, which lets tests observe fatal paths with
//! `#[should_panic(expected = "DEADLOCK_DETECTED")]`.

use std::fmt;
use std::sync::Arc;

/// Why the process is being terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalCause {
    /// A lock could not be acquired before the acquisition deadline.
    LockTimeout,
    /// A lock was released more times than it was acquired.
    MultipleUnlock,
    /// A thread released a lock other than the one it acquired last.
    InvalidUnlock,
    /// A writer released the lock while shared holders were still recorded.
    InvalidUnlockOrder,
    /// The lock-order graph contains a cycle.
    DeadlockDetected,
    /// A thread holding a lock in shared mode asked for exclusive mode.
    ReadThenWrite,
    /// More threads asked for an identity than a lock word can encode.
    ThreadIdExhausted,
    /// A lock's shared-holder count would overflow its 16 bits.
    ReaderOverflow,
    /// A node was dereferenced after it had been returned to its arena.
    NodeReclaimed,
    /// The node arena ran out of addressable slots.
    ArenaExhausted,
}

impl FatalCause {
    /// Stable short code for this cause.
    pub const fn as_str(self) -> &'static str {
        match self {
            FatalCause::LockTimeout => "LOCK_TIMEOUT",
            FatalCause::MultipleUnlock => "MULTIPLE_UNLOCK",
            FatalCause::InvalidUnlock => "INVALID_UNLOCK",
            FatalCause::InvalidUnlockOrder => "INVALID_UNLOCK_ORDER",
            FatalCause::DeadlockDetected => "DEADLOCK_DETECTED",
            FatalCause::ReadThenWrite => "READ_THEN_WRITE",
            FatalCause::ThreadIdExhausted => "THREAD_ID_EXHAUSTED",
            FatalCause::ReaderOverflow => "READER_OVERFLOW",
            FatalCause::NodeReclaimed => "NODE_RECLAIMED",
            FatalCause::ArenaExhausted => "ARENA_EXHAUSTED",
        }
    }
}

impl fmt::Display for FatalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal condition: its cause plus a human-readable detail line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub cause: FatalCause,
    pub detail: String,
}

impl FatalError {
    pub fn new(cause: FatalCause, detail: impl Into<String>) -> Self {
        Self {
            cause,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.cause)
        } else {
            write!(f, "{}: {}", self.cause, self.detail)
        }
    }
}

impl std::error::Error for FatalError {}

/// Receiver of fatal conditions.
///
/// Implementations must not return. Callers release every internal lock
/// before raising, so a handler may itself take locks.
pub trait FatalHandler: Send + Sync + 'static {
    fn fatal(&self, error: FatalError) -> !;
}

/// Logs the error and aborts the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortHandler;

impl FatalHandler for AbortHandler {
    fn fatal(&self, error: FatalError) -> ! {
        tracing::error!(cause = error.cause.as_str(), detail = %error.detail, "fatal condition, aborting");
        eprintln!("keel: fatal: {error}");
        std::process::abort()
    }
}

/// Panics with the error message instead of aborting.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicHandler;

impl FatalHandler for PanicHandler {
    fn fatal(&self, error: FatalError) -> ! {
        tracing::error!(cause = error.cause.as_str(), detail = %error.detail, "fatal condition");
        panic!("{error}")
    }
}

/// Selects a built-in handler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FatalMode {
    #[default]
    Abort,
    Panic,
}

impl FatalMode {
    pub fn handler(self) -> Arc<dyn FatalHandler> {
        match self {
            FatalMode::Abort => Arc::new(AbortHandler),
            FatalMode::Panic => Arc::new(PanicHandler),
        }
    }
}

/// Raise through the aborting handler.
///
/// Used for invariant violations inside the primitives themselves, which have
/// no context to carry a handler. This crate's own unit tests panic instead,
/// so those paths can be asserted with `#[should_panic]`.
#[cold]
pub fn abort(cause: FatalCause, detail: impl Into<String>) -> ! {
    let error = FatalError::new(cause, detail);
    #[cfg(test)]
    {
        PanicHandler.fatal(error)
    }
    #[cfg(not(test))]
    {
        AbortHandler.fatal(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause_code() {
        let err = FatalError::new(FatalCause::DeadlockDetected, "A -> B -> A");
        assert_eq!(err.to_string(), "DEADLOCK_DETECTED: A -> B -> A");

        let bare = FatalError::new(FatalCause::LockTimeout, "");
        assert_eq!(bare.to_string(), "LOCK_TIMEOUT");
    }

    #[test]
    #[should_panic(expected = "MULTIPLE_UNLOCK")]
    fn panic_handler_panics_with_cause() {
        PanicHandler.fatal(FatalError::new(FatalCause::MultipleUnlock, "read_unlock"));
    }

    #[test]
    fn mode_selects_handler() {
        let handler = FatalMode::Panic.handler();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handler.fatal(FatalError::new(FatalCause::InvalidUnlock, "x"));
        }));
        assert!(result.is_err());
    }
}
