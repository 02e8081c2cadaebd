//! Structured error kinds, returned (never string-matched) by the public
//! API. Each kind names the failure class, not a free-form message, so
//! callers can `match` on `ErrorKind`.

use std::fmt;
use std::io;

/// Structured error kind. Non-exhaustive: new internal failure classes can
/// be added without a semver break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Kernel poll / wake-up / socket-level failure.
    IoFailure,
    /// The suspension was aborted by an explicit `CancellationToken::cancel()`.
    Canceled,
    /// The suspension was aborted by a `Timeout` firing.
    TimedOut,
    /// API misuse: double release, `wait` without holding the lock, register
    /// after the owning loop/pool has stopped, unknown loop id, etc.
    InvalidState,
    /// A loop-local table ran out of ids, or a bounded queue is full.
    ResourceExhausted,
    /// A job was enqueued on a blocking executor that has already shut down.
    ThreadPoolStopped,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::Canceled => "canceled",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::ThreadPoolStopped => "thread_pool_stopped",
        };
        f.write_str(s)
    }
}

/// The runtime's error type. Carries a [`ErrorKind`] plus an optional
/// human-readable context string and/or underlying `io::Error`.
#[derive(Debug, thiserror::Error)]
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: None,
        }
    }

    pub fn from_io(kind: ErrorKind, source: io::Error) -> Self {
        Error {
            kind,
            msg: None,
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn canceled() -> Self {
        Error::new(ErrorKind::Canceled, "suspension canceled")
    }

    pub fn timed_out() -> Self {
        Error::new(ErrorKind::TimedOut, "suspension timed out")
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidState, msg)
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::ResourceExhausted, msg)
    }

    pub fn thread_pool_stopped() -> Self {
        Error::new(ErrorKind::ThreadPoolStopped, "blocking executor is stopped")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.msg, &self.source) {
            (Some(msg), _) => write!(f, "{}: {}", self.kind, msg),
            (None, Some(source)) => write!(f, "{}: {}", self.kind, source),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            msg: self.msg.clone(),
            // `io::Error` isn't `Clone`; recreate one from the same kind and
            // message so a cloned `Error` still renders/matches the same way.
            source: self.source.as_ref().map(|e| io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::from_io(ErrorKind::IoFailure, source)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
