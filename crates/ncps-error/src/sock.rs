//! Errors raised by the socket facade and the async waiter.
//!
//! The facade's contract (see `ncps-core::socket`) distinguishes success,
//! pending, timeout, and cancellation as *statuses*, not errors — only
//! genuine failures flow through this type.

/// A failure returned by the socket facade or the async waiter.
#[derive(Debug, thiserror::Error)]
pub enum SockError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The OS reported an ephemeral-port-range exhaustion (Linux `EADDRNOTAVAIL`)
    /// during connect. This is expected transient behavior while port-walking
    /// wraps around, and engine policy does not count it as a connect failure.
    #[error("ephemeral port range exhausted (expected transient)")]
    ExpectedTransient,

    #[error("socket already bound to an async waiter")]
    AlreadyBound,

    #[error("socket has no bound async waiter")]
    NotBound,

    #[error("operation already pending in this direction")]
    AlreadyPending,
}

impl SockError {
    /// Stable machine-readable tag, mirroring the facade's opaque error-code scheme.
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::ExpectedTransient => "expected_transient",
            Self::AlreadyBound => "already_bound",
            Self::NotBound => "not_bound",
            Self::AlreadyPending => "already_pending",
        }
    }

    /// True if this failure is the Linux ephemeral-port-exhaustion special case
    /// that engine policy treats as transient rather than a connect failure.
    pub const fn is_expected_transient(&self) -> bool {
        matches!(self, Self::ExpectedTransient)
    }

    /// Classify a raw connect-path `io::Error`, recognizing the platform's
    /// ephemeral-port-exhaustion errno (Linux: `EADDRNOTAVAIL`, 99) as transient.
    pub fn from_connect_io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(99) {
            Self::ExpectedTransient
        } else {
            Self::Io(err)
        }
    }
}
