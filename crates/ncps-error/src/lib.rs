//! Unified error types for `ncps` runtime crates.
//!
//! All runtime crates depend on this crate for error handling.

// Error variants and fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

mod args;
mod sock;

pub use args::ArgError;
pub use sock::SockError;

/// Unified error type wrapping all domain errors.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Args(#[from] ArgError),

    #[error(transparent)]
    Sock(#[from] SockError),

    #[error("setup failed at {file}:{line} in {function}: {message}")]
    Setup {
        file:     &'static str,
        line:     u32,
        function: &'static str,
        message:  String,
    },
}

impl RuntimeError {
    /// Get the error code for this error.
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Args(e) => e.error_code(),
            Self::Sock(e) => e.error_code(),
            Self::Setup { .. } => "setup_failure",
        }
    }
}

/// Build a [`RuntimeError::Setup`] diagnostic carrying the caller's
/// file/line/function, matching the engine policy for unrecoverable
/// setup errors (allocation failures, unexpected OS errors during init).
#[macro_export]
macro_rules! setup_error {
    ($msg:expr) => {
        $crate::RuntimeError::Setup {
            file:     file!(),
            line:     line!(),
            function: {
                fn f() {}
                fn type_name_of<T>(_: T) -> &'static str {
                    std::any::type_name::<T>()
                }
                let name = type_name_of(f);
                &name[..name.len() - 3]
            },
            message:  $msg.to_string(),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(RuntimeError::from(ArgError::MissingRole).error_code(), "missing_role");
        assert_eq!(RuntimeError::from(SockError::ExpectedTransient).error_code(), "expected_transient");
    }

    #[test]
    fn expected_transient_is_not_a_hard_failure() {
        let err = SockError::from_connect_io(std::io::Error::from_raw_os_error(99));
        assert!(err.is_expected_transient());
    }
}
