//! Errors raised while parsing and validating command-line parameters.

/// Problems detected while parsing or cross-validating CLI flags.
#[derive(Debug, thiserror::Error)]
pub enum ArgError {
    #[error("invalid value {value:?} for option {option}: {reason}")]
    InvalidValue {
        option: String,
        value:  String,
        reason: String,
    },

    #[error("first positional argument must be -s or -c <remote-ip>")]
    MissingRole,

    #[error("worker thread count {0} exceeds the maximum of {1}")]
    TooManyThreads(u32, u32),

    #[error("-np {np} must cover at least -r {threads} ports unless -rup is given")]
    InsufficientListenerPorts { np: u32, threads: u32 },

    #[error("-ncp {ncp} must cover at least -r {threads} ports when -bcp is non-zero")]
    InsufficientClientPorts { ncp: u32, threads: u32 },

    #[error("base port {bp} plus port count {np} exceeds 65536")]
    PortRangeOverflow { bp: u32, np: u32 },

    #[error("-ncp is required when -bcp is non-zero")]
    MissingClientPortCount,
}

impl ArgError {
    /// Stable machine-readable tag for this error, independent of its display text.
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidValue { .. } => "invalid_value",
            Self::MissingRole => "missing_role",
            Self::TooManyThreads(..) => "too_many_threads",
            Self::InsufficientListenerPorts { .. } => "insufficient_listener_ports",
            Self::InsufficientClientPorts { .. } => "insufficient_client_ports",
            Self::PortRangeOverflow { .. } => "port_range_overflow",
            Self::MissingClientPortCount => "missing_client_port_count",
        }
    }
}
