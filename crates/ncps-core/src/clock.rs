//! Monotonic wall-free timestamps.
//!
//! Both functions are backed by [`std::time::Instant`], which the standard
//! library guarantees is monotonic on every supported platform, pinned to a
//! process-local epoch established on first use. Neither function can
//! regress.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic milliseconds since an arbitrary process-local epoch.
///
/// Used to drive wait-list scheduling, periodic reporting, and the
/// time-to-Nth-connection table.
pub fn now_ms() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Monotonic microseconds since an arbitrary process-local epoch.
///
/// Used for SYN RTT measurement, where millisecond resolution is too coarse
/// on loopback and LAN connects.
pub fn now_us() -> u64 {
    epoch().elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_never_regress() {
        let a_ms = now_ms();
        let a_us = now_us();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b_ms = now_ms();
        let b_us = now_us();
        assert!(b_ms >= a_ms);
        assert!(b_us >= a_us);
    }

    #[test]
    fn microseconds_are_finer_than_milliseconds() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }
}
