//! Per-worker counters, single-writer (the owning worker) / single-reader
//! (the supervisor), each the size of a native word (§5, §4.6).
//!
//! The worker writes with `Ordering::Relaxed` (it never needs to observe its
//! own writes through another thread); the supervisor reads with
//! `Ordering::Acquire` so delta-based rates never mix pre- and post-update
//! values from a single field (§9 "Process-global counters/flags").

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cumulative, monotonic-except-for-`open_pending` counters owned by one
/// worker and polled by the supervisor.
#[derive(Default)]
pub struct WorkerCounters {
    /// Successful connects/accepts, cumulative.
    pub opened:          AtomicU64,
    /// Closes issued, cumulative.
    pub closed:          AtomicU64,
    /// Failed connects/accepts, cumulative.
    pub open_failures:   AtomicU64,
    /// Failed reads/writes, cumulative.
    pub io_failures:     AtomicU64,
    /// Bytes received, cumulative.
    pub rx_bytes:        AtomicU64,
    /// Bytes sent, cumulative.
    pub tx_bytes:        AtomicU64,
    /// Connections currently admitted but not yet completed
    /// (`open_pending_count`), instantaneous rather than cumulative.
    pub open_pending:    AtomicU64,
    /// Connections with >=1 SYN retransmit, cumulative.
    pub retransmitted:   AtomicU64,
    /// Connections with 0 SYN retransmits, cumulative.
    pub clean:           AtomicU64,
    /// Sum of SYN RTT (microseconds) over `clean` connections.
    pub clean_rtt_sum_us: AtomicU64,
    /// Sum of SYN RTT (microseconds) over `retransmitted` connections.
    pub retransmitted_rtt_sum_us: AtomicU64,
    /// Sum of SYN retransmit counts across every connection (distinct from
    /// `retransmitted`, which only counts connections with >=1 retransmit;
    /// this is the total number of retransmitted SYNs, the `RT/i` column).
    pub retrans_total: AtomicU64,
    /// Set when this worker's local port range wraps; cleared by the
    /// supervisor after being surfaced once (§11 "Port-wrap reporting").
    pub port_wrapped:    AtomicBool,
}

impl WorkerCounters {
    /// Records a successfully established connection's RTT/retransmit
    /// bucket. Does *not* touch `open_pending`: admission accounting
    /// (`record_admitted`/`record_release`) is only meaningful for the
    /// client's pending-connect cap and is the caller's responsibility.
    pub fn record_open(&self, syn_retrans: u32, rtt_us: u32) {
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.retrans_total.fetch_add(u64::from(syn_retrans), Ordering::Relaxed);
        if syn_retrans > 0 {
            self.retransmitted.fetch_add(1, Ordering::Relaxed);
            self.retransmitted_rtt_sum_us.fetch_add(u64::from(rtt_us), Ordering::Relaxed);
        } else {
            self.clean.fetch_add(1, Ordering::Relaxed);
            self.clean_rtt_sum_us.fetch_add(u64::from(rtt_us), Ordering::Relaxed);
        }
    }

    /// A connect or accept attempt failed.
    pub fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A read or write attempt failed.
    pub fn record_io_failure(&self) {
        self.io_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A `tcp_close` was issued for a connection.
    pub fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// A connect attempt was admitted under the pending-connect cap.
    pub fn record_admitted(&self) {
        self.open_pending.fetch_add(1, Ordering::Relaxed);
    }

    /// The admission slot taken by `record_admitted` has been released
    /// (connect resolved, successfully or not).
    pub fn record_release(&self) {
        self.open_pending.fetch_sub(1, Ordering::Relaxed);
    }

    /// Adds `n` bytes to the cumulative receive total.
    pub fn add_rx(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Adds `n` bytes to the cumulative send total.
    pub fn add_tx(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Flags that this worker's local port range just wrapped.
    pub fn mark_port_wrapped(&self) {
        self.port_wrapped.store(true, Ordering::Relaxed);
    }

    /// The supervisor consumes this flag once per display interval.
    pub fn take_port_wrapped(&self) -> bool {
        self.port_wrapped.swap(false, Ordering::AcqRel)
    }

    /// A consistent-enough snapshot for rate computation; the supervisor is
    /// the sole reader so torn reads only ever perturb a single sample
    /// (§5 "Shared resources").
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            opened:        self.opened.load(Ordering::Acquire),
            closed:        self.closed.load(Ordering::Acquire),
            open_failures: self.open_failures.load(Ordering::Acquire),
            io_failures:   self.io_failures.load(Ordering::Acquire),
            rx_bytes:      self.rx_bytes.load(Ordering::Acquire),
            tx_bytes:      self.tx_bytes.load(Ordering::Acquire),
            open_pending:  self.open_pending.load(Ordering::Acquire),
            retransmitted: self.retransmitted.load(Ordering::Acquire),
            clean:         self.clean.load(Ordering::Acquire),
            clean_rtt_sum_us: self.clean_rtt_sum_us.load(Ordering::Acquire),
            retransmitted_rtt_sum_us: self.retransmitted_rtt_sum_us.load(Ordering::Acquire),
            retrans_total: self.retrans_total.load(Ordering::Acquire),
        }
    }
}

/// A point-in-time copy of [`WorkerCounters`], cheap to diff across two
/// display intervals.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    /// Successful connects/accepts, cumulative.
    pub opened:          u64,
    /// Closes issued, cumulative.
    pub closed:          u64,
    /// Failed connects/accepts, cumulative.
    pub open_failures:   u64,
    /// Failed reads/writes, cumulative.
    pub io_failures:     u64,
    /// Bytes received, cumulative.
    pub rx_bytes:        u64,
    /// Bytes sent, cumulative.
    pub tx_bytes:        u64,
    /// Connections currently admitted but not yet completed, instantaneous.
    pub open_pending:    u64,
    /// Connections with >=1 SYN retransmit, cumulative.
    pub retransmitted:   u64,
    /// Connections with 0 SYN retransmits, cumulative.
    pub clean:           u64,
    /// Sum of SYN RTT (microseconds) over `clean` connections.
    pub clean_rtt_sum_us: u64,
    /// Sum of SYN RTT (microseconds) over `retransmitted` connections.
    pub retransmitted_rtt_sum_us: u64,
    /// Sum of SYN retransmit counts across every connection.
    pub retrans_total: u64,
}

impl CounterSnapshot {
    /// Element-wise difference against an earlier snapshot, saturating at 0
    /// (guards against the rare torn-read underflow called out in §5).
    pub fn delta(&self, earlier: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            opened:        self.opened.saturating_sub(earlier.opened),
            closed:        self.closed.saturating_sub(earlier.closed),
            open_failures: self.open_failures.saturating_sub(earlier.open_failures),
            io_failures:   self.io_failures.saturating_sub(earlier.io_failures),
            rx_bytes:      self.rx_bytes.saturating_sub(earlier.rx_bytes),
            tx_bytes:      self.tx_bytes.saturating_sub(earlier.tx_bytes),
            open_pending:  self.open_pending,
            retransmitted: self.retransmitted.saturating_sub(earlier.retransmitted),
            clean:         self.clean.saturating_sub(earlier.clean),
            clean_rtt_sum_us: self.clean_rtt_sum_us.saturating_sub(earlier.clean_rtt_sum_us),
            retransmitted_rtt_sum_us: self.retransmitted_rtt_sum_us.saturating_sub(earlier.retransmitted_rtt_sum_us),
            retrans_total: self.retrans_total.saturating_sub(earlier.retrans_total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_pending_tracks_admission_then_release() {
        let c = WorkerCounters::default();
        c.record_admitted();
        c.record_admitted();
        assert_eq!(c.snapshot().open_pending, 2);
        c.record_open(0, 100);
        c.record_release();
        assert_eq!(c.snapshot().open_pending, 1);
        c.record_open_failure();
        c.record_release();
        assert_eq!(c.snapshot().open_pending, 0);
    }

    #[test]
    fn delta_is_nonnegative_and_monotonic_fields_accumulate() {
        let c = WorkerCounters::default();
        let a = c.snapshot();
        for _ in 0..5 {
            c.record_admitted();
            c.record_open(0, 10);
            c.record_release();
        }
        let b = c.snapshot();
        assert_eq!(b.delta(&a).opened, 5);
    }

    #[test]
    fn retrans_total_sums_every_connections_count_not_just_flagged_ones() {
        let c = WorkerCounters::default();
        c.record_open(0, 10);
        c.record_open(3, 20);
        c.record_open(1, 5);
        assert_eq!(c.snapshot().retrans_total, 4);
        assert_eq!(c.snapshot().retransmitted, 2);
    }

    #[test]
    fn port_wrapped_flag_is_consumed_once() {
        let c = WorkerCounters::default();
        c.mark_port_wrapped();
        assert!(c.take_port_wrapped());
        assert!(!c.take_port_wrapped());
    }
}
