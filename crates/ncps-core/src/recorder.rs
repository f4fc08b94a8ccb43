//! The connection recorder: a global, lock-free histogram of SYN RTT and
//! retransmit counts, shared read-write across every worker via atomics.
//!
//! Mirrors `connrec.c`'s `g_connrec` global: every worker calls
//! [`Recorder::record`] once per established connection, and the supervisor
//! calls [`Recorder::summarize`] once, after [`Recorder::stop`], to produce
//! the final report (§4.4).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::constants::{CONN_BATCH, MAX_BATCHES, MAX_RTT_US, PERCENTILES_BP};

/// Lock-free accumulator of per-connection SYN RTT and retransmit counts.
///
/// All fields are atomics so every worker can call [`Recorder::record`]
/// concurrently without coordination; only `summarize` (called after `stop`,
/// when no worker is still recording) reads them non-atomically in spirit,
/// though it still uses `Ordering::Acquire` loads for safety.
pub struct Recorder {
    /// Nonzero while recording; the millisecond epoch the run's warm-up
    /// boundary was crossed at.
    t0_ms: AtomicU64,
    /// Strictly non-decreasing count of recorded connections.
    count: AtomicU64,
    /// `rtt_map[i]` = number of connections whose SYN RTT, clamped to
    /// `MAX_RTT_US`, equals exactly `i` microseconds.
    rtt_map: Vec<AtomicU32>,
    /// `time_map[k]` = milliseconds from `t0` to the `(k+1) * CONN_BATCH`-th
    /// connection. Written exactly once per crossed batch boundary.
    time_map: Vec<AtomicU64>,
    rtt_sum_us: AtomicU64,
    rexmit_sum: AtomicU64,
    rexmit_conns: AtomicU64,
    final_count: AtomicU64,
    final_elapsed_ms: AtomicU64,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    /// `connrec_init`: allocate and zero the histograms.
    pub fn new() -> Self {
        Self {
            t0_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
            rtt_map: (0..=MAX_RTT_US).map(|_| AtomicU32::new(0)).collect(),
            time_map: (0..MAX_BATCHES).map(|_| AtomicU64::new(0)).collect(),
            rtt_sum_us: AtomicU64::new(0),
            rexmit_sum: AtomicU64::new(0),
            rexmit_conns: AtomicU64::new(0),
            final_count: AtomicU64::new(0),
            final_elapsed_ms: AtomicU64::new(0),
        }
    }

    /// `connrec_start`: publish `t0` and begin recording.
    pub fn start(&self, now_ms: u64) {
        self.t0_ms.store(now_ms.max(1), Ordering::Release);
    }

    /// True once [`Recorder::start`] has run and before [`Recorder::stop`].
    pub fn is_recording(&self) -> bool {
        self.t0_ms.load(Ordering::Acquire) != 0
    }

    /// `connrec_record`: called once per established connection.
    ///
    /// The returned connection index `n` is the value used to claim a
    /// `time_map` slot; only the worker that crosses a `CONN_BATCH` boundary
    /// exactly writes that slot, which is what makes the write-once
    /// guarantee hold without a lock (§3 lifecycles).
    pub fn record(&self, now_ms: u64, syn_retrans: u32, rtt_us: u32) {
        let n = self.count.fetch_add(1, Ordering::AcqRel) + 1;

        if n % CONN_BATCH == 0 {
            let batch_index = (n / CONN_BATCH) as usize - 1;
            if batch_index < MAX_BATCHES {
                let t0 = self.t0_ms.load(Ordering::Acquire);
                self.time_map[batch_index].store(now_ms.saturating_sub(t0), Ordering::Release);
            }
        }

        let clamped = (rtt_us as usize).min(MAX_RTT_US);
        self.rtt_sum_us.fetch_add(rtt_us as u64, Ordering::Relaxed);
        self.rtt_map[clamped].fetch_add(1, Ordering::Relaxed);

        if syn_retrans > 0 {
            self.rexmit_sum.fetch_add(syn_retrans as u64, Ordering::Relaxed);
            self.rexmit_conns.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// `connrec_stop`: freeze `t0` and capture the final count/elapsed time.
    pub fn stop(&self, now_ms: u64) {
        let t0 = self.t0_ms.swap(0, Ordering::AcqRel);
        self.final_count.store(self.count.load(Ordering::Acquire), Ordering::Release);
        self.final_elapsed_ms
            .store(now_ms.saturating_sub(t0), Ordering::Release);
    }

    /// Connections recorded so far in this run (or the last one, once stopped).
    pub fn connection_count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Connection count captured by the last [`Recorder::stop`].
    pub fn final_connection_count(&self) -> u64 {
        self.final_count.load(Ordering::Acquire)
    }

    /// Elapsed milliseconds from `start` to the last [`Recorder::stop`].
    pub fn final_elapsed_ms(&self) -> u64 {
        self.final_elapsed_ms.load(Ordering::Acquire)
    }

    /// Time-to-Nth-connection samples recorded so far, as `(n, elapsed_ms)`
    /// pairs for every batch boundary crossed.
    pub fn time_to_nth(&self) -> Vec<(u64, u64)> {
        let count = self.connection_count();
        let crossed = (count / CONN_BATCH) as usize;
        (0..crossed.min(MAX_BATCHES))
            .map(|k| {
                let n = (k as u64 + 1) * CONN_BATCH;
                (n, self.time_map[k].load(Ordering::Acquire))
            })
            .collect()
    }

    /// Computes the SYN-RTT percentile table and retransmit summary.
    /// `summarize` is only meaningful after `stop()`; it never mutates.
    pub fn summarize(&self) -> Summary {
        let total: u64 = self.rtt_map.iter().map(|b| u64::from(b.load(Ordering::Acquire))).sum();
        let mut percentiles = Vec::with_capacity(PERCENTILES_BP.len());

        if total == 0 {
            for (label, _) in PERCENTILES_BP {
                percentiles.push((label, 0));
            }
        } else {
            let mut targets: Vec<(usize, u64)> = PERCENTILES_BP
                .iter()
                .enumerate()
                .map(|(i, (_, bp))| {
                    let t = (u128::from(total) * u128::from(*bp) / 10_000) as u64;
                    (i, t.max(1))
                })
                .collect();
            targets.sort_by_key(|&(_, t)| t);

            let mut cumulative = 0u64;
            let mut found = vec![None; PERCENTILES_BP.len()];
            let mut next = 0usize;
            for (bucket, counter) in self.rtt_map.iter().enumerate() {
                cumulative += u64::from(counter.load(Ordering::Acquire));
                while next < targets.len() && cumulative >= targets[next].1 {
                    found[targets[next].0] = Some(bucket as u32);
                    next += 1;
                }
                if next == targets.len() {
                    break;
                }
            }
            for (i, (label, _)) in PERCENTILES_BP.iter().enumerate() {
                percentiles.push((*label, found[i].unwrap_or(MAX_RTT_US as u32)));
            }
        }

        let rtt_sum = self.rtt_sum_us.load(Ordering::Acquire);
        let avg_rtt_us = if total == 0 { 0.0 } else { rtt_sum as f64 / total as f64 };
        let rexmit_conns = self.rexmit_conns.load(Ordering::Acquire);
        let rexmit_sum = self.rexmit_sum.load(Ordering::Acquire);

        Summary {
            total_connections: total,
            avg_rtt_us,
            percentiles_us: percentiles,
            rexmit_conn_fraction: if total == 0 { 0.0 } else { rexmit_conns as f64 / total as f64 },
            rexmit_per_conn: if total == 0 { 0.0 } else { rexmit_sum as f64 / total as f64 },
            time_to_nth: self.time_to_nth(),
        }
    }
}

/// Computed statistics, ready for the human table and `###`-tagged lines.
#[derive(Debug, Clone)]
pub struct Summary {
    /// Total connections the percentile table was computed over.
    pub total_connections: u64,
    /// Mean SYN RTT across every recorded connection, in microseconds.
    pub avg_rtt_us:         f64,
    /// `(percentile label, bucket microseconds)` pairs, in the fixed order
    /// from [`PERCENTILES_BP`].
    pub percentiles_us:      Vec<(&'static str, u32)>,
    /// Fraction of connections with >=1 SYN retransmit.
    pub rexmit_conn_fraction: f64,
    /// Mean SYN retransmits per connection (including clean ones).
    pub rexmit_per_conn:      f64,
    /// Time-to-Nth-connection samples; see [`Recorder::time_to_nth`].
    pub time_to_nth:          Vec<(u64, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_count_matches_bucket_sum() {
        let rec = Recorder::new();
        rec.start(1);
        for i in 0..1000u32 {
            rec.record(10, 0, i % 500);
        }
        let summary = rec.summarize();
        assert_eq!(summary.total_connections, 1000);
    }

    #[test]
    fn saturates_rtt_above_max() {
        let rec = Recorder::new();
        rec.start(1);
        rec.record(10, 0, u32::MAX);
        let summary = rec.summarize();
        assert_eq!(summary.total_connections, 1);
        // The single sample landed in the top bucket.
        assert!(summary.percentiles_us.iter().all(|&(_, b)| b == MAX_RTT_US as u32));
    }

    #[test]
    fn retransmit_fraction_tracks_flagged_connections() {
        let rec = Recorder::new();
        rec.start(1);
        for i in 0..10u32 {
            rec.record(10, u32::from(i < 3), 100);
        }
        let summary = rec.summarize();
        assert!((summary.rexmit_conn_fraction - 0.3).abs() < 1e-9);
    }

    #[test]
    fn time_map_batch_written_once_per_hundred_thousand() {
        let rec = Recorder::new();
        rec.start(5);
        for _ in 0..CONN_BATCH {
            rec.record(20, 0, 50);
        }
        let samples = rec.time_to_nth();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0, CONN_BATCH);
    }

    #[test]
    fn percentile_query_returns_smallest_covering_bucket() {
        let rec = Recorder::new();
        rec.start(1);
        // Ten samples at RTT=10us, ten at RTT=20us.
        for _ in 0..10 {
            rec.record(0, 0, 10);
        }
        for _ in 0..10 {
            rec.record(0, 0, 20);
        }
        let summary = rec.summarize();
        let p50 = summary.percentiles_us.iter().find(|&&(l, _)| l == "50").unwrap().1;
        assert!(p50 <= 20);
    }
}
