//! CPU pinning and the Linux-only non-RSS activity sampler (§4.5 "Affinity",
//! §4.6, §11).
//!
//! A worker picks up a non-negative `proc_index` from its shared slot on
//! every loop iteration and pins itself, clearing the slot afterwards; the
//! supervisor can rewrite the slot at runtime once the RSS sampler finishes
//! (automatic non-RSS affinity).

use std::fs;
use std::sync::atomic::{AtomicI64, Ordering};

/// Pins the calling thread to `cpu` via `sched_setaffinity`. Best-effort:
/// failures are logged, not fatal, since affinity is an optimization.
pub fn pin_current_thread(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::warn!(cpu, "sched_setaffinity failed: {}", std::io::Error::last_os_error());
        } else {
            tracing::debug!(cpu, "worker pinned");
        }
    }
}

/// Shared slot the supervisor writes and the worker polls once per loop
/// iteration. `-1` means "no pin requested".
pub fn new_proc_index_slot(initial: Option<usize>) -> AtomicI64 {
    AtomicI64::new(initial.map_or(-1, |c| c as i64))
}

/// Worker-side poll: if a non-negative index is pending, pin to it and
/// clear the slot so it is only applied once.
pub fn poll_and_pin(slot: &AtomicI64) {
    let value = slot.swap(-1, Ordering::AcqRel);
    if value >= 0 {
        pin_current_thread(value as usize);
    }
}

/// The 2-epoch non-RSS activity sampler (§11). Reads `/proc/softirqs`'
/// `NET_RX:` line, which lists one whitespace-separated decimal counter per
/// CPU (Linux only; unavailable elsewhere).
pub struct RssSampler {
    epoch:     u8,
    snapshot0: Vec<u64>,
}

impl Default for RssSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RssSampler {
    /// A fresh sampler at epoch 0 (not yet triggered).
    pub fn new() -> Self {
        Self {
            epoch:     0,
            snapshot0: Vec::new(),
        }
    }

    /// Advances the sampler one report interval given the just-observed
    /// aggregate CPS. The first qualifying tick (epoch 0) takes the initial
    /// softirq snapshot; the next (epoch 1) takes the second and returns
    /// `Some(candidates)`, the set of CPU indices whose softirq delta is
    /// below the computed threshold. Resets to epoch 0 if CPS drops below
    /// the trigger before completion.
    pub fn tick(&mut self, aggregate_cps: u64) -> Option<Vec<usize>> {
        use crate::constants::{RSS_SAMPLER_CPS_THRESHOLD, RSS_SAMPLER_THRESHOLD_FRACTION};

        if aggregate_cps < RSS_SAMPLER_CPS_THRESHOLD {
            self.epoch = 0;
            self.snapshot0.clear();
            return None;
        }

        match self.epoch {
            0 => {
                self.snapshot0 = read_net_rx_counters().unwrap_or_default();
                self.epoch = 1;
                None
            }
            _ => {
                let snapshot1 = read_net_rx_counters().unwrap_or_default();
                self.epoch = 0;
                let deltas: Vec<u64> = self
                    .snapshot0
                    .iter()
                    .zip(snapshot1.iter())
                    .map(|(a, b)| b.saturating_sub(*a))
                    .collect();
                self.snapshot0.clear();
                let max_delta = deltas.iter().copied().max().unwrap_or(0);
                if max_delta == 0 {
                    return None;
                }
                let threshold = max_delta / RSS_SAMPLER_THRESHOLD_FRACTION;
                let candidates: Vec<usize> = deltas
                    .iter()
                    .enumerate()
                    .filter(|&(_, &d)| d < threshold)
                    .map(|(i, _)| i)
                    .collect();
                Some(candidates)
            }
        }
    }
}

/// Parses `/proc/softirqs`' `NET_RX:` line into per-CPU counters. Returns
/// `None` (not an error) if the file or line is absent, since this is an
/// optional Linux-only capability (§9 "treat as an optional capability").
fn read_net_rx_counters() -> Option<Vec<u64>> {
    let text = fs::read_to_string("/proc/softirqs").ok()?;
    parse_net_rx_line(&text)
}

fn parse_net_rx_line(text: &str) -> Option<Vec<u64>> {
    let line = text.lines().find(|l| l.trim_start().starts_with("NET_RX:"))?;
    let rest = line.trim_start().strip_prefix("NET_RX:")?;
    Some(
        rest.split_whitespace()
            .take(1024)
            .filter_map(|tok| tok.parse::<u64>().ok())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_net_rx_counters_from_softirqs_text() {
        let text = "                    CPU0       CPU1\n\
                     HI:            0          0\n\
                     NET_RX:    12345       6789\n\
                     NET_TX:       10          2\n";
        let counters = parse_net_rx_line(text).unwrap();
        assert_eq!(counters, vec![12_345, 6_789]);
    }

    #[test]
    fn missing_net_rx_line_returns_none() {
        assert!(parse_net_rx_line("HI: 0 0\n").is_none());
    }

    #[test]
    fn sampler_resets_below_trigger() {
        let mut s = RssSampler::new();
        assert_eq!(s.tick(500), None);
        assert_eq!(s.epoch, 0);
    }

    #[test]
    fn sampler_advances_epochs_while_cps_stays_high() {
        let mut s = RssSampler::new();
        assert!(s.tick(20_000).is_none());
        assert_eq!(s.epoch, 1);
        // Epoch 1 always resets to 0 regardless of whether /proc/softirqs
        // exists in the test environment.
        let _ = s.tick(20_000);
        assert_eq!(s.epoch, 0);
    }
}
