//! Core connection-rate engine for `ncps`: the waiter, socket pool, recorder,
//! per-worker state machine, and supervisor that `ncps-cli` drives.
//!
//! Module map (§4 in the design notes):
//! - [`clock`]: monotonic millisecond/microsecond timestamps.
//! - [`socket`]: the socket pool and per-socket bookkeeping.
//! - [`waiter`]: the epoll-backed completion interface.
//! - [`config`]: validated run configuration, shared by the CLI and engine.
//! - [`constants`]: tunables lifted from the original sources.
//! - [`recorder`]: the lock-free SYN-RTT/retransmit histogram.
//! - [`counters`]: per-worker throughput/error counters.
//! - [`portwalk`]: client-side local/remote port-walking policy.
//! - [`waitlist`]: the duetime-ordered parked-connection list.
//! - [`ratelimit`]: token-bucket pacing for `-k`.
//! - [`affinity`]: CPU pinning and the non-RSS activity sampler.
//! - [`engine`]: the per-worker run loop tying all of the above together.
//! - [`supervisor`]: spawns workers, reports, and owns the shared controls.
//! - [`console`]: the interactive keypress thread (pause/brief toggles).

pub mod affinity;
pub mod clock;
pub mod config;
pub mod console;
pub mod constants;
pub mod counters;
pub mod engine;
pub mod portwalk;
pub mod ratelimit;
pub mod recorder;
pub mod socket;
pub mod supervisor;
pub mod waiter;
pub mod waitlist;
