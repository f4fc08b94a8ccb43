//! Tunable constants lifted from the original `ncps`/`sockwiz` sources.
//!
//! Kept in one place so the numbers in the spec (§4.2, §4.4, §4.5, §6) have a
//! single, greppable home instead of being scattered as magic literals.

/// Top bin of the SYN-RTT histogram, in microseconds. RTTs above this are
/// saturated into the last bucket.
pub const MAX_RTT_US: usize = 10_000_000;

/// Number of time-to-Nth-connection samples the recorder can hold.
pub const MAX_BATCHES: usize = 20_000;

/// Connection-count granularity of the time-to-Nth-connection table: entry
/// `k` holds the elapsed time to the `(k + 1) * CONN_BATCH`-th connection.
pub const CONN_BATCH: u64 = 100_000;

/// Results cached by the waiter per `wait()` call before the OS is consulted
/// again (`ASYNC_RESULT_CACHE_SIZE` in the original).
pub const ASYNC_RESULT_CACHE_SIZE: usize = 16;

/// Ready-list entries a worker dispatches per marker pass (§4.5 step 2).
pub const BATCH_SIZE: usize = 10;

/// Default `-r` worker thread count.
pub const DEFAULT_THREAD_COUNT: u32 = 16;

/// Maximum `-r` worker thread count.
pub const MAX_THREADS: u32 = 1024;

/// Default `-len` I/O buffer size in bytes.
pub const DATA_BUF_SIZE: usize = 1000;

/// Default `-bp` base port.
pub const DEFAULT_BASE_PORT: u16 = 10_001;

/// Highest port number plus one; `-bp` + `-np` must not exceed this.
pub const PORT_SPACE: u32 = 65_536;

/// Fixed TCP keep-alive probe interval applied whenever `-tka` is set.
pub const KEEPALIVE_INTERVAL_SECS: u32 = 1;

/// Fixed TCP keep-alive probe count applied whenever `-tka` is set.
pub const KEEPALIVE_PROBE_COUNT: u32 = 10;

/// Aggregate CPS threshold that advances the RSS-activity sampler's epoch
/// (§4.6, supplemented in `SPEC_FULL.md` §11).
pub const RSS_SAMPLER_CPS_THRESHOLD: u64 = 10_000;

/// Fraction of the maximum per-CPU softirq delta below which a CPU is
/// considered a non-RSS candidate.
pub const RSS_SAMPLER_THRESHOLD_FRACTION: u64 = 10;

/// Worker suspension timeout when it has no ready work, in milliseconds.
pub const IDLE_WAIT_TIMEOUT_MS: i32 = 100;

/// Sleep granularity while `pause_all_activity` is set.
pub const PAUSE_POLL_INTERVAL_MS: u64 = 100;

/// Percentiles reported by `Recorder::summarize`, expressed as parts per
/// 10 000 so they can be represented exactly without floating point (25% ->
/// 2500, 99.99% -> 9999).
pub const PERCENTILES_BP: [(&str, u32); 8] = [
    ("25", 2_500),
    ("50", 5_000),
    ("75", 7_500),
    ("90", 9_000),
    ("95", 9_500),
    ("99", 9_900),
    ("99.9", 9_990),
    ("99.99", 9_999),
];
