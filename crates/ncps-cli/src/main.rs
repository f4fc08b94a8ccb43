//! `ncps` - command-line driver for the connection-rate benchmark engine in
//! `ncps-core`. Owns argument parsing, output-stream selection (`-o`), and
//! process exit codes; every cross-field validation rule lives in
//! `ncps_core::config::RunConfig::build`, not here.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::process;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ncps_core::config::{RawArgs, RunConfig};
use ncps_error::RuntimeError;

/// TCP connection-rate benchmark: drives connect/accept cycles at scale and
/// reports connections/sec, throughput, and SYN RTT/retransmit statistics.
#[derive(Parser, Debug)]
#[command(name = "ncps", author, version, about, long_about = None)]
struct Cli {
    /// Run as a server, accepting connections.
    #[arg(short = 's', long, conflicts_with = "client")]
    server: bool,

    /// Run as a client, connecting to this remote address.
    #[arg(short = 'c', long = "client", value_name = "IP")]
    client: Option<String>,

    /// Worker thread count (default 16, max 1024).
    #[arg(short = 'r', long = "threads", default_value_t = 0)]
    threads: u32,

    /// Local bind address.
    #[arg(short = 'b', long = "bind", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// Base port: listener's start (server) or remote start (client).
    #[arg(long = "bp")]
    base_port: Option<u16>,

    /// Count of ports starting at `--bp`.
    #[arg(long = "np")]
    port_count: Option<u32>,

    /// Client local base port; 0 means ephemeral.
    #[arg(long = "bcp", default_value_t = 0)]
    client_base_port: u16,

    /// Client local port count, mandatory when `--bcp` is nonzero.
    #[arg(long = "ncp")]
    client_port_count: Option<u32>,

    /// Client: cartesian product of local x remote ports.
    #[arg(long = "xconnect")]
    xconnect: bool,

    /// Client: total connections to open.
    #[arg(short = 'N', long = "total-connections")]
    total_connections: Option<u64>,

    /// Client: pending-connect cap.
    #[arg(short = 'P', long = "pending-cap")]
    pending_cap: Option<u64>,

    /// Client: per-connection duration in milliseconds.
    #[arg(short = 'D', long = "duration-ms", default_value_t = 0)]
    connection_duration_ms: u64,

    /// Transfer mode: 0=no-io, 1=one-io, p=ping-pong, s=cont. send, r=cont. recv.
    #[arg(short = 'M', long = "mode", default_value = "1")]
    mode: String,

    /// Display interval, seconds.
    #[arg(short = 'i', long = "interval", default_value_t = 1)]
    interval_secs: u64,

    /// Total run duration, seconds; omit for "forever".
    #[arg(short = 't', long = "run-time")]
    run_time_secs: Option<u64>,

    /// Delay start, seconds.
    #[arg(long = "ds", default_value_t = 0)]
    delay_start_secs: u64,

    /// Warm-up seconds excluded from final stats.
    #[arg(long = "wt", default_value_t = 0)]
    warmup_secs: u64,

    /// Ping-pong period, seconds (also caps the connect rate).
    #[arg(short = 'k', long = "ping-pong-period", default_value_t = 0)]
    ping_pong_period_secs: u64,

    /// TCP keep-alive idle seconds.
    #[arg(long = "tka")]
    keepalive_idle_secs: Option<u32>,

    /// Client: do not reconnect after close.
    #[arg(long = "dnrc")]
    do_not_reconnect: bool,

    /// Busy-poll completions while connections are open.
    #[arg(long = "poll")]
    busy_poll: bool,

    /// Server: SO_REUSEPORT, all workers share all ports.
    #[arg(long = "rup")]
    reuse_port: bool,

    /// Abortive close discipline (RST on close).
    #[arg(long = "abortiveclose", conflicts_with = "normalclose")]
    abortiveclose: bool,

    /// Normal close discipline (FIN on close).
    #[arg(long = "normalclose")]
    normalclose: bool,

    /// Half-close (shutdown write) before close.
    #[arg(long = "disconbc", conflicts_with = "nodisconbc")]
    disconbc: bool,

    /// Disable half-close before close.
    #[arg(long = "nodisconbc")]
    nodisconbc: bool,

    /// I/O buffer size in bytes (default 1000, 0 -> default).
    #[arg(long = "len", default_value_t = 0)]
    io_buffer_len: usize,

    /// Suppress periodic display.
    #[arg(long = "sil")]
    silent: bool,

    /// Start in brief display mode.
    #[arg(long = "brief")]
    brief: bool,

    /// Redirect output to this file instead of stdout.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: Option<String>,

    /// Comma-separated per-worker CPU indices, or `nonrss` for Linux auto-detect.
    #[arg(long = "aff")]
    affinity: Option<String>,
}

impl Cli {
    fn into_raw_args(self) -> RawArgs {
        RawArgs {
            server: self.server,
            client_remote: self.client,
            threads: self.threads,
            bind_addr: self.bind,
            base_port: self.base_port.unwrap_or_else(ncps_core::config::default_base_port),
            port_count: self.port_count,
            client_base_port: self.client_base_port,
            client_port_count: self.client_port_count,
            cartesian: self.xconnect,
            total_connections: self.total_connections,
            pending_cap: self.pending_cap,
            connection_duration_ms: self.connection_duration_ms,
            transfer_mode: self.mode,
            display_interval_secs: self.interval_secs,
            run_duration_secs: self.run_time_secs,
            delay_start_secs: self.delay_start_secs,
            warmup_secs: self.warmup_secs,
            ping_pong_period_secs: self.ping_pong_period_secs,
            keepalive_idle_secs: self.keepalive_idle_secs,
            do_not_reconnect: self.do_not_reconnect,
            busy_poll: self.busy_poll,
            reuse_port: self.reuse_port,
            abortive_close: self.abortiveclose,
            normal_close: self.normalclose,
            half_close_before_close: self.disconbc,
            no_half_close: self.nodisconbc,
            io_buffer_len: self.io_buffer_len,
            silent: self.silent,
            brief: self.brief,
            affinity: self.affinity,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let cmdline: String = std::env::args().collect::<Vec<_>>().join(" ");
    let output_path = cli.output.clone();
    let raw = cli.into_raw_args();

    let result = RunConfig::build(raw)
        .map_err(RuntimeError::from)
        .and_then(|config| run_with_output(config, &cmdline, output_path.as_deref()));

    if let Err(e) = result {
        eprintln!("ncps: {e}");
        process::exit(exit_code_for(&e));
    }
}

fn run_with_output(config: RunConfig, cmdline: &str, output_path: Option<&str>) -> Result<(), RuntimeError> {
    match output_path {
        Some(path) => {
            let file = File::create(path).map_err(|e| ncps_error::setup_error!(format!("cannot open -o {path}: {e}")))?;
            let mut writer = BufWriter::new(file);
            let result = ncps_core::supervisor::run(config, cmdline, &mut writer);
            result?;
            writer
                .flush()
                .map_err(|e| ncps_error::setup_error!(format!("flush failed: {e}")))
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            ncps_core::supervisor::run(config, cmdline, &mut lock)
        }
    }
}

/// Non-zero on argument or runtime error, `0` on a normal end-of-duration
/// return from the supervisor (the caller only reaches `exit_code_for` on
/// `Err`, so this just distinguishes the error classes for scripting).
fn exit_code_for(err: &RuntimeError) -> i32 {
    match err {
        RuntimeError::Args(_) => 2,
        RuntimeError::Sock(_) => 3,
        RuntimeError::Setup { .. } => 4,
    }
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "ncps=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
