//! The validated, immutable run configuration produced from CLI flags (§6).
//!
//! `ncps-cli` owns argv parsing (a flat `clap::Parser` struct, since the CLI
//! is a flag bag rather than a subcommand tree) and converts its raw struct
//! into a [`RunConfig`] via [`RunConfig::build`], which performs every
//! cross-field validation rule named in §6 before a single worker spawns.

use std::net::IpAddr;

use ncps_error::ArgError;

use crate::constants::{DATA_BUF_SIZE, DEFAULT_BASE_PORT, DEFAULT_THREAD_COUNT, MAX_THREADS, PORT_SPACE};

/// Transfer mode for the I/O phase of a connection (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// `-M 0`: connect/accept then close, no data exchanged.
    NoIo,
    /// `-M 1`: one write followed by one read, then close.
    OneIo,
    /// `-M p`: alternate write/read ("ping-pong") until the connection's
    /// configured duration elapses.
    PingPong,
    /// `-M s`: continuously send only.
    ContinuousSend,
    /// `-M r`: continuously receive only.
    ContinuousRecv,
}

impl TransferMode {
    /// Parses `-M`'s value, rejecting client-only modes when `server_side`.
    pub fn parse(s: &str, server_side: bool) -> Result<Self, ArgError> {
        let mode = match s {
            "0" => TransferMode::NoIo,
            "1" => TransferMode::OneIo,
            "p" => TransferMode::PingPong,
            "s" => TransferMode::ContinuousSend,
            "r" => TransferMode::ContinuousRecv,
            other => {
                return Err(ArgError::InvalidValue {
                    option: "-M".into(),
                    value:  other.into(),
                    reason: "expected one of 0, 1, p, s, r".into(),
                })
            }
        };
        if server_side && !matches!(mode, TransferMode::ContinuousSend | TransferMode::ContinuousRecv) {
            return Err(ArgError::InvalidValue {
                option: "-M".into(),
                value:  s.into(),
                reason: "server only accepts s or r".into(),
            });
        }
        Ok(mode)
    }
}

/// Close discipline (§6 `-abortiveclose` / `-normalclose`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDiscipline {
    /// A graceful close (orderly FIN, optionally preceded by a half-close).
    Normal,
    /// An abortive close (`SO_LINGER` with a zero timeout, forcing RST).
    Abortive,
}

/// Per-worker CPU pinning policy (§4.5 "Affinity", §4.6, §11 RSS sampler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affinity {
    /// No pinning requested.
    None,
    /// Explicit per-worker CPU indices from `-aff <list>`, cycled if shorter
    /// than the thread count.
    Explicit(Vec<usize>),
    /// `-aff nonrss`: Linux-only automatic non-RSS CPU detection (§11).
    NonRss,
}

/// A contiguous port range, inclusive of `start`, exclusive of `start + count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// First port in the range.
    pub start: u16,
    /// Number of ports in the range.
    pub count: u32,
}

impl PortRange {
    /// One past the last port in the range.
    pub fn end_exclusive(&self) -> u32 {
        u32::from(self.start) + self.count
    }
}

/// Listener ports this worker binds, out of the full `[base, base+count)`
/// range every worker is configured with (§6's worked example: `-bp 20000
/// -np 100 -r 3` gives thread 1 `20000, 20003, 20006, ...`). With
/// `reuse_port` every worker binds the entire range via `SO_REUSEPORT`
/// instead of a strided subset.
pub fn listener_ports_for_worker(base: PortRange, thread_count: u32, worker_id: u32, reuse_port: bool) -> Vec<u16> {
    let (offset, step) = if reuse_port { (0, 1) } else { (worker_id, thread_count.max(1)) };
    let end = base.end_exclusive();
    let mut port = u32::from(base.start) + offset;
    let mut out = Vec::new();
    while port < end {
        out.push(port as u16);
        port += step;
    }
    out
}

/// Contiguous chunk of `[base, base+total_count)` assigned to worker
/// `index` out of `parts`, earlier workers getting the remainder (the
/// client local-port-range partitioning in §6/§4.6).
pub fn partition_contiguous_ports(base: u16, total_count: u32, parts: u32, index: u32) -> PortRange {
    let mut start = u32::from(base);
    for i in 0..index {
        start += partition_share(u64::from(total_count), parts, i) as u32;
    }
    let count = partition_share(u64::from(total_count), parts, index) as u32;
    PortRange {
        start: start as u16,
        count,
    }
}

/// Client-only parameters (§6).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The server address to connect to.
    pub remote_addr:       IpAddr,
    /// Remote port range to walk across.
    pub remote_ports:      PortRange,
    /// Local port range to bind from, if `-lp`/`-bcp` was given.
    pub local_ports:       Option<PortRange>,
    /// Walk the cartesian product of local and remote ports instead of
    /// pairing them index-for-index.
    pub cartesian_product: bool,
    /// Total connections to establish across every worker.
    pub total_connections: u64,
    /// Maximum connects in flight at once, across every worker.
    pub pending_cap:       u64,
    /// How long each connection stays open before being closed, in
    /// milliseconds (0 means close as soon as established).
    pub connection_duration_ms: u64,
    /// Don't reopen a connection after it closes.
    pub do_not_reconnect:  bool,
}

/// Server-only parameters (§6).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Ports to listen on.
    pub listen_ports:  PortRange,
    /// Bind every worker to the full port range via `SO_REUSEPORT` instead
    /// of a strided subset.
    pub reuse_port:    bool,
}

/// Role-specific configuration.
#[derive(Debug, Clone)]
pub enum Role {
    /// Acting as the connecting side.
    Client(ClientConfig),
    /// Acting as the listening side.
    Server(ServerConfig),
}

/// Display verbosity (`-brief` cycles 0 -> 1 -> 2 -> 0 at runtime; this is
/// just the initial value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BriefLevel {
    /// Full per-interval table.
    Verbose = 0,
    /// Condensed one-line-per-interval display.
    Brief1 = 1,
    /// Condensed display with the unused-field columns dropped too.
    Brief2 = 2,
}

/// The fully validated, immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Client or server, with its role-specific parameters.
    pub role:          Role,
    /// Number of worker threads.
    pub threads:        u32,
    /// Local address to bind sockets to.
    pub bind_addr:      IpAddr,
    /// What to do with an established connection (ping-pong, stream, etc).
    pub transfer_mode:   TransferMode,
    /// How often the supervisor prints a report row, in seconds.
    pub display_interval_secs: u64,
    /// Total run duration, or `None` to run until interrupted.
    pub run_duration_secs: Option<u64>,
    /// Seconds to wait after startup before opening any connection.
    pub delay_start_secs: u64,
    /// Seconds of warm-up excluded from the final report's statistics.
    pub warmup_secs:     u64,
    /// Ping-pong message period, in seconds (0 disables pacing).
    pub ping_pong_period_secs: u64,
    /// TCP keepalive idle time, or `None` to leave keepalive off.
    pub keepalive_idle_secs: Option<u32>,
    /// Enable `SO_BUSY_POLL` on every socket.
    pub busy_poll:       bool,
    /// Graceful or abortive close.
    pub close_discipline: CloseDiscipline,
    /// Half-close (`shutdown(SHUT_WR)`) before issuing the final close.
    pub half_close_before_close: bool,
    /// Read/write buffer size in bytes.
    pub io_buffer_len:   usize,
    /// Suppress the periodic report rows.
    pub silent:          bool,
    /// Initial display verbosity (`-brief` cycles it at runtime).
    pub brief:           BriefLevel,
    /// Per-worker CPU pinning policy.
    pub affinity:        Affinity,
}

impl RunConfig {
    /// Per-worker share of `-P`, "first R workers get one extra" (§4.6).
    pub fn pending_cap_for_worker(total_cap: u64, threads: u32, worker_id: u32) -> u64 {
        partition_share(total_cap, threads, worker_id)
    }

    /// Number of worker threads this run should spawn.
    pub fn validate_and_threads(raw_threads: u32) -> Result<u32, ArgError> {
        if raw_threads == 0 {
            return Ok(DEFAULT_THREAD_COUNT);
        }
        if raw_threads > MAX_THREADS {
            return Err(ArgError::TooManyThreads(raw_threads, MAX_THREADS));
        }
        Ok(raw_threads)
    }

    /// Validates the listener port range against the thread count (§6: `-np`
    /// must cover at least `-r` threads unless `-rup`).
    pub fn validate_listener_ports(np: u32, threads: u32, reuse_port: bool) -> Result<(), ArgError> {
        if !reuse_port && np < threads {
            return Err(ArgError::InsufficientListenerPorts { np, threads });
        }
        Ok(())
    }

    /// Validates `bp + np <= 65536` for either role's port range.
    pub fn validate_port_range(bp: u16, np: u32) -> Result<(), ArgError> {
        if u32::from(bp) + np > PORT_SPACE {
            return Err(ArgError::PortRangeOverflow { bp: u32::from(bp), np });
        }
        Ok(())
    }

    /// Validates `-ncp` is present and covers `-r` threads whenever `-bcp` is
    /// non-zero (§6).
    pub fn validate_client_ports(bcp: u16, ncp: Option<u32>, threads: u32) -> Result<Option<u32>, ArgError> {
        if bcp == 0 {
            return Ok(None);
        }
        let ncp = ncp.ok_or(ArgError::MissingClientPortCount)?;
        if ncp < threads {
            return Err(ArgError::InsufficientClientPorts { ncp, threads });
        }
        Ok(Some(ncp))
    }
}

/// "First R workers get one extra" partitioning used for `N`, `P`, and the
/// client-local port range (§4.6).
pub fn partition_share(total: u64, parts: u32, index: u32) -> u64 {
    if parts == 0 {
        return 0;
    }
    let parts = u64::from(parts);
    let index = u64::from(index);
    let base = total / parts;
    let remainder = total % parts;
    base + u64::from(index < remainder)
}

/// Default base port (`-bp` omitted).
pub const fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

/// The raw, already-typed flags `ncps-cli`'s `clap::Parser` struct produces,
/// one field per row of §6's table (minus `-o`, which is an output-stream
/// concern the CLI binary owns directly — §1 names it an external
/// collaborator, not part of the engine's configuration). [`RunConfig::build`]
/// performs every cross-field validation rule in §6 against this and
/// produces the immutable [`RunConfig`] the supervisor runs from.
#[derive(Debug, Clone)]
pub struct RawArgs {
    /// `-s`: run as a server.
    pub server:                bool,
    /// `-c <addr>`: run as a client connecting to `addr`.
    pub client_remote:         Option<String>,
    /// `-r`: worker thread count.
    pub threads:               u32,
    /// `-bind`: local address to bind sockets to.
    pub bind_addr:             IpAddr,
    /// `-bp`: first listener/local port.
    pub base_port:             u16,
    /// `-np`: number of listener ports.
    pub port_count:            Option<u32>,
    /// `-bcp`: first client-local port.
    pub client_base_port:      u16,
    /// `-ncp`: number of client-local ports.
    pub client_port_count:     Option<u32>,
    /// `-x`/`-xconnect`: walk the cartesian product of local and remote ports.
    pub cartesian:             bool,
    /// `-n`: total connections to establish.
    pub total_connections:     Option<u64>,
    /// `-P`: maximum connects in flight at once.
    pub pending_cap:           Option<u64>,
    /// `-d`: milliseconds each connection stays open before closing.
    pub connection_duration_ms: u64,
    /// `-M`: transfer mode name, validated by [`TransferMode::parse`].
    pub transfer_mode:         String,
    /// `-D`: seconds between report rows.
    pub display_interval_secs: u64,
    /// `-t`: total run duration in seconds.
    pub run_duration_secs:     Option<u64>,
    /// `-start`: seconds to wait before opening any connection.
    pub delay_start_secs:      u64,
    /// `-wt`: seconds of warm-up excluded from the final report.
    pub warmup_secs:           u64,
    /// `-T`: ping-pong message period in seconds.
    pub ping_pong_period_secs: u64,
    /// `-ka`: TCP keepalive idle time in seconds.
    pub keepalive_idle_secs:   Option<u32>,
    /// `-dnr`: don't reopen a connection after it closes.
    pub do_not_reconnect:      bool,
    /// `-b`: enable `SO_BUSY_POLL`.
    pub busy_poll:             bool,
    /// `-rup`: bind every worker to the full listener range via `SO_REUSEPORT`.
    pub reuse_port:            bool,
    /// `-close abortive`: force an abortive close.
    pub abortive_close:        bool,
    /// `-close normal`: force a graceful close.
    pub normal_close:          bool,
    /// `-halfclose`: half-close before the final close.
    pub half_close_before_close: bool,
    /// `-nohalfclose`: never half-close before the final close.
    pub no_half_close:         bool,
    /// `-l`: read/write buffer size in bytes.
    pub io_buffer_len:         usize,
    /// `-q`: suppress the periodic report rows.
    pub silent:                bool,
    /// `-brief`: start in the condensed display mode.
    pub brief:                 bool,
    /// `-aff`: CPU affinity policy name.
    pub affinity:              Option<String>,
}

impl Default for RawArgs {
    /// Every flag at its §6-documented default, role unset (`build()` will
    /// reject this as-is with [`ArgError::MissingRole`] until the caller
    /// sets `server` or `client_remote`).
    fn default() -> Self {
        Self {
            server:                false,
            client_remote:         None,
            threads:               0,
            bind_addr:             std::net::Ipv4Addr::UNSPECIFIED.into(),
            base_port:             DEFAULT_BASE_PORT,
            port_count:            None,
            client_base_port:      0,
            client_port_count:     None,
            cartesian:             false,
            total_connections:     None,
            pending_cap:           None,
            connection_duration_ms: 0,
            transfer_mode:         "1".into(),
            display_interval_secs: 1,
            run_duration_secs:     None,
            delay_start_secs:      0,
            warmup_secs:           0,
            ping_pong_period_secs: 0,
            keepalive_idle_secs:   None,
            do_not_reconnect:      false,
            busy_poll:             false,
            reuse_port:            false,
            abortive_close:        false,
            normal_close:          false,
            half_close_before_close: false,
            no_half_close:         false,
            io_buffer_len:         DATA_BUF_SIZE,
            silent:                false,
            brief:                 false,
            affinity:              None,
        }
    }
}

impl RunConfig {
    /// Converts parsed CLI flags into a validated [`RunConfig`], applying
    /// every defaulting and cross-validation rule from §6 in the order the
    /// table lists them. Nothing is spawned yet; a returned `Err` means
    /// `ncps-cli` exits before a single socket is opened.
    pub fn build(raw: RawArgs) -> Result<RunConfig, ArgError> {
        let threads = Self::validate_and_threads(raw.threads)?;

        let role = if raw.server {
            let np = raw.port_count.unwrap_or(1);
            Self::validate_port_range(raw.base_port, np)?;
            Self::validate_listener_ports(np, threads, raw.reuse_port)?;
            Role::Server(ServerConfig {
                listen_ports: PortRange { start: raw.base_port, count: np },
                reuse_port:   raw.reuse_port,
            })
        } else if let Some(remote) = raw.client_remote.as_deref() {
            let remote_addr: IpAddr = remote.parse().map_err(|_| ArgError::InvalidValue {
                option: "-c".into(),
                value:  remote.into(),
                reason: "expected an IPv4 or IPv6 address".into(),
            })?;
            let np = raw.port_count.unwrap_or(1);
            Self::validate_port_range(raw.base_port, np)?;
            let ncp = Self::validate_client_ports(raw.client_base_port, raw.client_port_count, threads)?;
            let local_ports = ncp.map(|count| PortRange { start: raw.client_base_port, count });

            let total_connections = raw.total_connections.unwrap_or(u64::from(threads) * 100);
            let pending_cap = raw.pending_cap.unwrap_or(total_connections);

            Role::Client(ClientConfig {
                remote_addr,
                remote_ports: PortRange { start: raw.base_port, count: np },
                local_ports,
                cartesian_product: raw.cartesian,
                total_connections,
                pending_cap,
                connection_duration_ms: raw.connection_duration_ms,
                do_not_reconnect: raw.do_not_reconnect,
            })
        } else {
            return Err(ArgError::MissingRole);
        };

        let transfer_mode = TransferMode::parse(&raw.transfer_mode, raw.server)?;

        let close_discipline = if raw.abortive_close {
            CloseDiscipline::Abortive
        } else if raw.normal_close {
            CloseDiscipline::Normal
        } else if raw.server {
            CloseDiscipline::Abortive
        } else {
            CloseDiscipline::Normal
        };

        let half_close_before_close = raw.half_close_before_close && !raw.no_half_close;

        let io_buffer_len = if raw.io_buffer_len == 0 { DATA_BUF_SIZE } else { raw.io_buffer_len };

        let affinity = parse_affinity(raw.affinity.as_deref())?;

        let brief = if raw.brief { BriefLevel::Brief1 } else { BriefLevel::Verbose };

        Ok(RunConfig {
            role,
            threads,
            bind_addr: raw.bind_addr,
            transfer_mode,
            display_interval_secs: raw.display_interval_secs.max(1),
            run_duration_secs: raw.run_duration_secs,
            delay_start_secs: raw.delay_start_secs,
            warmup_secs: raw.warmup_secs,
            ping_pong_period_secs: raw.ping_pong_period_secs,
            keepalive_idle_secs: raw.keepalive_idle_secs,
            busy_poll: raw.busy_poll,
            close_discipline,
            half_close_before_close,
            io_buffer_len,
            silent: raw.silent,
            brief,
            affinity,
        })
    }
}

/// Parses `-aff <list>`: `None` (flag omitted), `nonrss` (case-insensitive),
/// or a comma-separated list of CPU indices.
fn parse_affinity(raw: Option<&str>) -> Result<Affinity, ArgError> {
    let Some(raw) = raw else { return Ok(Affinity::None) };
    if raw.eq_ignore_ascii_case("nonrss") {
        return Ok(Affinity::NonRss);
    }
    let mut list = Vec::new();
    for part in raw.split(',') {
        let idx: usize = part.trim().parse().map_err(|_| ArgError::InvalidValue {
            option: "-aff".into(),
            value:  raw.into(),
            reason: "expected comma-separated CPU indices or 'nonrss'".into(),
        })?;
        list.push(idx);
    }
    Ok(Affinity::Explicit(list))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_share_gives_remainder_to_first_workers() {
        assert_eq!(partition_share(10, 3, 0), 4);
        assert_eq!(partition_share(10, 3, 1), 3);
        assert_eq!(partition_share(10, 3, 2), 3);
        assert_eq!(4 + 3 + 3, 10);
    }

    #[test]
    fn listener_ports_strided_across_workers_without_reuseport() {
        let base = PortRange { start: 20_000, count: 100 };
        let t1 = listener_ports_for_worker(base, 3, 0, false);
        let t2 = listener_ports_for_worker(base, 3, 1, false);
        let t3 = listener_ports_for_worker(base, 3, 2, false);
        assert_eq!(&t1[..3], &[20_000, 20_003, 20_006]);
        assert_eq!(&t2[..3], &[20_001, 20_004, 20_007]);
        assert_eq!(&t3[..3], &[20_002, 20_005, 20_008]);
        assert_eq!(t1.len() + t2.len() + t3.len(), 100);
    }

    #[test]
    fn listener_ports_full_range_with_reuseport() {
        let base = PortRange { start: 20_000, count: 10 };
        let ports = listener_ports_for_worker(base, 3, 1, true);
        assert_eq!(ports.len(), 10);
        assert_eq!(ports[0], 20_000);
    }

    #[test]
    fn partition_contiguous_ports_gives_sequential_nonoverlapping_chunks() {
        let p0 = partition_contiguous_ports(30_000, 40, 3, 0);
        let p1 = partition_contiguous_ports(30_000, 40, 3, 1);
        let p2 = partition_contiguous_ports(30_000, 40, 3, 2);
        assert_eq!(p0, PortRange { start: 30_000, count: 14 });
        assert_eq!(p1, PortRange { start: 30_014, count: 13 });
        assert_eq!(p2, PortRange { start: 30_027, count: 13 });
    }

    #[test]
    fn too_many_threads_is_rejected() {
        assert!(matches!(
            RunConfig::validate_and_threads(MAX_THREADS + 1),
            Err(ArgError::TooManyThreads(_, _))
        ));
    }

    #[test]
    fn zero_threads_defaults() {
        assert_eq!(RunConfig::validate_and_threads(0).unwrap(), DEFAULT_THREAD_COUNT);
    }

    #[test]
    fn listener_ports_below_thread_count_rejected_without_reuseport() {
        assert!(RunConfig::validate_listener_ports(2, 4, false).is_err());
        assert!(RunConfig::validate_listener_ports(2, 4, true).is_ok());
    }

    #[test]
    fn port_range_overflow_detected() {
        assert!(RunConfig::validate_port_range(65_535, 10).is_err());
        assert!(RunConfig::validate_port_range(60_000, 100).is_ok());
    }

    #[test]
    fn build_rejects_missing_role() {
        let raw = RawArgs::default();
        assert!(matches!(RunConfig::build(raw), Err(ArgError::MissingRole)));
    }

    #[test]
    fn build_defaults_client_total_connections_to_threads_times_100() {
        let raw = RawArgs {
            client_remote: Some("127.0.0.1".into()),
            threads: 4,
            ..RawArgs::default()
        };
        let cfg = RunConfig::build(raw).unwrap();
        match cfg.role {
            Role::Client(c) => {
                assert_eq!(c.total_connections, 400);
                assert_eq!(c.pending_cap, 400);
            }
            Role::Server(_) => panic!("expected client role"),
        }
        assert_eq!(cfg.close_discipline, CloseDiscipline::Normal);
    }

    #[test]
    fn build_defaults_server_close_discipline_to_abortive() {
        let raw = RawArgs {
            server: true,
            threads: 2,
            port_count: Some(2),
            transfer_mode: "s".into(),
            ..RawArgs::default()
        };
        let cfg = RunConfig::build(raw).unwrap();
        assert_eq!(cfg.close_discipline, CloseDiscipline::Abortive);
    }

    #[test]
    fn build_rejects_bad_transfer_mode_for_server() {
        let raw = RawArgs {
            server: true,
            threads: 1,
            port_count: Some(1),
            transfer_mode: "1".into(),
            ..RawArgs::default()
        };
        assert!(RunConfig::build(raw).is_err());
    }

    #[test]
    fn parse_affinity_accepts_nonrss_and_explicit_lists() {
        assert_eq!(parse_affinity(None).unwrap(), Affinity::None);
        assert_eq!(parse_affinity(Some("nonrss")).unwrap(), Affinity::NonRss);
        assert_eq!(parse_affinity(Some("NonRSS")).unwrap(), Affinity::NonRss);
        assert_eq!(parse_affinity(Some("0,2,4")).unwrap(), Affinity::Explicit(vec![0, 2, 4]));
        assert!(parse_affinity(Some("x")).is_err());
    }

    #[test]
    fn client_ports_required_when_bcp_nonzero() {
        assert!(matches!(
            RunConfig::validate_client_ports(30_000, None, 4),
            Err(ArgError::MissingClientPortCount)
        ));
        assert!(matches!(
            RunConfig::validate_client_ports(30_000, Some(2), 4),
            Err(ArgError::InsufficientClientPorts { .. })
        ));
        assert_eq!(RunConfig::validate_client_ports(0, None, 4).unwrap(), None);
    }
}
