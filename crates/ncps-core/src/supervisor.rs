//! The supervisor (C6, §4.6): partitions `N`/`P`/the port ranges across
//! workers, spawns them, periodically aggregates their counters into a
//! report, and drives the run's warm-up/duration boundaries and the final
//! summary.
//!
//! Everything here runs on one thread (the caller's); workers run on their
//! own OS threads and are touched only through [`WorkerCounters`] (atomics)
//! and [`SharedControls`]/the per-worker `proc_index` slot (§5).

use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ncps_error::{RuntimeError, SockError};

use crate::affinity::{self, RssSampler};
use crate::config::{Affinity, ClientConfig, PortRange, Role, RunConfig, ServerConfig};
use crate::console::{self, DisplayBrief};
use crate::counters::{CounterSnapshot, WorkerCounters};
use crate::engine::{SharedControls, Worker, WorkerParams, WorkerRole};
use crate::portwalk::PortWalker;
use crate::recorder::Recorder;
use crate::socket::AddressFamily;

struct WorkerHandle {
    join:     JoinHandle<Result<(), SockError>>,
    counters: Arc<WorkerCounters>,
}

/// Runs one full benchmark: spawns `config.threads` workers per `config.role`,
/// reports periodically until the configured duration elapses (or forever),
/// then stops every worker and prints the final summary to `out`.
///
/// `cmdline` is printed verbatim at the duration boundary (§4.6: "prints the
/// command line"); assembling it from `argv` is `ncps-cli`'s job, not this
/// engine's (§1 names the CLI surface an external collaborator).
pub fn run(config: RunConfig, cmdline: &str, out: &mut dyn Write) -> Result<(), RuntimeError> {
    if config.delay_start_secs > 0 {
        std::thread::sleep(Duration::from_secs(config.delay_start_secs));
    }

    let controls = Arc::new(SharedControls::default());
    let recorder = Arc::new(Recorder::new());
    let brief = Arc::new(DisplayBrief::new(config.brief as u8));

    console::spawn(Arc::clone(&controls), Arc::clone(&brief));

    let proc_indexes = initial_proc_indexes(&config);
    let workers = spawn_workers(&config, &recorder, &controls, &proc_indexes)?;

    let outcome = report_loop(&config, &recorder, &workers, &proc_indexes, &brief, cmdline, out);

    controls.stop.store(true, Ordering::Relaxed);
    let mut first_err = None;
    for w in workers {
        match w.join.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => first_err.get_or_insert(e),
            Err(_) => {
                tracing::error!("worker thread panicked");
            }
        };
    }

    outcome?;
    if let Some(e) = first_err {
        return Err(RuntimeError::from(e));
    }
    Ok(())
}

/// One slot per worker the RSS sampler or `-aff <list>` may rewrite; workers
/// poll their own slot once per loop iteration (§4.5 "Affinity").
fn initial_proc_indexes(config: &RunConfig) -> Vec<Arc<AtomicI64>> {
    match &config.affinity {
        Affinity::Explicit(list) if !list.is_empty() => (0..config.threads)
            .map(|i| Arc::new(affinity::new_proc_index_slot(Some(list[i as usize % list.len()]))))
            .collect(),
        _ => (0..config.threads).map(|_| Arc::new(affinity::new_proc_index_slot(None))).collect(),
    }
}

fn spawn_workers(
    config: &RunConfig,
    recorder: &Arc<Recorder>,
    controls: &Arc<SharedControls>,
    proc_indexes: &[Arc<AtomicI64>],
) -> Result<Vec<WorkerHandle>, RuntimeError> {
    let mut handles = Vec::with_capacity(config.threads as usize);
    for worker_id in 0..config.threads {
        let params = worker_params(config, worker_id);
        let counters = Arc::new(WorkerCounters::default());
        let recorder = Arc::clone(recorder);
        let controls = Arc::clone(controls);
        let proc_index = Arc::clone(&proc_indexes[worker_id as usize]);
        let counters_for_handle = Arc::clone(&counters);

        let join = std::thread::Builder::new()
            .name(format!("ncps-worker-{worker_id}"))
            .spawn(move || match Worker::new(params, recorder, counters, controls, proc_index) {
                Ok(mut worker) => {
                    worker.run();
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "worker setup failed");
                    Err(e)
                }
            })
            .map_err(|e| ncps_error::setup_error!(format!("failed to spawn worker {worker_id}: {e}")))?;

        handles.push(WorkerHandle {
            join,
            counters: counters_for_handle,
        });
    }
    Ok(handles)
}

/// Builds one worker's static parameters: its share of `N`/`P`, its slice of
/// the listener or local port range, and the role-independent knobs that
/// apply identically either side (§4.6 partitioning, §6 table).
fn worker_params(config: &RunConfig, worker_id: u32) -> WorkerParams {
    let family = AddressFamily::from_ip(config.bind_addr);
    let continuous_io_period_ms = config.ping_pong_period_secs * 1000;

    let (role, connection_duration_ms, pending_cap) = match &config.role {
        Role::Server(ServerConfig { listen_ports, reuse_port }) => {
            let ports = crate::config::listener_ports_for_worker(*listen_ports, config.threads, worker_id, *reuse_port);
            (
                WorkerRole::Server {
                    listen_ports: ports,
                    reuse_port:   *reuse_port,
                },
                0,
                u64::MAX,
            )
        }
        Role::Client(client) => {
            let total_connections = RunConfig::pending_cap_for_worker(client.total_connections, config.threads, worker_id);
            let pending_cap = RunConfig::pending_cap_for_worker(client.pending_cap, config.threads, worker_id).max(1);
            let local = client_local_range(client, config.threads, worker_id);
            let remote_offset = worker_id % client.remote_ports.count.max(1);
            let port_walker = PortWalker::new(local, client.remote_ports, remote_offset, client.cartesian_product);
            (
                WorkerRole::Client {
                    remote_addr: client.remote_addr,
                    total_connections,
                    port_walker,
                    do_not_reconnect: client.do_not_reconnect,
                },
                client.connection_duration_ms,
                pending_cap,
            )
        }
    };

    WorkerParams {
        worker_id,
        family,
        bind_addr: config.bind_addr,
        role,
        transfer_mode: config.transfer_mode,
        connection_duration_ms,
        continuous_io_period_ms,
        pending_cap,
        keepalive_idle_secs: config.keepalive_idle_secs,
        io_buffer_len: config.io_buffer_len,
        close_discipline: config.close_discipline,
        half_close_before_close: config.half_close_before_close,
        busy_poll: config.busy_poll,
    }
}

fn client_local_range(client: &ClientConfig, threads: u32, worker_id: u32) -> Option<PortRange> {
    let range = client.local_ports?;
    Some(crate::config::partition_contiguous_ports(range.start, range.count, threads, worker_id))
}

/// A fallible continuation of [`run`] so the outer function can always join
/// every worker before propagating an error (no thread leaks on the report
/// loop's own failure paths, though in practice it has none: writes to
/// `out` are best-effort, matching a benchmark tool that must not abort a
/// run over a full pipe).
fn report_loop(
    config: &RunConfig,
    recorder: &Recorder,
    workers: &[WorkerHandle],
    proc_indexes: &[Arc<AtomicI64>],
    brief: &DisplayBrief,
    cmdline: &str,
    out: &mut dyn Write,
) -> Result<(), RuntimeError> {
    let interval = config.display_interval_secs.max(1);
    let mut last_snapshots: Vec<CounterSnapshot> = workers.iter().map(|w| w.counters.snapshot()).collect();
    let mut elapsed_secs = 0u64;
    let mut warmed_up = config.warmup_secs == 0;
    let mut warmup_baseline: Option<(u64, u64)> = None;
    let mut rss = RssSampler::new();

    if warmed_up {
        recorder.start(crate::clock::now_ms());
        warmup_baseline = Some((0, 0));
    }

    loop {
        std::thread::sleep(Duration::from_secs(interval));
        elapsed_secs += interval;

        let snapshots: Vec<CounterSnapshot> = workers.iter().map(|w| w.counters.snapshot()).collect();
        let deltas: Vec<CounterSnapshot> = snapshots.iter().zip(&last_snapshots).map(|(s, l)| s.delta(l)).collect();
        let totals = sum_snapshots(&snapshots);
        let delta_total = sum_snapshots(&deltas);

        if !warmed_up && elapsed_secs >= config.warmup_secs {
            warmed_up = true;
            recorder.start(crate::clock::now_ms());
            warmup_baseline = Some((totals.rx_bytes, totals.tx_bytes));
        }

        let port_wrap = workers.iter().any(|w| w.counters.take_port_wrapped());

        if !config.silent {
            print_row(out, brief.get(), elapsed_secs, interval, &totals, &delta_total, port_wrap);
        }

        if matches!(config.affinity, Affinity::NonRss) {
            let cps = delta_total.opened / interval;
            if let Some(candidates) = rss.tick(cps) {
                if !candidates.is_empty() {
                    for (i, slot) in proc_indexes.iter().enumerate() {
                        slot.store(candidates[i % candidates.len()] as i64, Ordering::Release);
                    }
                    tracing::info!(?candidates, "non-rss affinity candidates assigned");
                }
            }
        }

        last_snapshots = snapshots;

        if let Some(duration) = config.run_duration_secs {
            if elapsed_secs >= duration {
                break;
            }
        }
    }

    let now_ms = crate::clock::now_ms();
    recorder.stop(now_ms);

    let final_snapshots: Vec<CounterSnapshot> = workers.iter().map(|w| w.counters.snapshot()).collect();
    let final_totals = sum_snapshots(&final_snapshots);
    let (warm_rx, warm_tx) = warmup_baseline.unwrap_or((final_totals.rx_bytes, final_totals.tx_bytes));

    print_final_report(out, recorder, &final_totals, warm_rx, warm_tx, cmdline);

    Ok(())
}

fn sum_snapshots(snaps: &[CounterSnapshot]) -> CounterSnapshot {
    let mut total = CounterSnapshot::default();
    for s in snaps {
        total.opened += s.opened;
        total.closed += s.closed;
        total.open_failures += s.open_failures;
        total.io_failures += s.io_failures;
        total.rx_bytes += s.rx_bytes;
        total.tx_bytes += s.tx_bytes;
        total.open_pending += s.open_pending;
        total.retransmitted += s.retransmitted;
        total.clean += s.clean;
        total.clean_rtt_sum_us += s.clean_rtt_sum_us;
        total.retransmitted_rtt_sum_us += s.retransmitted_rtt_sum_us;
        total.retrans_total += s.retrans_total;
    }
    total
}

#[allow(clippy::too_many_arguments)]
fn print_row(
    out: &mut dyn Write,
    brief_level: u8,
    elapsed_secs: u64,
    interval_secs: u64,
    totals: &CounterSnapshot,
    delta: &CounterSnapshot,
    port_wrap: bool,
) {
    let secs = interval_secs as f64;
    let conn_per_s = delta.opened as f64 / secs;

    match brief_level {
        2 => {
            let _ = writeln!(out, "{conn_per_s:.0}");
        }
        1 => {
            let _ = writeln!(out, "t={elapsed_secs} cps={conn_per_s:.0}");
        }
        _ => {
            let active = totals.opened.saturating_sub(totals.closed);
            let close_per_s = delta.closed as f64 / secs;
            let rx_kbps = delta.rx_bytes as f64 / 1024.0 / secs;
            let tx_kbps = delta.tx_bytes as f64 / 1024.0 / secs;
            let c0_rtt = avg(delta.clean_rtt_sum_us, delta.clean);
            let cr_rtt = avg(delta.retransmitted_rtt_sum_us, delta.retransmitted);
            let rep = if port_wrap { " REP" } else { "" };
            let _ = writeln!(
                out,
                "{elapsed_secs:>5} {active:>8} {pend:>6} {failed:>6} {iofail:>6} \
                 {conn_per_s:>9.1} {close_per_s:>9.1} {rx_kbps:>10.1} {tx_kbps:>10.1} \
                 {rt:>6} {c0:>6} {c0_rtt:>8.1} {cr:>6} {cr_rtt:>8.1}{rep}",
                pend = totals.open_pending,
                failed = delta.open_failures,
                iofail = delta.io_failures,
                rt = delta.retrans_total,
                c0 = delta.clean,
                cr = delta.retransmitted,
            );
        }
    }
}

fn avg(sum: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

fn print_final_report(
    out: &mut dyn Write,
    recorder: &Recorder,
    final_totals: &CounterSnapshot,
    warmup_rx: u64,
    warmup_tx: u64,
    cmdline: &str,
) {
    let _ = writeln!(out, "{cmdline}");

    let summary = recorder.summarize();
    let elapsed_s = (recorder.final_elapsed_ms() as f64 / 1000.0).max(f64::MIN_POSITIVE);
    let final_cps = recorder.final_connection_count() as f64 / elapsed_s;

    let _ = writeln!(out, "\ntime to Nth connection:");
    for (n, ms) in &summary.time_to_nth {
        let _ = writeln!(out, "  {n}: {ms} ms");
    }

    let _ = writeln!(out, "\nSYN RTT percentiles (us), avg={:.1}:", summary.avg_rtt_us);
    for (label, us) in &summary.percentiles_us {
        let _ = writeln!(out, "  p{label}: {us}");
    }

    let _ = writeln!(
        out,
        "\nretransmits: {:.4}% of connections, {:.4} per connection",
        summary.rexmit_conn_fraction * 100.0,
        summary.rexmit_per_conn
    );

    let rx_bytes = final_totals.rx_bytes.saturating_sub(warmup_rx);
    let tx_bytes = final_totals.tx_bytes.saturating_sub(warmup_tx);
    let rx_gbps = rx_bytes as f64 / 1e9 / elapsed_s;
    let tx_gbps = tx_bytes as f64 / 1e9 / elapsed_s;

    let _ = writeln!(out, "\nRX: {rx_gbps:.4} GB/s, TX: {tx_gbps:.4} GB/s");

    let cps_pairs: String = summary
        .time_to_nth
        .iter()
        .map(|(n, ms)| format!("{n}:{ms}"))
        .collect::<Vec<_>>()
        .join(",");
    let synrtt_pairs: String = summary
        .percentiles_us
        .iter()
        .map(|(label, us)| format!("{label}:{us}"))
        .collect::<Vec<_>>()
        .join(",");

    let _ = writeln!(out, "###ENDCPS {final_cps:.2}");
    let _ = writeln!(out, "###CPS {cps_pairs}");
    let _ = writeln!(out, "###SYNRTT {synrtt_pairs}");
    let _ = writeln!(
        out,
        "###REXMIT rtconnpercentage:{:.4},rtperconn:{:.4}",
        summary.rexmit_conn_fraction * 100.0,
        summary.rexmit_per_conn
    );
    let _ = writeln!(out, "###RXGBPS {rx_gbps:.4}");
    let _ = writeln!(out, "###TXGBPS {tx_gbps:.4}");
}

/// Exposed for `ncps-cli`: whether a bind address implies IPv4 or IPv6, used
/// to validate `-b` against `-c`'s address family before workers spawn.
pub fn address_family(addr: IpAddr) -> AddressFamily {
    AddressFamily::from_ip(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BriefLevel, CloseDiscipline, RawArgs, TransferMode};

    fn client_config(threads: u32, total: u64) -> RunConfig {
        let raw = RawArgs {
            client_remote: Some("127.0.0.1".into()),
            threads,
            total_connections: Some(total),
            transfer_mode: "0".into(),
            ..RawArgs::default()
        };
        RunConfig::build(raw).unwrap()
    }

    #[test]
    fn worker_params_partitions_client_connections_across_workers() {
        let config = client_config(3, 10);
        let mut total = 0u64;
        for worker_id in 0..3 {
            let params = worker_params(&config, worker_id);
            match params.role {
                WorkerRole::Client { total_connections, .. } => total += total_connections,
                WorkerRole::Server { .. } => panic!("expected client role"),
            }
        }
        assert_eq!(total, 10);
    }

    #[test]
    fn worker_params_carries_transfer_mode_and_close_discipline() {
        let config = client_config(1, 5);
        let params = worker_params(&config, 0);
        assert!(matches!(params.transfer_mode, TransferMode::NoIo));
        assert_eq!(params.close_discipline, CloseDiscipline::Normal);
    }

    #[test]
    fn initial_proc_indexes_cycle_explicit_list_across_more_workers_than_entries() {
        let mut config = client_config(4, 4);
        config.affinity = Affinity::Explicit(vec![1, 3]);
        let slots = initial_proc_indexes(&config);
        assert_eq!(slots.len(), 4);
        let values: Vec<i64> = slots.iter().map(|s| s.load(Ordering::Relaxed)).collect();
        assert_eq!(values, vec![1, 3, 1, 3]);
    }

    #[test]
    fn sum_snapshots_adds_every_worker_field() {
        let a = CounterSnapshot {
            opened: 1,
            rx_bytes: 10,
            ..CounterSnapshot::default()
        };
        let b = CounterSnapshot {
            opened: 2,
            rx_bytes: 20,
            ..CounterSnapshot::default()
        };
        let total = sum_snapshots(&[a, b]);
        assert_eq!(total.opened, 3);
        assert_eq!(total.rx_bytes, 30);
    }

    #[test]
    fn avg_handles_zero_count() {
        assert_eq!(avg(0, 0), 0.0);
        assert!((avg(100, 4) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn brief_level_unused_field_check() {
        // BriefLevel::Verbose is the as-u8-0 initial value DisplayBrief gets
        // constructed with in `run`; exercised indirectly via print_row.
        assert_eq!(BriefLevel::Verbose as u8, 0);
    }
}
