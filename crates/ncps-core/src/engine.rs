//! The per-worker connection-engine loop (C5, §4.5): the state machine that
//! drives each connection through connect/accept -> optional I/O -> close ->
//! (optional) reconnect, with admission control, rate-limited re-issue, and
//! ready/wait list bookkeeping.
//!
//! Each [`Worker`] owns its [`Pool`] and [`Waiter`] exclusively; nothing here
//! takes a lock, because nothing but the owning thread ever touches a
//! worker's lists (§5 "Scheduling model").

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use ncps_error::SockError;

use crate::affinity;
use crate::config::{CloseDiscipline, TransferMode};
use crate::constants::{BATCH_SIZE, IDLE_WAIT_TIMEOUT_MS};
use crate::counters::WorkerCounters;
use crate::portwalk::PortWalker;
use crate::ratelimit::RateLimiter;
use crate::recorder::Recorder;
use crate::socket::{AddressFamily, Pool, SockId, SockKind};
use crate::waiter::{AsyncOp, AsyncStatus, CallStatus, ReadOutcome, WaitOutcome, Waiter, WriteOutcome};
use crate::waitlist::WaitList;

/// States a connection's socket cycles through (§4.5 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Freshly allocated, not yet enqueued.
    None,
    /// Listener armed to accept the next connection.
    Accept,
    /// Accept delivered; configure and move into the I/O phase.
    AcceptComplete,
    /// Client socket waiting to be dispatched to `tcp_connect`.
    Connect,
    /// Connect delivered (success or failure).
    ConnectComplete,
    /// I/O loop wants a read.
    Read,
    /// Read delivered.
    ReadComplete,
    /// I/O loop wants a write.
    Write,
    /// Write delivered.
    WriteComplete,
    /// Terminal: issue close and either recycle or free.
    Close,
}

/// Outcome of the connection's most recently delivered operation, stashed so
/// the `*_Complete` dispatch can process it uniformly whether it arrived
/// inline or via [`Waiter::wait`].
#[derive(Debug)]
enum LastResult {
    None,
    Connect(Result<(), SockError>),
    Accept(Result<(), SockError>),
    Read(Result<usize, SockError>),
    Write(Result<(), SockError>),
}

/// Per-socket engine bookkeeping (§3 "Connection context").
pub struct ConnCtx {
    state:           ConnState,
    client:          bool,
    established_ms:  u64,
    local_port:      u16,
    remote_port:     u16,
    /// Set on the first `Close` dispatch; guards against issuing `tcp_close`
    /// twice for the same socket.
    close_issued:    bool,
    /// Number of cancellation completions still owed before this socket may
    /// be freed (§3 invariants, §5 "Cancellation").
    awaiting_cancel: u8,
    /// True while the no-io/one-io "detect an early peer close" phantom read
    /// is pending: a 1-byte read issued purely so the engine notices the
    /// peer sending data or going away before the configured connection
    /// duration elapses, instead of holding the socket open regardless
    /// (§3 lifecycles, §4.5 step 8).
    last_read_pending: bool,
    /// Set when the connection's most recent I/O completion failed; forces
    /// an abortive close on the next `Close` dispatch regardless of the
    /// configured discipline (§4.5 step 8, §7).
    force_abortive:  bool,
    last_result:     LastResult,
    /// Listener-only: the freshly allocated socket its current pending
    /// accept will complete into, since the waiter's completion only
    /// identifies the listener (the fd the accept event arrived on), not
    /// the peer socket it produced.
    pending_new_sock: Option<SockId>,
}

impl ConnCtx {
    fn fresh(client: bool) -> Self {
        Self {
            state: ConnState::None,
            client,
            established_ms: 0,
            local_port: 0,
            remote_port: 0,
            close_issued: false,
            awaiting_cancel: 0,
            last_read_pending: false,
            force_abortive: false,
            last_result: LastResult::None,
            pending_new_sock: None,
        }
    }
}

/// A connection closes abortively (`SO_LINGER{on,0}`, forcing an RST) if its
/// last completion failed, regardless of the configured discipline, or if
/// the user asked for abortive closes outright (§4.5 step 8, §7).
fn close_is_abortive(force_abortive: bool, discipline: CloseDiscipline) -> bool {
    force_abortive || matches!(discipline, CloseDiscipline::Abortive)
}

/// This worker's role: connecting client or accepting server.
pub enum WorkerRole {
    /// Connecting side.
    Client {
        /// Server address every connection targets.
        remote_addr:   IpAddr,
        /// This worker's share of the total connection count.
        total_connections: u64,
        /// Local/remote port-walking state.
        port_walker:   PortWalker,
        /// Don't reopen a connection after it closes.
        do_not_reconnect: bool,
    },
    /// Accepting side.
    Server {
        /// This worker's share of the listener port range, already strided
        /// (or, with `reuse_port`, the full range) by the supervisor via
        /// [`crate::config::listener_ports_for_worker`].
        listen_ports: Vec<u16>,
        /// Bind the full range via `SO_REUSEPORT` instead of a strided subset.
        reuse_port:   bool,
    },
}

/// Static, per-worker configuration handed down by the supervisor (§4.6).
pub struct WorkerParams {
    /// Index of this worker among its siblings.
    pub worker_id:       u32,
    /// IPv4 or IPv6, fixed for the worker's lifetime.
    pub family:          AddressFamily,
    /// Local address to bind sockets to.
    pub bind_addr:       IpAddr,
    /// Connecting or accepting, with its role-specific state.
    pub role:            WorkerRole,
    /// What to do with an established connection.
    pub transfer_mode:   TransferMode,
    /// Milliseconds each connection stays open before being closed.
    pub connection_duration_ms: u64,
    /// Milliseconds between successive ping-pong messages (0 disables pacing).
    pub continuous_io_period_ms: u64,
    /// This worker's share of the total pending-connect cap.
    pub pending_cap:     u64,
    /// TCP keepalive idle time, or `None` to leave keepalive off.
    pub keepalive_idle_secs: Option<u32>,
    /// Read/write buffer size in bytes.
    pub io_buffer_len:   usize,
    /// Graceful or abortive close.
    pub close_discipline: CloseDiscipline,
    /// Half-close before issuing the final close.
    pub half_close_before_close: bool,
    /// Enable `SO_BUSY_POLL` on every socket.
    pub busy_poll:       bool,
}

/// Process-wide controls the console thread (C7) flips and every worker
/// consults (§4.7, §5).
pub struct SharedControls {
    /// Set by the console thread to pause all I/O activity.
    pub pause_all_activity: AtomicBool,
    /// Set to request every worker shut down and exit its run loop.
    pub stop:               AtomicBool,
}

impl Default for SharedControls {
    fn default() -> Self {
        Self {
            pause_all_activity: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }
}

/// One worker's run loop: ready/wait/pending-limit lists, its own socket
/// pool, its own waiter, and the shared recorder/counters/controls it
/// reports through.
pub struct Worker {
    params:        WorkerParams,
    pool:          Pool<ConnCtx>,
    waiter:        Waiter,
    ready:         VecDeque<SockId>,
    /// Completions/inline-folds produced mid-dispatch, merged into `ready`
    /// only at the top of the *next* iteration (§4.5 step 2: "deliberately
    /// deferred ... to bound reentrancy depth").
    pending_ready: VecDeque<SockId>,
    wait_list:     WaitList,
    pending_limit: VecDeque<SockId>,
    open_pending_count: u64,
    rate_limiter:  RateLimiter,
    listeners:     Vec<SockId>,
    recorder:      Arc<Recorder>,
    counters:      Arc<WorkerCounters>,
    controls:      Arc<SharedControls>,
    proc_index:    Arc<AtomicI64>,
}

impl Worker {
    /// Builds a worker's socket pool and waiter and bootstraps its initial
    /// sockets (listeners bound and armed to accept, or client sockets queued
    /// to connect), per `params.role`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: WorkerParams,
        recorder: Arc<Recorder>,
        counters: Arc<WorkerCounters>,
        controls: Arc<SharedControls>,
        proc_index: Arc<AtomicI64>,
    ) -> Result<Self, SockError> {
        let waiter = Waiter::new()?;
        let now = crate::clock::now_ms();
        let n_connections = match &params.role {
            WorkerRole::Client { total_connections, .. } => *total_connections,
            WorkerRole::Server { .. } => 0,
        };
        let rate_limiter = if params.continuous_io_period_ms > 0 {
            RateLimiter::with_period(n_connections, params.continuous_io_period_ms, now)
        } else {
            RateLimiter::unlimited()
        };

        let mut worker = Self {
            params,
            pool: Pool::new(),
            waiter,
            ready: VecDeque::new(),
            pending_ready: VecDeque::new(),
            wait_list: WaitList::new(),
            pending_limit: VecDeque::new(),
            open_pending_count: 0,
            rate_limiter,
            listeners: Vec::new(),
            recorder,
            counters,
            controls,
            proc_index,
        };
        worker.bootstrap()?;
        Ok(worker)
    }

    fn bootstrap(&mut self) -> Result<(), SockError> {
        match &self.params.role {
            WorkerRole::Server { listen_ports, reuse_port } => {
                let ports = listen_ports.clone();
                let reuse_port = *reuse_port;
                let bind_addr = self.params.bind_addr;
                let family = self.params.family;
                for port in ports {
                    let id = self.pool.allocate(SockKind::TcpListener, family, ConnCtx::fresh(false));
                    self.waiter.bind(&mut self.pool, id)?;
                    self.waiter
                        .tcp_listener_open(&mut self.pool, id, SocketAddr::new(bind_addr, port), 1024, reuse_port)?;
                    self.pool.get_mut(id).expect("just allocated").state = ConnState::Accept;
                    self.listeners.push(id);
                    self.ready.push_back(id);
                }
            }
            WorkerRole::Client { total_connections, .. } => {
                for _ in 0..*total_connections {
                    let id = self.pool.allocate(SockKind::Tcp, self.params.family, ConnCtx::fresh(true));
                    self.pool.get_mut(id).expect("just allocated").state = ConnState::Connect;
                    self.ready.push_back(id);
                }
            }
        }
        Ok(())
    }

    /// Runs until [`SharedControls::stop`] is set.
    pub fn run(&mut self) {
        while !self.controls.stop.load(Ordering::Relaxed) {
            self.step();
        }
    }

    /// One full iteration of the run loop (§4.5 "Run loop").
    fn step(&mut self) {
        affinity::poll_and_pin(&self.proc_index);

        self.ready.extend(self.pending_ready.drain(..));

        let now_ms = crate::clock::now_ms();

        // Step 1: rate-capped wait-list drain.
        let budget = self.rate_limiter.available(now_ms);
        if budget > 0 {
            let due = self.wait_list.take_due(now_ms, budget);
            self.rate_limiter.consume(due.len());
            self.ready.extend(due);
        }

        // Step 2: dispatch up to BATCH_SIZE ready entries; follow-ups land
        // in `pending_ready`, not `ready` (reentrancy bound).
        let to_dispatch = self.ready.len().min(BATCH_SIZE);
        for _ in 0..to_dispatch {
            let Some(id) = self.ready.pop_front() else { break };
            self.dispatch(id);
        }

        // Step 9: drain the waiter.
        self.drain_waiter(now_ms);

        while self.controls.pause_all_activity.load(Ordering::Relaxed) {
            std::thread::sleep(std::time::Duration::from_millis(crate::constants::PAUSE_POLL_INTERVAL_MS));
            if self.controls.stop.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    fn timeout_ms(&self) -> i32 {
        if !self.ready.is_empty() {
            return 0;
        }
        if self.params.busy_poll && self.has_open_connections() {
            return 0;
        }
        IDLE_WAIT_TIMEOUT_MS
    }

    fn has_open_connections(&self) -> bool {
        self.open_pending_count > 0 || !self.wait_list.is_empty()
    }

    fn drain_waiter(&mut self, now_ms: u64) {
        match self.waiter.wait(&mut self.pool, self.timeout_ms()) {
            Ok(WaitOutcome::Ready(result)) => self.translate(result, now_ms),
            Ok(WaitOutcome::Timeout) => {}
            Err(e) => tracing::debug!(worker = self.params.worker_id, error = %e, "waiter error"),
        }
    }

    /// Translates one delivered completion into the matching `_complete`
    /// state and pushes it to `pending_ready`, or handles a cancellation.
    fn translate(&mut self, result: crate::waiter::AsyncResult, now_ms: u64) {
        let crate::waiter::AsyncResult { sock, op, status } = result;
        if matches!(status, AsyncStatus::Cancelled) {
            self.on_cancelled(sock);
            return;
        }
        // An accept completion is delivered against the listener's fd (the
        // token the epoll event carries), not the peer socket it produced,
        // so it needs its own routing rather than updating `sock`'s own ctx.
        if matches!(op, AsyncOp::Accept) {
            self.complete_accept(sock, status, now_ms);
            return;
        }
        let Some(ctx) = self.pool.get_mut(sock) else { return };

        match (op, status) {
            (AsyncOp::Connect, AsyncStatus::Success { .. }) => {
                ctx.last_result = LastResult::Connect(Ok(()));
                ctx.state = ConnState::ConnectComplete;
                ctx.established_ms = now_ms;
            }
            (AsyncOp::Connect, AsyncStatus::Failed(e)) => {
                ctx.last_result = LastResult::Connect(Err(e));
                ctx.state = ConnState::ConnectComplete;
            }
            (AsyncOp::Read, AsyncStatus::Success { bytes, .. }) => {
                ctx.last_result = LastResult::Read(Ok(bytes as usize));
                ctx.state = ConnState::ReadComplete;
            }
            (AsyncOp::Read, AsyncStatus::Failed(e)) => {
                ctx.last_result = LastResult::Read(Err(e));
                ctx.state = ConnState::ReadComplete;
            }
            (AsyncOp::Write, AsyncStatus::Success { .. }) => {
                ctx.last_result = LastResult::Write(Ok(()));
                ctx.state = ConnState::WriteComplete;
            }
            (AsyncOp::Write, AsyncStatus::Failed(e)) => {
                ctx.last_result = LastResult::Write(Err(e));
                ctx.state = ConnState::WriteComplete;
            }
            (AsyncOp::Accept, _) => unreachable!("handled above"),
            (_, AsyncStatus::Cancelled) => unreachable!("handled above"),
        }
        self.pending_ready.push_back(sock);
    }

    /// Resolves an accept completion delivered on `listener` into the
    /// peer socket parked in its `pending_new_sock`, and re-queues the
    /// listener so it keeps accepting.
    fn complete_accept(&mut self, listener: SockId, status: AsyncStatus, now_ms: u64) {
        let Some(new_id) = self.pool.get_mut(listener).and_then(|l| l.ctx.pending_new_sock.take()) else {
            return;
        };
        match status {
            AsyncStatus::Success { .. } => {
                if let Some(ctx) = self.pool.get_mut(new_id) {
                    ctx.last_result = LastResult::Accept(Ok(()));
                    ctx.state = ConnState::AcceptComplete;
                    ctx.established_ms = now_ms;
                }
            }
            AsyncStatus::Failed(e) => {
                if let Some(ctx) = self.pool.get_mut(new_id) {
                    ctx.last_result = LastResult::Accept(Err(e));
                    ctx.state = ConnState::AcceptComplete;
                }
            }
            AsyncStatus::Cancelled => unreachable!("handled by caller"),
        }
        self.pending_ready.push_back(new_id);
        self.ready.push_back(listener);
    }

    fn on_cancelled(&mut self, sock: SockId) {
        let Some(ctx) = self.pool.get_mut(sock) else { return };
        if let Some(orphan) = ctx.pending_new_sock.take() {
            self.pool.free(orphan);
        }
        let Some(ctx) = self.pool.get_mut(sock) else { return };
        ctx.awaiting_cancel = ctx.awaiting_cancel.saturating_sub(1);
        if ctx.awaiting_cancel == 0 && ctx.close_issued {
            self.finish_close(sock);
        }
    }

    // ---- dispatch -------------------------------------------------------

    fn dispatch(&mut self, id: SockId) {
        let Some(state) = self.pool.get(id).map(|s| s.ctx.state) else { return };
        match state {
            ConnState::None => {}
            ConnState::Accept => self.dispatch_accept(id),
            ConnState::AcceptComplete => self.dispatch_accept_complete(id),
            ConnState::Connect => self.dispatch_connect(id),
            ConnState::ConnectComplete => self.dispatch_connect_complete(id),
            ConnState::Read => self.dispatch_read(id),
            ConnState::ReadComplete => self.dispatch_read_complete(id),
            ConnState::Write => self.dispatch_write(id),
            ConnState::WriteComplete => self.dispatch_write_complete(id),
            ConnState::Close => self.dispatch_close(id),
        }
    }

    fn dispatch_connect(&mut self, id: SockId) {
        let cap = self.params.pending_cap;
        if self.open_pending_count >= cap {
            self.pending_limit.push_back(id);
            return;
        }

        let (local_port, remote_port, wrapped, remote_addr) = {
            let WorkerRole::Client { remote_addr, port_walker, .. } = &mut self.params.role else {
                return;
            };
            let (local_port, remote_port) = port_walker.current();
            let wrapped = port_walker.advance();
            (local_port, remote_port, wrapped, *remote_addr)
        };
        if wrapped {
            self.counters.mark_port_wrapped();
        }
        let remote = SocketAddr::new(remote_addr, remote_port);
        let local = if local_port == 0 {
            None
        } else {
            Some(SocketAddr::new(self.params.bind_addr, local_port))
        };

        if let Some(ctx) = self.pool.get_mut(id) {
            ctx.local_port = local_port;
            ctx.remote_port = remote_port;
        }

        // The only real failure this can surface for a just-allocated
        // socket is `NotBound` (the handle vanished, which cannot happen
        // within a single worker's own pool); `AlreadyBound` is expected on
        // a retried socket and is not an error here.
        if let Err(e) = self.waiter.bind(&mut self.pool, id) {
            if !matches!(e, SockError::AlreadyBound) {
                tracing::warn!(error = %e, "socket bind failed unexpectedly");
                self.pool.free(id);
                return;
            }
        }

        self.open_pending_count += 1;
        self.counters.record_admitted();

        match self.waiter.tcp_connect(&mut self.pool, id, local, remote, false) {
            Ok(CallStatus::Success) => {
                if let Some(ctx) = self.pool.get_mut(id) {
                    ctx.last_result = LastResult::Connect(Ok(()));
                    ctx.state = ConnState::ConnectComplete;
                    ctx.established_ms = crate::clock::now_ms();
                }
                self.pending_ready.push_back(id);
            }
            Ok(CallStatus::Pending) => {}
            Err(e) => self.fail_connect(id, e),
        }
    }

    /// Releases the admission slot taken by `dispatch_connect` and promotes
    /// one pending-limit entry if capacity now allows (§4.5 step 4).
    fn release_pending_slot(&mut self) {
        self.open_pending_count = self.open_pending_count.saturating_sub(1);
        self.counters.record_release();
        self.promote_pending_limit();
    }

    /// Handles a resolved connect failure. Assumes the admission slot is
    /// still held (i.e. `release_pending_slot` has *not* yet run for this
    /// attempt) and releases it itself, so every caller releases exactly
    /// once.
    fn fail_connect(&mut self, id: SockId, err: SockError) {
        self.release_pending_slot();
        if err.is_expected_transient() {
            // Expected transient during port-range wrap; not a real
            // failure, retry immediately without counting it (§7, §9 Open
            // Question 1). The failed attempt's fd (if any got as far as
            // `EINPROGRESS` and an `arm`) is dropped and its registration
            // flag cleared so the retry's `tcp_connect` starts from a clean
            // slate: reusing `registered` across a brand-new fd would make
            // the next `arm` issue `EPOLL_CTL_MOD` against nothing.
            if let Some(sock) = self.pool.get_mut(id) {
                sock.raw = None;
                sock.registered = false;
                sock.connecting = false;
                sock.ctx.state = ConnState::Connect;
            }
            self.pending_ready.push_back(id);
            return;
        }
        self.counters.record_open_failure();
        let do_not_reconnect = matches!(
            &self.params.role,
            WorkerRole::Client { do_not_reconnect: true, .. }
        );
        self.pool.free(id);
        if !do_not_reconnect {
            self.spawn_fresh_connect();
        }
    }

    fn promote_pending_limit(&mut self) {
        if self.open_pending_count < self.params.pending_cap {
            if let Some(id) = self.pending_limit.pop_front() {
                self.ready.push_back(id);
            }
        }
    }

    fn spawn_fresh_connect(&mut self) {
        let id = self.pool.allocate(SockKind::Tcp, self.params.family, ConnCtx::fresh(true));
        self.pool.get_mut(id).expect("just allocated").state = ConnState::Connect;
        self.ready.push_back(id);
    }

    fn dispatch_connect_complete(&mut self, id: SockId) {
        let result = self.pool.get_mut(id).map(|c| std::mem::replace(&mut c.ctx.last_result, LastResult::None));
        let Some(LastResult::Connect(result)) = result else { return };

        match result {
            Ok(()) => {
                self.release_pending_slot();
                self.on_established(id);
            }
            // `fail_connect` releases the admission slot itself.
            Err(e) => self.fail_connect(id, e),
        }
    }

    fn dispatch_accept(&mut self, listener: SockId) {
        let family = self.params.family;
        let new_id = self.pool.allocate(SockKind::Tcp, family, ConnCtx::fresh(false));
        match self.waiter.tcp_accept(&mut self.pool, listener, new_id, false) {
            Ok(crate::waiter::AcceptOutcome::Ready(_)) => {
                if let Some(ctx) = self.pool.get_mut(new_id) {
                    ctx.state = ConnState::AcceptComplete;
                    ctx.last_result = LastResult::Accept(Ok(()));
                    ctx.established_ms = crate::clock::now_ms();
                }
                // The listener keeps accepting; service it preferentially.
                self.ready.push_front(listener);
                self.pending_ready.push_back(new_id);
            }
            Ok(crate::waiter::AcceptOutcome::Pending) => {
                if let Some(ctx) = self.pool.get_mut(listener) {
                    ctx.pending_new_sock = Some(new_id);
                }
            }
            Err(e) => {
                self.pool.free(new_id);
                self.counters.record_open_failure();
                tracing::debug!(error = %e, "accept failed");
                self.ready.push_back(listener);
            }
        }
    }

    fn dispatch_accept_complete(&mut self, id: SockId) {
        let result = self.pool.get_mut(id).map(|c| std::mem::replace(&mut c.ctx.last_result, LastResult::None));
        match result {
            Some(LastResult::Accept(Ok(()))) => self.on_established(id),
            Some(LastResult::Accept(Err(_))) => {
                self.counters.record_open_failure();
                self.pool.free(id);
            }
            _ => {}
        }
    }

    /// Shared success path for `connect_complete`/`accept_complete`:
    /// keep-alive, buffer allocation, RTT/retransmit recording, and the
    /// transfer-mode edge into I/O or straight to close (§4.5 steps 4/6).
    fn on_established(&mut self, id: SockId) {
        if let Some(idle) = self.params.keepalive_idle_secs {
            let _ = self.waiter.tcp_set_keepalive(&self.pool, id, idle);
        }

        let (rtt_us, syn_retrans) = self.waiter.tcp_get_info(&self.pool, id).unwrap_or((0, 0));
        let now_ms = crate::clock::now_ms();
        if self.recorder.is_recording() {
            self.recorder.record(now_ms, syn_retrans, rtt_us);
        }
        self.counters.record_open(syn_retrans, rtt_us);

        match self.params.transfer_mode {
            TransferMode::NoIo => self.begin_duration_close(id),
            TransferMode::OneIo => {
                self.set_state(id, ConnState::Write);
                self.ready.push_back(id);
            }
            TransferMode::PingPong | TransferMode::ContinuousSend => {
                self.set_state(id, ConnState::Write);
                self.ready.push_back(id);
            }
            TransferMode::ContinuousRecv => {
                self.set_state(id, ConnState::Read);
                self.ready.push_back(id);
            }
        }
    }

    fn set_state(&mut self, id: SockId, state: ConnState) {
        if let Some(ctx) = self.pool.get_mut(id) {
            ctx.state = state;
        }
    }

    /// Starts the no-io/one-io "close after the configured duration" path
    /// (§4.5 steps 4/8): closes right away if no duration is configured,
    /// otherwise issues the phantom read and parks for what remains of it.
    fn begin_duration_close(&mut self, id: SockId) {
        if self.params.connection_duration_ms == 0 {
            self.close_connection(id, false);
            return;
        }
        let due_at = self
            .pool
            .get(id)
            .map_or(0, |s| s.ctx.established_ms + self.params.connection_duration_ms);
        self.issue_phantom_read(id, due_at);
    }

    /// Issues the 1-byte "detect an early peer close" read used to gate
    /// no-io/one-io connections by wall clock (§3 lifecycles, §4.5 step 8):
    /// if the peer already sent something or went away, close now instead of
    /// waiting out the rest of the duration; otherwise park on the wait list
    /// until `due_at`, and let either the timeout or the read's own eventual
    /// completion decide.
    fn issue_phantom_read(&mut self, id: SockId, due_at: u64) {
        match self.waiter.read(&mut self.pool, id, 1, false) {
            Ok(ReadOutcome::Ready { .. }) => self.close_connection(id, false),
            Ok(ReadOutcome::Pending) => {
                if let Some(ctx) = self.pool.get_mut(id) {
                    ctx.last_read_pending = true;
                    ctx.state = ConnState::Close;
                }
                self.wait_list.push(id, due_at);
            }
            Err(e) => self.io_failure(id, e),
        }
    }

    fn take_last_read_pending(&mut self, id: SockId) -> bool {
        self.pool
            .get_mut(id)
            .is_some_and(|ctx| std::mem::replace(&mut ctx.last_read_pending, false))
    }

    fn dispatch_write(&mut self, id: SockId) {
        let len = self.params.io_buffer_len;
        let buf = vec![0xABu8; len];
        match self.waiter.write(&mut self.pool, id, &buf, None) {
            Ok(WriteOutcome::Ready) => {
                self.counters.add_tx(len as u64);
                self.set_state(id, ConnState::WriteComplete);
                self.pending_ready.push_back(id);
            }
            Ok(WriteOutcome::Pending) => {}
            Err(e) => self.io_failure(id, e),
        }
    }

    fn dispatch_write_complete(&mut self, id: SockId) {
        match self.params.transfer_mode {
            TransferMode::OneIo | TransferMode::PingPong => {
                self.set_state(id, ConnState::Read);
                self.ready.push_back(id);
            }
            TransferMode::ContinuousSend => {
                if !self.age_within_duration(id) {
                    self.close_connection(id, false);
                    return;
                }
                self.set_state(id, ConnState::Write);
                self.ready.push_back(id);
            }
            _ => self.close_connection(id, false),
        }
    }

    fn dispatch_read(&mut self, id: SockId) {
        let len = self.params.io_buffer_len;
        match self.waiter.read(&mut self.pool, id, len, false) {
            Ok(ReadOutcome::Ready { bytes, .. }) => {
                self.counters.add_rx(bytes.len() as u64);
                if let Some(ctx) = self.pool.get_mut(id) {
                    ctx.last_result = LastResult::Read(Ok(bytes.len()));
                    ctx.state = ConnState::ReadComplete;
                }
                self.pending_ready.push_back(id);
            }
            Ok(ReadOutcome::Pending) => {}
            Err(e) => self.io_failure(id, e),
        }
    }

    fn dispatch_read_complete(&mut self, id: SockId) {
        if self.take_last_read_pending(id) {
            // The phantom "detect an early peer close" read woke up before
            // the configured duration elapsed; whatever it returned, stop
            // waiting and close now rather than parking for the rest of it.
            let result = self.pool.get_mut(id).map(|c| std::mem::replace(&mut c.ctx.last_result, LastResult::None));
            let failed = matches!(result, Some(LastResult::Read(Err(_))));
            self.close_connection(id, failed);
            return;
        }

        let result = self.pool.get_mut(id).map(|c| std::mem::replace(&mut c.ctx.last_result, LastResult::None));
        let bytes = match result {
            Some(LastResult::Read(Ok(n))) => n,
            Some(LastResult::Read(Err(e))) => {
                self.io_failure(id, e);
                return;
            }
            _ => return,
        };
        if bytes == 0 {
            self.close_connection(id, false);
            return;
        }

        // One-io bypasses the elapsed check entirely: `begin_duration_close`
        // already closes at once when no duration is configured, and issues
        // the phantom close-detection read unconditionally otherwise.
        if matches!(self.params.transfer_mode, TransferMode::OneIo) {
            self.begin_duration_close(id);
            return;
        }

        if !self.age_within_duration(id) {
            self.close_connection(id, false);
            return;
        }
        match self.params.transfer_mode {
            TransferMode::PingPong => self.reissue_or_park(id, ConnState::Write),
            TransferMode::ContinuousRecv => {
                self.set_state(id, ConnState::Read);
                self.ready.push_back(id);
            }
            _ => self.close_connection(id, false),
        }
    }

    /// Re-issues immediately, or parks on the wait list if `-k` pacing is
    /// requested (continuous-io / ping-pong period).
    fn reissue_or_park(&mut self, id: SockId, next: ConnState) {
        self.set_state(id, next);
        if self.params.continuous_io_period_ms > 0 {
            let now = crate::clock::now_ms();
            self.wait_list.push(id, now + self.params.continuous_io_period_ms);
        } else {
            self.ready.push_back(id);
        }
    }

    fn age_within_duration(&self, id: SockId) -> bool {
        let duration = self.params.connection_duration_ms;
        if duration == 0 {
            return true;
        }
        let Some(ctx) = self.pool.get(id) else { return false };
        crate::clock::now_ms().saturating_sub(ctx.ctx.established_ms) < duration
    }

    fn io_failure(&mut self, id: SockId, err: SockError) {
        tracing::debug!(error = %err, "io failure");
        self.counters.record_io_failure();
        self.close_connection(id, true);
    }

    fn close_connection(&mut self, id: SockId, was_io_failure: bool) {
        if let Some(ctx) = self.pool.get_mut(id) {
            ctx.force_abortive = was_io_failure;
        }
        self.set_state(id, ConnState::Close);
        self.ready.push_back(id);
    }

    fn dispatch_close(&mut self, id: SockId) {
        let Some(sock) = self.pool.get(id) else { return };
        if sock.ctx.close_issued {
            return;
        }
        let owed = u8::from(sock.has_pending_read())
            + u8::from(sock.has_pending_write())
            + u8::from(sock.has_pending_accept())
            + u8::from(sock.is_connecting());
        let force_abortive = sock.ctx.force_abortive;

        if self.params.half_close_before_close {
            let _ = self.waiter.tcp_disconnect(&self.pool, id);
        }
        let abortive = close_is_abortive(force_abortive, self.params.close_discipline);
        self.waiter.tcp_close(&mut self.pool, id, abortive);
        self.counters.record_close();

        if let Some(ctx) = self.pool.get_mut(id) {
            ctx.close_issued = true;
            ctx.awaiting_cancel = owed;
        }

        if owed == 0 {
            self.finish_close(id);
        }
    }

    fn finish_close(&mut self, id: SockId) {
        let Some(ctx) = self.pool.free(id) else { return };
        if !ctx.client {
            return;
        }
        let do_not_reconnect = matches!(
            &self.params.role,
            WorkerRole::Client { do_not_reconnect: true, .. }
        );
        if !do_not_reconnect {
            self.spawn_fresh_connect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use std::io::{Read as _, Write as _};
    use std::net::{Ipv4Addr, TcpListener};
    use std::time::{Duration, Instant};

    #[test]
    fn conn_ctx_starts_in_none_state() {
        let ctx = ConnCtx::fresh(true);
        assert_eq!(ctx.state, ConnState::None);
        assert!(ctx.client);
    }

    #[test]
    fn close_is_abortive_forces_rst_after_a_failed_completion_even_with_normal_discipline() {
        assert!(!close_is_abortive(false, CloseDiscipline::Normal));
        assert!(close_is_abortive(true, CloseDiscipline::Normal));
        assert!(close_is_abortive(false, CloseDiscipline::Abortive));
        assert!(close_is_abortive(true, CloseDiscipline::Abortive));
    }

    fn bare_worker(transfer_mode: TransferMode, connection_duration_ms: u64, continuous_io_period_ms: u64) -> Worker {
        let port_walker = PortWalker::new(None, PortRange { start: 1, count: 1 }, 0, false);
        let params = WorkerParams {
            worker_id: 0,
            family: AddressFamily::Inet4,
            bind_addr: Ipv4Addr::LOCALHOST.into(),
            role: WorkerRole::Client {
                remote_addr: Ipv4Addr::LOCALHOST.into(),
                total_connections: 0,
                port_walker,
                do_not_reconnect: true,
            },
            transfer_mode,
            connection_duration_ms,
            continuous_io_period_ms,
            pending_cap: 1,
            keepalive_idle_secs: None,
            io_buffer_len: 16,
            close_discipline: CloseDiscipline::Normal,
            half_close_before_close: false,
            busy_poll: false,
        };
        Worker::new(
            params,
            Arc::new(Recorder::new()),
            Arc::new(WorkerCounters::default()),
            Arc::new(SharedControls::default()),
            Arc::new(AtomicI64::new(-1)),
        )
        .expect("epoll setup should not fail in tests")
    }

    fn client_worker(remote_port: u16, transfer_mode: TransferMode, connection_duration_ms: u64) -> Worker {
        let port_walker = PortWalker::new(None, PortRange { start: remote_port, count: 1 }, 0, false);
        let params = WorkerParams {
            worker_id: 0,
            family: AddressFamily::Inet4,
            bind_addr: Ipv4Addr::LOCALHOST.into(),
            role: WorkerRole::Client {
                remote_addr: Ipv4Addr::LOCALHOST.into(),
                total_connections: 1,
                port_walker,
                do_not_reconnect: true,
            },
            transfer_mode,
            connection_duration_ms,
            continuous_io_period_ms: 0,
            pending_cap: 1,
            keepalive_idle_secs: None,
            io_buffer_len: 16,
            close_discipline: CloseDiscipline::Normal,
            half_close_before_close: false,
            busy_poll: false,
        };
        Worker::new(
            params,
            Arc::new(Recorder::new()),
            Arc::new(WorkerCounters::default()),
            Arc::new(SharedControls::default()),
            Arc::new(AtomicI64::new(-1)),
        )
        .expect("epoll setup should not fail in tests")
    }

    fn step_until(worker: &mut Worker, mut done: impl FnMut(&Worker) -> bool, max_iters: usize) -> bool {
        for _ in 0..max_iters {
            if done(worker) {
                return true;
            }
            worker.step();
        }
        done(worker)
    }

    fn first_sock_gone(worker: &Worker) -> bool {
        worker.pool.get(SockId { index: 0, generation: 0 }).is_none()
    }

    #[test]
    fn one_io_duration_keeps_the_connection_open_until_it_elapses() {
        // One-io's real read/write exchange finishes almost instantly; the
        // phantom read is what's supposed to hold the connection open for
        // the rest of `-D`, even though the peer never sends anything else.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 64];
                if let Ok(n) = stream.read(&mut buf) {
                    let _ = stream.write_all(&buf[..n]);
                }
                let mut sink = [0u8; 1];
                let _ = stream.read(&mut sink);
            }
        });

        let duration_ms = 150;
        let mut worker = client_worker(port, TransferMode::OneIo, duration_ms);
        let started = Instant::now();

        let closed = step_until(&mut worker, first_sock_gone, 2_000);

        assert!(closed, "one-io connection should eventually close once its duration elapses");
        assert!(
            started.elapsed() >= Duration::from_millis(duration_ms),
            "one-io connection closed before its configured duration elapsed"
        );
    }

    #[test]
    fn no_io_duration_zero_closes_immediately() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        std::thread::spawn(move || {
            let _ = listener.accept();
        });

        let mut worker = client_worker(port, TransferMode::NoIo, 0);
        let closed = step_until(&mut worker, first_sock_gone, 500);
        assert!(closed, "no-io connection with no configured duration should close right away");
    }

    #[test]
    fn continuous_send_free_runs_even_with_k_pacing_configured() {
        let mut worker = bare_worker(TransferMode::ContinuousSend, 0, 200);
        let id = worker.pool.allocate(SockKind::Tcp, AddressFamily::Inet4, ConnCtx::fresh(true));

        worker.dispatch_write_complete(id);

        assert!(worker.wait_list.is_empty(), "-k pacing must not apply to continuous-send");
        assert_eq!(worker.ready.back().copied(), Some(id));
        assert_eq!(worker.pool.get(id).expect("still allocated").ctx.state, ConnState::Write);
    }

    #[test]
    fn continuous_recv_free_runs_even_with_k_pacing_configured() {
        let mut worker = bare_worker(TransferMode::ContinuousRecv, 0, 200);
        let id = worker.pool.allocate(SockKind::Tcp, AddressFamily::Inet4, ConnCtx::fresh(true));
        worker.pool.get_mut(id).expect("just allocated").ctx.last_result = LastResult::Read(Ok(1));

        worker.dispatch_read_complete(id);

        assert!(worker.wait_list.is_empty(), "-k pacing must not apply to continuous-recv");
        assert_eq!(worker.ready.back().copied(), Some(id));
        assert_eq!(worker.pool.get(id).expect("still allocated").ctx.state, ConnState::Read);
    }

    #[test]
    fn ping_pong_is_paced_by_k_between_round_trips() {
        let mut worker = bare_worker(TransferMode::PingPong, 0, 200);
        let id = worker.pool.allocate(SockKind::Tcp, AddressFamily::Inet4, ConnCtx::fresh(true));
        worker.pool.get_mut(id).expect("just allocated").ctx.last_result = LastResult::Read(Ok(1));

        worker.dispatch_read_complete(id);

        assert!(worker.ready.is_empty(), "ping-pong should park rather than re-ready immediately");
        assert_eq!(worker.wait_list.len(), 1);
        assert_eq!(worker.pool.get(id).expect("still allocated").ctx.state, ConnState::Write);
    }

    #[test]
    fn a_failed_completion_forces_an_abortive_close_regardless_of_discipline() {
        let mut worker = bare_worker(TransferMode::OneIo, 0, 0);
        let id = worker.pool.allocate(SockKind::Tcp, AddressFamily::Inet4, ConnCtx::fresh(true));

        worker.io_failure(id, SockError::Io(std::io::Error::other("simulated failure")));

        assert_eq!(worker.pool.get(id).expect("still allocated").ctx.state, ConnState::Close);
        assert!(worker.pool.get(id).expect("still allocated").ctx.force_abortive);
    }

    #[test]
    fn a_clean_close_does_not_force_abortive() {
        let mut worker = bare_worker(TransferMode::OneIo, 0, 0);
        let id = worker.pool.allocate(SockKind::Tcp, AddressFamily::Inet4, ConnCtx::fresh(true));

        worker.close_connection(id, false);

        assert!(!worker.pool.get(id).expect("still allocated").ctx.force_abortive);
    }
}
