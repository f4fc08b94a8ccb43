//! The async waiter: a one-shot, edge-triggered epoll reactor that exposes
//! a uniform completion interface over Linux's readiness model.
//!
//! Per the design notes, completion-port and readiness asymmetry is hidden
//! behind a single `submit`/`wait` shape: callers issue non-blocking
//! operations through the `tcp_*`/`read`/`write` methods below, and every
//! one of them may complete inline (rare) or go `Pending`, in which case the
//! eventual result arrives from [`Waiter::wait`] looking identical either
//! way. A closing list synthesizes `Cancelled` completions for operations
//! that were pending when their socket was closed, and is always drained
//! before the OS is consulted, so a worker never reuses a socket object
//! before observing every cancellation it is owed.

use std::collections::VecDeque;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use ncps_error::SockError;
use socket2::{SockAddr as RawSockAddr, Socket as RawSocket, TcpKeepalive};

use crate::socket::{
    new_raw_socket, AddressFamily, PendingAccept, PendingRead, PendingWrite, Pool, SockId, SockKind,
};

/// Results cached per `wait()` call before the OS is asked for more;
/// mirrors `ASYNC_RESULT_CACHE_SIZE` in the original implementation.
const ASYNC_RESULT_CACHE_SIZE: usize = 16;
/// One epoll event can translate into up to 2 async results (a socket can be
/// simultaneously read-ready and write-ready), so the event buffer is sized
/// at half the result cache.
const EPOLL_EVENT_BUF: usize = ASYNC_RESULT_CACHE_SIZE / 2;

/// The logical operation a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncOp {
    /// A `read` completion.
    Read,
    /// A `write` completion.
    Write,
    /// A `tcp_accept` completion.
    Accept,
    /// A `tcp_connect` completion.
    Connect,
}

/// Outcome of a completed operation.
#[derive(Debug)]
pub enum AsyncStatus {
    /// `bytes` is the number of bytes transferred for a read, 0 otherwise.
    Success { bytes: u32, remote: Option<SocketAddr> },
    /// Synthesized because the socket was closed while this operation was
    /// still pending.
    Cancelled,
    /// The operation failed with the given socket error.
    Failed(SockError),
}

/// One entry delivered by [`Waiter::wait`].
#[derive(Debug)]
pub struct AsyncResult {
    /// The socket the completed operation belongs to.
    pub sock:   SockId,
    /// Which operation completed.
    pub op:     AsyncOp,
    /// How it completed.
    pub status: AsyncStatus,
}

/// Result of a [`Waiter::wait`] call.
pub enum WaitOutcome {
    /// A completion is available.
    Ready(AsyncResult),
    /// No completion arrived before the deadline.
    Timeout,
}

/// Result of a call that may complete immediately or go pending.
pub enum CallStatus {
    /// The call completed inline.
    Success,
    /// The call will complete later, delivered through `wait`.
    Pending,
}

/// Outcome of [`Waiter::read`].
pub enum ReadOutcome {
    /// The read completed inline with the given bytes (and sender, for UDP).
    Ready { bytes: Vec<u8>, remote: Option<SocketAddr> },
    /// No data was immediately available; the result will arrive via `wait`.
    Pending,
}

/// Outcome of [`Waiter::write`].
pub enum WriteOutcome {
    /// Every byte was sent.
    Ready,
    /// The send could not complete inline; retried inside `wait`.
    Pending,
}

/// Outcome of [`Waiter::tcp_accept`].
pub enum AcceptOutcome {
    /// A connection was accepted inline; carries the peer address if asked for.
    Ready(Option<SocketAddr>),
    /// No connection was waiting; the result will arrive via `wait`.
    Pending,
}

struct ClosingEntry {
    sock:    SockId,
    read:    bool,
    write:   bool,
    accept:  bool,
    connect: bool,
}

impl ClosingEntry {
    fn is_empty(&self) -> bool {
        !(self.read || self.write || self.accept || self.connect)
    }
}

fn encode_token(id: SockId) -> u64 {
    (u64::from(id.index) << 32) | u64::from(id.generation)
}

fn decode_token(token: u64) -> SockId {
    SockId {
        index:      (token >> 32) as u32,
        generation: token as u32,
    }
}

/// Owns the OS readiness primitive (an epoll instance) and the bookkeeping
/// needed to present it as a completion interface: a small result cache and
/// a FIFO closing list.
pub struct Waiter {
    epfd:    RawFd,
    cache:   VecDeque<AsyncResult>,
    closing: VecDeque<ClosingEntry>,
}

impl Waiter {
    /// `sockwiz_async_waiter_create`.
    pub fn new() -> Result<Self, SockError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            epfd,
            cache: VecDeque::with_capacity(ASYNC_RESULT_CACHE_SIZE),
            closing: VecDeque::new(),
        })
    }

    /// `sockwiz_socket_set_async_waiter`: idempotent per socket, must
    /// precede the first non-blocking operation.
    pub fn bind<C>(&self, pool: &mut Pool<C>, id: SockId) -> Result<(), SockError> {
        let sock = pool.get_mut(id).ok_or(SockError::NotBound)?;
        if sock.registered {
            return Err(SockError::AlreadyBound);
        }
        // `registered` doubles as the "bound" flag; the real epoll_ctl(ADD)
        // happens lazily on the first `arm`, since we don't yet know which
        // readiness direction is wanted.
        Ok(())
    }

    fn arm<C>(&self, pool: &mut Pool<C>, id: SockId, events: u32) -> Result<(), SockError> {
        let sock = pool.get(id).ok_or(SockError::NotBound)?;
        let fd = sock.fd().ok_or(SockError::NotBound)?;
        let already_registered = sock.registered;
        let mut ev = libc::epoll_event {
            events: events | (libc::EPOLLET | libc::EPOLLONESHOT) as u32,
            u64:    encode_token(id),
        };
        let op = if already_registered {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        if op == libc::EPOLL_CTL_ADD {
            pool.get_mut(id).expect("checked above").registered = true;
        }
        Ok(())
    }

    fn wanted_events<C>(sock: &crate::socket::Socket<C>) -> u32 {
        let mut events = 0u32;
        if sock.pending_read.is_some() || sock.pending_accept.is_some() {
            events |= libc::EPOLLIN as u32;
        }
        if sock.pending_write.is_some() || sock.connecting {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn rearm<C>(&self, pool: &mut Pool<C>, id: SockId) -> Result<(), SockError> {
        let Some(sock) = pool.get(id) else { return Ok(()) };
        let events = Self::wanted_events(sock);
        if events != 0 {
            self.arm(pool, id, events)?;
        }
        Ok(())
    }

    fn unregister(&self, fd: RawFd) {
        unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    // ---- Listener ----------------------------------------------------

    /// `sockwiz_tcp_listener_open`.
    pub fn tcp_listener_open<C>(
        &self,
        pool: &mut Pool<C>,
        id: SockId,
        local: SocketAddr,
        backlog: i32,
        reuse_port: bool,
    ) -> Result<(), SockError> {
        let sock = pool.get_mut(id).ok_or(SockError::NotBound)?;
        let raw = new_raw_socket(sock.family, SockKind::TcpListener)?;
        raw.set_reuse_address(true)?;
        if reuse_port {
            raw.set_reuse_port(true)?;
        }
        raw.bind(&RawSockAddr::from(local))?;
        raw.listen(backlog)?;
        sock.raw = Some(raw);
        Ok(())
    }

    /// `sockwiz_tcp_listener_close`.
    pub fn tcp_listener_close<C>(&mut self, pool: &mut Pool<C>, id: SockId) {
        self.close_common(pool, id, false);
    }

    // ---- Connect / accept ---------------------------------------------

    /// `sockwiz_tcp_connect`. Sets `IP_BIND_ADDRESS_NO_PORT` when binding a
    /// wildcard local port, so the kernel defers ephemeral port selection
    /// to connect time.
    pub fn tcp_connect<C>(
        &self,
        pool: &mut Pool<C>,
        id: SockId,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        reuse_addr: bool,
    ) -> Result<CallStatus, SockError> {
        let sock = pool.get_mut(id).ok_or(SockError::NotBound)?;
        let raw = new_raw_socket(sock.family, SockKind::Tcp)?;
        if reuse_addr {
            raw.set_reuse_address(true)?;
        }
        if let Some(local) = local {
            if local.port() == 0 {
                optimize_ephemeral_port_usage(&raw);
            }
            raw.bind(&RawSockAddr::from(local))?;
        }

        match raw.connect(&RawSockAddr::from(remote)) {
            Ok(()) => {
                sock.raw = Some(raw);
                sock.connecting = false;
                Ok(CallStatus::Success)
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                sock.raw = Some(raw);
                sock.connecting = true;
                self.arm(pool, id, libc::EPOLLOUT as u32)?;
                Ok(CallStatus::Pending)
            }
            Err(e) => Err(SockError::from_connect_io(e)),
        }
    }

    /// `sockwiz_tcp_accept`. At most one pending accept per listener.
    pub fn tcp_accept<C>(
        &self,
        pool: &mut Pool<C>,
        listener: SockId,
        new_sock: SockId,
        want_remote: bool,
    ) -> Result<AcceptOutcome, SockError> {
        {
            let l = pool.get(listener).ok_or(SockError::NotBound)?;
            if l.pending_accept.is_some() {
                return Err(SockError::AlreadyPending);
            }
        }
        let raw = pool
            .get(listener)
            .and_then(|s| s.raw.as_ref())
            .ok_or(SockError::NotBound)?;

        match raw.accept() {
            Ok((conn, addr)) => {
                conn.set_nonblocking(true)?;
                let new = pool.get_mut(new_sock).ok_or(SockError::NotBound)?;
                new.raw = Some(conn);
                Ok(AcceptOutcome::Ready(if want_remote { addr.as_socket() } else { None }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let l = pool.get_mut(listener).expect("checked above");
                l.pending_accept = Some(PendingAccept { new_sock, want_remote });
                self.arm(pool, listener, libc::EPOLLIN as u32)?;
                Ok(AcceptOutcome::Pending)
            }
            Err(e) => Err(SockError::Io(e)),
        }
    }

    /// `sockwiz_tcp_disconnect`: graceful half-close of the write side.
    pub fn tcp_disconnect<C>(&self, pool: &Pool<C>, id: SockId) -> Result<(), SockError> {
        let raw = pool.get(id).and_then(|s| s.raw.as_ref()).ok_or(SockError::NotBound)?;
        raw.shutdown(Shutdown::Write)?;
        Ok(())
    }

    /// `sockwiz_tcp_get_info`: kernel-reported SYN RTT (microseconds) and
    /// total SYN retransmits, via `getsockopt(IPPROTO_TCP, TCP_INFO)`.
    pub fn tcp_get_info<C>(&self, pool: &Pool<C>, id: SockId) -> Result<(u32, u32), SockError> {
        let fd = pool.get(id).and_then(|s| s.fd()).ok_or(SockError::NotBound)?;
        let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                std::ptr::addr_of_mut!(info).cast(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(SockError::Io(io::Error::last_os_error()));
        }
        Ok((info.tcpi_rtt, info.tcpi_total_retrans))
    }

    /// `sockwiz_tcp_set_keepalive`: idle period from the caller, interval
    /// fixed at 1s and probe count at 10 where the platform exposes them.
    pub fn tcp_set_keepalive<C>(&self, pool: &Pool<C>, id: SockId, idle_sec: u32) -> Result<(), SockError> {
        let raw = pool.get(id).and_then(|s| s.raw.as_ref()).ok_or(SockError::NotBound)?;
        let ka = TcpKeepalive::new()
            .with_time(Duration::from_secs(u64::from(idle_sec)))
            .with_interval(Duration::from_secs(1))
            .with_retries(10);
        raw.set_tcp_keepalive(&ka)?;
        Ok(())
    }

    /// `sockwiz_tcp_close`. If `abortive`, sets `SO_LINGER{on,0}` first so
    /// the close generates an RST instead of a graceful FIN.
    pub fn tcp_close<C>(&mut self, pool: &mut Pool<C>, id: SockId, abortive: bool) {
        self.close_common(pool, id, abortive);
    }

    fn close_common<C>(&mut self, pool: &mut Pool<C>, id: SockId, abortive: bool) {
        let Some(sock) = pool.get_mut(id) else { return };
        if abortive {
            if let Some(raw) = sock.raw.as_ref() {
                let _ = raw.set_linger(Some(Duration::ZERO));
            }
        }

        let entry = ClosingEntry {
            sock:    id,
            read:    sock.pending_read.take().is_some(),
            write:   sock.pending_write.take().is_some(),
            accept:  sock.pending_accept.take().is_some(),
            connect: sock.connecting,
        };
        sock.connecting = false;

        if let Some(fd) = sock.fd() {
            if sock.registered {
                self.unregister(fd);
            }
        }
        sock.raw = None;
        sock.registered = false;

        if !entry.is_empty() {
            self.closing.push_back(entry);
        }
    }

    // ---- Data path ------------------------------------------------------

    /// `sockwiz_read`.
    pub fn read<C>(&self, pool: &mut Pool<C>, id: SockId, len: usize, want_remote: bool) -> Result<ReadOutcome, SockError> {
        {
            let sock = pool.get(id).ok_or(SockError::NotBound)?;
            if sock.pending_read.is_some() {
                return Err(SockError::AlreadyPending);
            }
        }
        let is_udp = pool.get(id).map(|s| s.kind) == Some(SockKind::Udp);
        let raw = pool.get(id).and_then(|s| s.raw.as_ref()).ok_or(SockError::NotBound)?;

        let mut buf = vec![0u8; len];
        let outcome = recv_into(raw, &mut buf, is_udp);

        match outcome {
            Ok((n, remote)) => {
                buf.truncate(n);
                Ok(ReadOutcome::Ready { bytes: buf, remote })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let sock = pool.get_mut(id).expect("checked above");
                sock.pending_read = Some(PendingRead { buf, want: len, want_remote });
                self.arm(pool, id, libc::EPOLLIN as u32)?;
                Ok(ReadOutcome::Pending)
            }
            Err(e) => Err(SockError::Io(e)),
        }
    }

    /// `sockwiz_write`: all-or-nothing. Partial progress is retried inline
    /// here on the first call, and inside [`Waiter::wait`] on later
    /// readiness deliveries.
    pub fn write<C>(&self, pool: &mut Pool<C>, id: SockId, buf: &[u8], remote: Option<SocketAddr>) -> Result<WriteOutcome, SockError> {
        {
            let sock = pool.get(id).ok_or(SockError::NotBound)?;
            if sock.pending_write.is_some() {
                return Err(SockError::AlreadyPending);
            }
        }
        let sent = try_send(pool, id, buf, 0, remote)?;
        if sent == buf.len() {
            return Ok(WriteOutcome::Ready);
        }
        let sock = pool.get_mut(id).expect("checked above");
        sock.pending_write = Some(PendingWrite {
            buf: buf.to_vec(),
            sent,
            remote,
        });
        self.arm(pool, id, libc::EPOLLOUT as u32)?;
        Ok(WriteOutcome::Pending)
    }

    // ---- wait() -----------------------------------------------------------

    /// `sockwiz_async_waiter_wait`.
    pub fn wait<C>(&mut self, pool: &mut Pool<C>, timeout_ms: i32) -> Result<WaitOutcome, SockError> {
        if let Some(r) = self.cache.pop_front() {
            return Ok(WaitOutcome::Ready(r));
        }

        self.drain_closing_list();
        if let Some(r) = self.cache.pop_front() {
            return Ok(WaitOutcome::Ready(r));
        }

        let mut events: [libc::epoll_event; EPOLL_EVENT_BUF] = unsafe { std::mem::zeroed() };
        let n = unsafe { libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(WaitOutcome::Timeout);
            }
            return Err(SockError::Io(err));
        }

        for ev in &events[..n as usize] {
            self.dispatch_event(pool, ev);
        }

        match self.cache.pop_front() {
            Some(r) => Ok(WaitOutcome::Ready(r)),
            None => Ok(WaitOutcome::Timeout),
        }
    }

    fn drain_closing_list(&mut self) {
        while self.cache.len() < ASYNC_RESULT_CACHE_SIZE {
            let Some(front) = self.closing.front_mut() else { break };
            let op = if front.read {
                front.read = false;
                AsyncOp::Read
            } else if front.write {
                front.write = false;
                AsyncOp::Write
            } else if front.accept {
                front.accept = false;
                AsyncOp::Accept
            } else if front.connect {
                front.connect = false;
                AsyncOp::Connect
            } else {
                self.closing.pop_front();
                continue;
            };
            self.cache.push_back(AsyncResult {
                sock:   front.sock,
                op,
                status: AsyncStatus::Cancelled,
            });
            if front.is_empty() {
                self.closing.pop_front();
            }
        }
    }

    fn dispatch_event<C>(&mut self, pool: &mut Pool<C>, ev: &libc::epoll_event) {
        let id = decode_token(ev.u64);
        let readable = ev.events & libc::EPOLLIN as u32 != 0;
        let writable = ev.events & libc::EPOLLOUT as u32 != 0;

        let kind = match pool.get(id) {
            Some(s) => s.kind,
            None => return,
        };

        if writable {
            let connecting = pool.get(id).is_some_and(|s| s.connecting);
            if connecting {
                self.complete_connect(pool, id);
            } else if pool.get(id).is_some_and(|s| s.pending_write.is_some()) {
                self.complete_write(pool, id);
            }
        }

        if readable {
            if kind == SockKind::TcpListener {
                if pool.get(id).is_some_and(|s| s.pending_accept.is_some()) {
                    self.complete_accept(pool, id);
                }
            } else if pool.get(id).is_some_and(|s| s.pending_read.is_some()) {
                self.complete_read(pool, id);
            }
        }

        let _ = self.rearm(pool, id);
    }

    fn complete_connect<C>(&mut self, pool: &mut Pool<C>, id: SockId) {
        let Some(sock) = pool.get_mut(id) else { return };
        sock.connecting = false;
        let Some(fd) = sock.fd() else { return };

        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                std::ptr::addr_of_mut!(err).cast(),
                &mut len,
            )
        };
        let status = if rc == 0 && err == 0 {
            AsyncStatus::Success { bytes: 0, remote: None }
        } else {
            let ioerr = if rc == 0 {
                io::Error::from_raw_os_error(err)
            } else {
                io::Error::last_os_error()
            };
            AsyncStatus::Failed(SockError::from_connect_io(ioerr))
        };
        self.cache.push_back(AsyncResult { sock: id, op: AsyncOp::Connect, status });
    }

    fn complete_accept<C>(&mut self, pool: &mut Pool<C>, id: SockId) {
        let Some(pending) = pool.get_mut(id).and_then(|s| s.pending_accept.take()) else { return };
        let raw = pool.get(id).and_then(|s| s.raw.as_ref());
        let Some(raw) = raw else { return };

        match raw.accept() {
            Ok((conn, addr)) => {
                let _ = conn.set_nonblocking(true);
                if let Some(new) = pool.get_mut(pending.new_sock) {
                    new.raw = Some(conn);
                }
                self.cache.push_back(AsyncResult {
                    sock:   id,
                    op:     AsyncOp::Accept,
                    status: AsyncStatus::Success {
                        bytes:  0,
                        remote: if pending.want_remote { addr.as_socket() } else { None },
                    },
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(sock) = pool.get_mut(id) {
                    sock.pending_accept = Some(pending);
                }
            }
            Err(e) => {
                self.cache.push_back(AsyncResult {
                    sock:   id,
                    op:     AsyncOp::Accept,
                    status: AsyncStatus::Failed(SockError::Io(e)),
                });
            }
        }
    }

    fn complete_read<C>(&mut self, pool: &mut Pool<C>, id: SockId) {
        let Some(pending) = pool.get_mut(id).and_then(|s| s.pending_read.take()) else { return };
        let kind = pool.get(id).map(|s| s.kind);
        let raw = pool.get(id).and_then(|s| s.raw.as_ref());
        let Some(raw) = raw else { return };

        let mut buf = pending.buf;
        buf.resize(pending.want, 0);
        let result = recv_into(raw, &mut buf, kind == Some(SockKind::Udp));

        match result {
            Ok((n, remote)) => {
                buf.truncate(n);
                self.cache.push_back(AsyncResult {
                    sock:   id,
                    op:     AsyncOp::Read,
                    status: AsyncStatus::Success {
                        bytes: n as u32,
                        remote: if pending.want_remote { remote } else { None },
                    },
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(sock) = pool.get_mut(id) {
                    sock.pending_read = Some(PendingRead {
                        buf,
                        want: pending.want,
                        want_remote: pending.want_remote,
                    });
                }
            }
            Err(e) => {
                self.cache.push_back(AsyncResult {
                    sock:   id,
                    op:     AsyncOp::Read,
                    status: AsyncStatus::Failed(SockError::Io(e)),
                });
            }
        }
    }

    fn complete_write<C>(&mut self, pool: &mut Pool<C>, id: SockId) {
        let Some(pending) = pool.get_mut(id).and_then(|s| s.pending_write.take()) else { return };
        match try_send(pool, id, &pending.buf, pending.sent, pending.remote) {
            Ok(sent) if sent == pending.buf.len() => {
                self.cache.push_back(AsyncResult {
                    sock:   id,
                    op:     AsyncOp::Write,
                    status: AsyncStatus::Success { bytes: 0, remote: None },
                });
            }
            Ok(sent) => {
                if let Some(sock) = pool.get_mut(id) {
                    sock.pending_write = Some(PendingWrite {
                        buf: pending.buf,
                        sent,
                        remote: pending.remote,
                    });
                }
            }
            Err(e) => {
                self.cache.push_back(AsyncResult {
                    sock:   id,
                    op:     AsyncOp::Write,
                    status: AsyncStatus::Failed(e),
                });
            }
        }
    }

    // ---- UDP --------------------------------------------------------------

    /// `sockwiz_udp_open`.
    pub fn udp_open<C>(&self, pool: &mut Pool<C>, id: SockId, local: SocketAddr, remote: Option<SocketAddr>) -> Result<(), SockError> {
        let sock = pool.get_mut(id).ok_or(SockError::NotBound)?;
        let raw = new_raw_socket(sock.family, SockKind::Udp)?;
        raw.bind(&RawSockAddr::from(local))?;
        if let Some(remote) = remote {
            raw.connect(&RawSockAddr::from(remote))?;
        }
        sock.raw = Some(raw);
        Ok(())
    }

    /// `sockwiz_udp_close`.
    pub fn udp_close<C>(&mut self, pool: &mut Pool<C>, id: SockId) {
        self.close_common(pool, id, false);
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Reinterprets already-initialized bytes as a `MaybeUninit<u8>` slice.
/// Sound: per [`std::mem::MaybeUninit`] docs, viewing initialized memory as
/// `MaybeUninit<T>` is always valid; `buf` stays the owner of the storage.
fn uninit_slice(buf: &mut [u8]) -> &mut [std::mem::MaybeUninit<u8>] {
    unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast(), buf.len()) }
}

/// One non-blocking receive attempt, UDP (`recvfrom`) or TCP (`recv`).
fn recv_into(raw: &RawSocket, buf: &mut [u8], is_udp: bool) -> io::Result<(usize, Option<SocketAddr>)> {
    if is_udp {
        let (n, addr) = raw.recv_from(uninit_slice(buf))?;
        Ok((n, addr.as_socket()))
    } else {
        let n = raw.recv(uninit_slice(buf))?;
        Ok((n, None))
    }
}

fn try_send<C>(pool: &Pool<C>, id: SockId, buf: &[u8], from: usize, remote: Option<SocketAddr>) -> Result<usize, SockError> {
    let raw = pool.get(id).and_then(|s| s.raw.as_ref()).ok_or(SockError::NotBound)?;
    let mut sent = from;
    loop {
        if sent == buf.len() {
            return Ok(sent);
        }
        let chunk = &buf[sent..];
        let result = match remote {
            Some(addr) => raw.send_to(chunk, &RawSockAddr::from(addr)),
            None => raw.send(chunk),
        };
        match result {
            Ok(n) if n == 0 => return Ok(sent),
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(sent),
            Err(e) => return Err(SockError::Io(e)),
        }
    }
}

/// `optimize_ephemeral_port_usage`: `IP_BIND_ADDRESS_NO_PORT` defers the
/// kernel's ephemeral-port reservation from bind-time to connect-time,
/// letting many short-lived sockets share a wildcard-port bind without
/// exhausting the ephemeral range prematurely. Best-effort; unsupported
/// kernels just skip the optimization.
fn optimize_ephemeral_port_usage(raw: &RawSocket) {
    const IP_BIND_ADDRESS_NO_PORT: libc::c_int = 24;
    let flag: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            raw.as_raw_fd(),
            libc::IPPROTO_IP,
            IP_BIND_ADDRESS_NO_PORT,
            std::ptr::addr_of!(flag).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::AddressFamily;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    #[test]
    fn connect_to_closed_port_fails_quickly() {
        let waiter = Waiter::new().unwrap();
        let mut pool: Pool<()> = Pool::new();
        let id = pool.allocate(SockKind::Tcp, AddressFamily::Inet4, ());
        let remote = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));
        let result = waiter.tcp_connect(&mut pool, id, None, remote, false);
        assert!(matches!(result, Ok(CallStatus::Pending) | Err(_)));
    }

    #[test]
    fn token_roundtrips_through_encode_decode() {
        let id = SockId { index: 42, generation: 7 };
        assert_eq!(decode_token(encode_token(id)), id);
    }
}
