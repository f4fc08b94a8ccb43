//! Socket objects and the per-worker pool that owns them.
//!
//! A C-style opaque handle plus a caller-context blob (`sockwiz_socket_t` +
//! `caller_context_size`) becomes, in Rust, an index into an owning [`Pool`]
//! plus a typed `ctx: C` field on [`Socket`] — there is no reason to zero out
//! raw bytes when the type system can hand back a real `C::default()`.
//! Ownership is single-writer (the worker thread that owns the `Pool`), so
//! no locks guard it; see the design notes on intrusive lists via arena
//! indices.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use ncps_error::SockError;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};

/// Socket category, mirroring `sockwiz_socket_type` ("listener / stream /
/// datagram" in §3's data model). The connection engine only ever drives
/// `TcpListener`/`Tcp`; `Udp` exists because the facade itself is specified
/// as covering datagram sockets too (§3, §4.3's `remote_opt`/`remote_opt_out`
/// parameters on `read`/`write`), even though no `-M` transfer mode or CLI
/// flag in §6 currently routes a connection through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    TcpListener,
    Tcp,
    Udp,
}

/// Address family fixed for the lifetime of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet4,
    Inet6,
}

impl AddressFamily {
    pub(crate) fn domain(self) -> Domain {
        match self {
            AddressFamily::Inet4 => Domain::IPV4,
            AddressFamily::Inet6 => Domain::IPV6,
        }
    }

    /// The family implied by a bind/remote address.
    pub fn from_ip(addr: std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(_) => AddressFamily::Inet4,
            std::net::IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }
}

/// Opaque handle into a [`Pool`]. Stable for the lifetime of the socket
/// object; reused (with a bumped generation) once freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockId {
    pub(crate) index:      u32,
    pub(crate) generation: u32,
}

pub(crate) struct PendingRead {
    pub buf:           Vec<u8>,
    pub want:           usize,
    pub want_remote:    bool,
}

pub(crate) struct PendingWrite {
    pub buf:    Vec<u8>,
    pub sent:   usize,
    pub remote: Option<SocketAddr>,
}

pub(crate) struct PendingAccept {
    pub new_sock:    SockId,
    pub want_remote: bool,
}

/// A single socket object: OS descriptor (once opened), connection-state
/// flags, at most one pending operation per direction, and the caller's
/// own per-connection context.
pub struct Socket<C> {
    pub(crate) kind:   SockKind,
    pub(crate) family: AddressFamily,
    pub(crate) raw:    Option<RawSocket>,

    /// True once `epoll_ctl(ADD)` has been issued for this fd. Also serves
    /// as the "bound to a waiter" flag `set_async_waiter` guards on, since
    /// a socket is only ever registered after `Waiter::bind` has run.
    pub(crate) registered: bool,
    /// True between a non-blocking connect returning `EINPROGRESS` and its
    /// completion (success or failure) being observed.
    pub(crate) connecting: bool,

    pub(crate) pending_read:    Option<PendingRead>,
    pub(crate) pending_write:   Option<PendingWrite>,
    pub(crate) pending_accept:  Option<PendingAccept>,

    generation: u32,
    /// Caller context: the engine's per-connection bookkeeping
    /// (`engine::ConnCtx`), or `()` for listener sockets that carry none.
    pub ctx: C,
}

impl<C> std::ops::Deref for Socket<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.ctx
    }
}

impl<C> std::ops::DerefMut for Socket<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.ctx
    }
}

impl<C> Socket<C> {
    /// Listener, stream, or datagram.
    pub fn kind(&self) -> SockKind {
        self.kind
    }

    /// IPv4 or IPv6.
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// True while a non-blocking connect is in flight.
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// True if a read is currently pending.
    pub fn has_pending_read(&self) -> bool {
        self.pending_read.is_some()
    }

    /// True if a write is currently pending.
    pub fn has_pending_write(&self) -> bool {
        self.pending_write.is_some()
    }

    /// True if an accept is currently pending.
    pub fn has_pending_accept(&self) -> bool {
        self.pending_accept.is_some()
    }

    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.raw.as_ref().map(|s| s.as_raw_fd())
    }

    /// Local address, once the socket has been opened/connected/bound.
    pub fn local_address(&self) -> Result<SocketAddr, SockError> {
        let raw = self.raw.as_ref().ok_or(SockError::NotBound)?;
        raw.local_addr()?
            .as_socket()
            .ok_or_else(|| SockError::Io(std::io::Error::other("non-IP local address")))
    }
}

/// Owns every [`Socket`] allocated by a single worker. Indices are recycled
/// via a free list; a generation counter in [`SockId`] prevents a freed and
/// reused slot from being mistaken for the socket that used to live there.
pub struct Pool<C> {
    slots: Vec<Option<Socket<C>>>,
    free:  Vec<u32>,
}

impl<C> Default for Pool<C> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free:  Vec::new(),
        }
    }
}

impl<C> Pool<C> {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// `sockwiz_socket_allocate`: allocate a handle carrying a zeroed caller
    /// context (here: `ctx`, supplied by the caller rather than zeroed,
    /// since Rust has no uninitialized-then-zero step to skip).
    pub fn allocate(&mut self, kind: SockKind, family: AddressFamily, ctx: C) -> SockId {
        let socket = Socket {
            kind,
            family,
            raw: None,
            registered: false,
            connecting: false,
            pending_read: None,
            pending_write: None,
            pending_accept: None,
            generation: 0,
            ctx,
        };

        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize]
                .take()
                .map_or(0, |s| s.generation)
                .wrapping_add(1);
            let mut socket = socket;
            socket.generation = generation;
            self.slots[index as usize] = Some(socket);
            SockId { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Some(socket));
            SockId { index, generation: 0 }
        }
    }

    /// `sockwiz_socket_free`. Caller must have drained all pending
    /// operations first (invariant enforced by the engine, not the pool).
    pub fn free(&mut self, id: SockId) -> Option<C> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Some(s) if s.generation == id.generation => {
                let socket = slot.take().expect("checked Some above");
                self.free.push(id.index);
                Some(socket.ctx)
            }
            _ => None,
        }
    }

    /// The socket `id` refers to, if it's still live (generation matches).
    pub fn get(&self, id: SockId) -> Option<&Socket<C>> {
        match self.slots.get(id.index as usize)? {
            Some(s) if s.generation == id.generation => Some(s),
            _ => None,
        }
    }

    /// Mutable access to the socket `id` refers to, if still live.
    pub fn get_mut(&mut self, id: SockId) -> Option<&mut Socket<C>> {
        match self.slots.get_mut(id.index as usize)? {
            Some(s) if s.generation == id.generation => Some(s),
            _ => None,
        }
    }
}

pub(crate) fn new_raw_socket(family: AddressFamily, kind: SockKind) -> std::io::Result<RawSocket> {
    let (ty, proto) = match kind {
        SockKind::TcpListener | SockKind::Tcp => (Type::STREAM, Protocol::TCP),
        SockKind::Udp => (Type::DGRAM, Protocol::UDP),
    };
    let sock = RawSocket::new(family.domain(), ty, Some(proto))?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_recycles_index_with_new_generation() {
        let mut pool: Pool<u32> = Pool::new();
        let a = pool.allocate(SockKind::Tcp, AddressFamily::Inet4, 1);
        pool.free(a).unwrap();
        let b = pool.allocate(SockKind::Tcp, AddressFamily::Inet4, 2);
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(pool.get(a).is_none());
        assert_eq!(pool.get(b).unwrap().ctx, 2);
    }

    #[test]
    fn stale_handle_after_reuse_is_rejected() {
        let mut pool: Pool<()> = Pool::new();
        let a = pool.allocate(SockKind::Tcp, AddressFamily::Inet4, ());
        pool.free(a).unwrap();
        let _b = pool.allocate(SockKind::Tcp, AddressFamily::Inet4, ());
        assert!(pool.free(a).is_none());
    }
}
