//! Descriptor registry and socket primitives
//!
//! Every descriptor the server owns is recorded here, indexed directly by
//! its number. A record carries the descriptor type, the open flag, the
//! "added to a poller" flag consulted by [`crate::event`], and the chain
//! of close handlers.
//!
//! I/O calls return `Result<_, Errno>` so callers can classify failures
//! with [`ignore`]: transient errors mean "re-arm and come back later".
//!
//! ```text
//!   open_listener / open_socket / open_file / accept
//!                      │  (fd < maxfd, mark open)
//!                      ▼
//!   read / write / connect / shutdown_read   ◄── requires open
//!                      │
//!                      ▼
//!   close: run close handlers in order → clear record → close(2)
//! ```

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, MsgFlags, Shutdown, SockFlag, SockType, SockaddrIn,
};
use nix::sys::stat::Mode;
use nix::unistd;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

/// Descriptor type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommKind {
    File,
    Tcp,
    Udp,
}

/// Called with the descriptor number just before the OS close.
pub type CloseHandler = Box<dyn FnOnce(RawFd) + Send>;

#[derive(Default)]
struct Descriptor {
    kind: Option<CommKind>,
    open: bool,
    added: bool,
    handlers: Vec<CloseHandler>,
}

/// Process-wide descriptor registry
pub struct Registry {
    slots: Box<[Mutex<Descriptor>]>,
}

/// Transient errno: the operation should be retried after re-arming.
#[inline]
pub fn ignore(err: Errno) -> bool {
    matches!(
        err,
        Errno::EAGAIN | Errno::EINTR | Errno::EINPROGRESS | Errno::EALREADY
    ) || err == Errno::EWOULDBLOCK
}

/// Toggle `O_NONBLOCK` on a descriptor.
pub fn set_nonblocking(fd: RawFd, on: bool) -> std::result::Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let flags = if on {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

fn sock_flags(nonblocking: bool) -> SockFlag {
    if nonblocking {
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK
    } else {
        SockFlag::SOCK_CLOEXEC
    }
}

/// IPv4 socket owned by the caller until it is tracked.
fn new_socket(kind: CommKind, nonblocking: bool) -> Result<OwnedFd> {
    let ty = match kind {
        CommKind::Tcp => SockType::Stream,
        CommKind::Udp => SockType::Datagram,
        CommKind::File => return Err(Error::Invalid("open_socket needs a socket kind")),
    };
    Ok(socket::socket(AddressFamily::Inet, ty, sock_flags(nonblocking), None)?)
}

/// Parse a listen address. Empty or `*` means any.
pub fn parse_ipv4(addr: Option<&str>) -> Result<Ipv4Addr> {
    match addr.map(str::trim) {
        None | Some("") | Some("*") => Ok(Ipv4Addr::UNSPECIFIED),
        Some("localhost") => Ok(Ipv4Addr::LOCALHOST),
        Some(s) => s.parse().map_err(|_| Error::Addr(s.to_string())),
    }
}

/// Local address bound to a socket.
pub fn local_addr(fd: RawFd) -> std::result::Result<SocketAddrV4, Errno> {
    socket::getsockname::<SockaddrIn>(fd).map(SocketAddrV4::from)
}

/// Pending socket error (`SO_ERROR`), used after a non-blocking connect.
pub fn socket_error(fd: RawFd) -> std::result::Result<(), Errno> {
    // SAFETY: the caller holds `fd` open for the duration of the call.
    let sock = unsafe { BorrowedFd::borrow_raw(fd) };
    match socket::getsockopt(&sock, sockopt::SocketError)? {
        0 => Ok(()),
        err => Err(Errno::from_raw(err)),
    }
}

impl Registry {
    /// Create a registry for descriptors `0..maxfd`.
    pub fn new(maxfd: usize) -> Self {
        Self {
            slots: (0..maxfd).map(|_| Mutex::new(Descriptor::default())).collect(),
        }
    }

    #[inline]
    pub fn maxfd(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, fd: RawFd) -> Result<MutexGuard<'_, Descriptor>> {
        let slot = usize::try_from(fd)
            .ok()
            .and_then(|i| self.slots.get(i))
            .ok_or(Error::FdOutOfRange { fd, maxfd: self.maxfd() })?;
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn open_slot(&self, fd: RawFd) -> std::result::Result<MutexGuard<'_, Descriptor>, Errno> {
        match self.slot(fd) {
            Ok(d) if d.open => Ok(d),
            _ => Err(Errno::EBADF),
        }
    }

    /// Record a freshly created descriptor. Out-of-range descriptors are
    /// closed again and rejected.
    fn track(&self, fd: RawFd, kind: CommKind) -> Result<RawFd> {
        match self.slot(fd) {
            Ok(mut d) => {
                d.kind = Some(kind);
                d.open = true;
                d.added = false;
                d.handlers.clear();
                Ok(fd)
            }
            Err(e) => {
                let _ = unistd::close(fd);
                Err(e)
            }
        }
    }

    /// Open a file.
    pub fn open_file(&self, path: &Path, flags: OFlag, nonblocking: bool) -> Result<RawFd> {
        let mut flags = flags | OFlag::O_CLOEXEC;
        if nonblocking {
            flags |= OFlag::O_NONBLOCK;
        }
        let fd = nix::fcntl::open(path, flags, Mode::from_bits_truncate(0o644))?;
        self.track(fd, CommKind::File)
    }

    /// Open a server socket: socket + SO_REUSEADDR + bind, and listen for
    /// TCP. Port 0 binds an ephemeral port.
    pub fn open_listener(
        &self,
        kind: CommKind,
        addr: Option<&str>,
        port: u16,
        backlog: i32,
        nonblocking: bool,
    ) -> Result<RawFd> {
        let ip = parse_ipv4(addr)?;
        let sock = new_socket(kind, nonblocking)?;

        socket::setsockopt(&sock, sockopt::ReuseAddr, &true)?;
        socket::bind(sock.as_raw_fd(), &SockaddrIn::from(SocketAddrV4::new(ip, port)))?;
        if kind == CommKind::Tcp {
            let backlog = Backlog::new(backlog).unwrap_or(Backlog::MAXCONN);
            socket::listen(&sock, backlog)?;
        }
        self.track(sock.into_raw_fd(), kind)
    }

    /// Open an unconnected client socket.
    pub fn open_socket(&self, kind: CommKind, nonblocking: bool) -> Result<RawFd> {
        let sock = new_socket(kind, nonblocking)?;
        self.track(sock.into_raw_fd(), kind)
    }

    /// Accept one connection and register it.
    pub fn accept(
        &self,
        listen_fd: RawFd,
        nonblocking: bool,
    ) -> std::result::Result<(RawFd, SocketAddrV4), Errno> {
        self.open_slot(listen_fd)?;
        let fd = loop {
            match socket::accept4(listen_fd, sock_flags(nonblocking)) {
                Err(Errno::EINTR) => continue,
                other => break other?,
            }
        };
        let peer = match socket::getpeername::<SockaddrIn>(fd) {
            Ok(sa) => SocketAddrV4::from(sa),
            Err(e) => {
                let _ = unistd::close(fd);
                return Err(e);
            }
        };
        match self.track(fd, CommKind::Tcp) {
            Ok(fd) => Ok((fd, peer)),
            Err(e) => {
                tracing::warn!("accepted fd dropped: {}", e);
                Err(Errno::EMFILE)
            }
        }
    }

    /// Start connecting. A non-blocking socket reports `EINPROGRESS`;
    /// an already connected one reports success.
    pub fn connect(&self, fd: RawFd, addr: SocketAddrV4) -> std::result::Result<(), Errno> {
        self.open_slot(fd)?;
        match socket::connect(fd, &SockaddrIn::from(addr)) {
            Ok(()) | Err(Errno::EISCONN) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read into `buf`, retrying on `EINTR`. `Ok(0)` is end of stream.
    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> std::result::Result<usize, Errno> {
        self.open_slot(fd)?;
        loop {
            match unistd::read(fd, buf) {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        }
    }

    /// Write from `buf`, retrying on `EINTR`. Sockets never raise SIGPIPE.
    pub fn write(&self, fd: RawFd, buf: &[u8]) -> std::result::Result<usize, Errno> {
        let kind = self.open_slot(fd)?.kind;
        loop {
            let n = match kind {
                Some(CommKind::File) => {
                    // SAFETY: open in the registry, which owns it.
                    let file = unsafe { BorrowedFd::borrow_raw(fd) };
                    unistd::write(file, buf)
                }
                _ => socket::send(fd, buf, MsgFlags::MSG_NOSIGNAL),
            };
            match n {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        }
    }

    /// Stop further reads on a socket.
    pub fn shutdown_read(&self, fd: RawFd) -> std::result::Result<(), Errno> {
        self.open_slot(fd)?;
        socket::shutdown(fd, Shutdown::Read)
    }

    /// Append a close handler; handlers run in registration order.
    pub fn add_close_handler(&self, fd: RawFd, handler: CloseHandler) -> Result<()> {
        let mut d = self.slot(fd)?;
        if !d.open {
            return Err(Error::NotOpen(fd));
        }
        d.handlers.push(handler);
        Ok(())
    }

    /// Run the close handlers, clear the record and close the descriptor.
    pub fn close(&self, fd: RawFd) -> Result<()> {
        let handlers = {
            let mut d = self.slot(fd)?;
            if !d.open {
                return Err(Error::NotOpen(fd));
            }
            std::mem::take(&mut d.handlers)
        };

        for handler in handlers {
            handler(fd);
        }

        {
            let mut d = self.slot(fd)?;
            d.open = false;
            d.added = false;
            d.kind = None;
        }

        unistd::close(fd)?;
        Ok(())
    }

    #[inline]
    pub fn is_open(&self, fd: RawFd) -> bool {
        self.slot(fd).map(|d| d.open).unwrap_or(false)
    }

    pub fn kind(&self, fd: RawFd) -> Option<CommKind> {
        self.slot(fd).ok().and_then(|d| d.kind)
    }

    /// Whether the descriptor is already known to a poller.
    #[inline]
    pub fn added(&self, fd: RawFd) -> bool {
        self.slot(fd).map(|d| d.added).unwrap_or(false)
    }

    pub fn set_added(&self, fd: RawFd, added: bool) {
        if let Ok(mut d) = self.slot(fd) {
            d.added = added;
        }
    }

    /// Number of open descriptors.
    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.lock().map(|d| d.open).unwrap_or(false))
            .count()
    }
}
