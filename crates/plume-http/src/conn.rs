//! Client connection state machine
//!
//! A connection belongs to the worker that accepted it. Its callbacks share
//! one `Rc<RefCell<..>>` slot; teardown empties the slot, so callbacks that
//! fire afterwards find nothing and return.
//!
//! ```text
//!   client ──read──► parser ──► requests (FIFO) ──front──► Forward ──► backend
//!     ▲                                                       │
//!     └──────────── outq (canned replies, relayed bytes) ◄────┘
//! ```
//!
//! Only the front request is forwarded; the next one starts when the
//! front's response is complete.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nix::errno::Errno;
use plume_core::buffer::{BUFFER_CLASSES, MAX_BUFFER};
use plume_core::comm::{ignore, socket_error};
use plume_core::{
    Buffer, BufferPool, CommKind, LookasideList, LookasideOptions, MemConfig, MemPool, Pooled,
    Registry, Worker,
};

use crate::error::{ProxyError, Result};
use crate::forward::{Forward, Sent};
use crate::parser::{Method, Parser, Status};
use crate::plugin::HttpShared;
use crate::reply::Reply;
use crate::request::{Request, RequestBuilder};

/// Idle connection records kept per thread
pub const CONN_HWM: usize = 128;

/// Unsent body bytes buffered before client reads pause
pub const BODY_HWM: usize = MAX_BUFFER;

#[derive(Default)]
pub struct Connection {
    fd: RawFd,
    pool: MemPool,
    inbuf: Option<Buffer>,
    inlen: usize,
    parser: Parser,
    /// Request whose head is being parsed
    current: Option<Request>,
    requests: VecDeque<Request>,
    /// Body bytes still owed to the newest request
    body_left: u64,
    outq: VecDeque<Cow<'static, [u8]>>,
    out_off: usize,
    forward: Option<Forward>,
    eof: bool,
    bad_request: bool,
    closing: bool,
    write_armed: bool,
    /// Client read left unarmed until buffered body drains
    read_paused: bool,
}

/// Per-thread proxy state
pub struct HttpThread {
    conns: LookasideList<Connection>,
}

impl HttpThread {
    pub fn new(mem: MemConfig) -> Self {
        Self {
            conns: LookasideList::new(LookasideOptions::from_mem(mem, CONN_HWM), Connection::default),
        }
    }

    /// Connections currently handed out.
    pub fn open_connections(&self) -> usize {
        self.conns.outstanding()
    }
}

#[derive(Clone)]
struct Client {
    fd: RawFd,
    conn: Rc<RefCell<Option<Pooled<Connection>>>>,
    shared: Arc<HttpShared>,
}

impl Client {
    /// Run `f` on the connection unless it was torn down.
    fn with<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut slot = self.conn.borrow_mut();
        slot.as_deref_mut().map(f)
    }
}

// ── Entry points ──

/// Take ownership of a freshly accepted client.
pub(crate) fn accept(w: &mut Worker, shared: &Arc<HttpShared>, fd: RawFd) {
    if let Err(e) = open(w, shared, fd) {
        shared.stats.errors.fetch_add(1, Ordering::Relaxed);
        tracing::error!(fd, "connection dropped: {}", e);
        if let Err(e) = w.close(fd) {
            tracing::debug!(fd, "close: {}", e);
        }
    }
}

fn open(w: &mut Worker, shared: &Arc<HttpShared>, fd: RawFd) -> Result<()> {
    let buf = w.ctx().buffers().alloc(BUFFER_CLASSES[0])?;
    let thread = w
        .local_mut::<HttpThread>()
        .ok_or(plume_core::Error::State("http thread state missing"))?;
    let mut conn = thread.conns.alloc()?;
    conn.fd = fd;
    conn.inbuf = Some(buf);

    let closed = Arc::clone(shared);
    w.registry().add_close_handler(
        fd,
        Box::new(move |fd| {
            closed.stats.closed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(fd, "client closed");
        }),
    )?;

    let client = Client {
        fd,
        conn: Rc::new(RefCell::new(Some(conn))),
        shared: Arc::clone(shared),
    };
    arm_read(w, &client)?;
    Ok(())
}

fn teardown(w: &mut Worker, client: &Client) {
    let Some(mut conn) = client.conn.borrow_mut().take() else {
        return;
    };
    if let Some(f) = conn.forward.take() {
        if let Err(e) = w.close(f.fd) {
            tracing::debug!(fd = f.fd, "backend close: {}", e);
        }
    }
    if let Err(e) = w.close(conn.fd) {
        tracing::debug!(fd = conn.fd, "client close: {}", e);
    }
    *conn = Connection::default();
    if let Some(thread) = w.local_mut::<HttpThread>() {
        thread.conns.free(conn);
    }
}

// ── Callback wiring ──

fn arm_read(w: &Worker, client: &Client) -> plume_core::Result<()> {
    let c = client.clone();
    w.on_read(client.fd, move |w, _| {
        if c.with(|conn| conn.client_readable(w, &c)) == Some(true) {
            teardown(w, &c);
        }
    })
}

fn arm_write(w: &Worker, client: &Client) -> plume_core::Result<()> {
    let c = client.clone();
    w.on_write(client.fd, move |w, _| {
        let done = c.with(|conn| {
            conn.write_armed = false;
            conn.advance(w, &c)
        });
        if done == Some(true) {
            teardown(w, &c);
        }
    })
}

fn arm_backend_write(w: &Worker, client: &Client, fd: RawFd) -> plume_core::Result<()> {
    let c = client.clone();
    w.on_write(fd, move |w, _| {
        if c.with(|conn| conn.backend_writable(w, &c)) == Some(true) {
            teardown(w, &c);
        }
    })
}

fn arm_backend_read(w: &Worker, client: &Client, fd: RawFd) -> plume_core::Result<()> {
    let c = client.clone();
    w.on_read(fd, move |w, _| {
        if c.with(|conn| conn.backend_readable(w, &c)) == Some(true) {
            teardown(w, &c);
        }
    })
}

/// Write `data` directly when nothing is queued ahead of it, and queue
/// whatever the socket did not take.
fn send_or_queue(
    reg: &Registry,
    fd: RawFd,
    outq: &mut VecDeque<Cow<'static, [u8]>>,
    data: &[u8],
) -> std::result::Result<(), Errno> {
    let mut off = 0;
    if outq.is_empty() {
        while off < data.len() {
            match reg.write(fd, &data[off..]) {
                Ok(n) => off += n,
                Err(e) if ignore(e) => break,
                Err(e) => return Err(e),
            }
        }
    }
    if off < data.len() {
        outq.push_back(Cow::Owned(data[off..].to_vec()));
    }
    Ok(())
}

enum Relay {
    Pending,
    Done { close_delimited: bool },
}

impl Connection {
    #[inline]
    fn reading(&self) -> bool {
        !(self.eof || self.bad_request || self.closing)
    }

    #[inline]
    fn idle(&self) -> bool {
        self.requests.is_empty() && self.forward.is_none()
    }

    /// The newest request holds as much unsent body as allowed.
    #[inline]
    fn body_backlog_full(&self) -> bool {
        self.requests.back().is_some_and(|r| r.body.len() >= BODY_HWM)
    }

    // ── Client side ──

    fn client_readable(&mut self, w: &Worker, client: &Client) -> bool {
        if !self.reading() {
            return self.advance(w, client);
        }
        if let Err(e) = self.make_room(w.ctx().buffers()) {
            tracing::debug!(fd = self.fd, "{}", e);
            self.bad_request = true;
            return self.advance(w, client);
        }

        let Some(buf) = self.inbuf.as_mut() else {
            return true;
        };
        match w.registry().read(self.fd, &mut buf[self.inlen..]) {
            Ok(0) => {
                tracing::trace!(fd = self.fd, "client eof");
                if self.body_left > 0 {
                    return true;
                }
                self.eof = true;
            }
            Ok(n) => {
                self.inlen += n;
                if let Err(e) = self.consume() {
                    tracing::debug!(fd = self.fd, "{}", e);
                    self.bad_request = true;
                }
            }
            Err(e) if ignore(e) => {}
            Err(e) => {
                tracing::debug!(fd = self.fd, "client read: {}", e);
                return true;
            }
        }

        if self.reading() {
            if self.body_backlog_full() {
                tracing::trace!(fd = self.fd, "client read paused");
                self.read_paused = true;
            } else if let Err(e) = arm_read(w, client) {
                tracing::warn!(fd = self.fd, "re-arm read: {}", e);
                return true;
            }
        }
        self.advance(w, client)
    }

    /// Grow the inbound buffer when a partial line fills it.
    fn make_room(&mut self, buffers: &Arc<BufferPool>) -> Result<()> {
        let Some(buf) = self.inbuf.take() else {
            return Ok(());
        };
        if self.inlen < buf.len() {
            self.inbuf = Some(buf);
            return Ok(());
        }
        if buf.len() >= MAX_BUFFER {
            self.inbuf = Some(buf);
            return Err(ProxyError::BadRequest("request line or field too long"));
        }
        self.inbuf = Some(buffers.grow(buf, self.inlen)?);
        Ok(())
    }

    /// Parse buffered input into queued requests and their bodies.
    fn consume(&mut self) -> Result<()> {
        let Connection {
            pool,
            inbuf,
            inlen,
            parser,
            current,
            requests,
            body_left,
            ..
        } = self;
        let Some(buf) = inbuf.as_mut() else {
            return Ok(());
        };

        let mut off = 0;
        let result = loop {
            let avail = &buf[off..*inlen];
            if avail.is_empty() {
                break Ok(());
            }

            if *body_left > 0 {
                let n = (*body_left).min(avail.len() as u64) as usize;
                if let Some(req) = requests.back_mut() {
                    req.append_body(&avail[..n]);
                }
                *body_left -= n as u64;
                off += n;
                continue;
            }

            let (status, err) = {
                let mut target = RequestBuilder::new(pool, current);
                let status = parser.parse_request(avail, &mut target);
                (status, target.take_error())
            };
            off += parser.parsed();
            match status {
                Status::Done => {
                    parser.reset();
                    if let Some(req) = current.take() {
                        tracing::trace!(method = req.method.as_str(), "request queued");
                        *body_left = req.content_length;
                        requests.push_back(req);
                    }
                }
                Status::Again => break Ok(()),
                Status::Error => break Err(ProxyError::BadRequest("malformed request head")),
                Status::Break => break Err(err.unwrap_or(ProxyError::BadRequest("request rejected"))),
            }
        };

        buf.copy_within(off..*inlen, 0);
        *inlen -= off;
        result
    }

    /// Move the connection forward after any event. Returns true when it
    /// should be torn down.
    fn advance(&mut self, w: &Worker, client: &Client) -> bool {
        if self.forward.is_none() && !self.closing && !self.requests.is_empty() {
            if let Err(e) = self.start_forward(w, client) {
                self.fail(w, client, e);
            }
        }

        if let Err(e) = self.push_body(w, client) {
            self.fail(w, client, e);
        }

        if self.read_paused && self.reading() && !self.body_backlog_full() {
            self.read_paused = false;
            tracing::trace!(fd = self.fd, "client read resumed");
            if let Err(e) = arm_read(w, client) {
                tracing::warn!(fd = self.fd, "re-arm read: {}", e);
                return true;
            }
        }

        // the 400 goes out after every earlier response
        if self.bad_request && !self.closing && self.idle() {
            client.shared.stats.errors.fetch_add(1, Ordering::Relaxed);
            self.reply(w, Reply::BadRequest);
        }

        if !self.write_armed {
            if let Err(e) = self.flush(w, client) {
                tracing::debug!(fd = self.fd, "client write: {}", e);
                return true;
            }
        }

        self.outq.is_empty() && (self.closing || (self.eof && self.idle()))
    }

    fn flush(&mut self, w: &Worker, client: &Client) -> Result<()> {
        let reg = w.registry();
        while let Some(chunk) = self.outq.front() {
            match reg.write(self.fd, &chunk[self.out_off..]) {
                Ok(n) => {
                    self.out_off += n;
                    if self.out_off >= chunk.len() {
                        self.outq.pop_front();
                        self.out_off = 0;
                    }
                }
                Err(e) if ignore(e) => {
                    arm_write(w, client)?;
                    self.write_armed = true;
                    return Ok(());
                }
                Err(e) => return Err(plume_core::Error::Os(e).into()),
            }
        }

        if let Some(f) = self.forward.as_mut() {
            if f.read_paused {
                f.read_paused = false;
                arm_backend_read(w, client, f.fd)?;
            }
        }
        Ok(())
    }

    /// Queue a canned reply and stop taking requests.
    fn reply(&mut self, w: &Worker, reply: Reply) {
        tracing::debug!(fd = self.fd, status = reply.status(), "canned reply");
        self.outq.push_back(Cow::Borrowed(reply.bytes()));
        self.stop_reading(w);
    }

    fn stop_reading(&mut self, w: &Worker) {
        self.closing = true;
        self.requests.clear();
        self.body_left = 0;
        if let Err(e) = w.registry().shutdown_read(self.fd) {
            tracing::trace!(fd = self.fd, "shutdown: {}", e);
        }
    }

    /// Abandon the front request. The client gets a canned reply unless
    /// part of the response already went out.
    fn fail(&mut self, w: &Worker, client: &Client, err: ProxyError) {
        client.shared.stats.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(fd = self.fd, "forward failed: {}", err);

        let mut relayed = 0;
        if let Some(f) = self.forward.take() {
            relayed = f.relayed;
            if let Err(e) = w.close(f.fd) {
                tracing::debug!(fd = f.fd, "backend close: {}", e);
            }
        }
        if relayed > 0 {
            self.stop_reading(w);
        } else {
            self.reply(w, err.reply());
        }
    }

    // ── Backend side ──

    fn start_forward(&mut self, w: &Worker, client: &Client) -> Result<()> {
        let Some(req) = self.requests.front() else {
            return Ok(());
        };
        let addr = client.shared.select().ok_or(ProxyError::NoBackend)?;
        let reg = w.registry();
        let fd = reg.open_socket(CommKind::Tcp, true)?;

        let link = || -> Result<Forward> {
            let buf = w.ctx().buffers().alloc(MAX_BUFFER)?;
            let connected = match reg.connect(fd, addr) {
                Ok(()) => true,
                Err(Errno::EINPROGRESS) => false,
                Err(source) => return Err(ProxyError::Backend { addr, source }),
            };
            let mut head = Vec::with_capacity(256);
            req.write_head(&self.pool, &mut head);
            let mut fwd = Forward::new(fd, addr, head, buf, req.method == Method::Head);
            fwd.connected = connected;
            arm_backend_write(w, client, fd)?;
            fwd.write_armed = true;
            Ok(fwd)
        };

        match link() {
            Ok(fwd) => {
                tracing::debug!(fd = self.fd, backend = %addr, "forwarding request");
                self.forward = Some(fwd);
                Ok(())
            }
            Err(e) => {
                if let Err(ce) = w.close(fd) {
                    tracing::debug!(fd, "backend close: {}", ce);
                }
                Err(e)
            }
        }
    }

    /// Arm the backend write when body bytes are waiting.
    fn push_body(&mut self, w: &Worker, client: &Client) -> Result<()> {
        let (Some(f), Some(req)) = (self.forward.as_mut(), self.requests.front()) else {
            return Ok(());
        };
        if f.connected && !f.write_armed && f.has_unsent(&req.body) {
            arm_backend_write(w, client, f.fd)?;
            f.write_armed = true;
        }
        Ok(())
    }

    fn backend_writable(&mut self, w: &Worker, client: &Client) -> bool {
        if let Err(e) = self.send_backend(w, client) {
            self.fail(w, client, e);
        }
        self.advance(w, client)
    }

    fn send_backend(&mut self, w: &Worker, client: &Client) -> Result<()> {
        let Some(f) = self.forward.as_mut() else {
            return Ok(());
        };
        f.write_armed = false;
        let addr = f.addr;
        let backend = move |source| ProxyError::Backend { addr, source };

        if !f.connected {
            match socket_error(f.fd) {
                Ok(()) => f.connected = true,
                Err(e) if ignore(e) => {
                    arm_backend_write(w, client, f.fd)?;
                    f.write_armed = true;
                    return Ok(());
                }
                Err(e) => return Err(backend(e)),
            }
            tracing::trace!(fd = f.fd, backend = %addr, "backend connected");
        }

        if !f.post_read_armed {
            arm_backend_read(w, client, f.fd)?;
            f.post_read_armed = true;
        }

        let mut none = Vec::new();
        let (body, length) = match self.requests.front_mut() {
            Some(req) => (&mut req.body, req.content_length),
            None => (&mut none, 0),
        };
        if f.send(w.registry(), body, length).map_err(backend)? == Sent::Blocked {
            arm_backend_write(w, client, f.fd)?;
            f.write_armed = true;
        }
        Ok(())
    }

    fn backend_readable(&mut self, w: &Worker, client: &Client) -> bool {
        match self.relay(w, client) {
            Ok(Relay::Pending) => {}
            Ok(Relay::Done { close_delimited }) => self.finish(w, client, close_delimited),
            Err(e) => self.fail(w, client, e),
        }
        self.advance(w, client)
    }

    fn relay(&mut self, w: &Worker, client: &Client) -> Result<Relay> {
        let Connection {
            fd, forward, outq, ..
        } = self;
        let Some(f) = forward.as_mut() else {
            return Ok(Relay::Pending);
        };
        let addr = f.addr;

        let n = match w.registry().read(f.fd, &mut f.buf) {
            Ok(0) if f.tracker.close_delimited() => {
                return Ok(Relay::Done {
                    close_delimited: true,
                })
            }
            Ok(0) => return Err(ProxyError::BackendClosed(addr)),
            Ok(n) => n,
            Err(e) if ignore(e) => {
                arm_backend_read(w, client, f.fd)?;
                return Ok(Relay::Pending);
            }
            Err(source) => return Err(ProxyError::Backend { addr, source }),
        };

        let progress = f.tracker.feed(&f.buf[..n]);
        if progress.relay > 0 {
            f.relayed += progress.relay as u64;
            send_or_queue(w.registry(), *fd, outq, &f.buf[..progress.relay])
                .map_err(plume_core::Error::Os)?;
        }
        if progress.complete {
            return Ok(Relay::Done {
                close_delimited: false,
            });
        }

        if outq.is_empty() {
            arm_backend_read(w, client, f.fd)?;
        } else {
            f.read_paused = true;
        }
        Ok(Relay::Pending)
    }

    /// The front request's response is fully relayed.
    fn finish(&mut self, w: &Worker, client: &Client, close_delimited: bool) {
        if let Some(f) = self.forward.take() {
            tracing::debug!(fd = self.fd, backend = %f.addr, code = f.tracker.code(), bytes = f.relayed, "response relayed");
            if let Err(e) = w.close(f.fd) {
                tracing::debug!(fd = f.fd, "backend close: {}", e);
            }
        }
        client.shared.stats.forwarded.fetch_add(1, Ordering::Relaxed);

        let keep = match self.retire_front() {
            Some(req) => req.keep_alive && !close_delimited && req.body_complete(),
            None => false,
        };
        if !keep {
            self.stop_reading(w);
        }
    }

    /// Drop the front request. The pool is rewound once no request, queued
    /// or half parsed, still points into it.
    fn retire_front(&mut self) -> Option<Request> {
        let req = self.requests.pop_front();
        if self.requests.is_empty() && self.current.is_none() {
            self.pool.reset();
        }
        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_core::comm::local_addr;
    use plume_core::mempool::DEFAULT_BLOCK_SIZE;
    use plume_core::{Config, Context};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn connection(buffers: &Arc<BufferPool>) -> Connection {
        Connection {
            inbuf: Some(buffers.alloc(BUFFER_CLASSES[0]).unwrap()),
            ..Connection::default()
        }
    }

    fn feed(conn: &mut Connection, bytes: &[u8]) {
        let start = conn.inlen;
        let buf = conn.inbuf.as_mut().unwrap();
        buf[start..start + bytes.len()].copy_from_slice(bytes);
        conn.inlen += bytes.len();
        conn.consume().unwrap();
    }

    #[test]
    fn test_pool_rewound_between_keep_alive_requests() {
        let buffers = BufferPool::new(MemConfig::default(), 4);
        let mut conn = connection(&buffers);
        let req = b"GET /a/reasonably/long/path/for/the/pool HTTP/1.1\r\n\
Host: example.com\r\nUser-Agent: plume-test\r\nAccept: */*\r\n\r\n";

        for _ in 0..500 {
            feed(&mut conn, req);
            assert_eq!(conn.requests.len(), 1);
            let done = conn.retire_front().unwrap();
            assert!(done.keep_alive);
        }
        assert!(conn.pool.capacity() <= DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_pool_kept_while_requests_queued() {
        let buffers = BufferPool::new(MemConfig::default(), 4);
        let mut conn = connection(&buffers);
        feed(&mut conn, b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.requests.len(), 2);

        conn.retire_front();
        let next = conn.requests.front().unwrap();
        assert_eq!(next.path(&conn.pool), b"/b");
        assert_eq!(next.host(&conn.pool), b"x");
    }

    #[test]
    fn test_body_backlog_bounded() {
        let buffers = BufferPool::new(MemConfig::default(), 4);
        let mut conn = connection(&buffers);
        feed(&mut conn, b"POST /up HTTP/1.1\r\nHost: x\r\nContent-Length: 1000000\r\n\r\n");
        assert!(!conn.body_backlog_full());

        let chunk = [b'z'; 512];
        while !conn.body_backlog_full() {
            feed(&mut conn, &chunk);
        }
        let req = conn.requests.back().unwrap();
        assert_eq!(req.body.len(), BODY_HWM);
        assert!(!req.body_complete());

        // bytes that went to the backend no longer count
        conn.requests.back_mut().unwrap().body.drain(..1024);
        assert!(!conn.body_backlog_full());
    }

    #[test]
    fn test_no_backend_gets_503_and_close() {
        let ctx = Arc::new(Context::new(Config::new()).unwrap());
        let mut w = Worker::new(0, Arc::clone(&ctx)).unwrap();
        w.insert_local(HttpThread::new(MemConfig::default()));
        // never started, so no backend table
        let shared = Arc::new(HttpShared::default());

        let reg = Arc::clone(ctx.registry());
        let lfd = reg
            .open_listener(CommKind::Tcp, Some("127.0.0.1"), 0, 16, true)
            .unwrap();
        let port = local_addr(lfd).unwrap().port();
        let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (fd, _) = reg.accept(lfd, true).unwrap();
        accept(&mut w, &shared, fd);

        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        for _ in 0..50 {
            if shared.stats().closed > 0 {
                break;
            }
            w.dispatch_once();
        }

        let mut got = Vec::new();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, Reply::NoBackend.bytes());
        assert_eq!(shared.stats().errors, 1);
        assert_eq!(w.local::<HttpThread>().unwrap().open_connections(), 0);
        reg.close(lfd).unwrap();
    }
}
