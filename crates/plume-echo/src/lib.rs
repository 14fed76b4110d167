//! # plume-echo
//!
//! Echo plugin for the plume server.
//!
//! Without `echo_str` every read is written straight back. With it the
//! plugin "eats" all available input and answers each burst with the
//! configured string.
//!
//! ```text
//!   [echo]
//!   echo_port = 7007
//!   echo_str = "PONG"
//! ```
//!
//! A client record travels by value through its callbacks: exactly one
//! read or write callback owns it at any time.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use plume_core::comm::{ignore, local_addr};
use plume_core::event::Interest;
use plume_core::plugin::one_arg;
use plume_core::{
    CommKind, Context, Error, LookasideList, LookasideOptions, MemConfig, MemPool, Plugin, Pooled,
    Registry, Result, Span, Worker,
};

pub const NAME: &str = "echo";

pub const ECHO_BACKLOG: i32 = 100;

/// Tag stamped on pooled client records
pub const CLIENT_TAG: u32 = 0xEFEF_ABCD;

/// Idle client records kept per thread
pub const CLIENT_HWM: usize = 128;

const READ_CHUNK: usize = 512;
/// Reads per readiness event in fixed-reply mode
const EAT_READS: usize = 16;
const CLIENT_POOL_BASE: usize = 1024;

// ── Shared state ──

#[derive(Debug, Default)]
pub struct EchoStats {
    pub accepted: AtomicU64,
    pub closed: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Default)]
pub struct EchoShared {
    reply: OnceLock<Option<Vec<u8>>>,
    pub stats: EchoStats,
    port: AtomicU16,
}

impl EchoShared {
    fn reply(&self) -> Option<&[u8]> {
        self.reply.get().and_then(|r| r.as_deref())
    }

    /// Port the listener is bound to, once started.
    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Acquire) {
            0 => None,
            p => Some(p),
        }
    }
}

// ── Client records ──

#[derive(Default)]
struct EchoClient {
    fd: RawFd,
    pool: MemPool,
    buf: Span,
    out: Vec<u8>,
    off: usize,
    eof: bool,
}

/// Per-thread client free list
pub struct EchoThread {
    clients: LookasideList<EchoClient>,
}

impl EchoThread {
    pub fn new(mem: MemConfig) -> Self {
        Self {
            clients: LookasideList::new(
                LookasideOptions::from_mem(mem, CLIENT_HWM).tag(CLIENT_TAG),
                EchoClient::default,
            ),
        }
    }
}

/// Read what is available. In eat mode up to `EAT_READS` chunks are
/// discarded; whatever is left fires the next read event. Otherwise one
/// read is copied to the output queue.
fn fill(reg: &Registry, client: &mut EchoClient, eat: bool) -> Result<usize> {
    if client.buf.is_empty() {
        client.buf = client.pool.alloc(READ_CHUNK)?;
    }
    let EchoClient {
        fd,
        pool,
        buf,
        out,
        eof,
        ..
    } = client;
    let scratch = pool.get_mut(*buf);

    let mut total = 0;
    for _ in 0..EAT_READS {
        match reg.read(*fd, scratch) {
            Ok(0) => {
                *eof = true;
                break;
            }
            Ok(n) => {
                total += n;
                if !eat {
                    out.extend_from_slice(&scratch[..n]);
                    break;
                }
            }
            Err(e) if ignore(e) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(total)
}

fn release(w: &mut Worker, mut client: Pooled<EchoClient>) {
    let fd = client.fd;
    if let Err(e) = w.close(fd) {
        tracing::debug!(fd, "echo close: {}", e);
    }
    *client = EchoClient::default();
    if let Some(thread) = w.local_mut::<EchoThread>() {
        thread.clients.free(client);
    }
}

fn arm_read(w: &Worker, client: Pooled<EchoClient>, shared: Arc<EchoShared>) {
    let fd = client.fd;
    if let Err(e) = w.on_read(fd, move |w, _| on_read(w, client, shared)) {
        tracing::warn!(fd, "echo: arm read: {}", e);
        if let Err(e) = w.close(fd) {
            tracing::debug!(fd, "echo close: {}", e);
        }
    }
}

fn on_read(w: &mut Worker, mut client: Pooled<EchoClient>, shared: Arc<EchoShared>) {
    let reply = shared.reply();
    match fill(w.registry(), &mut client, reply.is_some()) {
        Ok(0) if client.eof => return release(w, client),
        Ok(0) => return arm_read(w, client, shared),
        Ok(n) => {
            tracing::trace!(fd = client.fd, bytes = n, "echo read");
            if let Some(r) = reply {
                client.out.extend_from_slice(r);
            }
        }
        Err(e) => {
            shared.stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(fd = client.fd, "echo read: {}", e);
            return release(w, client);
        }
    }
    flush(w, client, shared);
}

fn flush(w: &mut Worker, mut client: Pooled<EchoClient>, shared: Arc<EchoShared>) {
    let fd = client.fd;
    while client.off < client.out.len() {
        match w.registry().write(fd, &client.out[client.off..]) {
            Ok(n) => client.off += n,
            Err(e) if ignore(e) => {
                if let Err(e) = w.on_write(fd, move |w, _| flush(w, client, shared)) {
                    tracing::warn!(fd, "echo: arm write: {}", e);
                    if let Err(e) = w.close(fd) {
                        tracing::debug!(fd, "echo close: {}", e);
                    }
                }
                return;
            }
            Err(e) => {
                shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(fd, "echo write: {}", e);
                return release(w, client);
            }
        }
    }
    tracing::trace!(fd, bytes = client.out.len(), "echo reply sent");
    client.out.clear();
    client.off = 0;

    if client.eof {
        release(w, client);
    } else {
        arm_read(w, client, shared);
    }
}

// ── Accept ──

fn open(w: &mut Worker, shared: &Arc<EchoShared>, fd: RawFd) -> Result<()> {
    let thread = w
        .local_mut::<EchoThread>()
        .ok_or(Error::State("echo thread state missing"))?;
    let mut client = thread.clients.alloc()?;
    client.fd = fd;
    client.pool = MemPool::new(CLIENT_POOL_BASE);

    let closed = Arc::clone(shared);
    w.registry().add_close_handler(
        fd,
        Box::new(move |fd| {
            closed.stats.closed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(fd, "echo client closed");
        }),
    )?;

    let shared = Arc::clone(shared);
    w.on_read(fd, move |w, _| on_read(w, client, shared))
}

fn arm_accept(ctx: &Context, shared: &Arc<EchoShared>, lfd: RawFd) -> Result<()> {
    let shared = Arc::clone(shared);
    ctx.global().register(
        lfd,
        Interest::Read,
        Box::new(move |w: &mut Worker, fd: RawFd| on_accept(w, shared, fd)),
    )
}

fn on_accept(w: &mut Worker, shared: Arc<EchoShared>, lfd: RawFd) {
    loop {
        match w.registry().accept(lfd, true) {
            Ok((fd, peer)) => {
                shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fd, %peer, worker = w.id(), "echo accept");
                if let Err(e) = open(w, &shared, fd) {
                    shared.stats.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(fd, "echo: connection dropped: {}", e);
                    if let Err(e) = w.close(fd) {
                        tracing::debug!(fd, "echo close: {}", e);
                    }
                }
            }
            Err(e) if ignore(e) => break,
            Err(e) => {
                tracing::warn!(fd = lfd, "echo accept: {}", e);
                break;
            }
        }
    }

    if w.ctx().is_running() && w.registry().is_open(lfd) {
        let ctx = Arc::clone(w.ctx());
        if let Err(e) = arm_accept(&ctx, &shared, lfd) {
            tracing::error!(fd = lfd, "echo: re-arm accept: {}", e);
        }
    }
}

// ── Plugin ──

pub struct EchoPlugin {
    reply: Option<String>,
    port: u16,
    shared: Arc<EchoShared>,
    listen_fd: AtomicI32,
}

impl Default for EchoPlugin {
    fn default() -> Self {
        Self {
            reply: None,
            port: 0,
            shared: Arc::new(EchoShared::default()),
            listen_fd: AtomicI32::new(-1),
        }
    }
}

impl EchoPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> Arc<EchoShared> {
        Arc::clone(&self.shared)
    }
}

impl Plugin for EchoPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn directives(&self) -> &'static [&'static str] {
        &["echo_str", "echo_port"]
    }

    fn set_directive(&mut self, key: &str, args: &[String]) -> Result<()> {
        match key {
            "echo_str" => {
                let s: String = one_arg(NAME, key, args)?;
                self.reply = (!s.is_empty()).then_some(s);
            }
            "echo_port" => self.port = one_arg(NAME, key, args)?,
            _ => {
                return Err(Error::UnknownDirective {
                    block: NAME.to_string(),
                    directive: key.to_string(),
                })
            }
        }
        Ok(())
    }

    fn on_work_process_start(&self, ctx: &Arc<Context>) -> Result<()> {
        let reply = self.reply.clone().map(String::into_bytes);
        if self.shared.reply.set(reply).is_err() {
            return Err(Error::State("echo plugin already started"));
        }

        let lfd = ctx
            .registry()
            .open_listener(CommKind::Tcp, None, self.port, ECHO_BACKLOG, true)
            .inspect_err(|e| tracing::error!(port = self.port, "echo: listen failed: {}", e))?;
        let bound = local_addr(lfd)?;
        self.shared.port.store(bound.port(), Ordering::Release);
        self.listen_fd.store(lfd, Ordering::Release);

        arm_accept(ctx, &self.shared, lfd)?;
        tracing::info!(addr = %bound, eat = self.reply.is_some(), "echo listening");
        Ok(())
    }

    fn on_work_process_exit(&self, ctx: &Arc<Context>) {
        let lfd = self.listen_fd.swap(-1, Ordering::AcqRel);
        if lfd >= 0 {
            if let Err(e) = ctx.close(lfd) {
                tracing::debug!(fd = lfd, "echo: close listener: {}", e);
            }
        }
    }

    fn on_work_thread_start(&self, worker: &mut Worker) -> Result<()> {
        let mem = worker.ctx().config().mem();
        worker.insert_local(EchoThread::new(mem));
        Ok(())
    }

    fn on_work_thread_exit(&self, worker: &mut Worker) {
        let stats = worker.remove_local::<EchoThread>().map(|t| t.clients.stats());
        let s = &self.shared.stats;
        tracing::info!(
            worker = worker.id(),
            accepted = s.accepted.load(Ordering::Relaxed),
            closed = s.closed.load(Ordering::Relaxed),
            errors = s.errors.load(Ordering::Relaxed),
            pooled = stats.map_or(0, |st| st.list_len),
            "echo thread exit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_core::plugin::configure;
    use plume_core::Block;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn test_directives() {
        let mut p = EchoPlugin::new();
        let block = Block::new("echo")
            .directive("echo_str", ["PONG"])
            .directive("echo_port", ["7007"]);
        configure(&mut p, &block).unwrap();
        assert_eq!(p.reply.as_deref(), Some("PONG"));
        assert_eq!(p.port, 7007);

        let mut p = EchoPlugin::new();
        configure(&mut p, &Block::new("echo").directive("echo_str", [""])).unwrap();
        assert_eq!(p.reply, None);

        let mut p = EchoPlugin::new();
        assert!(configure(&mut p, &Block::new("echo").directive("echo_port", ["70000"])).is_err());
        assert!(configure(&mut p, &Block::new("echo").directive("backends", ["x"])).is_err());
    }

    #[test]
    fn test_eat_mode_bounded_per_event() {
        let reg = Registry::new(4096);
        let lfd = reg
            .open_listener(CommKind::Tcp, Some("127.0.0.1"), 0, 16, false)
            .unwrap();
        let port = local_addr(lfd).unwrap().port();
        let cfd = reg.open_socket(CommKind::Tcp, false).unwrap();
        reg.connect(cfd, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
        let (sfd, _) = reg.accept(lfd, true).unwrap();

        let burst = vec![b'e'; EAT_READS * READ_CHUNK * 2];
        let mut sent = 0;
        while sent < burst.len() {
            sent += reg.write(cfd, &burst[sent..]).unwrap();
        }

        let mut client = EchoClient {
            fd: sfd,
            pool: MemPool::new(CLIENT_POOL_BASE),
            ..EchoClient::default()
        };
        assert_eq!(fill(&reg, &mut client, true).unwrap(), EAT_READS * READ_CHUNK);
        assert_eq!(fill(&reg, &mut client, true).unwrap(), EAT_READS * READ_CHUNK);
        assert_eq!(fill(&reg, &mut client, true).unwrap(), 0);
        assert!(!client.eof);
        assert!(client.out.is_empty());

        for fd in [sfd, cfd, lfd] {
            reg.close(fd).unwrap();
        }
    }

    #[test]
    fn test_client_records_are_tagged() {
        let mut t = EchoThread::new(MemConfig::default());
        let c = t.clients.alloc().unwrap();
        assert_eq!(c.tag(), CLIENT_TAG);
        t.clients.free(c);
        assert_eq!(t.clients.stats().list_len, 1);
    }
}
