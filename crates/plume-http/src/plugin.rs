//! The `http` plugin: listener, backend table and per-thread state

use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use plume_core::comm::{ignore, local_addr};
use plume_core::event::Interest;
use plume_core::plugin::one_arg;
use plume_core::{CommKind, Context, Error, Plugin, Result, Worker};

use crate::backend::Backends;
use crate::conn::{self, HttpThread};

pub const NAME: &str = "http";

/// Listen backlog when `http_listen` gives none
pub const DEF_BACKLOG: i32 = 5;

#[derive(Debug, Default)]
pub struct HttpStats {
    pub accepted: AtomicU64,
    pub closed: AtomicU64,
    pub errors: AtomicU64,
    pub forwarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub closed: u64,
    pub errors: u64,
    pub forwarded: u64,
}

impl HttpStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every worker: backend rotation, counters and the
/// bound listening port.
#[derive(Debug, Default)]
pub struct HttpShared {
    backends: OnceLock<Backends>,
    pub stats: HttpStats,
    port: AtomicU16,
}

impl HttpShared {
    pub(crate) fn select(&self) -> Option<SocketAddrV4> {
        self.backends.get().and_then(Backends::select)
    }

    /// Port the listener is bound to, once started.
    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Acquire) {
            0 => None,
            p => Some(p),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

pub struct HttpPlugin {
    port: u16,
    listen: Option<String>,
    backlog: i32,
    backends: Vec<SocketAddrV4>,
    shared: Arc<HttpShared>,
    listen_fd: AtomicI32,
}

impl Default for HttpPlugin {
    fn default() -> Self {
        Self {
            port: 0,
            listen: None,
            backlog: DEF_BACKLOG,
            backends: Vec::new(),
            shared: Arc::new(HttpShared::default()),
            listen_fd: AtomicI32::new(-1),
        }
    }
}

impl HttpPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for observing the running plugin.
    pub fn shared(&self) -> Arc<HttpShared> {
        Arc::clone(&self.shared)
    }
}

impl Plugin for HttpPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn directives(&self) -> &'static [&'static str] {
        &["http_port", "http_listen", "backends"]
    }

    fn set_directive(&mut self, key: &str, args: &[String]) -> Result<()> {
        match key {
            "http_port" => self.port = one_arg(NAME, key, args)?,
            "http_listen" => {
                let value: String = one_arg(NAME, key, args)?;
                let (addr, backlog) = match value.split_once(',') {
                    Some((a, b)) => {
                        let backlog = b
                            .trim()
                            .parse::<i32>()
                            .ok()
                            .filter(|&n| n > 0)
                            .ok_or_else(|| Error::plugin(NAME, format!("http_listen: bad backlog `{b}`")))?;
                        (a.trim(), backlog)
                    }
                    None => (value.trim(), DEF_BACKLOG),
                };
                self.listen = Some(addr.to_string());
                self.backlog = backlog;
            }
            "backends" => self.backends.extend(Backends::parse(args)?),
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
        if self.backends.is_empty() {
            tracing::error!("http: no backends configured");
            return Err(Error::plugin(NAME, "no backends configured"));
        }
        if self.shared.backends.set(Backends::new(self.backends.clone())).is_err() {
            return Err(Error::State("http plugin already started"));
        }

        let lfd = ctx
            .registry()
            .open_listener(CommKind::Tcp, self.listen.as_deref(), self.port, self.backlog, true)
            .inspect_err(|e| tracing::error!(port = self.port, "http: listen failed: {}", e))?;
        let bound = local_addr(lfd)?;
        self.shared.port.store(bound.port(), Ordering::Release);
        self.listen_fd.store(lfd, Ordering::Release);

        arm_accept(ctx, &self.shared, lfd)?;
        tracing::info!(addr = %bound, backends = self.backends.len(), "http proxy listening");
        Ok(())
    }

    fn on_work_process_exit(&self, ctx: &Arc<Context>) {
        let lfd = self.listen_fd.swap(-1, Ordering::AcqRel);
        if lfd >= 0 {
            if let Err(e) = ctx.close(lfd) {
                tracing::debug!(fd = lfd, "http: close listener: {}", e);
            }
        }
        let s = self.shared.stats();
        tracing::info!(
            accepted = s.accepted,
            forwarded = s.forwarded,
            errors = s.errors,
            "http proxy stopped"
        );
    }

    fn on_work_thread_start(&self, worker: &mut Worker) -> Result<()> {
        let mem = worker.ctx().config().mem();
        worker.insert_local(HttpThread::new(mem));
        Ok(())
    }

    fn on_work_thread_exit(&self, worker: &mut Worker) {
        let open = worker
            .remove_local::<HttpThread>()
            .map_or(0, |t| t.open_connections());
        let s = self.shared.stats();
        tracing::info!(
            worker = worker.id(),
            open,
            accepted = s.accepted,
            closed = s.closed,
            errors = s.errors,
            "http thread exit"
        );
    }
}

fn arm_accept(ctx: &Context, shared: &Arc<HttpShared>, lfd: RawFd) -> Result<()> {
    let shared = Arc::clone(shared);
    ctx.global().register(
        lfd,
        Interest::Read,
        Box::new(move |w: &mut Worker, fd: RawFd| on_accept(w, shared, fd)),
    )
}

/// Drain the accept queue, then re-arm the listener.
fn on_accept(w: &mut Worker, shared: Arc<HttpShared>, lfd: RawFd) {
    loop {
        match w.registry().accept(lfd, true) {
            Ok((fd, peer)) => {
                shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fd, %peer, worker = w.id(), "http accept");
                conn::accept(w, &shared, fd);
            }
            Err(e) if ignore(e) => break,
            Err(e) => {
                tracing::warn!(fd = lfd, "http accept: {}", e);
                break;
            }
        }
    }

    if w.ctx().is_running() && w.registry().is_open(lfd) {
        let ctx = Arc::clone(w.ctx());
        if let Err(e) = arm_accept(&ctx, &shared, lfd) {
            tracing::error!(fd = lfd, "http: re-arm accept: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_core::plugin::configure;
    use plume_core::Block;

    fn configured(block: Block) -> Result<HttpPlugin> {
        let mut p = HttpPlugin::new();
        configure(&mut p, &block)?;
        Ok(p)
    }

    #[test]
    fn test_directives() {
        let p = configured(
            Block::new("http")
                .directive("http_port", ["8080"])
                .directive("http_listen", ["127.0.0.1, 64"])
                .directive("backends", ["127.0.0.1:8081", "127.0.0.1:8082"]),
        )
        .unwrap();
        assert_eq!(p.port, 8080);
        assert_eq!(p.listen.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.backlog, 64);
        assert_eq!(p.backends.len(), 2);
    }

    #[test]
    fn test_default_backlog() {
        let p = configured(Block::new("http").directive("http_listen", ["0.0.0.0"])).unwrap();
        assert_eq!(p.backlog, DEF_BACKLOG);
    }

    #[test]
    fn test_bad_directives() {
        assert!(configured(Block::new("http").directive("http_port", ["x"])).is_err());
        assert!(configured(Block::new("http").directive("http_listen", ["1.2.3.4,0"])).is_err());
        assert!(configured(Block::new("http").directive("backends", ["nowhere"])).is_err());
        assert!(configured(Block::new("http").directive("echo_str", ["x"])).is_err());
    }

    #[test]
    fn test_start_without_backends_fails() {
        let p = HttpPlugin::new();
        let ctx = Arc::new(Context::new(plume_core::Config::new()).unwrap());
        assert!(p.on_work_process_start(&ctx).is_err());
        assert_eq!(p.shared().port(), None);
    }
}
