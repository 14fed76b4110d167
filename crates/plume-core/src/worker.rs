//! Worker thread management
//!
//! Each worker is an OS thread running the dispatch loop over its own
//! local poller, and taking turns on the process-wide global poller.
//!
//! Callbacks receive `&mut Worker` and the descriptor that fired:
//!
//! - [`LocalHandler`]: registered on this worker's poller, never leaves
//!   the thread, may capture `Rc` state
//! - [`GlobalHandler`]: registered on the global poller, may be run by
//!   any worker, must be `Send`
//!
//! Per-thread plugin state lives in the worker's typed slot map
//! ([`Worker::insert_local`] / [`Worker::local`]).

use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::comm::Registry;
use crate::constants::{MAX_EVENTS, POLL_TIMEOUT_MS};
use crate::dispatcher::Context;
use crate::error::Result;
use crate::event::{Fired, Interest, Poller};
use crate::timer::{TimerHandler, TimerId, Timers};

pub type LocalHandler = Box<dyn FnOnce(&mut Worker, RawFd)>;
pub type GlobalHandler = Box<dyn FnOnce(&mut Worker, RawFd) + Send>;

pub struct Worker {
    id: usize,
    ctx: Arc<Context>,
    local: Poller<LocalHandler>,
    timers: Timers<Worker>,
    locals: HashMap<TypeId, Box<dyn Any>>,
    local_fired: Vec<Fired<LocalHandler>>,
    global_fired: Vec<Fired<GlobalHandler>>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<Context>) -> Result<Self> {
        let local = Poller::new(Arc::clone(ctx.registry()))?;
        if let Err(e) = local.link(ctx.global()) {
            tracing::warn!(worker = id, "global poller not linked: {}", e);
        }
        Ok(Self {
            id,
            ctx,
            local,
            timers: Timers::new(),
            locals: HashMap::new(),
            local_fired: Vec::with_capacity(MAX_EVENTS),
            global_fired: Vec::with_capacity(MAX_EVENTS),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        self.ctx.registry()
    }

    // ── Event registration ──

    /// Call `f` once when `fd` is readable.
    pub fn on_read(&self, fd: RawFd, f: impl FnOnce(&mut Worker, RawFd) + 'static) -> Result<()> {
        self.local.register(fd, Interest::Read, Box::new(f))
    }

    /// Call `f` once when `fd` is writable.
    pub fn on_write(&self, fd: RawFd, f: impl FnOnce(&mut Worker, RawFd) + 'static) -> Result<()> {
        self.local.register(fd, Interest::Write, Box::new(f))
    }

    /// Call `f` once, on whichever worker polls first, when `fd` is readable.
    pub fn on_read_global(
        &self,
        fd: RawFd,
        f: impl FnOnce(&mut Worker, RawFd) + Send + 'static,
    ) -> Result<()> {
        self.ctx.global().register(fd, Interest::Read, Box::new(f))
    }

    /// Drop this worker's callbacks for `fd` and close it.
    pub fn close(&self, fd: RawFd) -> Result<()> {
        self.local.forget(fd);
        self.ctx.registry().close(fd)
    }

    pub fn pending(&self, fd: RawFd) -> (bool, bool) {
        self.local.pending(fd)
    }

    // ── Timers ──

    pub fn add_timer(
        &mut self,
        delta_ms: u64,
        f: impl FnOnce(&mut Worker) + 'static,
    ) -> Result<TimerId> {
        self.timers.add(delta_ms, Box::new(f))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Fire expired timers; milliseconds until the next one, 0 if none.
    pub fn run_timers(&mut self) -> u64 {
        let mut fired: Vec<TimerHandler<Worker>> = Vec::new();
        self.timers.take_expired(Instant::now(), &mut fired);
        for h in fired {
            h(self);
        }
        self.timers.next_delay(Instant::now())
    }

    // ── Per-thread state ──

    pub fn insert_local<T: 'static>(&mut self, value: T) {
        self.locals.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn local<T: 'static>(&self) -> Option<&T> {
        self.locals
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref())
    }

    pub fn local_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.locals
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut())
    }

    pub fn remove_local<T: 'static>(&mut self) -> Option<T> {
        self.locals
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast().ok())
            .map(|b| *b)
    }

    // ── Dispatch ──

    /// One loop iteration: timers, then the global poller if no other
    /// worker holds it, then the local poller. Returns callbacks run.
    pub fn dispatch_once(&mut self) -> usize {
        let next = self.run_timers();
        let timeout = if next == 0 {
            POLL_TIMEOUT_MS
        } else {
            next.min(POLL_TIMEOUT_MS)
        } as u16;
        let mut handled = 0;

        // the local poller wakes when the global one has events, so the
        // global poll itself never waits
        let ctx = Arc::clone(&self.ctx);
        if let Some(mut guard) = ctx.global().try_lock() {
            let mut fired = std::mem::take(&mut self.global_fired);
            guard.poll(&mut fired, MAX_EVENTS, 0);
            for f in fired.drain(..) {
                (f.handler)(self, f.fd);
                handled += 1;
            }
            self.global_fired = fired;
        }

        let mut fired = std::mem::take(&mut self.local_fired);
        self.local.poll(&mut fired, MAX_EVENTS, timeout);
        for f in fired.drain(..) {
            (f.handler)(self, f.fd);
            handled += 1;
        }
        self.local_fired = fired;

        handled
    }

    /// Close every descriptor that still has a callback on this worker.
    pub fn close_all(&mut self) {
        for fd in self.local.registered() {
            if let Err(e) = self.close(fd) {
                tracing::debug!(worker = self.id, fd, "close at exit: {}", e);
            }
        }
    }
}

/// Pin the calling thread to the CPUs set in `mask`.
pub fn pin_to_cpus(mask: u64) -> Result<()> {
    let mut set = CpuSet::new();
    for cpu in (0..64).filter(|c| mask & (1u64 << c) != 0) {
        set.set(cpu)?;
    }
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

/// Pool of worker threads
pub struct WorkerPool {
    /// Join handles for worker threads
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Spawn `num_workers` threads named `plume-worker-N`.
    pub fn start<F>(&mut self, num_workers: usize, worker_fn: F) -> Result<()>
    where
        F: Fn(usize) + Send + Sync + Clone + 'static,
    {
        self.handles.reserve(num_workers);
        for i in 0..num_workers {
            let worker_fn = worker_fn.clone();
            let handle = thread::Builder::new()
                .name(format!("plume-worker-{}", i))
                .spawn(move || {
                    set_current_worker_id(i);
                    worker_fn(i);
                })?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Wait for all workers to finish
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }

    /// Get number of workers
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT_WORKER_ID: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) };
}

/// Set the current worker ID for this thread
pub fn set_current_worker_id(id: usize) {
    CURRENT_WORKER_ID.with(|cell| cell.set(id));
}

/// Current worker ID, `usize::MAX` outside worker threads
#[inline]
pub fn current_worker_id() -> usize {
    CURRENT_WORKER_ID.with(|cell| cell.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommKind;
    use crate::config::Config;
    use std::cell::Cell;
    use std::io::Write;
    use std::net::{SocketAddrV4, TcpStream};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker() -> Worker {
        let ctx = Arc::new(Context::new(Config::new().maxfd(4096)).unwrap());
        Worker::new(0, ctx).unwrap()
    }

    #[test]
    fn test_pool_names_and_ids() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new();
        let s = seen.clone();
        pool.start(3, move |i| {
            assert_eq!(current_worker_id(), i);
            let name = thread::current().name().map(str::to_string);
            assert_eq!(name, Some(format!("plume-worker-{i}")));
            s.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(pool.num_workers(), 3);
        pool.join();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(current_worker_id(), usize::MAX);
    }

    #[test]
    fn test_locals() {
        let mut w = worker();
        w.insert_local(Rc::new(Cell::new(5u32)));
        w.local::<Rc<Cell<u32>>>().unwrap().set(6);
        assert_eq!(w.local::<Rc<Cell<u32>>>().unwrap().get(), 6);
        assert!(w.local::<String>().is_none());
        assert_eq!(w.remove_local::<Rc<Cell<u32>>>().unwrap().get(), 6);
    }

    #[test]
    fn test_timer_fires_from_dispatch() {
        let mut w = worker();
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        w.add_timer(0, move |_| h.set(true)).unwrap();
        w.dispatch_once();
        assert!(hit.get());
    }

    #[test]
    fn test_read_callback_dispatched_once() {
        let mut w = worker();
        let reg = Arc::clone(w.registry());
        let lfd = reg
            .open_listener(CommKind::Tcp, Some("127.0.0.1"), 0, 8, false)
            .unwrap();
        let port = crate::comm::local_addr(lfd).unwrap().port();
        let mut client = TcpStream::connect(SocketAddrV4::new([127, 0, 0, 1].into(), port)).unwrap();
        let (fd, _) = reg.accept(lfd, true).unwrap();

        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        w.on_read(fd, move |w, fd| {
            let mut buf = [0u8; 8];
            let n = w.registry().read(fd, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"hi");
            h.set(h.get() + 1);
        })
        .unwrap();

        client.write_all(b"hi").unwrap();
        for _ in 0..20 {
            if hits.get() > 0 {
                break;
            }
            w.dispatch_once();
        }
        assert_eq!(hits.get(), 1);
        assert_eq!(w.pending(fd), (false, false));

        client.write_all(b"again").unwrap();
        w.dispatch_once();
        assert_eq!(hits.get(), 1);

        w.close(fd).unwrap();
        reg.close(lfd).unwrap();
    }

    #[test]
    fn test_close_all() {
        let mut w = worker();
        let fd = w.registry().open_socket(CommKind::Tcp, true).unwrap();
        w.on_read(fd, |_, _| {}).unwrap();
        w.close_all();
        assert!(!w.registry().is_open(fd));
    }
}
