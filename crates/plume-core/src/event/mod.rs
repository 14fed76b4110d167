//! Readiness notification
//!
//! A [`Poller`] pairs an OS [`Selector`] with per-descriptor callback
//! slots. Every registration arms a one-shot, edge-triggered watch; the
//! callback is moved out of its slot when the event is delivered, so it
//! runs at most once per registration.
//!
//! ```text
//!   UNREGISTERED ──register──► REGISTERED ──poll──► FIRED ──► UNREGISTERED
//!                                  │  ▲
//!                                  └──┘ register again: replace pending
//! ```
//!
//! Each process owns one global poller (listening sockets, polled by
//! whichever worker wins the try-lock) and each worker owns a local one.

use nix::errno::Errno;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use crate::comm::Registry;
use crate::error::{Error, Result};

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod epoll;
        pub use epoll::EpollSelector as DefaultSelector;
    } else {
        compile_error!("plume needs epoll");
    }
}

/// Direction a callback waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// One readiness report from a selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Error or hang-up; delivered to both directions
    pub error: bool,
}

/// OS readiness backend.
///
/// `ctl` arms a one-shot edge-triggered watch for the given directions;
/// `add` selects first registration versus modification.
pub trait Selector: Send + Sync {
    fn ctl(&self, fd: RawFd, read: bool, write: bool, add: bool) -> std::result::Result<(), Errno>;

    /// Wait up to `timeout_ms`, appending at most `max` reports to `out`.
    fn wait(
        &self,
        out: &mut Vec<Readiness>,
        max: usize,
        timeout_ms: u16,
    ) -> std::result::Result<usize, Errno>;

    /// Descriptor another selector can watch, if the backend has one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Wake this selector whenever `fd` becomes readable. The wakeup is
    /// reported as readiness for `fd`, which has no callbacks.
    fn watch(&self, _fd: RawFd) -> std::result::Result<(), Errno> {
        Err(Errno::ENOTSUP)
    }
}

/// A callback taken out of its slot by `poll`.
pub struct Fired<H> {
    pub fd: RawFd,
    pub interest: Interest,
    pub handler: H,
}

struct Slot<H> {
    read: Option<H>,
    write: Option<H>,
}

impl<H> Default for Slot<H> {
    fn default() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

/// Callback slots plus a selector.
pub struct Poller<H> {
    selector: Box<dyn Selector>,
    registry: Arc<Registry>,
    slots: Mutex<Vec<Slot<H>>>,
    /// Scratch readiness buffer; holding it is holding the poll lock
    ready: Mutex<Vec<Readiness>>,
    failures: AtomicU64,
}

/// Exclusive right to poll, obtained from [`Poller::lock`] or [`Poller::try_lock`].
pub struct PollGuard<'a, H> {
    poller: &'a Poller<H>,
    ready: MutexGuard<'a, Vec<Readiness>>,
}

impl<H> Poller<H> {
    /// Poller over the platform selector.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        Ok(Self::with_selector(Box::new(DefaultSelector::new()?), registry))
    }

    pub fn with_selector(selector: Box<dyn Selector>, registry: Arc<Registry>) -> Self {
        let maxfd = registry.maxfd();
        Self {
            selector,
            registry,
            slots: Mutex::new((0..maxfd).map(|_| Slot::default()).collect()),
            ready: Mutex::new(Vec::new()),
            failures: AtomicU64::new(0),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Slot<H>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback for one direction, replacing any pending one,
    /// and arm the combined interest of the descriptor.
    pub fn register(&self, fd: RawFd, interest: Interest, handler: H) -> Result<()> {
        let maxfd = self.registry.maxfd();
        let (read, write) = {
            let mut slots = self.lock_slots();
            let slot = usize::try_from(fd)
                .ok()
                .and_then(|i| slots.get_mut(i))
                .ok_or(Error::FdOutOfRange { fd, maxfd })?;
            match interest {
                Interest::Read => slot.read = Some(handler),
                Interest::Write => slot.write = Some(handler),
            }
            (slot.read.is_some(), slot.write.is_some())
        };

        if let Err(e) = self.arm(fd, read, write) {
            let mut slots = self.lock_slots();
            if let Some(slot) = slots.get_mut(fd as usize) {
                match interest {
                    Interest::Read => slot.read = None,
                    Interest::Write => slot.write = None,
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// ADD on first use, MOD afterwards, tracked by the registry's added flag.
    fn arm(&self, fd: RawFd, read: bool, write: bool) -> std::result::Result<(), Errno> {
        let added = self.registry.added(fd);
        let result = match self.selector.ctl(fd, read, write, !added) {
            Err(Errno::EEXIST) if !added => self.selector.ctl(fd, read, write, false),
            Err(Errno::ENOENT) if added => self.selector.ctl(fd, read, write, true),
            other => other,
        };
        self.registry.set_added(fd, result.is_ok());
        result
    }

    /// Drop pending callbacks for a descriptor that is being closed.
    pub fn forget(&self, fd: RawFd) {
        let taken = {
            let mut slots = self.lock_slots();
            usize::try_from(fd)
                .ok()
                .and_then(|i| slots.get_mut(i))
                .map(std::mem::take)
        };
        drop(taken);
    }

    /// Wake this poller's waits when `other` has events, so a worker
    /// blocked on its local poller notices work on the global one.
    pub fn link<H2>(&self, other: &Poller<H2>) -> Result<()> {
        let fd = other.selector.raw_fd().ok_or(Error::Invalid("selector cannot be linked"))?;
        self.selector.watch(fd)?;
        Ok(())
    }

    /// Descriptors with at least one pending callback.
    pub fn registered(&self) -> Vec<RawFd> {
        self.lock_slots()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.read.is_some() || s.write.is_some())
            .map(|(fd, _)| fd as RawFd)
            .collect()
    }

    /// Pending `(read, write)` callbacks for a descriptor.
    pub fn pending(&self, fd: RawFd) -> (bool, bool) {
        usize::try_from(fd)
            .ok()
            .and_then(|i| {
                self.lock_slots()
                    .get(i)
                    .map(|s| (s.read.is_some(), s.write.is_some()))
            })
            .unwrap_or((false, false))
    }

    /// Poll failures seen so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Block until the poll lock is free.
    pub fn lock(&self) -> PollGuard<'_, H> {
        PollGuard {
            poller: self,
            ready: self.ready.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Take the poll lock if nobody else holds it.
    pub fn try_lock(&self) -> Option<PollGuard<'_, H>> {
        let ready = match self.ready.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(PollGuard { poller: self, ready })
    }

    /// Convenience for single-owner pollers.
    pub fn poll(&self, out: &mut Vec<Fired<H>>, max: usize, timeout_ms: u16) -> usize {
        self.lock().poll(out, max, timeout_ms)
    }
}

impl<H> PollGuard<'_, H> {
    /// Wait for readiness and move fired callbacks into `out`, read before
    /// write for each descriptor. Returns the number of callbacks taken.
    pub fn poll(&mut self, out: &mut Vec<Fired<H>>, max: usize, timeout_ms: u16) -> usize {
        let p = self.poller;
        self.ready.clear();

        match p.selector.wait(&mut self.ready, max, timeout_ms) {
            Ok(_) => {}
            Err(Errno::EINTR) => return 0,
            Err(e) => {
                let n = p.failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(failures = n, "poll failed: {}", e);
                return 0;
            }
        }

        let start = out.len();
        let mut rearm = Vec::new();
        {
            let mut slots = p.lock_slots();
            for r in self.ready.iter() {
                let Some(slot) = usize::try_from(r.fd).ok().and_then(|i| slots.get_mut(i)) else {
                    continue;
                };
                if r.readable || r.error {
                    if let Some(handler) = slot.read.take() {
                        out.push(Fired { fd: r.fd, interest: Interest::Read, handler });
                    }
                }
                if r.writable || r.error {
                    if let Some(handler) = slot.write.take() {
                        out.push(Fired { fd: r.fd, interest: Interest::Write, handler });
                    }
                }
                if slot.read.is_some() || slot.write.is_some() {
                    rearm.push((r.fd, slot.read.is_some(), slot.write.is_some()));
                }
            }
        }

        for (fd, read, write) in rearm {
            if let Err(e) = p.arm(fd, read, write) {
                tracing::warn!(fd, "re-arm failed: {}", e);
            }
        }

        out.len() - start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Scripted selector: every ctl call is recorded, every wait pops one
    /// batch of readiness reports.
    #[derive(Default)]
    struct Mock {
        ctls: Mutex<Vec<(RawFd, bool, bool, bool)>>,
        batches: Mutex<VecDeque<Vec<Readiness>>>,
    }

    impl Selector for Arc<Mock> {
        fn ctl(&self, fd: RawFd, read: bool, write: bool, add: bool) -> std::result::Result<(), Errno> {
            self.ctls.lock().unwrap().push((fd, read, write, add));
            Ok(())
        }

        fn wait(&self, out: &mut Vec<Readiness>, max: usize, _: u16) -> std::result::Result<usize, Errno> {
            let batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
            let n = batch.len().min(max);
            out.extend_from_slice(&batch[..n]);
            Ok(n)
        }
    }

    fn readable(fd: RawFd) -> Readiness {
        Readiness { fd, readable: true, ..Default::default() }
    }

    type Cb = Box<dyn FnOnce() + Send>;

    fn setup() -> (Arc<Mock>, Poller<Cb>) {
        let mock = Arc::new(Mock::default());
        let poller = Poller::with_selector(Box::new(mock.clone()), Arc::new(Registry::new(64)));
        (mock, poller)
    }

    fn run(poller: &Poller<Cb>) -> usize {
        let mut out = Vec::new();
        let n = poller.poll(&mut out, 256, 0);
        for f in out {
            (f.handler)();
        }
        n
    }

    #[test]
    fn test_fires_once_per_registration() {
        let (mock, poller) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        poller
            .register(5, Interest::Read, Box::new(move || { h.fetch_add(1, Ordering::SeqCst); }))
            .unwrap();

        mock.batches.lock().unwrap().push_back(vec![readable(5)]);
        mock.batches.lock().unwrap().push_back(vec![readable(5)]);

        assert_eq!(run(&poller), 1);
        assert_eq!(run(&poller), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_then_modify() {
        let (mock, poller) = setup();
        poller.register(7, Interest::Read, Box::new(|| {})).unwrap();
        poller.register(7, Interest::Write, Box::new(|| {})).unwrap();
        let ctls = mock.ctls.lock().unwrap().clone();
        assert_eq!(ctls, vec![(7, true, false, true), (7, true, true, false)]);
    }

    #[test]
    fn test_reregister_replaces_pending() {
        let (mock, poller) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        for add in [1, 10] {
            let h = hits.clone();
            poller
                .register(3, Interest::Read, Box::new(move || { h.fetch_add(add, Ordering::SeqCst); }))
                .unwrap();
        }
        mock.batches.lock().unwrap().push_back(vec![readable(3)]);
        run(&poller);
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_remaining_direction_rearmed() {
        let (mock, poller) = setup();
        poller.register(4, Interest::Read, Box::new(|| {})).unwrap();
        poller.register(4, Interest::Write, Box::new(|| {})).unwrap();
        mock.ctls.lock().unwrap().clear();

        mock.batches.lock().unwrap().push_back(vec![readable(4)]);
        assert_eq!(run(&poller), 1);
        assert_eq!(poller.pending(4), (false, true));
        assert_eq!(*mock.ctls.lock().unwrap(), vec![(4, false, true, false)]);
    }

    #[test]
    fn test_error_delivers_both_directions() {
        let (mock, poller) = setup();
        poller.register(9, Interest::Read, Box::new(|| {})).unwrap();
        poller.register(9, Interest::Write, Box::new(|| {})).unwrap();
        mock.batches
            .lock()
            .unwrap()
            .push_back(vec![Readiness { fd: 9, error: true, ..Default::default() }]);

        let mut out = Vec::new();
        poller.poll(&mut out, 256, 0);
        let dirs: Vec<_> = out.iter().map(|f| f.interest).collect();
        assert_eq!(dirs, vec![Interest::Read, Interest::Write]);
    }

    #[test]
    fn test_forget_drops_callbacks() {
        let (mock, poller) = setup();
        poller.register(2, Interest::Read, Box::new(|| panic!("forgotten"))).unwrap();
        poller.forget(2);
        mock.batches.lock().unwrap().push_back(vec![readable(2)]);
        assert_eq!(run(&poller), 0);
    }

    #[test]
    fn test_try_lock_excludes() {
        let (_mock, poller) = setup();
        let guard = poller.try_lock();
        assert!(guard.is_some());
        assert!(poller.try_lock().is_none());
        drop(guard);
        assert!(poller.try_lock().is_some());
    }

    #[test]
    fn test_registered_lists_pending() {
        let (_mock, poller) = setup();
        poller.register(3, Interest::Read, Box::new(|| {})).unwrap();
        poller.register(8, Interest::Write, Box::new(|| {})).unwrap();
        assert_eq!(poller.registered(), vec![3, 8]);
    }

    #[test]
    fn test_out_of_range_fd() {
        let (_mock, poller) = setup();
        assert!(poller.register(640, Interest::Read, Box::new(|| {})).is_err());
    }
}
