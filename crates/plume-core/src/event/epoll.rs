//! epoll selector

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use super::{Readiness, Selector};
use crate::constants::MAX_EVENTS;

pub struct EpollSelector {
    epoll: Epoll,
}

impl EpollSelector {
    pub fn new() -> std::result::Result<Self, Errno> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
        })
    }
}

impl Selector for EpollSelector {
    fn ctl(&self, fd: RawFd, read: bool, write: bool, add: bool) -> std::result::Result<(), Errno> {
        let mut flags = EpollFlags::EPOLLONESHOT | EpollFlags::EPOLLET;
        if read {
            flags |= EpollFlags::EPOLLIN;
        }
        if write {
            flags |= EpollFlags::EPOLLOUT;
        }
        let mut event = EpollEvent::new(flags, fd as u64);

        // SAFETY: the registry keeps fd open while it is registered.
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if add {
            self.epoll.add(bfd, event)
        } else {
            self.epoll.modify(bfd, &mut event)
        }
    }

    fn wait(
        &self,
        out: &mut Vec<Readiness>,
        max: usize,
        timeout_ms: u16,
    ) -> std::result::Result<usize, Errno> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let max = max.clamp(1, MAX_EVENTS);
        let n = self.epoll.wait(&mut events[..max], timeout_ms)?;

        let error = EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP;
        out.extend(events[..n].iter().map(|ev| {
            let flags = ev.events();
            Readiness {
                fd: ev.data() as RawFd,
                readable: flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP),
                writable: flags.contains(EpollFlags::EPOLLOUT),
                error: flags.intersects(error),
            }
        }));
        Ok(n)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.epoll.0.as_raw_fd())
    }

    fn watch(&self, fd: RawFd) -> std::result::Result<(), Errno> {
        // SAFETY: the watched selector outlives this one (owned by the context).
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(
            bfd,
            EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, fd as u64),
        )
    }
}
