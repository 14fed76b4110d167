//! Per-thread timers
//!
//! A list of pending callbacks sorted by absolute expiry. Timers with the
//! same expiry fire in the order they were added. Entries are recycled
//! through a [`LookasideList`] of `MAX_TIMERS`.
//!
//! `Timers<C>` is generic over the context handed to callbacks; the
//! worker uses `Timers<Worker>` and fires them from its dispatch loop.

use std::time::{Duration, Instant};

use crate::constants::MAX_TIMERS;
use crate::error::Result;
use crate::lookaside::{LookasideList, LookasideOptions, Pooled};

pub type TimerHandler<C> = Box<dyn FnOnce(&mut C)>;

/// Handle returned by [`Timers::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Entry<C> {
    id: u64,
    expires: Instant,
    handler: Option<TimerHandler<C>>,
}

pub struct Timers<C> {
    list: Vec<Pooled<Entry<C>>>,
    entries: LookasideList<Entry<C>>,
    next_id: u64,
}

impl<C: 'static> Timers<C> {
    pub fn new() -> Self {
        let entries = LookasideList::new(LookasideOptions::new(MAX_TIMERS), || Entry {
            id: 0,
            expires: Instant::now(),
            handler: None,
        })
        .with_reset(|e| e.handler = None);
        Self {
            list: Vec::new(),
            entries,
            next_id: 1,
        }
    }

    /// Schedule `handler` to run `delta_ms` from now.
    pub fn add(&mut self, delta_ms: u64, handler: TimerHandler<C>) -> Result<TimerId> {
        self.add_at(Instant::now() + Duration::from_millis(delta_ms), handler)
    }

    fn add_at(&mut self, expires: Instant, handler: TimerHandler<C>) -> Result<TimerId> {
        let id = self.next_id;
        self.next_id += 1;

        let mut entry = self.entries.alloc()?;
        entry.id = id;
        entry.expires = expires;
        entry.handler = Some(handler);

        // first entry strictly later: keeps equal expiries FIFO
        let at = self.list.partition_point(|e| e.expires <= expires);
        self.list.insert(at, entry);
        Ok(TimerId(id))
    }

    /// Remove a pending timer. Returns false if it already fired.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.list.iter().position(|e| e.id == id.0) {
            Some(i) => {
                let entry = self.list.remove(i);
                self.entries.free(entry);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Move handlers expired at `now` into `out`, in firing order.
    pub fn take_expired(&mut self, now: Instant, out: &mut Vec<TimerHandler<C>>) {
        let n = self.list.partition_point(|e| e.expires <= now);
        for mut entry in self.list.drain(..n).collect::<Vec<_>>() {
            if let Some(h) = entry.handler.take() {
                out.push(h);
            }
            self.entries.free(entry);
        }
    }

    /// Milliseconds until the next expiry, rounded up so a pending timer
    /// never reports 0. Returns 0 when nothing is pending.
    pub fn next_delay(&self, now: Instant) -> u64 {
        match self.list.first() {
            None => 0,
            Some(e) => {
                let left = e.expires.saturating_duration_since(now);
                (left.as_micros().div_ceil(1000) as u64).max(1)
            }
        }
    }

    /// Fire expired timers against `ctx` and report the next delay.
    pub fn run(&mut self, ctx: &mut C) -> u64 {
        let mut fired = Vec::new();
        let now = Instant::now();
        self.take_expired(now, &mut fired);
        for h in fired {
            h(ctx);
        }
        self.next_delay(Instant::now())
    }
}

impl<C: 'static> Default for Timers<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(tag: u32) -> TimerHandler<Vec<u32>> {
        Box::new(move |v: &mut Vec<u32>| v.push(tag))
    }

    #[test]
    fn test_fires_in_expiry_order() {
        let mut timers = Timers::new();
        let base = Instant::now();
        timers.add_at(base + Duration::from_millis(30), push(3)).unwrap();
        timers.add_at(base + Duration::from_millis(10), push(1)).unwrap();
        timers.add_at(base + Duration::from_millis(20), push(2)).unwrap();

        let mut out = Vec::new();
        timers.take_expired(base + Duration::from_millis(25), &mut out);
        let mut seen = Vec::new();
        for h in out {
            h(&mut seen);
        }
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_delay(base + Duration::from_millis(25)), 5);
    }

    #[test]
    fn test_equal_expiry_is_fifo() {
        let mut timers = Timers::new();
        let at = Instant::now();
        for tag in 0..5 {
            timers.add_at(at, push(tag)).unwrap();
        }
        let mut out = Vec::new();
        timers.take_expired(at, &mut out);
        let mut seen = Vec::new();
        for h in out {
            h(&mut seen);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_cancel() {
        let mut timers = Timers::new();
        let a = timers.add(1000, push(1)).unwrap();
        let _b = timers.add(2000, push(2)).unwrap();
        assert!(timers.cancel(a));
        assert!(!timers.cancel(a));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_run_returns_zero_when_empty() {
        let mut timers = Timers::new();
        let mut seen = Vec::new();
        timers.add(0, push(9)).unwrap();
        assert_eq!(timers.run(&mut seen), 0);
        assert_eq!(seen, vec![9]);

        timers.add(50, push(1)).unwrap();
        let left = timers.run(&mut seen);
        assert!(left > 0 && left <= 50);
    }

    #[test]
    fn test_entries_recycled() {
        let mut timers: Timers<Vec<u32>> = Timers::new();
        let at = Instant::now();
        for _ in 0..3 {
            timers.add_at(at, push(0)).unwrap();
        }
        timers.take_expired(at, &mut Vec::new());
        assert_eq!(timers.entries.stats().list_len, 3);
        timers.add_at(at, push(0)).unwrap();
        assert_eq!(timers.entries.stats().alloc_from_list, 1);
    }
}
