//! Lookaside lists
//!
//! Recyclers for same-typed objects. `alloc` pops from the free list or
//! constructs a new object; `free` pushes back unless the list already
//! holds `hwm` objects, in which case the object is dropped.
//!
//! Every object carries the list's tag. With tag checking on, an object
//! freed to a list with a different tag is counted in `tag_mismatch` and
//! dropped instead of recycled.
//!
//! Two flavours:
//!
//! - [`LookasideList`]: single-threaded, `&mut self`, no locking
//! - [`SharedLookaside`]: thread-safe, backed by a bounded lock-free queue

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::config::MemConfig;
use crate::error::{Error, Result};

/// Options shared by both list flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookasideOptions {
    /// Maximum number of objects retained on the free list
    pub hwm: usize,
    pub tag: u32,
    /// Reset objects handed out from the free list
    pub zero: bool,
    pub tag_check: bool,
    /// Maximum outstanding objects; `alloc` fails beyond it
    pub limit: Option<usize>,
}

impl LookasideOptions {
    pub fn new(hwm: usize) -> Self {
        Self::from_mem(MemConfig::default(), hwm)
    }

    pub fn from_mem(mem: MemConfig, hwm: usize) -> Self {
        Self {
            hwm,
            tag: mem.tag,
            zero: mem.zero,
            tag_check: mem.tag_check,
            limit: None,
        }
    }

    pub fn tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookasideStats {
    pub alloc_times: u64,
    pub free_times: u64,
    pub alloc_from_list: u64,
    pub free_to_list: u64,
    pub alloc_failed: u64,
    pub tag_mismatch: u64,
    pub list_len: usize,
}

#[derive(Default)]
struct Counters {
    alloc_times: AtomicU64,
    free_times: AtomicU64,
    alloc_from_list: AtomicU64,
    free_to_list: AtomicU64,
    alloc_failed: AtomicU64,
    tag_mismatch: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(c: &AtomicU64) {
        c.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, list_len: usize) -> LookasideStats {
        LookasideStats {
            alloc_times: self.alloc_times.load(Ordering::Relaxed),
            free_times: self.free_times.load(Ordering::Relaxed),
            alloc_from_list: self.alloc_from_list.load(Ordering::Relaxed),
            free_to_list: self.free_to_list.load(Ordering::Relaxed),
            alloc_failed: self.alloc_failed.load(Ordering::Relaxed),
            tag_mismatch: self.tag_mismatch.load(Ordering::Relaxed),
            list_len,
        }
    }
}

struct Tagged<T> {
    tag: u32,
    value: T,
}

/// An object handed out by a lookaside list.
pub struct Pooled<T> {
    inner: Box<Tagged<T>>,
}

impl<T> Pooled<T> {
    #[inline]
    pub fn tag(&self) -> u32 {
        self.inner.tag
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner.value
    }
}

type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

// ── Single-threaded ──

pub struct LookasideList<T> {
    opts: LookasideOptions,
    ctor: Box<dyn Fn() -> T>,
    reset: Option<Box<dyn Fn(&mut T)>>,
    free: Vec<Box<Tagged<T>>>,
    outstanding: usize,
    counters: Counters,
}

impl<T> LookasideList<T> {
    pub fn new(opts: LookasideOptions, ctor: impl Fn() -> T + 'static) -> Self {
        Self {
            free: Vec::with_capacity(opts.hwm),
            opts,
            ctor: Box::new(ctor),
            reset: None,
            outstanding: 0,
            counters: Counters::default(),
        }
    }

    /// Use `reset` instead of the constructor for zeroing recycled objects.
    pub fn with_reset(mut self, reset: impl Fn(&mut T) + 'static) -> Self {
        self.reset = Some(Box::new(reset));
        self
    }

    pub fn alloc(&mut self) -> Result<Pooled<T>> {
        if self.opts.limit.is_some_and(|l| self.outstanding >= l) {
            Counters::bump(&self.counters.alloc_failed);
            return Err(Error::Exhausted("lookaside limit"));
        }
        Counters::bump(&self.counters.alloc_times);

        let inner = match self.free.pop() {
            Some(mut obj) => {
                Counters::bump(&self.counters.alloc_from_list);
                if self.opts.zero {
                    match &self.reset {
                        Some(reset) => reset(&mut obj.value),
                        None => obj.value = (self.ctor)(),
                    }
                }
                obj
            }
            None => Box::new(Tagged {
                tag: self.opts.tag,
                value: (self.ctor)(),
            }),
        };
        self.outstanding += 1;
        Ok(Pooled { inner })
    }

    pub fn free(&mut self, obj: Pooled<T>) {
        Counters::bump(&self.counters.free_times);
        self.outstanding = self.outstanding.saturating_sub(1);

        if self.opts.tag_check && obj.inner.tag != self.opts.tag {
            Counters::bump(&self.counters.tag_mismatch);
            tracing::warn!(
                expected = self.opts.tag,
                found = obj.inner.tag,
                "lookaside tag mismatch"
            );
            return;
        }
        if self.free.len() < self.opts.hwm {
            self.free.push(obj.inner);
            Counters::bump(&self.counters.free_to_list);
        }
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn stats(&self) -> LookasideStats {
        self.counters.snapshot(self.free.len())
    }
}

// ── Thread-safe ──

pub struct SharedLookaside<T> {
    opts: LookasideOptions,
    ctor: Box<dyn Fn() -> T + Send + Sync>,
    reset: Option<Reset<T>>,
    free: Option<ArrayQueue<Box<Tagged<T>>>>,
    outstanding: AtomicUsize,
    counters: Counters,
}

impl<T: Send> SharedLookaside<T> {
    pub fn new(opts: LookasideOptions, ctor: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            free: (opts.hwm > 0).then(|| ArrayQueue::new(opts.hwm)),
            opts,
            ctor: Box::new(ctor),
            reset: None,
            outstanding: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn with_reset(mut self, reset: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        self.reset = Some(Box::new(reset));
        self
    }

    pub fn alloc(&self) -> Result<Pooled<T>> {
        if let Some(limit) = self.opts.limit {
            let reserved = self
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                });
            if reserved.is_err() {
                Counters::bump(&self.counters.alloc_failed);
                return Err(Error::Exhausted("lookaside limit"));
            }
        } else {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
        }
        Counters::bump(&self.counters.alloc_times);

        let recycled = self.free.as_ref().and_then(ArrayQueue::pop);
        let inner = match recycled {
            Some(mut obj) => {
                Counters::bump(&self.counters.alloc_from_list);
                if self.opts.zero {
                    match &self.reset {
                        Some(reset) => reset(&mut obj.value),
                        None => obj.value = (self.ctor)(),
                    }
                }
                obj
            }
            None => Box::new(Tagged {
                tag: self.opts.tag,
                value: (self.ctor)(),
            }),
        };
        Ok(Pooled { inner })
    }

    pub fn free(&self, obj: Pooled<T>) {
        Counters::bump(&self.counters.free_times);
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if self.opts.tag_check && obj.inner.tag != self.opts.tag {
            Counters::bump(&self.counters.tag_mismatch);
            tracing::warn!(
                expected = self.opts.tag,
                found = obj.inner.tag,
                "lookaside tag mismatch"
            );
            return;
        }
        // a full queue hands the object back and it is dropped
        if let Some(q) = &self.free {
            if q.push(obj.inner).is_ok() {
                Counters::bump(&self.counters.free_to_list);
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> LookasideStats {
        self.counters
            .snapshot(self.free.as_ref().map_or(0, ArrayQueue::len))
    }
}
