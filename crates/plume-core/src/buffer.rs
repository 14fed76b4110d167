//! I/O buffers in fixed size classes
//!
//! Four classes (1K, 2K, 4K, 8K), each a [`SharedLookaside`]. A
//! [`Buffer`] returns itself to its class when dropped, so a buffer taken
//! on one worker may be released on any other.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::config::MemConfig;
use crate::error::{Error, Result};
use crate::lookaside::{LookasideOptions, LookasideStats, Pooled, SharedLookaside};

/// Buffer class sizes, smallest first.
pub const BUFFER_CLASSES: [usize; 4] = [1024, 2048, 4096, 8192];

/// Largest buffer the pool hands out.
pub const MAX_BUFFER: usize = BUFFER_CLASSES[BUFFER_CLASSES.len() - 1];

pub struct BufferPool {
    classes: Vec<SharedLookaside<Box<[u8]>>>,
}

impl BufferPool {
    /// Pool retaining at most `hwm` idle buffers per class.
    pub fn new(mem: MemConfig, hwm: usize) -> Arc<Self> {
        let classes = BUFFER_CLASSES
            .iter()
            .map(|&size| {
                SharedLookaside::new(LookasideOptions::from_mem(mem, hwm), move || {
                    vec![0u8; size].into_boxed_slice()
                })
                .with_reset(|b| b.fill(0))
            })
            .collect();
        Arc::new(Self { classes })
    }

    /// Index of the smallest class that holds `size` bytes.
    pub fn class_for(size: usize) -> Option<usize> {
        BUFFER_CLASSES.iter().position(|&c| c >= size)
    }

    /// Take a buffer of at least `size` bytes.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Result<Buffer> {
        let class = Self::class_for(size).ok_or(Error::Exhausted("buffer larger than 8K"))?;
        self.alloc_class(class)
    }

    fn alloc_class(self: &Arc<Self>, class: usize) -> Result<Buffer> {
        let data = self.classes[class].alloc()?;
        Ok(Buffer {
            data: Some(data),
            class,
            pool: Arc::clone(self),
        })
    }

    /// Move the first `used` bytes of `buf` into a buffer of the next
    /// class. Fails when `buf` is already the largest class.
    pub fn grow(self: &Arc<Self>, buf: Buffer, used: usize) -> Result<Buffer> {
        let next = buf.class + 1;
        if next >= BUFFER_CLASSES.len() {
            return Err(Error::Exhausted("buffer at largest class"));
        }
        let mut bigger = self.alloc_class(next)?;
        let used = used.min(buf.len());
        bigger[..used].copy_from_slice(&buf[..used]);
        Ok(bigger)
    }

    pub fn stats(&self, class: usize) -> Option<LookasideStats> {
        self.classes.get(class).map(SharedLookaside::stats)
    }
}

/// A pooled byte buffer of one size class.
pub struct Buffer {
    data: Option<Pooled<Box<[u8]>>>,
    class: usize,
    pool: Arc<BufferPool>,
}

impl Buffer {
    #[inline]
    pub fn class(&self) -> usize {
        self.class
    }

    #[inline]
    pub fn is_largest(&self) -> bool {
        self.class + 1 == BUFFER_CLASSES.len()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.data.as_deref() {
            Some(b) => &b[..],
            None => &[],
        }
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.data.as_deref_mut() {
            Some(b) => &mut b[..],
            None => &mut [],
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.classes[self.class].free(data);
        }
    }
}
