//! Per-connection arena
//!
//! Bump allocation over a chain of blocks. Allocations are never moved
//! and never freed one by one; the whole pool goes away with its owner.
//! Callers hold [`Span`] handles instead of pointers.
//!
//! ```text
//!   blocks: [ base ][ base ][ 3 x base ]◄── current
//!                               ├── used ──┤├ free ┤
//! ```

use crate::error::{Error, Result};

/// Default block size.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

const ALIGN: usize = std::mem::size_of::<usize>();

#[inline]
fn align_up(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Handle to bytes inside a [`MemPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Span {
    block: usize,
    start: usize,
    len: usize,
}

impl Span {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-range of this span, clamped to its length.
    pub fn slice(&self, from: usize, to: usize) -> Span {
        let to = to.min(self.len);
        let from = from.min(to);
        Span {
            block: self.block,
            start: self.start + from,
            len: to - from,
        }
    }
}

pub struct MemPool {
    base: usize,
    blocks: Vec<Box<[u8]>>,
    current: usize,
    free: usize,
}

impl MemPool {
    pub fn new(base: usize) -> Self {
        Self {
            base: align_up(base.max(ALIGN)),
            blocks: Vec::new(),
            current: 0,
            free: 0,
        }
    }

    fn new_block(&mut self, need: usize) -> Result<()> {
        let size = need.div_ceil(self.base).max(1) * self.base;
        let mut block = Vec::new();
        block
            .try_reserve_exact(size)
            .map_err(|_| Error::Exhausted("mempool block"))?;
        block.resize(size, 0);
        self.blocks.push(block.into_boxed_slice());
        self.current = self.blocks.len() - 1;
        self.free = size;
        Ok(())
    }

    /// Reserve `size` bytes. The reservation is rounded up to pointer
    /// alignment; the returned span covers exactly `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Result<Span> {
        let rounded = align_up(size);
        if self.blocks.is_empty() || rounded > self.free {
            self.new_block(rounded)?;
        }
        let start = self.blocks[self.current].len() - self.free;
        self.free -= rounded;
        Ok(Span {
            block: self.current,
            start,
            len: size,
        })
    }

    /// Reserve and fill from `bytes`.
    pub fn alloc_copy(&mut self, bytes: &[u8]) -> Result<Span> {
        let span = self.alloc(bytes.len())?;
        self.get_mut(span).copy_from_slice(bytes);
        Ok(span)
    }

    #[inline]
    pub fn get(&self, span: Span) -> &[u8] {
        match self.blocks.get(span.block) {
            Some(b) => &b[span.start..span.start + span.len],
            None => &[],
        }
    }

    #[inline]
    pub fn get_mut(&mut self, span: Span) -> &mut [u8] {
        match self.blocks.get_mut(span.block) {
            Some(b) => &mut b[span.start..span.start + span.len],
            None => &mut [],
        }
    }

    /// Bytes left in the current block.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total bytes held by the pool.
    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    /// Forget every allocation. A first block of the base size is kept for
    /// reuse; anything larger is released. Spans handed out before become
    /// invalid.
    pub fn reset(&mut self) {
        self.blocks.truncate(1);
        if self.blocks.first().is_some_and(|b| b.len() != self.base) {
            self.blocks.clear();
        }
        self.current = 0;
        self.free = self.blocks.first().map_or(0, |b| b.len());
    }

    /// Release every block at once.
    pub fn destroy(self) {
        tracing::trace!(blocks = self.blocks.len(), "mempool destroyed");
    }
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlaps(a: Span, b: Span) -> bool {
        a.block == b.block && a.start < b.start + b.len && b.start < a.start + a.len
    }

    #[test]
    fn test_alignment() {
        let mut pool = MemPool::new(256);
        let a = pool.alloc(3).unwrap();
        let b = pool.alloc(5).unwrap();
        assert_eq!(a.len(), 3);
        assert_eq!(b.start % ALIGN, 0);
        assert_eq!(pool.free_bytes(), 256 - 2 * ALIGN);
    }

    #[test]
    fn test_no_overlap_across_blocks() {
        let mut pool = MemPool::new(64);
        let a = pool.alloc_copy(&[0xAA; 40]).unwrap();
        // does not fit in the 24 bytes left, forces a second block
        let b = pool.alloc_copy(&[0xBB; 40]).unwrap();
        assert_eq!(pool.block_count(), 2);
        assert!(!overlaps(a, b));
        assert!(pool.get(a).iter().all(|&x| x == 0xAA));
        assert!(pool.get(b).iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn test_large_request_rounds_to_base_multiple() {
        let mut pool = MemPool::new(64);
        pool.alloc(8).unwrap();
        pool.alloc(150).unwrap();
        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.capacity(), 64 + 192);
        // the big block is now current
        assert_eq!(pool.free_bytes(), 192 - 152);
    }

    #[test]
    fn test_many_small_never_alias() {
        let mut pool = MemPool::new(128);
        let spans: Vec<_> = (0..200u8)
            .map(|i| pool.alloc_copy(&vec![i; (i % 17) as usize + 1]).unwrap())
            .collect();
        for (i, s) in spans.iter().enumerate() {
            assert!(pool.get(*s).iter().all(|&x| x == i as u8));
        }
    }

    #[test]
    fn test_slice() {
        let mut pool = MemPool::default();
        let s = pool.alloc_copy(b"GET /index.html").unwrap();
        assert_eq!(pool.get(s.slice(4, 15)), b"/index.html");
        assert_eq!(pool.get(s.slice(10, 99)), b".html");
        assert!(s.slice(20, 30).is_empty());
    }

    #[test]
    fn test_zero_sized() {
        let mut pool = MemPool::new(64);
        let s = pool.alloc(0).unwrap();
        assert!(s.is_empty());
        assert_eq!(pool.get(s), b"");
        pool.destroy();
    }

    #[test]
    fn test_reset_keeps_one_base_block() {
        let mut pool = MemPool::new(64);
        for _ in 0..10 {
            pool.alloc(40).unwrap();
        }
        pool.alloc(500).unwrap();
        assert!(pool.block_count() > 1);

        pool.reset();
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.capacity(), 64);
        assert_eq!(pool.free_bytes(), 64);

        let span = pool.alloc_copy(b"again").unwrap();
        assert_eq!(pool.get(span), b"again");
        assert_eq!(pool.block_count(), 1);

        // an oversized first block is not kept
        let mut big = MemPool::new(64);
        big.alloc(1000).unwrap();
        big.reset();
        assert_eq!(big.block_count(), 0);
        assert_eq!(big.capacity(), 0);
    }
}
