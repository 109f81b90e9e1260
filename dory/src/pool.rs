use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

/// Fixed-capacity block pool backing every message body.
///
/// The pool is sized once at startup and never grows. Running out of blocks
/// is the backpressure signal: callers report a NoMem discard and keep
/// serving clients instead of blocking them. Allocation pops blocks LIFO
/// off a free list guarded by a single mutex.
pub struct Pool {
    block_size: usize,
    block_count: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("buffer pool exhausted")]
    Exhausted,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub block_size: usize,
    pub block_count: usize,
    pub free_blocks: usize,
    pub in_use_bytes: usize,
    pub capacity_bytes: usize,
}

impl Pool {
    pub fn new(block_size: usize, block_count: usize) -> anyhow::Result<Arc<Pool>> {
        if block_size == 0 || block_count == 0 {
            anyhow::bail!(
                "buffer pool requires nonzero block size and count (got {block_size} x {block_count})"
            );
        }

        let free = (0..block_count)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();

        Ok(Arc::new(Pool {
            block_size,
            block_count,
            free: Mutex::new(free),
        }))
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocates enough blocks to hold `parts` back to back and copies them
    /// in. All-or-nothing: either every needed block is taken or none is.
    pub fn alloc(self: &Arc<Self>, parts: &[&[u8]]) -> Result<PooledBuf, PoolError> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let needed = len.div_ceil(self.block_size);

        let mut blocks = {
            let mut free = self.free.lock().expect("poisoned pool free list");
            if free.len() < needed {
                return Err(PoolError::Exhausted);
            }
            let split_at = free.len() - needed;
            free.split_off(split_at)
        };

        let mut offset = 0;
        for part in parts {
            let mut src = *part;
            while !src.is_empty() {
                let block = offset / self.block_size;
                let at = offset % self.block_size;
                let n = (self.block_size - at).min(src.len());
                blocks[block][at..at + n].copy_from_slice(&src[..n]);
                src = &src[n..];
                offset += n;
            }
        }

        Ok(PooledBuf {
            pool: Arc::clone(self),
            blocks,
            len,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let free_blocks = self.free.lock().expect("poisoned pool free list").len();
        PoolStats {
            block_size: self.block_size,
            block_count: self.block_count,
            free_blocks,
            in_use_bytes: (self.block_count - free_blocks) * self.block_size,
            capacity_bytes: self.block_count * self.block_size,
        }
    }

    fn release(&self, mut blocks: Vec<Box<[u8]>>) {
        if blocks.is_empty() {
            return;
        }
        let mut free = self.free.lock().expect("poisoned pool free list");
        free.append(&mut blocks);
    }
}

/// A byte buffer carved out of the pool. Blocks go back on the free list
/// when the buffer is dropped.
pub struct PooledBuf {
    pool: Arc<Pool>,
    blocks: Vec<Box<[u8]>>,
    len: usize,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates the filled portion of each block, in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks_in(0, self.len)
    }

    /// Iterates the bytes in `[start, end)` as block-bounded slices.
    pub fn chunks_in(&self, start: usize, end: usize) -> impl Iterator<Item = &[u8]> {
        assert!(start <= end && end <= self.len);
        let block_size = self.pool.block_size;
        let first = start / block_size;
        self.blocks
            .iter()
            .enumerate()
            .skip(first)
            .take_while(move |(i, _)| i * block_size < end)
            .map(move |(i, block)| {
                let block_start = i * block_size;
                let lo = start.saturating_sub(block_start);
                let hi = (end - block_start).min(block_size);
                &block[lo..hi]
            })
            .filter(|chunk| !chunk.is_empty())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.blocks));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trip() {
        let pool = Pool::new(8, 4).unwrap();
        let buf = pool.alloc(&[b"hello", b" world"]).unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.to_vec(), b"hello world");
        assert_eq!(pool.stats().free_blocks, 2);

        drop(buf);
        assert_eq!(pool.stats().free_blocks, 4);
    }

    #[test]
    fn alloc_exact_capacity_succeeds_one_more_fails() {
        let pool = Pool::new(4, 2).unwrap();
        let exact = pool.alloc(&[&[7u8; 8]]).unwrap();
        assert_eq!(pool.stats().free_blocks, 0);

        // Zero-length allocations take no blocks and still succeed.
        assert!(pool.alloc(&[]).is_ok());
        assert!(matches!(pool.alloc(&[b"x"]), Err(PoolError::Exhausted)));

        drop(exact);
        assert!(pool.alloc(&[b"x"]).is_ok());
    }

    #[test]
    fn all_or_nothing_allocation() {
        let pool = Pool::new(4, 3).unwrap();
        let _held = pool.alloc(&[&[0u8; 5]]).unwrap();
        // Two blocks needed, one free: nothing should be taken.
        assert!(matches!(pool.alloc(&[&[0u8; 8]]), Err(PoolError::Exhausted)));
        assert_eq!(pool.stats().free_blocks, 1);
    }

    #[test]
    fn chunked_ranges() {
        let pool = Pool::new(4, 4).unwrap();
        let buf = pool.alloc(&[b"abcdefghij"]).unwrap();

        let collected: Vec<u8> = buf.chunks_in(2, 9).flatten().copied().collect();
        assert_eq!(collected, b"cdefghi");

        let chunk_sizes: Vec<usize> = buf.chunks().map(<[u8]>::len).collect();
        assert_eq!(chunk_sizes, vec![4, 4, 2]);
    }
}
