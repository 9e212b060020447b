//! Bump-pointer arena for lifetime-bounded event processing
//!
//! Allocation advances a cursor inside pre-allocated, cache-line-aligned
//! chunks; `reset` rewinds every cursor in O(1) and releases nothing back
//! to the allocator. Individual objects are never freed, so only
//! `Copy`/plain-old-data payloads belong here.

use common::constants::memory::CACHE_LINE_SIZE;
use std::alloc::{Layout, alloc, dealloc};
use std::cell::Cell;
use std::ptr::NonNull;

struct Chunk {
    data: NonNull<u8>,
    size: usize,
    used: Cell<usize>,
}

impl Chunk {
    fn new(size: usize) -> anyhow::Result<Self> {
        let size = (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
        let layout = Layout::from_size_align(size, CACHE_LINE_SIZE)
            .map_err(|e| anyhow::anyhow!("arena layout: {e}"))?;
        let data = unsafe {
            let ptr = alloc(layout);
            NonNull::new(ptr).ok_or_else(|| anyhow::anyhow!("arena chunk allocation failed"))?
        };
        Ok(Self {
            data,
            size,
            used: Cell::new(0),
        })
    }

    fn try_alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.used.get();
        let aligned = (base + align - 1) & !(align - 1);
        let end = aligned.checked_add(size)?;
        if end > self.size {
            return None;
        }
        self.used.set(end);
        Some(unsafe { NonNull::new_unchecked(self.data.as_ptr().add(aligned)) })
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, CACHE_LINE_SIZE)
            .expect("layout validated at construction");
        unsafe { dealloc(self.data.as_ptr(), layout) };
    }
}

/// Per-event bump arena; single-threaded by design
pub struct Arena {
    chunks: Vec<Chunk>,
    chunk_size: usize,
    current: Cell<usize>,
}

impl Arena {
    /// Create an arena with one pre-allocated chunk
    pub fn new(chunk_size: usize) -> anyhow::Result<Self> {
        let chunk_size = chunk_size.max(CACHE_LINE_SIZE);
        Ok(Self {
            chunks: vec![Chunk::new(chunk_size)?],
            chunk_size,
            current: Cell::new(0),
        })
    }

    /// Allocate and initialize one value; lives until `reset`
    pub fn alloc<T>(&mut self, value: T) -> anyhow::Result<&mut T> {
        let size = size_of::<T>().max(1);
        let align = align_of::<T>();
        assert!(
            size <= self.chunk_size,
            "object larger than arena chunk size"
        );

        let idx = self.current.get();
        let ptr = match self.chunks[idx].try_alloc(size, align) {
            Some(p) => p,
            None => {
                // Current chunk exhausted; move to (or grow) the next.
                let next = idx + 1;
                if next == self.chunks.len() {
                    self.chunks.push(Chunk::new(self.chunk_size)?);
                }
                self.current.set(next);
                self.chunks[next]
                    .try_alloc(size, align)
                    .ok_or_else(|| anyhow::anyhow!("arena chunk too small for allocation"))?
            }
        };

        let typed = ptr.as_ptr().cast::<T>();
        unsafe {
            typed.write(value);
            Ok(&mut *typed)
        }
    }

    /// Rewind all cursors; O(1) in live objects
    ///
    /// Values handed out earlier must not be touched afterwards; the
    /// borrow checker enforces that through the `&mut self` receiver.
    pub fn reset(&mut self) {
        for chunk in &self.chunks {
            chunk.used.set(0);
        }
        self.current.set(0);
    }

    /// Bytes currently in use across chunks
    #[must_use]
    pub fn used(&self) -> usize {
        self.chunks.iter().map(|c| c.used.get()).sum()
    }

    /// Total reserved bytes
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_reset() {
        let mut arena = Arena::new(1024).unwrap();
        {
            let a = arena.alloc(42_u64).unwrap();
            assert_eq!(*a, 42);
        }
        {
            let b = arena.alloc([1_u8; 100]).unwrap();
            assert_eq!(b[99], 1);
        }
        assert!(arena.used() >= 108);
        arena.reset();
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn grows_additional_chunks() {
        let mut arena = Arena::new(256).unwrap();
        for i in 0..100_u64 {
            let v = arena.alloc(i).unwrap();
            assert_eq!(*v, i);
        }
        assert!(arena.reserved() >= 256 * 2);
        arena.reset();
        // Chunks are retained across reset for reuse.
        assert!(arena.reserved() >= 256 * 2);
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn respects_alignment() {
        let mut arena = Arena::new(1024).unwrap();
        let _ = arena.alloc(1_u8).unwrap();
        let p = arena.alloc(7_u64).unwrap();
        assert_eq!((p as *mut u64 as usize) % align_of::<u64>(), 0);
    }
}
