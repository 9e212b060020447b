//! Fixed-size object pools
//!
//! Two variants over the same pre-allocated storage: [`FixedPool`] guards
//! its free list with a mutex and is the default; [`LockFreePool`] uses a
//! tagged-index atomic free list (generation counter packed with the slot
//! index to rule out ABA) for hot paths. Both hand out RAII guards that
//! return the slot on drop. Capacities round up to a power of two.

use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

const TAG_BITS: usize = 32;
const INDEX_MASK: usize = 0xFFFF_FFFF;
/// Index value marking the end of the free list
const NIL: usize = INDEX_MASK;

#[inline(always)]
fn pack(generation: u32, index: usize) -> usize {
    ((generation as usize) << TAG_BITS) | (index & INDEX_MASK)
}

#[inline(always)]
fn unpack_index(tagged: usize) -> usize {
    tagged & INDEX_MASK
}

#[inline(always)]
fn unpack_generation(tagged: usize) -> u32 {
    (tagged >> TAG_BITS) as u32
}

/// Mutex-guarded fixed pool; O(1) acquire and release
pub struct FixedPool<T> {
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
    free: Mutex<Vec<usize>>,
    allocated: AtomicUsize,
}

unsafe impl<T: Send> Send for FixedPool<T> {}
unsafe impl<T: Send> Sync for FixedPool<T> {}

impl<T: Default> FixedPool<T> {
    /// Create a pool; capacity rounds up to a power of two
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let mut storage = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            storage.push(UnsafeCell::new(MaybeUninit::new(T::default())));
        }
        Self {
            storage: storage.into_boxed_slice(),
            free: Mutex::new((0..capacity).rev().collect()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take a slot; `None` when exhausted
    pub fn acquire(&self) -> Option<PoolGuard<'_, T>> {
        let index = self.free.lock().pop()?;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        let obj = unsafe { (*self.storage[index].get()).assume_init_mut() };
        Some(PoolGuard {
            obj,
            release: ReleaseTo::Fixed(self),
            index,
        })
    }

    /// Slots currently handed out
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Total slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }
}

impl<T> FixedPool<T> {
    fn release(&self, index: usize) {
        self.free.lock().push(index);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Lock-free fixed pool for hot paths
pub struct LockFreePool<T> {
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
    next: Box<[AtomicUsize]>,
    head: AtomicUsize,
    allocated: AtomicUsize,
}

unsafe impl<T: Send> Send for LockFreePool<T> {}
unsafe impl<T: Send> Sync for LockFreePool<T> {}

impl<T: Default> LockFreePool<T> {
    /// Create a pool; capacity rounds up to a power of two (max 2^32 slots)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        assert!(capacity < INDEX_MASK, "pool capacity exceeds index space");
        let mut storage = Vec::with_capacity(capacity);
        let mut next = Vec::with_capacity(capacity);
        for i in 0..capacity {
            storage.push(UnsafeCell::new(MaybeUninit::new(T::default())));
            next.push(AtomicUsize::new(if i + 1 < capacity { i + 1 } else { NIL }));
        }
        Self {
            storage: storage.into_boxed_slice(),
            next: next.into_boxed_slice(),
            head: AtomicUsize::new(pack(0, 0)),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Take a slot; `None` when exhausted
    pub fn acquire(&self) -> Option<PoolGuard<'_, T>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let index = unpack_index(head);
            if index == NIL {
                return None;
            }
            let next = self.next[index].load(Ordering::Acquire);
            let new_head = pack(unpack_generation(head).wrapping_add(1), unpack_index(next));
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                let obj = unsafe { (*self.storage[index].get()).assume_init_mut() };
                return Some(PoolGuard {
                    obj,
                    release: ReleaseTo::LockFree(self),
                    index,
                });
            }
        }
    }

    /// Slots currently handed out
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Total slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }
}

impl<T> LockFreePool<T> {
    fn release(&self, index: usize) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            self.next[index].store(pack(0, unpack_index(head)), Ordering::Release);
            let new_head = pack(unpack_generation(head).wrapping_add(1), index);
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.allocated.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

enum ReleaseTo<'a, T> {
    Fixed(&'a FixedPool<T>),
    LockFree(&'a LockFreePool<T>),
}

/// RAII slot guard; the slot returns to its pool on drop
pub struct PoolGuard<'a, T> {
    obj: &'a mut T,
    release: ReleaseTo<'a, T>,
    index: usize,
}

impl<T> std::ops::Deref for PoolGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.obj
    }
}

impl<T> std::ops::DerefMut for PoolGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.obj
    }
}

impl<T> Drop for PoolGuard<'_, T> {
    fn drop(&mut self) {
        match self.release {
            ReleaseTo::Fixed(pool) => pool.release(self.index),
            ReleaseTo::LockFree(pool) => pool.release(self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct Slot {
        value: u64,
    }

    #[test]
    fn fixed_pool_round_trip() {
        let pool = FixedPool::<Slot>::new(3);
        assert_eq!(pool.capacity(), 4); // rounded to power of two
        {
            let mut a = pool.acquire().unwrap();
            a.value = 7;
            assert_eq!(pool.allocated(), 1);
        }
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn fixed_pool_exhaustion() {
        let pool = FixedPool::<Slot>::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        drop(a);
        assert!(pool.acquire().is_some());
        drop(b);
    }

    #[test]
    fn lock_free_pool_round_trip() {
        let pool = LockFreePool::<Slot>::new(4);
        let mut guards = Vec::new();
        for i in 0..4 {
            let mut g = pool.acquire().unwrap();
            g.value = i;
            guards.push(g);
        }
        assert!(pool.acquire().is_none());
        guards.clear();
        assert_eq!(pool.allocated(), 0);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn lock_free_pool_concurrent_churn() {
        let pool = Arc::new(LockFreePool::<Slot>::new(64));
        let mut handles = Vec::new();
        for t in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for i in 0..5_000 {
                    if let Some(mut g) = pool.acquire() {
                        g.value = t * 10_000 + i;
                        thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.allocated(), 0);
    }
}
