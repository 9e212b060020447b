//! Lock-free MPMC queue for cross-dispatcher handoff
//!
//! Michael–Scott unbounded queue. Epoch-based reclamation recycles nodes
//! safely between producers and consumers and removes the ABA hazard that
//! tagged pointers would otherwise have to carry. Head and tail live on
//! separate cache lines.

use crossbeam::epoch::{self, Atomic, Owned, Shared};
use crossbeam::utils::CachePadded;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

struct Node<T> {
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }
}

/// Unbounded lock-free multi-producer multi-consumer queue
///
/// `push` and `pop` are wait-free on the uncontended path and lock-free
/// under contention. Emptiness is observational: a `pop` racing a `push`
/// may report empty; callers absorb that through the event-loop park.
pub struct MpmcQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    len: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MpmcQueue<T> {
    /// Create an empty queue with one sentinel node
    #[must_use]
    pub fn new() -> Self {
        let sentinel = Owned::new(Node::sentinel());
        let guard = unsafe { epoch::unprotected() };
        let sentinel = sentinel.into_shared(guard);
        Self {
            head: CachePadded::new(Atomic::from(sentinel)),
            tail: CachePadded::new(Atomic::from(sentinel)),
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Append a value at the tail
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let new = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        })
        .into_shared(&guard);

        loop {
            let tail = self.tail.load(Acquire, &guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Acquire, &guard);

            if !next.is_null() {
                // Tail is lagging; help it forward and retry.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Release, Relaxed, &guard);
                continue;
            }

            if tail_ref
                .next
                .compare_exchange(Shared::null(), new, Release, Relaxed, &guard)
                .is_ok()
            {
                let _ = self
                    .tail
                    .compare_exchange(tail, new, Release, Relaxed, &guard);
                self.len.fetch_add(1, Relaxed);
                return;
            }
        }
    }

    /// Remove the value at the head, if any
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Acquire, &guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Acquire, &guard);

            let next_ref = unsafe { next.as_ref() }?;

            let tail = self.tail.load(Acquire, &guard);
            if head == tail {
                // Tail still points at the sentinel; help before popping.
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Release, Relaxed, &guard);
            }

            if self
                .head
                .compare_exchange(head, next, Release, Relaxed, &guard)
                .is_ok()
            {
                self.len.fetch_sub(1, Relaxed);
                let value = unsafe { ptr::read(next_ref.value.as_ptr()) };
                unsafe { guard.defer_destroy(head) };
                return Some(value);
            }
        }
    }

    /// Observational emptiness check
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.head.load(Acquire, &guard);
        unsafe { head.deref() }.next.load(Acquire, &guard).is_null()
    }

    /// Approximate number of queued items
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Relaxed)
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        // Free the remaining sentinel.
        let guard = unsafe { epoch::unprotected() };
        let head = self.head.load(Relaxed, guard);
        if !head.is_null() {
            drop(unsafe { head.into_owned() });
        }
    }
}
