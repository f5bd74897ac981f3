//! Lock-free FIFO queue with split reference counting on head and tail.
//!
//! The queue always holds one dummy node; `tail` points at it and it carries
//! no value:
//!
//! ```text
//! [Data]->[Data]->[Data]->[Dummy]
//! [Head]                  [Tail]
//! ```
//!
//! # Push
//!
//! A pusher claims a reference to the tail node and tries to CAS the value
//! into its empty data slot. The winner turns the old dummy into a data node:
//! it links a fresh dummy behind it, swings `tail` to the fresh dummy and
//! retires the tail's claim on the old node. A loser gives its reference back
//! and retries against the new tail.
//!
//! # Pop
//!
//! A popper claims a reference to the head node. If head and tail name the
//! same node only the dummy is left and the queue is empty. Otherwise the
//! popper CASes `head` to `next`; the winner takes the value and retires the
//! head's claim, a loser gives its reference back and retries.
//!
//! A node can be referenced through both `tail` and `head`, so each node has a
//! [`ReclamationCounter`] with two claims. The node returns to the arena once
//! both claims are retired and every reference taken through them is back.

use core::marker::PhantomData;
use core::ptr;

use crate::arena::{NodeArena, NodeRef, ReclaimStats};
use crate::counted::{AtomicCountedPtr, CountedPtr, ReclamationCounter};
use crate::sync::{AtomicPtr, Ordering, spin_loop};

struct QueueNode<T> {
    data: AtomicPtr<T>,
    count: ReclamationCounter,
    next: AtomicCountedPtr,
}

impl<T> Default for QueueNode<T> {
    fn default() -> Self {
        Self {
            data: AtomicPtr::new(ptr::null_mut()),
            count: ReclamationCounter::default(),
            next: AtomicCountedPtr::new(CountedPtr::NULL),
        }
    }
}

impl<T> Drop for QueueNode<T> {
    fn drop(&mut self) {
        let data = self.data.swap(ptr::null_mut(), Ordering::Acquire);
        if !data.is_null() {
            // SAFETY: non-null data pointers always come from Box::into_raw in push.
            drop(unsafe { Box::from_raw(data) });
        }
    }
}

/// A lock-free FIFO queue.
pub struct LockFreeQueue<T> {
    head: AtomicCountedPtr,
    tail: AtomicCountedPtr,
    arena: NodeArena<QueueNode<T>>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeQueue<T> {
    pub fn new() -> Self {
        let arena = NodeArena::new();
        let dummy = CountedPtr::new(Self::fresh_node(&arena));
        Self {
            head: AtomicCountedPtr::new(dummy),
            tail: AtomicCountedPtr::new(dummy),
            arena,
            _marker: PhantomData,
        }
    }

    pub fn push(&self, value: T) {
        let data = Box::into_raw(Box::new(value));
        let new_dummy = CountedPtr::new(Self::fresh_node(&self.arena));

        let mut old_tail = self.tail.load(Ordering::Relaxed);
        loop {
            self.tail.claim(&mut old_tail);
            let pinned = self.arena.pin(old_tail.index);
            let node = self.arena.get(pinned);

            if node
                .data
                .compare_exchange(ptr::null_mut(), data, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                node.next.store(new_dummy, Ordering::Release);
                let retired = self.tail.swap(new_dummy, Ordering::AcqRel);
                debug_assert_eq!(retired.index, pinned.index);
                self.retire_claim(pinned, retired);
                return;
            }

            self.release_ref(pinned);
            old_tail = self.tail.load(Ordering::Relaxed);
            spin_loop();
        }
    }

    /// Pop the oldest value, or `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            self.head.claim(&mut old_head);
            let claimed = old_head;

            let pinned = self.arena.pin(claimed.index);
            if claimed.index == self.tail.load(Ordering::Acquire).index {
                self.release_ref(pinned);
                return None;
            }

            let node = self.arena.get(pinned);
            let next = node.next.load(Ordering::Acquire);
            if self.head.compare_exchange_weak(
                &mut old_head,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                let data = node.data.swap(ptr::null_mut(), Ordering::Acquire);
                self.retire_claim(pinned, claimed);
                // SAFETY: the node was a data node (it is not the tail), its
                // data slot was filled by push with a Box::into_raw pointer,
                // and only the thread that unlinks it takes the value.
                return Some(*unsafe { Box::from_raw(data) });
            }

            self.release_ref(pinned);
            spin_loop();
        }
    }

    /// Racy snapshot: another thread may push or pop right after.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).index == self.tail.load(Ordering::Acquire).index
    }

    /// Node allocation counters for this queue, dummy nodes included.
    pub fn stats(&self) -> ReclaimStats {
        self.arena.stats()
    }

    fn fresh_node(arena: &NodeArena<QueueNode<T>>) -> u32 {
        let slot = arena.alloc();
        let node = arena.get(slot);
        node.data.store(ptr::null_mut(), Ordering::Relaxed);
        node.next.store(CountedPtr::NULL, Ordering::Relaxed);
        node.count.reset();
        slot.index
    }

    fn release_ref(&self, node: NodeRef) {
        if self.arena.get(node).count.release_ref() {
            self.arena.release(node);
        }
    }

    /// Retire the claim of the slot `retired` was taken from.
    fn retire_claim(&self, node: NodeRef, retired: CountedPtr) {
        let count_increase = retired.count_increase();
        if self.arena.get(node).count.retire_claim(count_increase) {
            self.arena.release(node);
        }
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
        let dummy = self.head.load(Ordering::Relaxed);
        let dummy = self.arena.pin(dummy.index);
        self.arena.release(dummy);
    }
}
