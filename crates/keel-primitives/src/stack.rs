//! Lock-free LIFO stack with split reference counting.
//!
//! # Push
//!
//! The new node is private until the head CAS succeeds, so push is a plain
//! Treiber splice with no counting.
//!
//! # Pop
//!
//! 1. Claim a reference to the head node by bumping the external count in
//!    `head` (a ticket). The node cannot be reclaimed while the claim is held;
//!    every later access goes through a [`NodeRef`](crate::arena) pinned
//!    right after the claim, so a broken count is caught by the arena canary.
//! 2. CAS `head` from the exact (index, count) just claimed to the node's
//!    `next`. The winner owns the node: it takes the value and folds
//!    `ticket - 2` into the internal count. Losers give their claim back by
//!    decrementing the internal count.
//! 3. Whoever brings the internal count to zero returns the node to the arena.
//!
//! Earlier designs were rejected: freeing the node right after the winning CAS
//! lets a loser read freed memory; parking popped nodes on a pending list until
//! no pop is in flight never reclaims under sustained load; and an atomic
//! shared-ownership pointer needs a lock inside its own load/store on most
//! targets.

use core::marker::PhantomData;
use core::ptr;

use crate::arena::{NodeArena, ReclaimStats};
use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::sync::{AtomicI32, AtomicPtr, Ordering, spin_loop};

struct StackNode<T> {
    data: AtomicPtr<T>,
    /// Valid while the node is reachable from `head`; written once before publishing.
    next: AtomicCountedPtr,
    internal: AtomicI32,
}

impl<T> Default for StackNode<T> {
    fn default() -> Self {
        Self {
            data: AtomicPtr::new(ptr::null_mut()),
            next: AtomicCountedPtr::new(CountedPtr::NULL),
            internal: AtomicI32::new(0),
        }
    }
}

impl<T> Drop for StackNode<T> {
    fn drop(&mut self) {
        let data = self.data.swap(ptr::null_mut(), Ordering::Acquire);
        if !data.is_null() {
            // SAFETY: non-null data pointers always come from Box::into_raw in push.
            drop(unsafe { Box::from_raw(data) });
        }
    }
}

/// A lock-free LIFO stack.
pub struct LockFreeStack<T> {
    head: AtomicCountedPtr,
    arena: NodeArena<StackNode<T>>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LockFreeStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicCountedPtr::new(CountedPtr::NULL),
            arena: NodeArena::new(),
            _marker: PhantomData,
        }
    }

    pub fn push(&self, value: T) {
        let slot = self.arena.alloc();
        let node = self.arena.get(slot);
        node.data
            .store(Box::into_raw(Box::new(value)), Ordering::Relaxed);
        node.internal.store(0, Ordering::Relaxed);

        let new_head = CountedPtr::new(slot.index);
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            node.next.store(old_head, Ordering::Relaxed);
            if self.head.compare_exchange_weak(
                &mut old_head,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                return;
            }
            spin_loop();
        }
    }

    /// Pop the most recently pushed value, or `None` if the stack is empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            self.head.claim(&mut old_head);
            if old_head.is_null() {
                return None;
            }

            let pinned = self.arena.pin(old_head.index);
            let node = self.arena.get(pinned);
            let next = node.next.load(Ordering::Relaxed);

            let claimed = old_head;
            if self.head.compare_exchange_weak(
                &mut old_head,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                let data = node.data.swap(ptr::null_mut(), Ordering::Acquire);
                let count_increase = claimed.count_increase();
                if node.internal.fetch_add(count_increase, Ordering::Release) == -count_increase {
                    self.arena.release(pinned);
                }
                // SAFETY: only the thread that unlinks the node takes its data,
                // and push stored a Box::into_raw pointer there.
                return Some(*unsafe { Box::from_raw(data) });
            }

            if node.internal.fetch_sub(1, Ordering::Relaxed) == 1 {
                node.internal.load(Ordering::Acquire);
                self.arena.release(pinned);
            }
            spin_loop();
        }
    }

    /// Racy snapshot: another thread may push or pop right after.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Node allocation counters for this stack.
    pub fn stats(&self) -> ReclaimStats {
        self.arena.stats()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}
