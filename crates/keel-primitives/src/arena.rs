//! Grow-only node arena addressed by stable `u32` indices.
//!
//! The lock-free containers never hand raw node pointers around. A node is
//! named by its arena index, which lets a node reference and its external
//! count share one `AtomicU64` on every target.
//!
//! # Layout
//!
//! Slots live in up to [`SEGMENT_COUNT`] segments. Segment `s` holds
//! `SEGMENT_BASE << s` slots and is allocated on first use with a CAS, so the
//! arena grows geometrically and never moves a slot once it exists. Segments
//! are released only when the arena is dropped.
//!
//! # Recycling
//!
//! A released slot goes onto a Treiber free list:
//! - `free_head: AtomicU64` = (tag << 32) | index
//! - Tag increments on each push/pop for ABA safety
//! - `next_free` lives in the slot header, not in the node
//!
//! # Canary
//!
//! Every slot carries a [`SlotState`] and a generation, bumped each time the
//! slot is released, before it goes back on the free list. Containers address nodes through a [`NodeRef`]
//! (index + generation) taken when the node is allocated or when a reference
//! to it is claimed. [`NodeArena::get`] refuses a slot that is not `Live` or
//! whose generation differs from the handle's, so a container that touches a
//! node after it was reclaimed, even one already recycled, raises
//! `NODE_RECLAIMED` instead of reading another node.

use core::marker::PhantomData;
use core::ptr;

use crate::fatal::{self, FatalCause};
use crate::sync::{AtomicPtr, AtomicU32, AtomicU64, Ordering, spin_loop};

/// Sentinel index: end of free list, and the null node reference.
pub const NULL_INDEX: u32 = u32::MAX;

#[cfg(not(feature = "loom"))]
const SEGMENT_BASE: u32 = 64;
#[cfg(feature = "loom")]
const SEGMENT_BASE: u32 = 2;

#[cfg(not(feature = "loom"))]
pub const SEGMENT_COUNT: usize = 26;
#[cfg(feature = "loom")]
pub const SEGMENT_COUNT: usize = 4;

/// Total number of addressable slots.
pub const CAPACITY: u64 = SEGMENT_BASE as u64 * ((1u64 << SEGMENT_COUNT) - 1);

const _: () = assert!(CAPACITY <= NULL_INDEX as u64);

/// Lifecycle of an arena slot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free = 0,
    Live = 1,
}

impl SlotState {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Live),
            _ => None,
        }
    }
}

/// Allocation counters, used to check that every node is reclaimed exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Slots handed out, counting recycled slots again.
    pub allocated: u64,
    /// Slots returned.
    pub released: u64,
}

impl ReclaimStats {
    /// Nodes currently alive.
    pub fn live(&self) -> u64 {
        self.allocated - self.released
    }
}

/// A node index plus the generation the slot had when the handle was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

struct Slot<N> {
    state: AtomicU32,
    generation: AtomicU32,
    next_free: AtomicU32,
    node: N,
}

impl<N: Default> Slot<N> {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(SlotState::Free as u32),
            generation: AtomicU32::new(0),
            next_free: AtomicU32::new(NULL_INDEX),
            node: N::default(),
        }
    }
}

pub(crate) struct NodeArena<N> {
    segments: Box<[AtomicPtr<Slot<N>>]>,
    /// Next index that has never been handed out.
    bump: AtomicU32,
    free_head: AtomicU64,
    allocated: AtomicU64,
    released: AtomicU64,
    _marker: PhantomData<Box<Slot<N>>>,
}

impl<N: Default> NodeArena<N> {
    pub(crate) fn new() -> Self {
        let segments = (0..SEGMENT_COUNT)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            segments,
            bump: AtomicU32::new(0),
            free_head: AtomicU64::new(pack_free_head(NULL_INDEX, 0)),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// Take a slot, recycling a released one when possible.
    ///
    /// The returned node still holds whatever its previous user left behind;
    /// the caller resets it before publishing the index.
    pub(crate) fn alloc(&self) -> NodeRef {
        let index = match self.pop_free_list() {
            Some(index) => index,
            None => self.bump_alloc(),
        };

        let slot = self.slot(index);
        if let Err(actual) = slot.state.compare_exchange(
            SlotState::Free as u32,
            SlotState::Live as u32,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            fatal::abort(
                FatalCause::NodeReclaimed,
                format!("slot {index} handed out while in state {:?}", SlotState::from_u32(actual)),
            );
        }
        let generation = slot.generation.load(Ordering::Acquire);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        NodeRef { index, generation }
    }

    /// Take a handle to the node currently living at `index`.
    ///
    /// The caller must already hold a reference that keeps the node alive,
    /// such as a claim through the slot that published it.
    pub(crate) fn pin(&self, index: u32) -> NodeRef {
        let slot = self.slot(index);
        if slot.state.load(Ordering::Acquire) != SlotState::Live as u32 {
            fatal::abort(
                FatalCause::NodeReclaimed,
                format!("node {index} claimed after reclamation"),
            );
        }
        NodeRef {
            index,
            generation: slot.generation.load(Ordering::Acquire),
        }
    }

    /// Return a live slot to the free list.
    pub(crate) fn release(&self, node: NodeRef) {
        let index = node.index;
        let slot = self.check(node);
        // Outstanding handles go stale before the slot can be handed out again.
        slot.generation.fetch_add(1, Ordering::AcqRel);
        if slot
            .state
            .compare_exchange(
                SlotState::Live as u32,
                SlotState::Free as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            fatal::abort(
                FatalCause::NodeReclaimed,
                format!("slot {index} released twice"),
            );
        }
        self.released.fetch_add(1, Ordering::Relaxed);
        self.push_free_list(index);
    }

    /// Borrow a live node.
    ///
    /// Aborts if the slot is not live or was handed out again since `node`
    /// was taken: the caller does not hold a reference the reclamation
    /// protocol honours.
    #[inline]
    pub(crate) fn get(&self, node: NodeRef) -> &N {
        &self.check(node).node
    }

    #[inline]
    fn check(&self, node: NodeRef) -> &Slot<N> {
        let slot = self.slot(node.index);
        let live = slot.state.load(Ordering::Acquire) == SlotState::Live as u32;
        let generation = slot.generation.load(Ordering::Acquire);
        if !live || generation != node.generation {
            fatal::abort(
                FatalCause::NodeReclaimed,
                format!(
                    "node {} (generation {}) used after reclamation, slot is {} at generation {generation}",
                    node.index,
                    node.generation,
                    if live { "live" } else { "free" },
                ),
            );
        }
        slot
    }

    pub(crate) fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            allocated: self.allocated.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
        }
    }

    fn pop_free_list(&self) -> Option<u32> {
        loop {
            let old_head = self.free_head.load(Ordering::Acquire);
            let (index, tag) = unpack_free_head(old_head);

            if index == NULL_INDEX {
                return None;
            }

            let next = self.slot(index).next_free.load(Ordering::Acquire);
            let new_head = pack_free_head(next, tag.wrapping_add(1));

            if self
                .free_head
                .compare_exchange_weak(old_head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
            spin_loop();
        }
    }

    fn push_free_list(&self, index: u32) {
        let slot = self.slot(index);

        loop {
            let old_head = self.free_head.load(Ordering::Acquire);
            let (old_index, tag) = unpack_free_head(old_head);

            slot.next_free.store(old_index, Ordering::Release);

            let new_head = pack_free_head(index, tag.wrapping_add(1));

            if self
                .free_head
                .compare_exchange_weak(old_head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn bump_alloc(&self) -> u32 {
        let index = self.bump.fetch_add(1, Ordering::Relaxed);
        if index as u64 >= CAPACITY {
            fatal::abort(
                FatalCause::ArenaExhausted,
                format!("node arena full ({CAPACITY} slots)"),
            );
        }
        let (segment, _) = locate(index);
        self.ensure_segment(segment);
        index
    }

    fn ensure_segment(&self, segment: usize) -> *mut Slot<N> {
        let current = self.segments[segment].load(Ordering::Acquire);
        if !current.is_null() {
            return current;
        }

        let len = segment_len(segment);
        let fresh: Box<[Slot<N>]> = (0..len).map(|_| Slot::new()).collect();
        let fresh = Box::into_raw(fresh) as *mut Slot<N>;

        match self.segments[segment].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::trace!(segment, len, "node arena segment allocated");
                fresh
            }
            Err(existing) => {
                // SAFETY: `fresh` came from Box::into_raw above with this length
                // and was never published.
                drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, len)) });
                existing
            }
        }
    }

    #[inline]
    fn slot(&self, index: u32) -> &Slot<N> {
        let (segment, offset) = locate(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        if base.is_null() {
            fatal::abort(
                FatalCause::NodeReclaimed,
                format!("node {index} refers to an unallocated segment"),
            );
        }
        // SAFETY: segment `segment` holds `segment_len(segment)` slots,
        // `offset` is below that, and segments live as long as the arena.
        unsafe { &*base.add(offset) }
    }
}

impl<N> Drop for NodeArena<N> {
    fn drop(&mut self) {
        for (segment, slot) in self.segments.iter().enumerate() {
            let base = slot.load(Ordering::Acquire);
            if base.is_null() {
                continue;
            }
            let len = segment_len(segment);
            // SAFETY: every non-null segment pointer was produced by
            // Box::into_raw on a boxed slice of exactly `len` slots.
            drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(base, len)) });
        }
    }
}

#[inline]
const fn segment_len(segment: usize) -> usize {
    (SEGMENT_BASE as usize) << segment
}

/// Map a global index to (segment, offset within segment).
#[inline]
fn locate(index: u32) -> (usize, usize) {
    let bucket = index / SEGMENT_BASE + 1;
    let segment = bucket.ilog2() as usize;
    let first = SEGMENT_BASE as usize * ((1usize << segment) - 1);
    (segment, index as usize - first)
}

#[inline]
fn pack_free_head(index: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | (index as u64)
}

#[inline]
fn unpack_free_head(packed: u64) -> (u32, u32) {
    let index = packed as u32;
    let tag = (packed >> 32) as u32;
    (index, tag)
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Cell {
        value: AtomicU32,
    }

    #[test]
    fn locate_spans_segments() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(SEGMENT_BASE - 1), (0, SEGMENT_BASE as usize - 1));
        assert_eq!(locate(SEGMENT_BASE), (1, 0));
        assert_eq!(locate(3 * SEGMENT_BASE - 1), (1, 2 * SEGMENT_BASE as usize - 1));
        assert_eq!(locate(3 * SEGMENT_BASE), (2, 0));
    }

    #[test]
    fn released_slots_are_recycled() {
        let arena: NodeArena<Cell> = NodeArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        assert_ne!(a.index, b.index);

        arena.get(a).value.store(7, Ordering::Relaxed);
        arena.release(a);

        let c = arena.alloc();
        assert_eq!(c.index, a.index);
        assert_eq!(c.generation, a.generation + 1);
        assert_eq!(arena.pin(c.index), c);

        let stats = arena.stats();
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.live(), 2);
    }

    #[test]
    #[should_panic(expected = "NODE_RECLAIMED")]
    fn stale_handle_to_recycled_slot_is_rejected() {
        let arena: NodeArena<Cell> = NodeArena::new();
        let stale = arena.alloc();
        arena.release(stale);
        let fresh = arena.alloc();
        assert_eq!(fresh.index, stale.index);

        // The slot is live again, but for a different node.
        arena.get(stale).value.store(99, Ordering::Relaxed);
    }

    #[test]
    #[should_panic(expected = "NODE_RECLAIMED")]
    fn handle_to_free_slot_is_rejected() {
        let arena: NodeArena<Cell> = NodeArena::new();
        let node = arena.alloc();
        arena.release(node);
        arena.get(node);
    }

    #[test]
    #[should_panic(expected = "NODE_RECLAIMED")]
    fn double_release_is_rejected() {
        let arena: NodeArena<Cell> = NodeArena::new();
        let node = arena.alloc();
        arena.release(node);
        arena.release(node);
    }

    #[test]
    #[should_panic(expected = "NODE_RECLAIMED")]
    fn pinning_a_free_slot_is_rejected() {
        let arena: NodeArena<Cell> = NodeArena::new();
        let node = arena.alloc();
        arena.release(node);
        arena.pin(node.index);
    }

    #[test]
    fn grows_past_first_segment() {
        let arena: NodeArena<Cell> = NodeArena::new();
        let nodes: Vec<NodeRef> = (0..(SEGMENT_BASE * 4)).map(|_| arena.alloc()).collect();
        for (i, &node) in nodes.iter().enumerate() {
            arena.get(node).value.store(i as u32, Ordering::Relaxed);
        }
        for (i, &node) in nodes.iter().enumerate() {
            assert_eq!(arena.get(node).value.load(Ordering::Relaxed), i as u32);
        }
        for node in nodes {
            arena.release(node);
        }
        assert_eq!(arena.stats().live(), 0);
    }

    #[test]
    fn canary_holds_under_concurrent_churn() {
        const THREADS: u32 = 4;
        const ROUNDS: u32 = 2_000;
        let arena: NodeArena<Cell> = NodeArena::new();

        let stale: Vec<NodeRef> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let arena = &arena;
                    s.spawn(move || {
                        let mut first = None;
                        for round in 0..ROUNDS {
                            let node = arena.alloc();
                            let marker = t * ROUNDS + round;
                            arena.get(node).value.store(marker, Ordering::Relaxed);
                            std::thread::yield_now();
                            // No other thread was handed the same live slot.
                            assert_eq!(arena.get(node).value.load(Ordering::Relaxed), marker);
                            arena.release(node);
                            first.get_or_insert(node);
                        }
                        first
                    })
                })
                .collect();
            workers.into_iter().filter_map(|w| w.join().unwrap()).collect()
        });

        let stats = arena.stats();
        assert_eq!(stats.allocated, u64::from(THREADS * ROUNDS));
        assert_eq!(stats.live(), 0);

        // Bring every recycled slot back to life under a newer generation.
        let fresh: Vec<NodeRef> = (0..THREADS * 2).map(|_| arena.alloc()).collect();
        for node in stale {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                arena.get(node);
            }));
            assert!(result.is_err(), "stale {node:?} passed the canary");
        }
        for node in fresh {
            arena.release(node);
        }
    }
}
