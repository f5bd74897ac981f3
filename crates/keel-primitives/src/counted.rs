//! Split reference counting.
//!
//! A shared slot (a stack head, a queue head or tail) holds a
//! [`CountedPtr`]: a node index plus an *external count*. A thread that wants
//! to look at the node first bumps the external count through the slot with a
//! CAS ([`AtomicCountedPtr::claim`]); once that succeeds the node cannot be
//! reclaimed until the thread gives the reference back.
//!
//! References are given back to a per-node *internal* count. When a node
//! leaves a shared slot, whoever moved it folds the external count it saw
//! (minus the slot's own reference and its own claim) into the internal count.
//! The node is reclaimable once the two balance out.
//!
//! Queue nodes can be referenced from two slots (as a push target through the
//! tail, as a pop source through the head), so their internal count is paired
//! with a 2-bit count of slots that may still hand out references; see
//! [`ReclamationCounter`].

use crate::arena::NULL_INDEX;
use crate::fatal::{self, FatalCause};
use crate::sync::{AtomicU32, AtomicU64, Ordering, spin_loop};

/// A node index together with the number of references taken through the
/// slot that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CountedPtr {
    pub(crate) index: u32,
    pub(crate) external: u32,
}

impl CountedPtr {
    pub(crate) const NULL: CountedPtr = CountedPtr {
        index: NULL_INDEX,
        external: 0,
    };

    /// A freshly published node: the slot itself holds one reference.
    #[inline]
    pub(crate) const fn new(index: u32) -> Self {
        Self { index, external: 1 }
    }

    #[inline]
    pub(crate) const fn is_null(self) -> bool {
        self.index == NULL_INDEX
    }

    /// References to hand back when this pointer leaves its slot: the slot's
    /// own reference and the caller's claim are not counted.
    #[inline]
    pub(crate) const fn count_increase(self) -> i32 {
        self.external as i32 - 2
    }

    #[inline]
    const fn with_ticket(self) -> Self {
        Self {
            index: self.index,
            external: self.external.wrapping_add(1),
        }
    }

    #[inline]
    const fn pack(self) -> u64 {
        ((self.external as u64) << 32) | (self.index as u64)
    }

    #[inline]
    const fn unpack(packed: u64) -> Self {
        Self {
            index: packed as u32,
            external: (packed >> 32) as u32,
        }
    }
}

/// A [`CountedPtr`] updated with single-word atomic operations.
pub(crate) struct AtomicCountedPtr(AtomicU64);

impl AtomicCountedPtr {
    pub(crate) fn new(ptr: CountedPtr) -> Self {
        Self(AtomicU64::new(ptr.pack()))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> CountedPtr {
        CountedPtr::unpack(self.0.load(order))
    }

    #[inline]
    pub(crate) fn store(&self, ptr: CountedPtr, order: Ordering) {
        self.0.store(ptr.pack(), order)
    }

    #[inline]
    pub(crate) fn swap(&self, ptr: CountedPtr, order: Ordering) -> CountedPtr {
        CountedPtr::unpack(self.0.swap(ptr.pack(), order))
    }

    /// Replace `current` with `new`. On failure `current` is refreshed with
    /// the value found in the slot.
    #[inline]
    pub(crate) fn compare_exchange_weak(
        &self,
        current: &mut CountedPtr,
        new: CountedPtr,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        match self
            .0
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
        {
            Ok(_) => true,
            Err(actual) => {
                *current = CountedPtr::unpack(actual);
                false
            }
        }
    }

    /// Take a reference to whatever node the slot currently holds.
    ///
    /// `observed` is the caller's last view of the slot; on return it is the
    /// value the slot held right after the caller's ticket was added.
    pub(crate) fn claim(&self, observed: &mut CountedPtr) {
        loop {
            let ticketed = observed.with_ticket();
            match self.0.compare_exchange_weak(
                observed.pack(),
                ticketed.pack(),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    *observed = ticketed;
                    return;
                }
                Err(actual) => {
                    *observed = CountedPtr::unpack(actual);
                    spin_loop();
                }
            }
        }
    }
}

const CLAIM_BITS: u32 = 2;
const CLAIM_MASK: u32 = (1 << CLAIM_BITS) - 1;
const INTERNAL_MASK: u32 = u32::MAX >> CLAIM_BITS;

/// Number of shared slots that can reference a queue node.
pub(crate) const QUEUE_CLAIMS: u32 = 2;

/// Per-node reclamation state for the queue, packed in one `u32`:
/// low 2 bits remaining claims, high 30 bits internal count.
///
/// The internal count goes transiently negative (a reference can be handed
/// back before the slot's claim is retired), so it is kept modulo 2^30.
pub(crate) struct ReclamationCounter(AtomicU32);

impl Default for ReclamationCounter {
    fn default() -> Self {
        Self(AtomicU32::new(pack_counter(0, QUEUE_CLAIMS)))
    }
}

impl ReclamationCounter {
    /// Prepare a recycled node: no references returned, both claims open.
    pub(crate) fn reset(&self) {
        self.0.store(pack_counter(0, QUEUE_CLAIMS), Ordering::Relaxed);
    }

    /// Give back one reference taken through a slot.
    ///
    /// Returns true when the caller must reclaim the node.
    pub(crate) fn release_ref(&self) -> bool {
        self.update(|internal, claims| (internal.wrapping_sub(1), claims))
    }

    /// Retire a slot's claim, folding in the references taken through it.
    ///
    /// Returns true when the caller must reclaim the node. Retiring more
    /// claims than a node has is fatal `NODE_RECLAIMED`.
    pub(crate) fn retire_claim(&self, count_increase: i32) -> bool {
        self.update(|internal, claims| {
            let Some(claims) = claims.checked_sub(1) else {
                fatal::abort(
                    FatalCause::NodeReclaimed,
                    "queue node claim retired after both claims were gone",
                )
            };
            (internal.wrapping_add(count_increase as u32), claims)
        })
    }

    #[cfg(test)]
    fn snapshot(&self) -> (u32, u32) {
        unpack_counter(self.0.load(Ordering::Acquire))
    }

    fn update(&self, f: impl Fn(u32, u32) -> (u32, u32)) -> bool {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let (internal, claims) = unpack_counter(current);
            let (internal, claims) = f(internal, claims);
            let next = pack_counter(internal, claims);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return (internal & INTERNAL_MASK) == 0 && claims == 0,
                Err(actual) => current = actual,
            }
        }
    }
}

#[inline]
const fn pack_counter(internal: u32, claims: u32) -> u32 {
    ((internal & INTERNAL_MASK) << CLAIM_BITS) | (claims & CLAIM_MASK)
}

#[inline]
const fn unpack_counter(packed: u32) -> (u32, u32) {
    (packed >> CLAIM_BITS, packed & CLAIM_MASK)
}
