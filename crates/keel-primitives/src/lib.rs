//! Lock-free containers for a multi-threaded server.
//!
//! # Primitives
//!
//! - [`LockFreeStack`]: LIFO stack with split reference counting
//! - [`LockFreeQueue`]: FIFO queue with split reference counting on head and tail
//! - [`BlockingQueue`] / [`BlockingStack`]: mutex + condvar reference containers
//!
//! Nodes of the lock-free containers live in an index-addressed arena, so a
//! node reference and its external count fit in one `AtomicU64`. Every node is
//! returned to the arena exactly once; [`ReclaimStats`] exposes the counters.
//!
//! Broken invariants are raised through [`fatal`], which terminates the
//! process instead of returning an error.
//!
//! # Loom Testing
//!
//! Enable the `loom` feature for concurrency verification:
//!
//! ```text
//! cargo test -p keel-primitives --features loom --release
//! ```

pub mod arena;
pub mod blocking;
mod counted;
pub mod fatal;
pub mod queue;
pub mod stack;
pub mod sync;

pub use arena::{ReclaimStats, SlotState};
pub use blocking::{Blocking, BlockingQueue, BlockingStack, Discipline, Fifo, Lifo};
pub use fatal::{AbortHandler, FatalCause, FatalError, FatalHandler, FatalMode, PanicHandler};
pub use queue::LockFreeQueue;
pub use stack::LockFreeStack;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
