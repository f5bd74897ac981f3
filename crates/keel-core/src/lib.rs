//! Reentrant reader-writer spin lock with lock-order deadlock detection.
//!
//! Everything hangs off a [`KeelContext`], built once from a [`KeelConfig`]:
//!
//! - [`RwSpinLock`]: a named, reentrant reader-writer lock packed into one
//!   `AtomicU32`, with scoped [`ReadLockGuard`] / [`WriteLockGuard`]
//! - [`LockDependencyTracker`]: per-thread held-lock stacks plus a
//!   process-wide lock-order graph, checked for cycles on every new edge
//! - [`ThreadRegistry`] / [`ThreadManager`]: small per-thread ids for the
//!   lock word, and a launch/join harness
//!
//! Misuse (unbalanced or out-of-order unlocks), acquisitions that never
//! complete and lock-order cycles are fatal. They go through the context's
//! [`FatalHandler`](keel_primitives::FatalHandler), which aborts the process
//! unless the context was configured with [`FatalMode::Panic`].
//!
//! ```no_run
//! use keel_core::{KeelConfig, KeelContext};
//!
//! let ctx = KeelContext::new(KeelConfig::default().with_deadlock_detection(true));
//! let accounts = ctx.new_rw_lock("accounts");
//! let users = ctx.new_rw_lock("users");
//!
//! let _a = accounts.write();
//! let _u = users.read(); // records accounts -> users
//! ```

pub mod config;
pub mod context;
pub mod deadlock;
pub mod lock;
pub mod thread;

pub use config::{DEFAULT_ACQUIRE_TIMEOUT, DEFAULT_MAX_SPIN_COUNT, KeelConfig, LockConfig};
pub use context::KeelContext;
pub use deadlock::{DeadlockCycle, LockDependencyTracker, LockMode, LockName};
pub use keel_primitives::{FatalCause, FatalError, FatalMode};
pub use lock::{ReadLockGuard, RwSpinLock, WriteLockGuard};
pub use thread::{ThreadId, ThreadIdentity, ThreadManager, ThreadRegistry};
