//! The shared context that every lock and thread id comes from.
//!
//! A [`KeelContext`] bundles the configuration, the fatal handler, the thread
//! registry and, when deadlock detection is on, the lock-order tracker.

use std::fmt;
use std::io;
use std::sync::Arc;

use keel_primitives::{FatalError, FatalHandler};

use crate::config::KeelConfig;
use crate::deadlock::{LockDependencyTracker, LockName};
use crate::lock::RwSpinLock;
use crate::thread::{ThreadId, ThreadIdentity, ThreadManager, ThreadRegistry};

/// Everything the locks of one process share.
///
/// Build one per process (or per test) and hand it around as an
/// `Arc<KeelContext>`. Locks keep their context alive.
pub struct KeelContext {
    config: KeelConfig,
    fatal: Arc<dyn FatalHandler>,
    registry: Arc<ThreadRegistry>,
    tracker: Option<LockDependencyTracker>,
    threads: ThreadManager,
}

impl KeelContext {
    /// Build a context using the fatal handler selected by `config.fatal`.
    pub fn new(config: KeelConfig) -> Arc<Self> {
        let fatal = config.fatal.handler();
        Self::with_fatal_handler(config, fatal)
    }

    /// Build a context that raises fatal conditions through `fatal`.
    pub fn with_fatal_handler(config: KeelConfig, fatal: Arc<dyn FatalHandler>) -> Arc<Self> {
        let registry = Arc::new(ThreadRegistry::new(Arc::clone(&fatal)));
        let tracker = config
            .deadlock_detection
            .then(|| LockDependencyTracker::new(Arc::clone(&fatal)));
        tracing::debug!(
            deadlock_detection = config.deadlock_detection,
            max_spin_count = config.lock.max_spin_count,
            acquire_timeout = ?config.lock.acquire_timeout,
            "keel context created"
        );

        Arc::new(Self {
            threads: ThreadManager::new(Arc::clone(&registry)),
            config,
            fatal,
            registry,
            tracker,
        })
    }

    pub fn config(&self) -> &KeelConfig {
        &self.config
    }

    /// The lock-order tracker, if deadlock detection is enabled.
    pub fn tracker(&self) -> Option<&LockDependencyTracker> {
        self.tracker.as_ref()
    }

    pub fn threads(&self) -> &ThreadManager {
        &self.threads
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn current_thread_id(&self) -> ThreadId {
        self.registry.current_thread_id()
    }

    /// Shorthand for `self.threads().launch(name, f)`.
    pub fn launch<F>(&self, name: impl Into<String>, f: F) -> io::Result<ThreadId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.threads.launch(name, f)
    }

    /// Raise a fatal condition through this context's handler.
    pub fn fatal(&self, error: FatalError) -> ! {
        self.fatal.fatal(error)
    }

    /// Create a lock named `name`.
    ///
    /// The deadlock detector identifies locks by name: locks created with the
    /// same name are one node of the lock-order graph.
    pub fn new_rw_lock(self: &Arc<Self>, name: impl Into<LockName>) -> RwSpinLock {
        RwSpinLock::new(name.into(), Arc::clone(self))
    }

    /// Create a lock named after the type `T` that embeds it.
    pub fn new_rw_lock_for<T: ?Sized>(self: &Arc<Self>) -> RwSpinLock {
        self.new_rw_lock(std::any::type_name::<T>())
    }
}

impl fmt::Debug for KeelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeelContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}
