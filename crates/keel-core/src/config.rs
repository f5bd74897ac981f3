//! Tuning knobs for locks and the context that creates them.

use std::time::Duration;

use keel_primitives::FatalMode;

/// Spin iterations between yields while waiting for a lock.
pub const DEFAULT_MAX_SPIN_COUNT: u32 = 5000;

/// How long an acquisition may wait before it is treated as a hang.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Acquisition policy shared by every lock of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Compare-and-swap attempts per spin round before yielding the thread.
    pub max_spin_count: u32,
    /// Total wall-clock budget of one acquisition. Exceeding it is fatal.
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_spin_count: DEFAULT_MAX_SPIN_COUNT,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl LockConfig {
    pub fn with_max_spin_count(mut self, max_spin_count: u32) -> Self {
        self.max_spin_count = max_spin_count.max(1);
        self
    }

    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }
}

/// Configuration of a [`KeelContext`](crate::KeelContext).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeelConfig {
    pub lock: LockConfig,
    /// Record lock-acquisition order and check it for cycles.
    ///
    /// On by default in debug builds only.
    pub deadlock_detection: bool,
    /// What happens when a fatal condition is raised.
    pub fatal: FatalMode,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            deadlock_detection: cfg!(debug_assertions),
            fatal: FatalMode::default(),
        }
    }
}

impl KeelConfig {
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = enabled;
        self
    }

    pub fn with_fatal(mut self, fatal: FatalMode) -> Self {
        self.fatal = fatal;
        self
    }
}
