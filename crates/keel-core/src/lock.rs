//! Reentrant reader-writer spin lock.
//!
//! The whole lock state is one `AtomicU32`:
//!
//! ```text
//! 31            16 15             0
//! +---------------+---------------+
//! | writer thread |  reader count |
//! +---------------+---------------+
//! ```
//!
//! A writer id of zero means nobody holds exclusive access. Readers from other
//! threads can only join while the writer field is zero. The writing thread
//! may take the lock again for write (tracked by a separate reentrancy count)
//! or for read (bumping the reader field directly). Taking write access while
//! holding only read access is not supported.
//!
//! Acquisition spins for `max_spin_count` attempts, then yields between
//! rounds. An acquisition still waiting after `acquire_timeout` is treated as
//! a hang and raises `LOCK_TIMEOUT`.

use std::fmt;
use std::hint::spin_loop;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use keel_primitives::{FatalCause, FatalError};
use static_assertions::{assert_impl_all, assert_not_impl_any};

use crate::context::KeelContext;
use crate::deadlock::{LockMode, LockName};
use crate::thread::ThreadId;

const WRITE_THREAD_MASK: u32 = 0xFFFF_0000;
const READ_COUNT_MASK: u32 = 0x0000_FFFF;
const WRITER_SHIFT: u32 = 16;
const EMPTY_FLAG: u32 = 0;

fn writer_of(word: u32) -> u16 {
    ((word & WRITE_THREAD_MASK) >> WRITER_SHIFT) as u16
}

fn readers_of(word: u32) -> u32 {
    word & READ_COUNT_MASK
}

/// A named, reentrant reader-writer spin lock.
///
/// Created through [`KeelContext::new_rw_lock`]. The lock guards no data of
/// its own; it is embedded next to the state it protects.
pub struct RwSpinLock {
    word: AtomicU32,
    /// Write acquisitions by the current writer. Only the writer touches it.
    write_count: AtomicU32,
    name: LockName,
    context: Arc<KeelContext>,
}

assert_impl_all!(RwSpinLock: Send, Sync);
assert_not_impl_any!(ReadLockGuard<'static>: Send, Sync);
assert_not_impl_any!(WriteLockGuard<'static>: Send, Sync);

impl RwSpinLock {
    pub(crate) fn new(name: LockName, context: Arc<KeelContext>) -> Self {
        Self {
            word: AtomicU32::new(EMPTY_FLAG),
            write_count: AtomicU32::new(0),
            name,
            context,
        }
    }

    pub fn name(&self) -> &LockName {
        &self.name
    }

    /// Thread currently holding exclusive access.
    pub fn writer(&self) -> Option<ThreadId> {
        ThreadId::new(writer_of(self.word.load(Ordering::Relaxed)))
    }

    /// Shared holders currently recorded, including the writer's own reads.
    pub fn reader_count(&self) -> u32 {
        readers_of(self.word.load(Ordering::Relaxed))
    }

    /// Acquire exclusive access and hold it until the guard is dropped.
    pub fn write(&self) -> WriteLockGuard<'_> {
        self.write_lock();
        WriteLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire shared access and hold it until the guard is dropped.
    pub fn read(&self) -> ReadLockGuard<'_> {
        self.read_lock();
        ReadLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Acquire exclusive access. Must be paired with [`write_unlock`](Self::write_unlock).
    pub fn write_lock(&self) {
        let thread = self.context.current_thread_id();
        if let Some(tracker) = self.context.tracker() {
            tracker.push_lock(thread, &self.name, LockMode::Write);
        }

        if writer_of(self.word.load(Ordering::Relaxed)) == thread.get() {
            let depth = self.write_count.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::trace!(lock = %self.name, thread = %thread, depth, "write lock re-entered");
            return;
        }

        let desired = u32::from(thread.get()) << WRITER_SHIFT;
        self.acquire(thread, LockMode::Write, || {
            self.word
                .compare_exchange_weak(EMPTY_FLAG, desired, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        });
        self.write_count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(lock = %self.name, thread = %thread, "write lock acquired");
    }

    /// Release one level of exclusive access.
    pub fn write_unlock(&self) {
        let thread = self.context.current_thread_id();
        let word = self.word.load(Ordering::Relaxed);

        if writer_of(word) != thread.get() {
            self.context.fatal(FatalError::new(
                FatalCause::InvalidUnlock,
                format!(
                    "{thread} released write access to {} held by {}",
                    self.name,
                    describe_writer(writer_of(word))
                ),
            ));
        }
        if readers_of(word) != 0 {
            self.context.fatal(FatalError::new(
                FatalCause::InvalidUnlockOrder,
                format!(
                    "{thread} released write access to {} with {} read acquisitions outstanding",
                    self.name,
                    readers_of(word)
                ),
            ));
        }

        if let Some(tracker) = self.context.tracker() {
            tracker.pop_lock(thread, &self.name);
        }

        if self.write_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.word.store(EMPTY_FLAG, Ordering::Release);
            tracing::trace!(lock = %self.name, thread = %thread, "write lock released");
        }
    }

    /// Acquire shared access. Must be paired with [`read_unlock`](Self::read_unlock).
    pub fn read_lock(&self) {
        let thread = self.context.current_thread_id();
        if let Some(tracker) = self.context.tracker() {
            tracker.push_lock(thread, &self.name, LockMode::Read);
        }

        // The writer's own reads: nobody else can touch the word meanwhile.
        let word = self.word.load(Ordering::Relaxed);
        if writer_of(word) == thread.get() {
            if readers_of(word) == READ_COUNT_MASK {
                self.fail(
                    thread,
                    FatalCause::ReaderOverflow,
                    format!("{thread} re-entered {} for read too many times", self.name),
                );
            }
            self.word.fetch_add(1, Ordering::Acquire);
            tracing::trace!(lock = %self.name, thread = %thread, "read lock taken by writer");
            return;
        }

        self.acquire(thread, LockMode::Read, || {
            // Only a word with no writer is a valid expectation.
            let expected = readers_of(self.word.load(Ordering::Relaxed));
            expected != READ_COUNT_MASK
                && self
                    .word
                    .compare_exchange_weak(expected, expected + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
        });
        tracing::trace!(lock = %self.name, thread = %thread, "read lock acquired");
    }

    /// Release one shared acquisition.
    pub fn read_unlock(&self) {
        let thread = self.context.current_thread_id();
        if let Some(tracker) = self.context.tracker() {
            tracker.pop_lock(thread, &self.name);
        }

        let released = self
            .word
            .fetch_update(Ordering::Release, Ordering::Relaxed, |word| {
                (readers_of(word) > 0).then(|| word - 1)
            });
        if released.is_err() {
            self.context.fatal(FatalError::new(
                FatalCause::MultipleUnlock,
                format!("{thread} released read access to {} with no readers recorded", self.name),
            ));
        }
        tracing::trace!(lock = %self.name, thread = %thread, "read lock released");
    }

    /// Spin, then yield, until `try_once` succeeds or the deadline passes.
    fn acquire(&self, thread: ThreadId, mode: LockMode, mut try_once: impl FnMut() -> bool) {
        let config = self.context.config().lock;
        let started = Instant::now();
        let mut yielded = false;

        loop {
            for _ in 0..config.max_spin_count {
                if try_once() {
                    return;
                }
                spin_loop();
            }

            let waited = started.elapsed();
            if waited >= config.acquire_timeout {
                self.fail(
                    thread,
                    FatalCause::LockTimeout,
                    format!(
                        "{thread} waited {waited:?} for {mode:?} access to {} (writer: {}, readers: {})",
                        self.name,
                        describe_writer(writer_of(self.word.load(Ordering::Relaxed))),
                        self.reader_count()
                    ),
                );
            }

            if !yielded {
                yielded = true;
                tracing::debug!(lock = %self.name, thread = %thread, ?mode, "lock contended, yielding");
            }
            std::thread::yield_now();
        }
    }

    /// Abandon an acquisition the tracker already recorded.
    fn fail(&self, thread: ThreadId, cause: FatalCause, detail: String) -> ! {
        if let Some(tracker) = self.context.tracker() {
            tracker.pop_lock(thread, &self.name);
        }
        self.context.fatal(FatalError::new(cause, detail))
    }
}

fn describe_writer(raw: u16) -> String {
    match ThreadId::new(raw) {
        Some(id) => id.to_string(),
        None => "nobody".to_owned(),
    }
}

impl fmt::Debug for RwSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwSpinLock")
            .field("name", &self.name)
            .field("writer", &self.writer())
            .field("readers", &self.reader_count())
            .finish()
    }
}

/// Shared access to an [`RwSpinLock`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReadLockGuard<'a> {
    lock: &'a RwSpinLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ReadLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_unlock();
    }
}

impl fmt::Debug for ReadLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadLockGuard").field(&self.lock.name).finish()
    }
}

/// Exclusive access to an [`RwSpinLock`], released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct WriteLockGuard<'a> {
    lock: &'a RwSpinLock,
    _not_send: PhantomData<*const ()>,
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

impl fmt::Debug for WriteLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WriteLockGuard").field(&self.lock.name).finish()
    }
}
