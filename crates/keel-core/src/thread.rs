//! Thread identities and a minimal launch/join harness.
//!
//! Lock words store the owning writer in 16 bits, so threads that take locks
//! need a small non-zero id. A [`ThreadRegistry`] hands those out lazily, the
//! first time a thread asks, and remembers them for the thread's lifetime.
//!
//! Bindings live in a thread-local list with one entry per registry the
//! thread has used. Entries of dropped registries are pruned whenever the
//! thread binds a new id.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use keel_primitives::{FatalCause, FatalError, FatalHandler};
use parking_lot::Mutex;

/// Small integer identity of a thread, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU16);

impl ThreadId {
    /// Largest id a lock word can encode.
    pub const MAX: u16 = u16::MAX;

    pub fn new(raw: u16) -> Option<Self> {
        NonZeroU16::new(raw).map(Self)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Supplies the id of the calling thread.
///
/// The id must stay the same for the whole life of the thread.
pub trait ThreadIdentity: Send + Sync {
    fn current_thread_id(&self) -> ThreadId;
}

struct Binding {
    registry: Weak<()>,
    id: ThreadId,
}

impl Binding {
    fn is_for(&self, registry: &ThreadRegistry) -> bool {
        std::ptr::eq(self.registry.as_ptr(), Arc::as_ptr(&registry.alive))
    }
}

thread_local! {
    static BOUND_IDS: RefCell<Vec<Binding>> = const { RefCell::new(Vec::new()) };
}

/// Hands out thread ids, starting at 1.
pub struct ThreadRegistry {
    // Identity token for thread-local bindings; they hold it weakly.
    alive: Arc<()>,
    next: AtomicU32,
    fatal: Arc<dyn FatalHandler>,
}

impl ThreadRegistry {
    pub fn new(fatal: Arc<dyn FatalHandler>) -> Self {
        Self {
            alive: Arc::new(()),
            next: AtomicU32::new(1),
            fatal,
        }
    }

    /// Number of ids handed out so far.
    pub fn registered(&self) -> usize {
        let next = self.next.load(Ordering::Relaxed);
        (next - 1).min(ThreadId::MAX as u32) as usize
    }

    /// Take the next unused id without binding it to any thread.
    pub(crate) fn reserve(&self) -> ThreadId {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        match u16::try_from(raw).ok().and_then(ThreadId::new) {
            Some(id) => id,
            None => self.fatal.fatal(FatalError::new(
                FatalCause::ThreadIdExhausted,
                format!("more than {} threads asked for an id", ThreadId::MAX),
            )),
        }
    }

    /// Bind `id` to the calling thread.
    pub(crate) fn bind_current(&self, id: ThreadId) {
        BOUND_IDS.with(|bound| {
            let mut bound = bound.borrow_mut();
            bound.retain(|b| b.registry.strong_count() > 0 && !b.is_for(self));
            bound.push(Binding {
                registry: Arc::downgrade(&self.alive),
                id,
            });
        });
    }

    fn bound_id(&self) -> Option<ThreadId> {
        BOUND_IDS.with(|bound| bound.borrow().iter().find(|b| b.is_for(self)).map(|b| b.id))
    }
}

impl ThreadIdentity for ThreadRegistry {
    fn current_thread_id(&self) -> ThreadId {
        if let Some(id) = self.bound_id() {
            return id;
        }
        let id = self.reserve();
        self.bind_current(id);
        tracing::trace!(thread = %id, "assigned thread id");
        id
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("registered", &self.registered())
            .finish()
    }
}

/// Launches named threads with a pre-assigned id and joins them.
///
/// Threads that are never joined are detached when the manager is dropped.
pub struct ThreadManager {
    registry: Arc<ThreadRegistry>,
    handles: Mutex<Vec<(ThreadId, JoinHandle<()>)>>,
}

impl ThreadManager {
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self {
            registry,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `f` on a new OS thread and return the id it runs under.
    ///
    /// The body runs inside a `thread` tracing span carrying the id.
    pub fn launch<F>(&self, name: impl Into<String>, f: F) -> io::Result<ThreadId>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let id = self.registry.reserve();
        let registry = Arc::clone(&self.registry);
        let span = tracing::info_span!("thread", id = id.get(), name = %name);

        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                registry.bind_current(id);
                let _entered = span.enter();
                tracing::debug!("thread started");
                f();
                tracing::debug!("thread finished");
            })?;

        self.handles.lock().push((id, handle));
        Ok(id)
    }

    /// Wait for every launched thread, including ones launched while waiting.
    ///
    /// Returns how many of them panicked.
    pub fn join(&self) -> usize {
        let mut panicked = 0;
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return panicked;
            }
            for (id, handle) in handles {
                if let Err(payload) = handle.join() {
                    panicked += 1;
                    tracing::warn!(thread = %id, reason = panic_message(&*payload), "thread panicked");
                }
            }
        }
    }

    /// Threads launched and not yet joined.
    pub fn pending(&self) -> usize {
        self.handles.lock().len()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_primitives::PanicHandler;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> Arc<ThreadRegistry> {
        Arc::new(ThreadRegistry::new(Arc::new(PanicHandler)))
    }

    #[test]
    fn ids_start_at_one_and_are_stable() {
        let registry = registry();
        let first = registry.current_thread_id();
        assert_eq!(first.get(), 1);
        assert_eq!(registry.current_thread_id(), first);

        let other = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || registry.current_thread_id())
                .join()
                .unwrap()
        };
        assert_eq!(other.get(), 2);
        assert_eq!(registry.registered(), 2);
    }

    #[test]
    fn registries_are_independent() {
        let a = registry();
        let b = registry();
        a.reserve();
        a.reserve();
        assert_eq!(a.current_thread_id().get(), 3);
        assert_eq!(b.current_thread_id().get(), 1);
        assert_eq!(a.current_thread_id().get(), 3);
    }

    #[test]
    fn bindings_of_dropped_registries_are_pruned() {
        fn bound_count() -> usize {
            BOUND_IDS.with(|bound| bound.borrow().len())
        }

        // A fresh thread starts with no bindings.
        std::thread::spawn(|| {
            for _ in 0..100 {
                let registry = registry();
                assert_eq!(registry.current_thread_id().get(), 1);
                assert!(bound_count() <= 2);
            }

            let kept = registry();
            kept.current_thread_id();
            let dropped = registry();
            dropped.current_thread_id();
            assert_eq!(bound_count(), 2);
            drop(dropped);

            let next = registry();
            next.current_thread_id();
            assert_eq!(bound_count(), 2);
            assert_eq!(kept.current_thread_id().get(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "THREAD_ID_EXHAUSTED")]
    fn exhausting_ids_is_fatal() {
        let registry = registry();
        registry.next.store(ThreadId::MAX as u32 + 1, Ordering::Relaxed);
        registry.current_thread_id();
    }

    #[test]
    fn launched_threads_see_their_reserved_id() {
        let registry = registry();
        let manager = ThreadManager::new(Arc::clone(&registry));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut launched = Vec::new();
        for i in 0..4 {
            let registry = Arc::clone(&registry);
            let seen = Arc::clone(&seen);
            let id = manager
                .launch(format!("worker-{i}"), move || {
                    seen.lock().push(registry.current_thread_id());
                })
                .unwrap();
            launched.push(id);
        }
        assert_eq!(manager.join(), 0);
        assert_eq!(manager.pending(), 0);

        let mut seen = seen.lock().clone();
        seen.sort();
        launched.sort();
        assert_eq!(seen, launched);
    }

    #[test]
    fn join_counts_panicked_threads() {
        let manager = ThreadManager::new(registry());
        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let ran = Arc::clone(&ran);
            manager
                .launch(format!("t{i}"), move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                    if i == 1 {
                        panic!("boom");
                    }
                })
                .unwrap();
        }
        assert_eq!(manager.join(), 1);
        assert_eq!(ran.load(Ordering::Relaxed), 3);
    }
}
