//! Runtime lock-order tracking.
//!
//! Every thread has a stack of the locks it currently holds. When a thread
//! acquires lock `B` while its most recent lock is `A`, the edge `A -> B` is
//! added to a process-wide lock-order graph. Two threads that take the same
//! pair of locks in opposite orders put a cycle into that graph, whether or not
//! their timing ever made them block on each other. The cycle is reported the
//! moment the closing edge appears.
//!
//! Locks are identified by name. Two lock instances that share a name share a
//! node in the graph.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use keel_primitives::{FatalCause, FatalError, FatalHandler};
use parking_lot::Mutex;

use crate::thread::ThreadId;

/// Name of a lock, cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockName(Arc<str>);

impl LockName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for LockName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// How a lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    Write,
}

/// A cycle in the lock-order graph.
///
/// `locks()[i + 1]` was acquired while `locks()[i]` was held, and the first
/// lock was acquired while the last was held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockCycle {
    locks: Vec<LockName>,
}

impl DeadlockCycle {
    pub fn locks(&self) -> &[LockName] {
        &self.locks
    }

    /// Each `(held, acquired)` pair of the cycle, closing edge last.
    pub fn edges(&self) -> impl Iterator<Item = (&LockName, &LockName)> {
        let next = self.locks.iter().cycle().skip(1);
        self.locks.iter().zip(next)
    }
}

impl fmt::Display for DeadlockCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for lock in &self.locks {
            write!(f, "{lock} -> ")?;
        }
        match self.locks.first() {
            Some(first) => write!(f, "{first}"),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HeldLock {
    id: u32,
    mode: LockMode,
}

#[derive(Default)]
struct TrackerState {
    ids: HashMap<LockName, u32>,
    names: Vec<LockName>,
    /// `order[a]` holds every lock ever acquired directly after `a`.
    order: Vec<BTreeSet<u32>>,
    edges: usize,
    held: HashMap<ThreadId, Vec<HeldLock>>,
}

impl TrackerState {
    fn resolve(&mut self, name: &LockName) -> u32 {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.ids.insert(name.clone(), id);
        self.names.push(name.clone());
        self.order.push(BTreeSet::new());
        tracing::debug!(lock = %name, id, "registered lock");
        id
    }

    fn push(&mut self, thread: ThreadId, name: &LockName, mode: LockMode) -> Result<(), FatalError> {
        let id = self.resolve(name);

        let stack = self.held.get(&thread).map(Vec::as_slice).unwrap_or_default();
        let held_read = stack.iter().any(|h| h.id == id && h.mode == LockMode::Read);
        let held_write = stack.iter().any(|h| h.id == id && h.mode == LockMode::Write);
        let previous = stack.last().map(|h| h.id);

        if mode == LockMode::Write && held_read && !held_write {
            return Err(FatalError::new(
                FatalCause::ReadThenWrite,
                format!("{thread} asked for write access to {name} while holding it for read"),
            ));
        }

        // Re-entering a lock the thread already holds never blocks, wherever
        // it sits in the stack.
        let reentrant = held_read || held_write;
        if let Some(previous) = previous.filter(|_| !reentrant) {
            if self.order[previous as usize].insert(id) {
                self.edges += 1;
                tracing::debug!(
                    thread = %thread,
                    from = %self.names[previous as usize],
                    to = %name,
                    "new lock order"
                );

                if let Some(cycle) = self.find_cycle() {
                    self.order[previous as usize].remove(&id);
                    self.edges -= 1;
                    tracing::error!(thread = %thread, cycle = %cycle, "lock order cycle");
                    return Err(FatalError::new(FatalCause::DeadlockDetected, cycle.to_string()));
                }
            }
        }

        self.held.entry(thread).or_default().push(HeldLock { id, mode });
        Ok(())
    }

    fn pop(&mut self, thread: ThreadId, name: &LockName) -> Result<(), FatalError> {
        let top = self.held.get(&thread).and_then(|stack| stack.last()).copied();
        let Some(top) = top else {
            return Err(FatalError::new(
                FatalCause::MultipleUnlock,
                format!("{thread} released {name} while holding no lock"),
            ));
        };

        if self.ids.get(name) != Some(&top.id) {
            return Err(FatalError::new(
                FatalCause::InvalidUnlock,
                format!(
                    "{thread} released {name} but its most recent lock is {}",
                    self.names[top.id as usize]
                ),
            ));
        }

        if let Some(stack) = self.held.get_mut(&thread) {
            stack.pop();
            if stack.is_empty() {
                self.held.remove(&thread);
            }
        }
        Ok(())
    }

    /// Depth-first search over every lock, looking for a back edge.
    fn find_cycle(&self) -> Option<DeadlockCycle> {
        let mut search = CycleSearch {
            order: &self.order,
            discovered: vec![None; self.order.len()],
            finished: vec![false; self.order.len()],
            parent: vec![None; self.order.len()],
            next_discovery: 0,
        };

        for root in 0..self.order.len() as u32 {
            if search.discovered[root as usize].is_some() {
                continue;
            }
            if let Some((here, there)) = search.visit(root) {
                let mut path = vec![here];
                let mut now = here;
                while now != there {
                    // Every node on the DFS path except the root has a parent,
                    // and `there` is an ancestor of `here`.
                    let Some(parent) = search.parent[now as usize] else {
                        break;
                    };
                    path.push(parent);
                    now = parent;
                }
                path.reverse();
                let locks = path
                    .into_iter()
                    .map(|id| self.names[id as usize].clone())
                    .collect();
                return Some(DeadlockCycle { locks });
            }
        }
        None
    }
}

struct CycleSearch<'a> {
    order: &'a [BTreeSet<u32>],
    discovered: Vec<Option<u32>>,
    finished: Vec<bool>,
    parent: Vec<Option<u32>>,
    next_discovery: u32,
}

impl CycleSearch<'_> {
    /// Returns the first back edge `(here, there)` reachable from `here`.
    fn visit(&mut self, here: u32) -> Option<(u32, u32)> {
        self.discovered[here as usize] = Some(self.next_discovery);
        self.next_discovery += 1;

        let order = self.order;
        for &there in &order[here as usize] {
            match self.discovered[there as usize] {
                None => {
                    self.parent[there as usize] = Some(here);
                    if let Some(edge) = self.visit(there) {
                        return Some(edge);
                    }
                }
                // Forward and cross edges point at finished nodes.
                Some(_) if !self.finished[there as usize] => return Some((here, there)),
                Some(_) => {}
            }
        }

        self.finished[here as usize] = true;
        None
    }
}

/// Records which locks each thread holds and the order they were taken in.
pub struct LockDependencyTracker {
    state: Mutex<TrackerState>,
    fatal: Arc<dyn FatalHandler>,
}

impl LockDependencyTracker {
    pub fn new(fatal: Arc<dyn FatalHandler>) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            fatal,
        }
    }

    /// Record that `thread` is about to acquire `name`.
    ///
    /// Raises `DEADLOCK_DETECTED` if this acquisition closes a cycle in the
    /// lock-order graph and `READ_THEN_WRITE` on a read-to-write upgrade. In
    /// both cases nothing is recorded for the rejected acquisition.
    pub fn push_lock(&self, thread: ThreadId, name: &LockName, mode: LockMode) {
        let result = self.state.lock().push(thread, name, mode);
        if let Err(error) = result {
            self.fatal.fatal(error);
        }
    }

    /// Record that `thread` released `name`.
    ///
    /// Locks must be released in the reverse order they were acquired in.
    pub fn pop_lock(&self, thread: ThreadId, name: &LockName) {
        let result = self.state.lock().pop(thread, name);
        if let Err(error) = result {
            self.fatal.fatal(error);
        }
    }

    /// Distinct lock names seen so far.
    pub fn lock_count(&self) -> usize {
        self.state.lock().names.len()
    }

    /// Edges in the lock-order graph.
    pub fn edge_count(&self) -> usize {
        self.state.lock().edges
    }

    /// Whether `to` has ever been acquired directly while `from` was held.
    pub fn has_edge(&self, from: &LockName, to: &LockName) -> bool {
        let state = self.state.lock();
        match (state.ids.get(from), state.ids.get(to)) {
            (Some(&from), Some(&to)) => state.order[from as usize].contains(&to),
            _ => false,
        }
    }

    /// Locks `thread` holds, oldest first.
    pub fn held_by(&self, thread: ThreadId) -> Vec<(LockName, LockMode)> {
        let state = self.state.lock();
        state
            .held
            .get(&thread)
            .map(|stack| {
                stack
                    .iter()
                    .map(|h| (state.names[h.id as usize].clone(), h.mode))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for LockDependencyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockDependencyTracker")
            .field("locks", &state.names.len())
            .field("edges", &state.edges)
            .field("threads_holding", &state.held.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_primitives::PanicHandler;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn tracker() -> LockDependencyTracker {
        LockDependencyTracker::new(Arc::new(PanicHandler))
    }

    fn tid(raw: u16) -> ThreadId {
        ThreadId::new(raw).unwrap()
    }

    fn name(s: &str) -> LockName {
        LockName::from(s)
    }

    fn panic_text(result: std::thread::Result<()>) -> String {
        let payload = result.expect_err("expected a fatal panic");
        payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_default()
    }

    #[test]
    fn nested_acquisition_records_an_edge() {
        let tracker = tracker();
        let (a, b) = (name("A"), name("B"));
        tracker.push_lock(tid(1), &a, LockMode::Write);
        tracker.push_lock(tid(1), &b, LockMode::Read);
        assert_eq!(tracker.held_by(tid(1)), vec![(a.clone(), LockMode::Write), (b.clone(), LockMode::Read)]);
        tracker.pop_lock(tid(1), &b);
        tracker.pop_lock(tid(1), &a);

        assert_eq!(tracker.lock_count(), 2);
        assert_eq!(tracker.edge_count(), 1);
        assert!(tracker.has_edge(&a, &b));
        assert!(!tracker.has_edge(&b, &a));
        assert!(tracker.held_by(tid(1)).is_empty());
    }

    #[test]
    fn same_order_on_many_threads_is_fine() {
        let tracker = tracker();
        for t in 1..=4 {
            tracker.push_lock(tid(t), &name("A"), LockMode::Write);
            tracker.push_lock(tid(t), &name("B"), LockMode::Write);
            tracker.push_lock(tid(t), &name("C"), LockMode::Write);
        }
        for t in 1..=4 {
            tracker.pop_lock(tid(t), &name("C"));
            tracker.pop_lock(tid(t), &name("B"));
            tracker.pop_lock(tid(t), &name("A"));
        }
        assert_eq!(tracker.edge_count(), 2);
    }

    #[test]
    fn opposite_order_is_a_cycle() {
        let tracker = tracker();
        tracker.push_lock(tid(1), &name("X"), LockMode::Write);
        tracker.push_lock(tid(1), &name("Y"), LockMode::Write);
        tracker.pop_lock(tid(1), &name("Y"));
        tracker.pop_lock(tid(1), &name("X"));

        tracker.push_lock(tid(2), &name("Y"), LockMode::Write);
        let text = panic_text(catch_unwind(AssertUnwindSafe(|| {
            tracker.push_lock(tid(2), &name("X"), LockMode::Write);
        })));
        assert!(text.starts_with("DEADLOCK_DETECTED"), "{text}");
        assert!(text.contains("X -> Y -> X") || text.contains("Y -> X -> Y"), "{text}");

        // The rejected acquisition left no trace.
        assert_eq!(tracker.held_by(tid(2)), vec![(name("Y"), LockMode::Write)]);
        assert!(!tracker.has_edge(&name("Y"), &name("X")));
        assert_eq!(tracker.edge_count(), 1);
    }

    #[test]
    fn longer_cycles_are_reported_in_order() {
        let tracker = tracker();
        for (t, (a, b)) in [("A", "B"), ("B", "C"), ("C", "D")].into_iter().enumerate() {
            let t = tid(t as u16 + 1);
            tracker.push_lock(t, &name(a), LockMode::Write);
            tracker.push_lock(t, &name(b), LockMode::Write);
            tracker.pop_lock(t, &name(b));
            tracker.pop_lock(t, &name(a));
        }

        tracker.push_lock(tid(9), &name("D"), LockMode::Read);
        let text = panic_text(catch_unwind(AssertUnwindSafe(|| {
            tracker.push_lock(tid(9), &name("A"), LockMode::Read);
        })));
        assert!(text.contains("A -> B -> C -> D -> A"), "{text}");
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        // A -> B -> D and A -> C -> D produce a cross edge, not a back edge.
        let tracker = tracker();
        for path in [["A", "B", "D"], ["A", "C", "D"]] {
            for lock in path {
                tracker.push_lock(tid(1), &name(lock), LockMode::Write);
            }
            for lock in path.iter().rev() {
                tracker.pop_lock(tid(1), &name(lock));
            }
        }
        assert_eq!(tracker.edge_count(), 4);
    }

    #[test]
    fn cycle_edges_close_the_loop() {
        let cycle = DeadlockCycle {
            locks: vec![name("X"), name("Y"), name("Z")],
        };
        let edges: Vec<_> = cycle
            .edges()
            .map(|(a, b)| (a.as_str().to_owned(), b.as_str().to_owned()))
            .collect();
        assert_eq!(
            edges,
            vec![
                ("X".to_owned(), "Y".to_owned()),
                ("Y".to_owned(), "Z".to_owned()),
                ("Z".to_owned(), "X".to_owned()),
            ]
        );
        assert_eq!(cycle.to_string(), "X -> Y -> Z -> X");
    }

    #[test]
    fn reentrant_acquisition_adds_no_edge() {
        let tracker = tracker();
        tracker.push_lock(tid(1), &name("X"), LockMode::Write);
        tracker.push_lock(tid(1), &name("Y"), LockMode::Write);
        tracker.push_lock(tid(1), &name("X"), LockMode::Write);
        tracker.push_lock(tid(1), &name("X"), LockMode::Read);
        assert_eq!(tracker.edge_count(), 1);
        for lock in ["X", "X", "Y", "X"] {
            tracker.pop_lock(tid(1), &name(lock));
        }
    }

    #[test]
    fn reacquiring_a_lock_below_the_top_adds_no_edge() {
        let tracker = tracker();
        tracker.push_lock(tid(1), &name("X"), LockMode::Write);
        tracker.push_lock(tid(1), &name("Y"), LockMode::Write);
        // X is held under Y: taking it again must not record Y -> X.
        tracker.push_lock(tid(1), &name("X"), LockMode::Write);
        tracker.push_lock(tid(1), &name("X"), LockMode::Read);
        assert!(tracker.has_edge(&name("X"), &name("Y")));
        assert!(!tracker.has_edge(&name("Y"), &name("X")));
        assert_eq!(tracker.edge_count(), 1);
        assert_eq!(tracker.held_by(tid(1)).len(), 4);
        for lock in ["X", "X", "Y", "X"] {
            tracker.pop_lock(tid(1), &name(lock));
        }

        // Y keeps its own outgoing edges.
        tracker.push_lock(tid(2), &name("Y"), LockMode::Read);
        tracker.push_lock(tid(2), &name("Z"), LockMode::Read);
        assert!(tracker.has_edge(&name("Y"), &name("Z")));
        assert_eq!(tracker.edge_count(), 2);
        tracker.pop_lock(tid(2), &name("Z"));
        tracker.pop_lock(tid(2), &name("Y"));
    }

    #[test]
    #[should_panic(expected = "READ_THEN_WRITE")]
    fn read_then_write_is_fatal() {
        let tracker = tracker();
        tracker.push_lock(tid(1), &name("X"), LockMode::Read);
        tracker.push_lock(tid(1), &name("X"), LockMode::Write);
    }

    #[test]
    #[should_panic(expected = "MULTIPLE_UNLOCK")]
    fn pop_without_push_is_fatal() {
        tracker().pop_lock(tid(1), &name("X"));
    }

    #[test]
    #[should_panic(expected = "INVALID_UNLOCK")]
    fn out_of_order_pop_is_fatal() {
        let tracker = tracker();
        tracker.push_lock(tid(1), &name("X"), LockMode::Write);
        tracker.push_lock(tid(1), &name("Y"), LockMode::Write);
        tracker.pop_lock(tid(1), &name("X"));
    }

    #[test]
    fn stacks_are_per_thread() {
        let tracker = tracker();
        tracker.push_lock(tid(1), &name("X"), LockMode::Write);
        tracker.push_lock(tid(2), &name("Y"), LockMode::Write);
        // Thread 2 releasing Y does not look at thread 1's X.
        tracker.pop_lock(tid(2), &name("Y"));
        tracker.pop_lock(tid(1), &name("X"));
        assert_eq!(tracker.edge_count(), 0);
    }
}
