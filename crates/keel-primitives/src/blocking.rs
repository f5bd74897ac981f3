//! Mutex and condition-variable backed containers.
//!
//! These are the reference implementations the lock-free containers are
//! checked against. One coarse lock guards everything; `push` wakes exactly
//! one waiter.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Which element a container hands out next.
pub trait Discipline<T>: Default {
    fn put(&mut self, value: T);
    fn take(&mut self) -> Option<T>;
    fn len(&self) -> usize;
}

/// First in, first out.
pub struct Fifo<T>(VecDeque<T>);

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self(VecDeque::new())
    }
}

impl<T> Discipline<T> for Fifo<T> {
    fn put(&mut self, value: T) {
        self.0.push_back(value);
    }

    fn take(&mut self) -> Option<T> {
        self.0.pop_front()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Last in, first out.
pub struct Lifo<T>(Vec<T>);

impl<T> Default for Lifo<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> Discipline<T> for Lifo<T> {
    fn put(&mut self, value: T) {
        self.0.push(value);
    }

    fn take(&mut self) -> Option<T> {
        self.0.pop()
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// A container whose consumers can block until an element is available.
pub struct Blocking<T, D: Discipline<T>> {
    items: Mutex<D>,
    available: Condvar,
    _marker: PhantomData<fn(T) -> T>,
}

/// Blocking FIFO queue.
pub type BlockingQueue<T> = Blocking<T, Fifo<T>>;

/// Blocking LIFO stack.
pub type BlockingStack<T> = Blocking<T, Lifo<T>>;

impl<T, D: Discipline<T>> Default for Blocking<T, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, D: Discipline<T>> Blocking<T, D> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(D::default()),
            available: Condvar::new(),
            _marker: PhantomData,
        }
    }

    pub fn push(&self, value: T) {
        let mut items = self.items.lock();
        items.put(value);
        self.available.notify_one();
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().take()
    }

    /// Block until an element is available and take it.
    pub fn wait_pop(&self) -> T {
        let mut items = self.items.lock();
        loop {
            if let Some(value) = items.take() {
                return value;
            }
            self.available.wait(&mut items);
        }
    }

    /// Like [`wait_pop`](Self::wait_pop), giving up after `timeout`.
    pub fn wait_pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(value) = items.take() {
                return Some(value);
            }
            if self.available.wait_until(&mut items, deadline).timed_out() {
                return items.take();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
