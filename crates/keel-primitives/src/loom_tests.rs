#![cfg(all(test, feature = "loom"))]

use crate::queue::LockFreeQueue;
use crate::stack::LockFreeStack;
use crate::sync::thread;
use loom::sync::Arc;

#[test]
fn stack_concurrent_push_pop() {
    loom::model(|| {
        let stack = Arc::new(LockFreeStack::new());
        stack.push(1u32);

        let pusher = thread::spawn({
            let stack = stack.clone();
            move || stack.push(2)
        });

        let popper = thread::spawn({
            let stack = stack.clone();
            move || stack.try_pop()
        });

        pusher.join().unwrap();
        let popped = popper.join().unwrap();
        assert!(popped.is_some());

        let mut seen = vec![popped.unwrap()];
        while let Some(v) = stack.try_pop() {
            seen.push(v);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(stack.stats().live(), 0);
    });
}

#[test]
fn stack_racing_pops_take_each_node_once() {
    loom::model(|| {
        let stack = Arc::new(LockFreeStack::new());
        stack.push(1u32);
        stack.push(2u32);

        let t1 = thread::spawn({
            let stack = stack.clone();
            move || stack.try_pop()
        });
        let t2 = thread::spawn({
            let stack = stack.clone();
            move || stack.try_pop()
        });

        let mut seen = vec![t1.join().unwrap().unwrap(), t2.join().unwrap().unwrap()];
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        assert!(stack.try_pop().is_none());
        assert_eq!(stack.stats().live(), 0);
    });
}

#[test]
fn queue_producer_consumer() {
    loom::model(|| {
        let queue = Arc::new(LockFreeQueue::new());

        let producer = thread::spawn({
            let queue = queue.clone();
            move || {
                queue.push(1u32);
                queue.push(2u32);
            }
        });

        let consumer = thread::spawn({
            let queue = queue.clone();
            move || {
                let mut received = Vec::new();
                for _ in 0..2 {
                    if let Some(v) = queue.try_pop() {
                        received.push(v);
                    }
                }
                received
            }
        });

        producer.join().unwrap();
        let mut received = consumer.join().unwrap();
        while let Some(v) = queue.try_pop() {
            received.push(v);
        }
        assert_eq!(received, vec![1, 2]);
        assert_eq!(queue.stats().live(), 1);
    });
}

#[test]
fn queue_racing_pushers() {
    loom::model(|| {
        let queue = Arc::new(LockFreeQueue::new());

        let t1 = thread::spawn({
            let queue = queue.clone();
            move || queue.push(1u32)
        });
        let t2 = thread::spawn({
            let queue = queue.clone();
            move || queue.push(2u32)
        });

        t1.join().unwrap();
        t2.join().unwrap();

        let mut seen = Vec::new();
        while let Some(v) = queue.try_pop() {
            seen.push(v);
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(queue.stats().live(), 1);
    });
}
