//! Bounded multi-producer/multi-consumer FIFO with condition signalling.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Blocking FIFO. `push` blocks while at capacity, `pop` blocks while empty.
/// Payloads only need to be movable, not clonable.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BlockingQueue<T> {
    /// A queue that never blocks producers.
    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn push(&self, value: T) {
        let mut items = self.items.lock().unwrap();
        while items.len() >= self.capacity {
            items = self.not_full.wait(items).unwrap();
        }
        items.push_back(value);
        drop(items);
        self.not_empty.notify_one();
    }

    pub fn pop(&self) -> T {
        let mut items = self.items.lock().unwrap();
        while items.is_empty() {
            items = self.not_empty.wait(items).unwrap();
        }
        let value = items.pop_front().expect("queue cannot be empty here");
        drop(items);
        self.not_full.notify_one();
        value
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::BlockingQueue;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pop_returns_items_in_fifo_order() {
        let queue = BlockingQueue::with_capacity(8);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(1, queue.pop());
        assert_eq!(2, queue.pop());
        assert_eq!(3, queue.pop());
    }

    #[test]
    fn push_accepts_move_only_payloads() {
        let queue = BlockingQueue::unbounded();
        queue.push(Box::new(42usize));
        assert_eq!(42, *queue.pop());
    }

    #[test]
    fn pop_blocks_until_a_producer_pushes() {
        let queue = Arc::new(BlockingQueue::with_capacity(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push("late");
        assert_eq!("late", consumer.join().unwrap());
    }

    #[test]
    fn push_blocks_at_capacity_until_a_consumer_pops() {
        let queue = Arc::new(BlockingQueue::with_capacity(1));
        queue.push(1);
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(1, queue.len());
        assert_eq!(1, queue.pop());
        producer.join().unwrap();
        assert_eq!(2, queue.pop());
    }

    #[test]
    fn many_producers_and_consumers_drain_everything_exactly_once() {
        let queue = Arc::new(BlockingQueue::with_capacity(16));
        let mut handles = Vec::new();
        for p in 0..4u64 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    queue.push(p * 1000 + i);
                }
            }));
        }
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            consumers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..100 {
                    seen.push(queue.pop());
                }
                seen
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (0..4u64)
            .flat_map(|p| (0..100).map(move |i| p * 1000 + i))
            .collect();
        assert_eq!(expected, all);
    }
}
