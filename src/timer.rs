// Copyright 2024 Hearth Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Indexed binary min-heap of connection deadlines.
//!
//! Nodes carry an id and a deadline, nothing else. [`TimerHeap::tick`]
//! returns the ids whose deadlines have passed; the reactor maps each id back
//! to a connection and runs its usual close path. Keeping callbacks out of
//! the heap avoids a reference cycle between timers and the connections that
//! own them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct TimerNode {
    id: u64,
    deadline: Instant,
}

/// Min-heap on deadline with an auxiliary id → index map, so that reset and
/// cancel by id are O(log n).
///
/// Invariants: heap order on `deadline`; `index[node.id]` is the position of
/// that node in `heap`; the two collections always have the same length.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    index: HashMap<u64, usize>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Inserts a timer for `id`, or moves the existing one when `id` is
    /// already armed.
    pub fn add(&mut self, id: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        if let Some(&at) = self.index.get(&id) {
            self.heap[at].deadline = deadline;
            self.sift(at);
        } else {
            let at = self.heap.len();
            self.heap.push(TimerNode { id, deadline });
            self.index.insert(id, at);
            self.sift_up(at);
        }
    }

    /// Pushes the deadline of an armed timer forward. Returns false when `id`
    /// is not present (the connection is already gone).
    pub fn reset(&mut self, id: u64, timeout: Duration) -> bool {
        match self.index.get(&id) {
            Some(&at) => {
                self.heap[at].deadline = Instant::now() + timeout;
                self.sift(at);
                true
            }
            None => false,
        }
    }

    /// Disarms `id`. Returns false when it was not armed.
    pub fn cancel(&mut self, id: u64) -> bool {
        match self.index.get(&id) {
            Some(&at) => {
                self.remove_at(at);
                true
            }
            None => false,
        }
    }

    /// Time until the earliest deadline, zero if it has already passed, or
    /// `None` when no timer is armed (block indefinitely).
    pub fn peek(&self) -> Option<Duration> {
        self.heap
            .first()
            .map(|node| node.deadline.saturating_duration_since(Instant::now()))
    }

    /// Removes every expired timer and returns their ids, earliest first.
    pub fn tick(&mut self) -> Vec<u64> {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(front) = self.heap.first() {
            if front.deadline > now {
                break;
            }
            expired.push(self.remove_at(0).id);
        }
        expired
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    /// Swaps the node at `at` with the tail, pops it, and restores heap order
    /// at `at` by sifting whichever direction the moved node needs.
    fn remove_at(&mut self, at: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if at < last {
            self.swap_nodes(at, last);
        }
        let node = self.heap.pop().expect("remove_at on empty heap");
        self.index.remove(&node.id);
        if at < self.heap.len() {
            self.sift(at);
        }
        node
    }

    /// Sifts up when the node beats its parent, down otherwise.
    fn sift(&mut self, at: usize) {
        if at > 0 && self.heap[at].deadline < self.heap[(at - 1) / 2].deadline {
            self.sift_up(at);
        } else {
            self.sift_down(at);
        }
    }

    fn sift_up(&mut self, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if self.heap[at].deadline >= self.heap[parent].deadline {
                break;
            }
            self.swap_nodes(at, parent);
            at = parent;
        }
    }

    fn sift_down(&mut self, mut at: usize) {
        let len = self.heap.len();
        loop {
            let mut smallest = at;
            let left = 2 * at + 1;
            let right = 2 * at + 2;
            if left < len && self.heap[left].deadline < self.heap[smallest].deadline {
                smallest = left;
            }
            if right < len && self.heap[right].deadline < self.heap[smallest].deadline {
                smallest = right;
            }
            if smallest == at {
                break;
            }
            self.swap_nodes(at, smallest);
            at = smallest;
        }
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }
}

#[cfg(test)]
mod test {
    use super::TimerHeap;
    use std::time::Duration;

    const MS: Duration = Duration::from_millis(1);

    fn assert_index_consistent(heap: &TimerHeap) {
        assert_eq!(heap.index.len(), heap.heap.len());
        for (at, node) in heap.heap.iter().enumerate() {
            assert_eq!(Some(&at), heap.index.get(&node.id));
        }
        for at in 1..heap.heap.len() {
            let parent = (at - 1) / 2;
            assert!(heap.heap[parent].deadline <= heap.heap[at].deadline);
        }
    }

    #[test]
    fn peek_returns_earliest_deadline() {
        let mut heap = TimerHeap::new();
        assert_eq!(None, heap.peek());
        heap.add(1, 500 * MS);
        heap.add(2, 100 * MS);
        heap.add(3, 900 * MS);
        let next = heap.peek().unwrap();
        assert!(next <= 100 * MS);
        assert_index_consistent(&heap);
    }

    #[test]
    fn add_existing_id_replaces_in_place() {
        let mut heap = TimerHeap::new();
        heap.add(7, 10 * MS);
        heap.add(7, 800 * MS);
        assert_eq!(1, heap.len());
        // Deadline now reflects the second add.
        assert!(heap.peek().unwrap() > 500 * MS);
        assert_index_consistent(&heap);
    }

    #[test]
    fn reset_requires_id_to_be_armed() {
        let mut heap = TimerHeap::new();
        assert!(!heap.reset(3, 10 * MS));
        heap.add(3, 10 * MS);
        assert!(heap.reset(3, 700 * MS));
        assert!(heap.peek().unwrap() > 500 * MS);
    }

    #[test]
    fn cancel_removes_node_and_mapping() {
        let mut heap = TimerHeap::new();
        for id in 0..16 {
            heap.add(id, Duration::from_millis(10 + id));
        }
        assert!(heap.cancel(5));
        assert!(!heap.cancel(5));
        assert_eq!(15, heap.len());
        assert_index_consistent(&heap);
    }

    #[test]
    fn tick_fires_expired_ids_earliest_first() {
        let mut heap = TimerHeap::new();
        heap.add(1, Duration::ZERO);
        heap.add(2, 60_000 * MS);
        heap.add(3, Duration::ZERO);
        std::thread::sleep(2 * MS);
        let fired = heap.tick();
        assert_eq!(2, fired.len());
        assert!(fired.contains(&1) && fired.contains(&3));
        assert_eq!(1, heap.len());
        assert_index_consistent(&heap);
    }

    #[test]
    fn random_ops_keep_heap_and_index_consistent() {
        let mut heap = TimerHeap::new();
        // Deterministic pseudo-random walk over add/reset/cancel.
        let mut state = 0x2545f491u64;
        for _ in 0..512 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let id = state % 37;
            match (state >> 33) % 3 {
                0 => heap.add(id, Duration::from_millis(state % 1000 + 1)),
                1 => {
                    heap.reset(id, Duration::from_millis(state % 1000 + 1));
                }
                _ => {
                    heap.cancel(id);
                }
            }
            assert_index_consistent(&heap);
        }
        heap.clear();
        assert!(heap.is_empty());
    }
}
