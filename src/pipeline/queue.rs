//! Priority task queue for pending chunks.
//!
//! Fresh chunks enter at the back in index order. Failed chunks wait out their
//! backoff in a separate delay set and then jump to the front, so retries are
//! never starved by the remaining plan.

use super::chunk::{Chunk, ChunkState};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use tokio::time::Instant;

/// Pending chunks plus chunks waiting for their retry deadline.
#[derive(Default)]
pub struct TaskQueue {
    ready: VecDeque<Chunk>,
    delayed: BinaryHeap<Reverse<(Instant, u64)>>,
    delayed_chunks: HashMap<u64, Chunk>,
    seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a freshly planned chunk.
    pub fn push_back(&mut self, mut chunk: Chunk) {
        chunk.state = ChunkState::Pending;
        self.ready.push_back(chunk);
    }

    /// Put a chunk at the head of the queue.
    pub fn push_front(&mut self, mut chunk: Chunk) {
        chunk.state = ChunkState::Pending;
        self.ready.push_front(chunk);
    }

    /// Park a failed chunk until `ready_at`.
    pub fn schedule_retry(&mut self, mut chunk: Chunk, ready_at: Instant) {
        chunk.state = ChunkState::RetryPending;
        let seq = self.seq;
        self.seq += 1;
        self.delayed.push(Reverse((ready_at, seq)));
        self.delayed_chunks.insert(seq, chunk);
    }

    /// Move every retry whose deadline has passed to the front of the queue.
    ///
    /// Among several due retries the earliest deadline ends up first.
    /// Returns the number of chunks promoted.
    pub fn promote_due(&mut self, now: Instant) -> usize {
        let mut due = Vec::new();
        while let Some(Reverse((ready_at, seq))) = self.delayed.peek().copied() {
            if ready_at > now {
                break;
            }
            self.delayed.pop();
            if let Some(chunk) = self.delayed_chunks.remove(&seq) {
                due.push(chunk);
            }
        }
        let promoted = due.len();
        for chunk in due.into_iter().rev() {
            self.push_front(chunk);
        }
        promoted
    }

    /// Earliest pending retry deadline.
    pub fn next_retry_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((ready_at, _))| *ready_at)
    }

    pub fn pending_retries(&self) -> usize {
        self.delayed_chunks.len()
    }

    /// Chunks ready for dispatch.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// No ready chunks and no retries waiting.
    pub fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.delayed_chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.ready.iter()
    }

    pub fn pop_front(&mut self) -> Option<Chunk> {
        self.ready.pop_front()
    }

    pub fn remove(&mut self, position: usize) -> Option<Chunk> {
        self.ready.remove(position)
    }

    /// Drop everything, ready and delayed.
    pub fn clear(&mut self) {
        self.ready.clear();
        self.delayed.clear();
        self.delayed_chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn chunks(n: usize) -> Vec<Chunk> {
        let input = Bytes::from(vec![0u8; n * 4]);
        (0..n).map(|i| Chunk::new(i, (i * 4) as u64, 4, &input)).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = TaskQueue::new();
        for chunk in chunks(3) {
            queue.push_back(chunk);
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front()).map(|c| c.index()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_due_retries_jump_the_queue() {
        let mut queue = TaskQueue::new();
        let mut all = chunks(4).into_iter();
        let first = all.next().unwrap();
        let second = all.next().unwrap();
        for chunk in all {
            queue.push_back(chunk);
        }

        let now = Instant::now();
        queue.schedule_retry(second, now + Duration::from_millis(5));
        queue.schedule_retry(first, now + Duration::from_millis(1));
        assert_eq!(queue.pending_retries(), 2);
        assert_eq!(queue.next_retry_deadline(), Some(now + Duration::from_millis(1)));

        // Nothing due yet
        assert_eq!(queue.promote_due(now), 0);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.promote_due(now + Duration::from_millis(10)), 2);
        assert!(queue.next_retry_deadline().is_none());
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front()).map(|c| c.index()).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_retry_state_transitions() {
        let mut queue = TaskQueue::new();
        let chunk = chunks(1).pop().unwrap();
        let now = Instant::now();
        queue.schedule_retry(chunk, now);
        assert!(!queue.is_drained());
        assert!(queue.is_empty());

        queue.promote_due(now);
        let chunk = queue.pop_front().unwrap();
        assert_eq!(chunk.state(), ChunkState::Pending);
        assert!(queue.is_drained());
    }

    #[test]
    fn test_clear_drops_delayed() {
        let mut queue = TaskQueue::new();
        let mut all = chunks(2);
        queue.schedule_retry(all.pop().unwrap(), Instant::now());
        queue.push_back(all.pop().unwrap());
        queue.clear();
        assert!(queue.is_drained());
    }
}
