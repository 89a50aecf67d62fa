//! Early candidate buffering
//!
//! Candidates can reach us before the remote description they belong to.
//! They are held here in arrival order and flushed once the description is
//! applied.

use std::collections::VecDeque;

use crate::transport::IceCandidate;

#[derive(Debug)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
    capacity: usize,
}

impl CandidateBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue a candidate, evicting the oldest when full.
    /// Returns the number of candidates evicted.
    pub fn push(&mut self, candidate: IceCandidate) -> usize {
        let mut evicted = 0;
        while self.queue.len() >= self.capacity {
            self.queue.pop_front();
            evicted += 1;
        }
        self.queue.push_back(candidate);
        evicted
    }

    /// Take every buffered candidate in arrival order, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
