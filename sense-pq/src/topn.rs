//! Bounded top-N selection over a stream of approximate candidates.
//!
//! The heap never holds more than N entries, so the corpus is never
//! materialised or fully sorted. Candidates are ordered by approximate
//! distance, then by their position in the code stream: for equal distances
//! the candidate seen first wins. Shard-local selections are combined with
//! [`merge_top_n`], which re-applies the same reduction over their union.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A code that survived approximate scoring.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: i64,
    pub word: String,
    pub sense_id: i32,
    pub approx_distance: f32,
    /// Position in the full code stream
    pub position: u64,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.approx_distance
            .total_cmp(&other.approx_distance)
            .then_with(|| self.position.cmp(&other.position))
    }
}

/// Max-heap capped at `capacity` entries; the root is the worst kept candidate.
#[derive(Debug)]
pub struct BoundedTopN {
    capacity: usize,
    heap: BinaryHeap<Candidate>,
}

impl BoundedTopN {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity.min(1 << 16) + 1),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Distance a new candidate has to beat once the heap is full.
    pub fn threshold(&self) -> Option<f32> {
        if self.heap.len() < self.capacity {
            None
        } else {
            self.heap.peek().map(|worst| worst.approx_distance)
        }
    }

    /// Offer a candidate; returns whether it was kept.
    pub fn push(&mut self, candidate: Candidate) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(candidate);
            return true;
        }
        match self.heap.peek() {
            Some(worst) if candidate < *worst => {
                self.heap.pop();
                self.heap.push(candidate);
                true
            }
            _ => false,
        }
    }

    /// Kept candidates in ascending order.
    pub fn into_sorted_vec(self) -> Vec<Candidate> {
        self.heap.into_sorted_vec()
    }
}

/// Merge shard-local top-N lists into the global top-N.
pub fn merge_top_n(shards: impl IntoIterator<Item = Vec<Candidate>>, n: usize) -> Vec<Candidate> {
    let mut top = BoundedTopN::new(n);
    for candidate in shards.into_iter().flatten() {
        top.push(candidate);
    }
    top.into_sorted_vec()
}
