//! Query result sets and per-query statistics.

use std::time::Duration;

/// One candidate: a vector id and its distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub vid: u32,
    pub distance: f32,
}

impl Neighbor {
    pub fn new(vid: u32, distance: f32) -> Self {
        Self { vid, distance }
    }
}

/// A user-facing search hit, with metadata when requested.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub vid: u32,
    pub distance: f32,
    pub metadata: Option<Vec<u8>>,
}

/// Bounded, distance-ordered candidate list for one query.
///
/// Holds at most `capacity` neighbors, nearest first. Inserting into a full
/// set evicts the farthest entry when the newcomer is closer.
#[derive(Debug, Clone)]
pub struct QueryResultSet {
    target: Vec<f32>,
    capacity: usize,
    results: Vec<Neighbor>,
}

impl QueryResultSet {
    pub fn new(target: Vec<f32>, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            results: Vec::with_capacity(capacity.saturating_add(1).min(1 << 16)),
        }
    }

    #[inline]
    pub fn target(&self) -> &[f32] {
        &self.target
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.results.len() >= self.capacity
    }

    #[inline]
    pub fn results(&self) -> &[Neighbor] {
        &self.results
    }

    #[inline]
    pub fn best(&self) -> Option<Neighbor> {
        self.results.first().copied()
    }

    /// Distance a newcomer must beat to be kept.
    #[inline]
    pub fn worst_distance(&self) -> f32 {
        if self.is_full() {
            self.results.last().map_or(f32::INFINITY, |n| n.distance)
        } else {
            f32::INFINITY
        }
    }

    /// Insert keeping distance order. Returns whether the candidate was kept.
    pub fn add_point(&mut self, vid: u32, distance: f32) -> bool {
        if self.capacity == 0 || distance.is_nan() || distance >= self.worst_distance() {
            return false;
        }
        let pos = self.results.partition_point(|n| n.distance <= distance);
        self.results.insert(pos, Neighbor::new(vid, distance));
        if self.results.len() > self.capacity {
            self.results.pop();
        }
        true
    }

    pub fn contains(&self, vid: u32) -> bool {
        self.results.iter().any(|n| n.vid == vid)
    }

    /// Rewrite every vid, keeping distances and order.
    pub fn map_vids<F: FnMut(u32) -> u32>(&mut self, mut f: F) {
        for n in &mut self.results {
            n.vid = f(n.vid);
        }
    }

    pub fn retain<F: FnMut(&Neighbor) -> bool>(&mut self, f: F) {
        self.results.retain(f);
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }

    /// Re-sort by ascending distance. Ties keep insertion order.
    pub fn sort(&mut self) {
        self.results
            .sort_by(|a, b| a.distance.total_cmp(&b.distance));
    }

    pub fn truncate(&mut self, k: usize) {
        self.results.truncate(k);
    }

    pub fn into_results(self) -> Vec<Neighbor> {
        self.results
    }
}

/// Counters and timings for one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchStats {
    /// Head candidates examined.
    pub head_checked: usize,
    /// Postings handed to the disk stage.
    pub postings_requested: usize,
    /// Postings actually read before any latency cutoff.
    pub postings_read: usize,
    /// Posting records scanned.
    pub records_scanned: usize,
    /// Bytes read from posting storage.
    pub bytes_read: usize,
    /// Records skipped as deleted or stale.
    pub records_skipped: usize,
    pub head_latency: Duration,
    pub disk_latency: Duration,
    pub total_latency: Duration,
    /// The latency limit stopped posting reads early.
    pub latency_limited: bool,
}
