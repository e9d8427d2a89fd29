//! Per-worker query scratch space.
//!
//! A [`Workspace`] is allocated once per worker thread and reset, not
//! reallocated, at the start of every query. [`WorkspacePool`] owns them,
//! keyed by [`ThreadId`], and creates each lazily on first use.

use crate::options::Options;
use crate::posting::codec::PAGE_SIZE;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Reusable scratch for one query at a time.
#[derive(Debug)]
pub struct Workspace {
    /// Postings staged for the disk stage, in head rank order.
    pub posting_ids: Vec<u32>,
    posting_seen: HashSet<u32>,
    vector_seen: HashSet<u32>,
    /// Raw posting bytes read from storage.
    pub io_buffer: Vec<u8>,
}

impl Workspace {
    pub fn new(hash_exp: u32, max_postings: usize, io_buffer_size: usize) -> Self {
        let table = 1usize << hash_exp.min(24);
        Self {
            posting_ids: Vec::with_capacity(max_postings),
            posting_seen: HashSet::with_capacity(table),
            vector_seen: HashSet::with_capacity(table),
            io_buffer: Vec::with_capacity(io_buffer_size),
        }
    }

    /// Forget everything from the previous query; keeps allocations.
    pub fn reset(&mut self) {
        self.posting_ids.clear();
        self.posting_seen.clear();
        self.vector_seen.clear();
        self.io_buffer.clear();
    }

    /// Stage a posting unless it was already staged this query.
    pub fn stage_posting(&mut self, pid: u32) -> bool {
        if self.posting_seen.insert(pid) {
            self.posting_ids.push(pid);
            true
        } else {
            false
        }
    }

    /// Record that `vid` was seen; `false` if it already was.
    pub fn mark_vector(&mut self, vid: u32) -> bool {
        self.vector_seen.insert(vid)
    }

    pub fn io_capacity(&self) -> usize {
        self.io_buffer.capacity()
    }
}

/// Workspaces keyed by worker thread.
#[derive(Debug)]
pub struct WorkspacePool {
    workspaces: Mutex<HashMap<ThreadId, Arc<Mutex<Workspace>>>>,
    hash_exp: u32,
    max_postings: usize,
    io_buffer_size: usize,
}

impl WorkspacePool {
    pub fn new(options: &Options) -> Self {
        let pages = options
            .posting_page_limit
            .min(options.search_posting_page_limit + 1);
        Self {
            workspaces: Mutex::new(HashMap::new()),
            hash_exp: options.hash_exp,
            max_postings: options.internal_result_num,
            io_buffer_size: pages * PAGE_SIZE,
        }
    }

    /// The calling thread's workspace, created on first use.
    pub fn acquire(&self) -> Arc<Mutex<Workspace>> {
        let id = thread::current().id();
        let mut workspaces = self.workspaces.lock();
        Arc::clone(workspaces.entry(id).or_insert_with(|| {
            tracing::debug!(thread = ?id, "allocating query workspace");
            Arc::new(Mutex::new(Workspace::new(
                self.hash_exp,
                self.max_postings,
                self.io_buffer_size,
            )))
        }))
    }

    /// Number of workspaces allocated so far.
    pub fn len(&self) -> usize {
        self.workspaces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_dedups_and_reset_keeps_capacity() {
        let mut ws = Workspace::new(4, 8, 4096);
        assert!(ws.stage_posting(3));
        assert!(!ws.stage_posting(3));
        assert!(ws.stage_posting(1));
        assert_eq!(ws.posting_ids, vec![3, 1]);
        assert!(ws.mark_vector(10));
        assert!(!ws.mark_vector(10));

        let cap = ws.posting_ids.capacity();
        ws.reset();
        assert!(ws.posting_ids.is_empty());
        assert!(ws.mark_vector(10));
        assert_eq!(ws.posting_ids.capacity(), cap);
        assert!(ws.io_capacity() >= 4096);
    }

    #[test]
    fn pool_is_per_thread() {
        let pool = WorkspacePool::new(&Options::default());
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(Arc::ptr_eq(&a, &b));

        std::thread::scope(|s| {
            s.spawn(|| {
                let c = pool.acquire();
                assert!(!Arc::ptr_eq(&a, &c));
            });
        });
        assert_eq!(pool.len(), 2);
    }
}
