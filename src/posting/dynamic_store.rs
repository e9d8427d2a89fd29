//! Updatable posting store.
//!
//! Postings live in memory as versioned record strings, one lock per posting,
//! and are addressed like a key-value store: `get_write_posting` reads a value,
//! `write_posting` replaces or appends to it. The whole store is persisted as a
//! postcard snapshot.
//!
//! Inserts append a record to each chosen posting. Records are never removed
//! in place; deletes and reassignments make old records non-current through the
//! label store (deleted status, or a version that no longer matches).
//!
//! Refinement rebuilds every posting from a snapshot of the current records, so
//! it holds `rewrite` exclusively while writers (`add_index`, `write_posting`)
//! hold it shared. Searches never take it.

use super::codec::RecordLayout;
use super::workspace::Workspace;
use super::{
    assign_replicas, find_exact, has_live_record, latency_limit, plan_postings, search_postings,
    BuildContext, GroundTruth, PostingSource, PostingStore,
};
use crate::distance::DistCalcMethod;
use crate::error::{Result, SpannError};
use crate::head::HeadIndex;
use crate::options::Options;
use crate::query::{QueryResultSet, SearchStats};
use crate::vectors::VectorSet;
use crate::version_label::VersionLabelStore;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// File name of the snapshot inside the index directory.
pub const DYNAMIC_POSTING_FILE: &str = "SPTAGDynamicPostings.bin";

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    postings: Vec<Vec<u8>>,
}

/// In-memory, updatable posting store.
pub struct DynamicPostingStore {
    postings: RwLock<Vec<Mutex<Vec<u8>>>>,
    rewrite: RwLock<()>,
    layout: RecordLayout,
    labels: Option<Arc<VersionLabelStore>>,
    method: DistCalcMethod,
    latency_limit: Option<Duration>,
    candidates: usize,
    replica_count: usize,
}

impl DynamicPostingStore {
    /// Empty store configured from `options`.
    pub fn new(options: &Options, labels: Arc<VersionLabelStore>) -> Self {
        let mut store = Self {
            postings: RwLock::new(Vec::new()),
            rewrite: RwLock::new(()),
            layout: RecordLayout::new(options.dim, true),
            labels: Some(labels),
            method: options.dist_calc_method,
            latency_limit: None,
            candidates: 64,
            replica_count: 8,
        };
        store.configure(options);
        store
    }

    fn configure(&mut self, options: &Options) {
        self.method = options.dist_calc_method;
        self.latency_limit = latency_limit(options);
        self.candidates = options.internal_result_num;
        self.replica_count = options.replica_count.max(1);
    }

    fn labels_or_empty(&self) -> Result<&VersionLabelStore> {
        self.labels.as_deref().ok_or(SpannError::EmptyIndex)
    }

    fn replace_all(&self, postings: Vec<Vec<u8>>) {
        *self.postings.write() = postings.into_iter().map(Mutex::new).collect();
    }

    /// Encode `(vid, vector)` pairs per posting with current label versions.
    fn encode_postings(&self, members: Vec<Vec<(u32, &[f32])>>) -> Vec<Vec<u8>> {
        let labels = self.labels.as_deref();
        members
            .into_iter()
            .map(|posting| {
                let mut bytes = Vec::with_capacity(posting.len() * self.layout.record_size());
                for (vid, vector) in posting {
                    let version = labels.map_or(0, |l| l.version(vid));
                    self.layout.encode(&mut bytes, vid, version, vector);
                }
                bytes
            })
            .collect()
    }

    fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            dimension: self.layout.dimension,
            postings: self.postings.read().iter().map(|p| p.lock().clone()).collect(),
        };
        let bytes = postcard::to_stdvec(&snapshot)?;
        fs::write(path, bytes).map_err(|e| SpannError::create(path, e))?;
        tracing::info!(path = %path.display(), postings = snapshot.postings.len(), "saved posting snapshot");
        Ok(())
    }
}

impl PostingSource for DynamicPostingStore {
    fn read_posting(&self, pid: u32, buffer: &mut Vec<u8>) -> Result<()> {
        let postings = self.postings.read();
        let posting = postings
            .get(pid as usize)
            .ok_or_else(|| SpannError::Fail(format!("posting {pid} out of range")))?;
        buffer.extend_from_slice(&posting.lock());
        Ok(())
    }

    fn record_layout(&self) -> RecordLayout {
        self.layout
    }

    fn labels(&self) -> Option<&VersionLabelStore> {
        self.labels.as_deref()
    }

    fn method(&self) -> DistCalcMethod {
        self.method
    }
}

impl PostingStore for DynamicPostingStore {
    fn load_index(&mut self, options: &Options, labels: Arc<VersionLabelStore>) -> Result<()> {
        let path = options.index_directory.join(DYNAMIC_POSTING_FILE);
        let bytes = fs::read(&path).map_err(|e| SpannError::open(&path, e))?;
        let snapshot: Snapshot = postcard::from_bytes(&bytes)?;
        if options.dim != 0 && snapshot.dimension != options.dim {
            return Err(SpannError::DimensionSizeMismatch {
                expected: options.dim,
                actual: snapshot.dimension,
            });
        }
        self.layout = RecordLayout::new(snapshot.dimension, true);
        for (pid, posting) in snapshot.postings.iter().enumerate() {
            if let Err(e) = self.layout.count(posting) {
                return Err(SpannError::Format(format!("posting {pid}: {e}")));
            }
        }
        tracing::info!(path = %path.display(), postings = snapshot.postings.len(), "loaded posting snapshot");
        self.replace_all(snapshot.postings);
        self.labels = Some(labels);
        self.configure(options);
        Ok(())
    }

    fn build_index(&mut self, ctx: &BuildContext<'_>) -> Result<()> {
        self.layout = RecordLayout::new(ctx.vectors.dimension(), true);
        self.labels = Some(Arc::clone(ctx.labels));
        self.configure(ctx.options);

        let members = plan_postings(ctx)
            .into_iter()
            .map(|posting| {
                posting
                    .into_iter()
                    .map(|(vid, _)| (vid, ctx.vectors.get(vid as usize)))
                    .collect()
            })
            .collect();
        let encoded = self.encode_postings(members);
        self.replace_all(encoded);
        self.save_snapshot(&ctx.options.index_directory.join(DYNAMIC_POSTING_FILE))
    }

    fn search_index(
        &self,
        ws: &mut Workspace,
        results: &mut QueryResultSet,
        _head: &dyn HeadIndex,
        stats: Option<&mut SearchStats>,
        truth: Option<&mut GroundTruth<'_>>,
    ) -> Result<()> {
        search_postings(self, ws, results, stats, truth, self.latency_limit)
    }

    fn check_valid_posting(&self, pid: u32) -> bool {
        let postings = self.postings.read();
        postings.get(pid as usize).is_some_and(|posting| {
            has_live_record(self.layout, self.labels.as_deref(), &posting.lock())
        })
    }

    fn add_index(&self, vectors: &VectorSet, head: &dyn HeadIndex, begin: u32) -> Result<()> {
        let labels = self.labels_or_empty()?;
        if head.num_samples() == 0 {
            return Err(SpannError::EmptyIndex);
        }
        if vectors.dimension() != self.layout.dimension {
            return Err(SpannError::DimensionSizeMismatch {
                expected: self.layout.dimension,
                actual: vectors.dimension(),
            });
        }

        let _writer = self.rewrite.read();
        let assignments: Vec<Vec<(u32, f32)>> = vectors
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|v| assign_replicas(v, head, self.replica_count, self.candidates, self.method))
            .collect();

        let postings = self.postings.read();
        let mut record = Vec::with_capacity(self.layout.record_size());
        for (i, replicas) in assignments.into_iter().enumerate() {
            let vid = begin + i as u32;
            record.clear();
            self.layout
                .encode(&mut record, vid, labels.version(vid), vectors.get(i));
            for (pid, _) in replicas {
                let posting = postings
                    .get(pid as usize)
                    .ok_or_else(|| SpannError::Fail(format!("posting {pid} out of range")))?;
                posting.lock().extend_from_slice(&record);
            }
        }
        tracing::debug!(begin, count = vectors.len(), "inserted vectors");
        Ok(())
    }

    fn search_vector(&self, vector: &[f32], head: &dyn HeadIndex) -> Result<Option<u32>> {
        find_exact(self, head, vector, self.candidates)
    }

    fn refine_index(&self, head: &dyn HeadIndex) -> Result<()> {
        let labels = self.labels_or_empty()?;
        let _exclusive = self.rewrite.write();

        // Collect every current vector once.
        let mut live: BTreeMap<u32, Vec<f32>> = BTreeMap::new();
        {
            let postings = self.postings.read();
            for posting in postings.iter() {
                let bytes = posting.lock();
                self.layout.for_each(&bytes, |entry| {
                    if super::is_current(Some(labels), &entry) {
                        live.entry(entry.vid)
                            .or_insert_with(|| entry.vector.to_vec());
                    }
                })?;
            }
        }

        let live: Vec<(u32, Vec<f32>)> = live.into_iter().collect();
        let assignments: Vec<Vec<(u32, f32)>> = live
            .par_iter()
            .map(|(_, v)| assign_replicas(v, head, self.replica_count, self.candidates, self.method))
            .collect();

        let mut members: Vec<Vec<(u32, &[f32])>> = vec![Vec::new(); head.num_samples()];
        let mut reassigned = 0usize;
        for ((vid, vector), replicas) in live.iter().zip(assignments) {
            // Bumping the version makes every old replica stale.
            if labels.increment_count(*vid).is_none() {
                continue;
            }
            reassigned += 1;
            for (pid, _) in replicas {
                members[pid as usize].push((*vid, vector.as_slice()));
            }
        }
        let encoded = self.encode_postings(members);
        self.replace_all(encoded);
        tracing::info!(reassigned, postings = head.num_samples(), "refined posting assignment");
        Ok(())
    }

    fn get_write_posting(&self, pid: u32) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.read_posting(pid, &mut buffer)?;
        Ok(buffer)
    }

    fn write_posting(&self, pid: u32, bytes: &[u8], append: bool) -> Result<()> {
        self.layout.count(bytes)?;
        let _writer = self.rewrite.read();
        let postings = self.postings.read();
        let posting = postings
            .get(pid as usize)
            .ok_or_else(|| SpannError::Fail(format!("posting {pid} out of range")))?;
        let mut posting = posting.lock();
        if !append {
            posting.clear();
        }
        posting.extend_from_slice(bytes);
        Ok(())
    }

    fn init_posting_record(&mut self, head: &dyn HeadIndex) -> Result<()> {
        if head.num_samples() == 0 {
            return Err(SpannError::EmptyIndex);
        }
        self.layout = RecordLayout::new(head.dimension(), true);
        self.replace_all(vec![Vec::new(); head.num_samples()]);
        Ok(())
    }

    fn num_postings(&self) -> usize {
        self.postings.read().len()
    }

    fn layout(&self) -> RecordLayout {
        self.layout
    }

    fn is_updatable(&self) -> bool {
        true
    }

    fn save(&self, dir: &Path) -> Result<()> {
        self.save_snapshot(&dir.join(DYNAMIC_POSTING_FILE))
    }
}
