//! Disk-resident postings: the second stage of a query.
//!
//! A posting store maps posting id (= head sample position) to the list of
//! vectors assigned to that posting. Two stores ship with the crate:
//!
//! - [`StaticPostingStore`]: one read-only file, built once.
//! - [`DynamicPostingStore`]: updatable key-value style store accepting
//!   inserts and rewrites; the "mapped" backend migrates a static build into it.
//!
//! Both share the assignment and scan routines in this module: a vector is
//! assigned to up to `replica_count` nearby heads pruned by the relative
//! neighborhood rule (a head is skipped when it is closer to an already chosen
//! head than to the vector), and a scan skips deleted or stale records.

pub mod codec;
pub mod dynamic_store;
pub mod static_store;
pub mod workspace;

pub use codec::{PostingEntry, RecordLayout, PAGE_SIZE};
pub use dynamic_store::DynamicPostingStore;
pub use static_store::StaticPostingStore;
pub use workspace::{Workspace, WorkspacePool};

use crate::distance::DistCalcMethod;
use crate::error::Result;
use crate::head::HeadIndex;
use crate::options::Options;
use crate::query::{QueryResultSet, SearchStats};
use crate::vectors::VectorSet;
use crate::version_label::VersionLabelStore;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Distance at or below which a stored vector counts as the same vector.
pub const EXACT_MATCH_EPSILON: f32 = 1e-6;

/// Inputs to a posting store build.
pub struct BuildContext<'a> {
    pub vectors: &'a VectorSet,
    pub head: &'a dyn HeadIndex,
    /// Global vector id of each head sample.
    pub head_ids: &'a [u64],
    pub options: &'a Options,
    pub labels: &'a Arc<VersionLabelStore>,
}

/// Ground-truth bookkeeping for recall diagnostics.
///
/// Every scanned record whose vid is in `truth` is recorded under the posting
/// it was found in.
pub struct GroundTruth<'a> {
    pub truth: &'a HashSet<u32>,
    pub found: &'a mut BTreeMap<u32, BTreeSet<u32>>,
}

/// Backend-agnostic posting store.
pub trait PostingStore: Send + Sync {
    /// Open a built store from `options.index_directory`.
    fn load_index(&mut self, options: &Options, labels: Arc<VersionLabelStore>) -> Result<()>;

    /// Assign every vector to postings and persist the result.
    fn build_index(&mut self, ctx: &BuildContext<'_>) -> Result<()>;

    /// Scan `ws.posting_ids`, merging live records into `results`.
    fn search_index(
        &self,
        ws: &mut Workspace,
        results: &mut QueryResultSet,
        head: &dyn HeadIndex,
        stats: Option<&mut SearchStats>,
        truth: Option<&mut GroundTruth<'_>>,
    ) -> Result<()>;

    /// Whether posting `pid` holds at least one live record.
    fn check_valid_posting(&self, pid: u32) -> bool;

    /// Insert `vectors` as vids `begin..begin + vectors.len()`.
    fn add_index(&self, vectors: &VectorSet, head: &dyn HeadIndex, begin: u32) -> Result<()>;

    /// Vid of a live stored vector equal to `vector`, if any.
    fn search_vector(&self, vector: &[f32], head: &dyn HeadIndex) -> Result<Option<u32>>;

    /// Reassign every live vector from scratch.
    fn refine_index(&self, head: &dyn HeadIndex) -> Result<()>;

    /// Raw bytes of posting `pid` in this store's record layout.
    fn get_write_posting(&self, pid: u32) -> Result<Vec<u8>>;

    /// Replace or extend posting `pid` with versioned records.
    fn write_posting(&self, pid: u32, bytes: &[u8], append: bool) -> Result<()>;

    /// Create one empty posting per head sample.
    fn init_posting_record(&mut self, head: &dyn HeadIndex) -> Result<()>;

    fn num_postings(&self) -> usize;

    fn layout(&self) -> RecordLayout;

    /// Whether `add_index` and `write_posting` are supported.
    fn is_updatable(&self) -> bool;

    /// Persist into `dir` so that `load_index` with that directory reopens it.
    fn save(&self, dir: &Path) -> Result<()>;
}

/// Crate-internal read access shared by the scan helpers.
pub(crate) trait PostingSource {
    fn read_posting(&self, pid: u32, buffer: &mut Vec<u8>) -> Result<()>;
    fn record_layout(&self) -> RecordLayout;
    fn labels(&self) -> Option<&VersionLabelStore>;
    fn method(&self) -> DistCalcMethod;
}

/// A record is current when its vector is live and, for versioned records,
/// the stored version matches the label.
#[inline]
pub(crate) fn is_current(labels: Option<&VersionLabelStore>, entry: &PostingEntry<'_>) -> bool {
    is_live(labels, entry.vid, entry.version)
}

#[inline]
pub(crate) fn is_live(labels: Option<&VersionLabelStore>, vid: u32, version: Option<u8>) -> bool {
    let Some(labels) = labels else {
        return true;
    };
    match labels.get(vid) {
        None => false,
        Some(label) if label.status() == crate::version_label::PostingStatus::Deleted => false,
        Some(label) => version.map_or(true, |v| v == label.count()),
    }
}

/// Up to `replica_count` heads for `vector`, nearest first.
pub(crate) fn assign_replicas(
    vector: &[f32],
    head: &dyn HeadIndex,
    replica_count: usize,
    candidates: usize,
    method: DistCalcMethod,
) -> Vec<(u32, f32)> {
    let mut nearest = QueryResultSet::new(vector.to_vec(), candidates.max(replica_count));
    head.search(&mut nearest);

    let mut chosen: Vec<(u32, f32)> = Vec::with_capacity(replica_count);
    for n in nearest.results() {
        if chosen.len() >= replica_count {
            break;
        }
        let sample = head.sample(n.vid as usize);
        let shadowed = chosen
            .iter()
            .any(|&(g, _)| method.distance(sample, head.sample(g as usize)) <= n.distance);
        if !shadowed {
            chosen.push((n.vid, n.distance));
        }
    }
    chosen
}

/// Posting membership for a fresh build: `(vid, distance)` per posting,
/// nearest first, capped at the page-derived vector limit.
pub(crate) fn plan_postings(ctx: &BuildContext<'_>) -> Vec<Vec<(u32, f32)>> {
    let options = ctx.options;
    let excluded: HashSet<u32> = if options.exclude_head {
        ctx.head_ids.iter().map(|&id| id as u32).collect()
    } else {
        HashSet::new()
    };

    let per_vector: Vec<Vec<(u32, f32)>> = (0..ctx.vectors.len())
        .into_par_iter()
        .map(|vid| {
            if excluded.contains(&(vid as u32)) {
                return Vec::new();
            }
            assign_replicas(
                ctx.vectors.get(vid),
                ctx.head,
                options.replica_count,
                options.internal_result_num,
                options.dist_calc_method,
            )
        })
        .collect();

    let mut postings: Vec<Vec<(u32, f32)>> = vec![Vec::new(); ctx.head.num_samples()];
    for (vid, replicas) in per_vector.into_iter().enumerate() {
        for (pid, distance) in replicas {
            postings[pid as usize].push((vid as u32, distance));
        }
    }

    let limit = RecordLayout::vector_limit(ctx.vectors.dimension(), options.posting_page_limit);
    let mut dropped = 0usize;
    for posting in &mut postings {
        posting.sort_by(|a, b| a.1.total_cmp(&b.1));
        if posting.len() > limit {
            dropped += posting.len() - limit;
            posting.truncate(limit);
        }
    }
    let assigned: usize = postings.iter().map(Vec::len).sum();
    tracing::info!(
        postings = postings.len(),
        assigned,
        dropped,
        vector_limit = limit,
        "planned posting lists"
    );
    postings
}

/// Scan the staged postings of `ws` into `results`.
pub(crate) fn search_postings<S: PostingSource + ?Sized>(
    source: &S,
    ws: &mut Workspace,
    results: &mut QueryResultSet,
    stats: Option<&mut SearchStats>,
    mut truth: Option<&mut GroundTruth<'_>>,
    latency_limit: Option<Duration>,
) -> Result<()> {
    let started = Instant::now();
    let layout = source.record_layout();
    let labels = source.labels();
    let method = source.method();

    let postings = std::mem::take(&mut ws.posting_ids);
    let mut buffer = std::mem::take(&mut ws.io_buffer);
    let mut local = SearchStats {
        postings_requested: postings.len(),
        ..SearchStats::default()
    };

    let mut outcome = Ok(());
    for &pid in &postings {
        if latency_limit.is_some_and(|limit| started.elapsed() > limit) {
            local.latency_limited = true;
            break;
        }
        buffer.clear();
        if let Err(e) = source.read_posting(pid, &mut buffer) {
            outcome = Err(e);
            break;
        }
        local.postings_read += 1;
        local.bytes_read += buffer.len();

        let scanned = layout.for_each(&buffer, |entry| {
            if !is_current(labels, &entry) {
                local.records_skipped += 1;
                return;
            }
            if let Some(t) = truth.as_deref_mut() {
                if t.truth.contains(&entry.vid) {
                    t.found.entry(pid).or_default().insert(entry.vid);
                }
            }
            if !ws.mark_vector(entry.vid) {
                return;
            }
            let distance = method.distance(results.target(), entry.vector);
            results.add_point(entry.vid, distance);
        });
        match scanned {
            Ok(n) => local.records_scanned += n,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        }
    }

    ws.posting_ids = postings;
    ws.io_buffer = buffer;
    local.disk_latency = started.elapsed();
    if let Some(stats) = stats {
        stats.postings_requested += local.postings_requested;
        stats.postings_read += local.postings_read;
        stats.records_scanned += local.records_scanned;
        stats.records_skipped += local.records_skipped;
        stats.bytes_read += local.bytes_read;
        stats.disk_latency += local.disk_latency;
        stats.latency_limited |= local.latency_limited;
    }
    outcome
}

/// First live record equal to `vector` in the postings nearest to it.
pub(crate) fn find_exact<S: PostingSource + ?Sized>(
    source: &S,
    head: &dyn HeadIndex,
    vector: &[f32],
    candidates: usize,
) -> Result<Option<u32>> {
    let layout = source.record_layout();
    let labels = source.labels();
    let method = source.method();

    let mut nearest = QueryResultSet::new(vector.to_vec(), candidates.max(1));
    head.search(&mut nearest);

    let mut buffer = Vec::new();
    for n in nearest.results() {
        buffer.clear();
        source.read_posting(n.vid, &mut buffer)?;
        let mut found = None;
        layout.for_each(&buffer, |entry| {
            if found.is_none()
                && is_current(labels, &entry)
                && method.distance(vector, entry.vector) <= EXACT_MATCH_EPSILON
            {
                found = Some(entry.vid);
            }
        })?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

/// Whether any record header in `bytes` is current. Reads labels only.
pub(crate) fn has_live_record(
    layout: RecordLayout,
    labels: Option<&VersionLabelStore>,
    bytes: &[u8],
) -> bool {
    layout
        .headers(bytes)
        .any(|(vid, version)| is_live(labels, vid, version))
}

/// `Some(limit)` when a positive latency limit is configured.
pub(crate) fn latency_limit(options: &Options) -> Option<Duration> {
    (options.latency_limit_ms > 0.0).then(|| Duration::from_secs_f64(options.latency_limit_ms / 1000.0))
}
