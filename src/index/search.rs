//! Two-stage k-NN search.
//!
//! 1. Head stage: the head index returns up to `internal_result_num` nearest
//!    head samples.
//! 2. Filter stage: candidates farther than `best × max_dist_ratio` are cut
//!    (only when that limit exceeds 0.1), invalid postings are skipped, and the
//!    rest are staged once each.
//! 3. Disk stage: the posting store scans the staged postings.
//! 4. Finalize: drop deleted vids, sort, truncate to `k`.

use super::SpannIndex;
use crate::distance::{normalize, DistCalcMethod};
use crate::error::{Result, SpannError};
use crate::posting::{GroundTruth, Workspace};
use crate::query::{Neighbor, QueryResultSet, SearchResult, SearchStats};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

/// Distance limits at or below this value do not cut candidates.
const MIN_LIMIT_DISTANCE: f32 = 0.1;

impl SpannIndex {
    fn check_query(&self, query: &[f32]) -> Result<()> {
        if !self.ready {
            return Err(SpannError::EmptyIndex);
        }
        if query.len() != self.options.dim {
            return Err(SpannError::DimensionSizeMismatch {
                expected: self.options.dim,
                actual: query.len(),
            });
        }
        Ok(())
    }

    fn prepare_query(&self, query: &[f32]) -> Vec<f32> {
        let mut query = query.to_vec();
        if self.options.dist_calc_method == DistCalcMethod::Cosine {
            normalize(&mut query);
        }
        query
    }

    /// `k` nearest live vectors to `query`, nearest first.
    pub fn search(&self, query: &[f32], k: usize, with_metadata: bool) -> Result<Vec<SearchResult>> {
        self.check_query(query)?;
        let mut results = QueryResultSet::new(query.to_vec(), k);
        self.search_index(&mut results, None)?;
        Ok(results
            .into_results()
            .into_iter()
            .map(|n| SearchResult {
                vid: n.vid,
                distance: n.distance,
                metadata: if with_metadata { self.metadata(n.vid) } else { None },
            })
            .collect())
    }

    /// Run [`SpannIndex::search`] for every query on the rayon pool.
    pub fn search_batch(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<Vec<SearchResult>>> {
        queries
            .par_iter()
            .map(|q| self.search(q, k, false))
            .collect()
    }

    /// Full search into `results`, keeping `results.capacity()` neighbors.
    pub fn search_index(
        &self,
        results: &mut QueryResultSet,
        mut stats: Option<&mut SearchStats>,
    ) -> Result<()> {
        self.check_query(results.target())?;
        let started = Instant::now();
        let head = self.head()?;

        let capacity = self.options.internal_result_num.max(results.capacity());
        let mut candidates = QueryResultSet::new(self.prepare_query(results.target()), capacity);
        head.search(&mut candidates);
        if let Some(s) = stats.as_deref_mut() {
            s.head_checked += head.num_samples();
            s.head_latency += started.elapsed();
        }

        if self.postings.is_some() {
            self.search_disk(&mut candidates, stats.as_deref_mut())?;
        } else {
            candidates.map_vids(|pid| self.translate(pid));
            candidates.retain(|n| !self.labels.is_deleted(n.vid));
        }

        results.clear();
        for n in candidates.results() {
            results.add_point(n.vid, n.distance);
        }
        if let Some(s) = stats {
            s.total_latency += started.elapsed();
        }
        Ok(())
    }

    /// Nearest head samples to `query`, as global vids.
    pub fn search_head(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.check_query(query)?;
        let mut results = QueryResultSet::new(self.prepare_query(query), k);
        self.head()?.search(&mut results);
        results.map_vids(|pid| self.translate(pid));
        results.retain(|n| !self.labels.is_deleted(n.vid));
        Ok(results.into_results())
    }

    /// Disk stage for callers holding head-stage results.
    ///
    /// `results` enters holding head samples (posting ids) nearest first and
    /// leaves holding global vids, sorted, without deleted entries.
    pub fn search_disk(
        &self,
        results: &mut QueryResultSet,
        stats: Option<&mut SearchStats>,
    ) -> Result<()> {
        if !self.ready {
            return Err(SpannError::EmptyIndex);
        }
        let head = self.head()?;
        let store = self.posting_store().ok_or(SpannError::EmptyIndex)?;
        let handle = self.workspaces.acquire();
        let mut ws = handle.lock();
        ws.reset();

        let limit = self.distance_limit(results);
        for n in results.results() {
            if ws.posting_ids.len() >= self.options.internal_result_num {
                break;
            }
            if limit > MIN_LIMIT_DISTANCE && n.distance > limit {
                break;
            }
            if store.check_valid_posting(n.vid) {
                ws.stage_posting(n.vid);
            }
        }

        self.seed_head_results(&mut ws, results);
        store.search_index(&mut ws, results, head, stats, None)?;
        self.finish(results);
        Ok(())
    }

    /// Disk stage in sub-batches of `sub_internal_result_num` head candidates,
    /// recording which ground-truth vids each posting yields.
    pub fn debug_search_disk(
        &self,
        results: &mut QueryResultSet,
        sub_internal_result_num: usize,
        internal_result_num: usize,
        mut stats: Option<&mut SearchStats>,
        truth: &HashSet<u32>,
        found: &mut BTreeMap<u32, BTreeSet<u32>>,
    ) -> Result<()> {
        if !self.ready {
            return Err(SpannError::EmptyIndex);
        }
        let head = self.head()?;
        let store = self.posting_store().ok_or(SpannError::EmptyIndex)?;
        let handle = self.workspaces.acquire();
        let mut ws = handle.lock();
        ws.reset();

        let hits: Vec<Neighbor> = results.results().to_vec();
        let limit = self.distance_limit(results);
        let internal = internal_result_num.min(hits.len());
        let sub = sub_internal_result_num.max(1);
        self.seed_head_results(&mut ws, results);

        for start in (0..internal).step_by(sub) {
            ws.posting_ids.clear();
            for n in &hits[start..(start + sub).min(internal)] {
                if limit > MIN_LIMIT_DISTANCE && n.distance > limit {
                    break;
                }
                if store.check_valid_posting(n.vid) {
                    ws.stage_posting(n.vid);
                }
            }
            let mut bookkeeping = GroundTruth {
                truth,
                found: &mut *found,
            };
            store.search_index(&mut ws, results, head, stats.as_deref_mut(), Some(&mut bookkeeping))?;
        }

        self.finish(results);
        Ok(())
    }

    fn distance_limit(&self, results: &QueryResultSet) -> f32 {
        results
            .best()
            .map_or(f32::MAX, |b| b.distance * self.options.max_dist_ratio)
    }

    /// Keep head samples as results when heads are excluded from postings;
    /// otherwise the postings hold them and the head results are dropped.
    fn seed_head_results(&self, ws: &mut Workspace, results: &mut QueryResultSet) {
        if self.options.exclude_head {
            results.map_vids(|pid| self.translate(pid));
            for n in results.results() {
                ws.mark_vector(n.vid);
            }
        } else {
            results.clear();
        }
    }

    fn finish(&self, results: &mut QueryResultSet) {
        results.retain(|n| !self.labels.is_deleted(n.vid));
        results.sort();
    }
}
