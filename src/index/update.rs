//! Incremental mutation: insert, delete by id, delete by vector, refine.

use super::SpannIndex;
use crate::distance::DistCalcMethod;
use crate::error::{Result, SpannError};
use crate::posting::EXACT_MATCH_EPSILON;
use crate::query::QueryResultSet;
use crate::vectors::VectorSet;

impl SpannIndex {
    /// Insert the row-major vectors in `data`; returns the first assigned vid.
    ///
    /// Vids `begin..begin + n` are reserved under one lock together with the
    /// matching metadata slots, so concurrent inserts get disjoint ranges.
    pub fn add(&self, data: &[f32], metadata: Option<&[Vec<u8>]>) -> Result<u32> {
        if !self.ready {
            return Err(SpannError::EmptyIndex);
        }
        if data.is_empty() {
            return Err(SpannError::EmptyData);
        }
        let dim = self.options.dim;
        if dim == 0 || data.len() % dim != 0 {
            return Err(SpannError::DimensionSizeMismatch {
                expected: dim,
                actual: data.len(),
            });
        }
        let store = self.posting_store().ok_or(SpannError::EmptyIndex)?;
        if !store.is_updatable() {
            return Err(SpannError::Fail(
                "inserts need the dynamic or mapped posting backend".into(),
            ));
        }
        let n = data.len() / dim;
        if let Some(meta) = metadata {
            if meta.len() != n {
                return Err(SpannError::Fail(format!(
                    "{} metadata entries for {n} vectors",
                    meta.len()
                )));
            }
        }

        let begin = {
            let _guard = self.add_lock.lock();
            let begin = self.labels.add_batch(n)?;
            match (&self.metadata, metadata) {
                (Some(entries), Some(meta)) => {
                    entries.add_batch(meta.iter().cloned());
                    if entries.has_mapping() {
                        for (vid, m) in (begin..).zip(meta) {
                            if let Some(old) = entries.update_mapping(m, vid) {
                                self.labels.mark_deleted(old);
                                tracing::debug!(old, vid, "metadata moved to a new vector");
                            }
                        }
                    }
                }
                (Some(entries), None) => {
                    entries.add_batch(std::iter::repeat_with(Vec::new).take(n));
                }
                (None, Some(_)) => {
                    tracing::warn!(count = n, "index carries no metadata; dropping metadata of inserted vectors");
                }
                (None, None) => {}
            }
            begin
        };

        let mut vectors = VectorSet::new(data.to_vec(), dim)?;
        if self.options.dist_calc_method == DistCalcMethod::Cosine {
            vectors.normalize();
        }
        store.add_index(&vectors, self.head()?, begin)?;
        tracing::debug!(begin, count = n, "added vectors");
        Ok(begin)
    }

    /// Mark `vid` deleted. Fails with `VectorNotFound` when it is out of range
    /// or already deleted.
    pub fn delete(&self, vid: u32) -> Result<()> {
        if self.labels.mark_deleted(vid) {
            tracing::debug!(vid, "deleted vector");
            Ok(())
        } else {
            Err(SpannError::VectorNotFound(vid))
        }
    }

    /// Delete the live vector equal to `vector`; returns its vid.
    pub fn delete_by_vector(&self, vector: &[f32]) -> Result<u32> {
        if !self.ready {
            return Err(SpannError::EmptyIndex);
        }
        if vector.len() != self.options.dim {
            return Err(SpannError::DimensionSizeMismatch {
                expected: self.options.dim,
                actual: vector.len(),
            });
        }
        let store = self.posting_store().ok_or(SpannError::EmptyIndex)?;
        let mut vector = vector.to_vec();
        if self.options.dist_calc_method == DistCalcMethod::Cosine {
            crate::distance::normalize(&mut vector);
        }
        let head = self.head()?;
        let found = match store.search_vector(&vector, head)? {
            Some(vid) => Some(vid),
            // Excluded heads live only in the head index.
            None if self.options.exclude_head => self.find_head_exact(vector),
            None => None,
        };
        let vid = found.ok_or(SpannError::ExternalAbort)?;
        self.delete(vid)?;
        Ok(vid)
    }

    fn find_head_exact(&self, vector: Vec<f32>) -> Option<u32> {
        let head = self.head.as_deref()?;
        let mut nearest = QueryResultSet::new(vector, 1);
        head.search(&mut nearest);
        nearest
            .best()
            .filter(|n| n.distance <= EXACT_MATCH_EPSILON)
            .map(|n| self.translate(n.vid))
            .filter(|&vid| !self.labels.is_deleted(vid))
    }

    /// Reassign every live vector to its current nearest postings.
    pub fn refine(&self) -> Result<()> {
        if !self.ready {
            return Err(SpannError::EmptyIndex);
        }
        let store = self.posting_store().ok_or(SpannError::EmptyIndex)?;
        store.refine_index(self.head()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn line_index(dir: &std::path::Path, use_kv: bool) -> SpannIndex {
        let rows: Vec<Vec<f32>> = (0..120).map(|i| vec![i as f32, (i % 7) as f32]).collect();
        let mut index = SpannIndex::new(Options {
            index_directory: dir.to_path_buf(),
            ratio: 0.25,
            use_kv,
            replica_count: 2,
            ..Options::default()
        });
        index.build(VectorSet::from_rows(&rows).unwrap(), None).unwrap();
        index
    }

    #[test]
    fn add_before_build_is_empty_index() {
        let index = SpannIndex::new(Options::default());
        assert!(matches!(index.add(&[1.0, 2.0], None), Err(SpannError::EmptyIndex)));
    }

    #[test]
    fn add_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let index = line_index(dir.path(), true);
        assert!(matches!(index.add(&[], None), Err(SpannError::EmptyData)));
        assert!(matches!(
            index.add(&[1.0, 2.0, 3.0], None),
            Err(SpannError::DimensionSizeMismatch { expected: 2, .. })
        ));
    }

    #[test]
    fn static_backend_refuses_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let index = line_index(dir.path(), false);
        assert!(matches!(index.add(&[1.0, 2.0], None), Err(SpannError::Fail(_))));
        assert_eq!(index.num_vectors(), 120);
    }

    #[test]
    fn add_then_find() {
        let dir = tempfile::tempdir().unwrap();
        let index = line_index(dir.path(), true);
        let begin = index.add(&[60.5, 3.0, 200.0, 0.0], None).unwrap();
        assert_eq!(begin, 120);
        assert_eq!(index.num_vectors(), 122);

        let hits = index.search(&[60.5, 3.0], 1, false).unwrap();
        assert_eq!(hits[0].vid, 120);
        let hits = index.search(&[200.0, 0.0], 1, false).unwrap();
        assert_eq!(hits[0].vid, 121);
    }

    #[test]
    fn delete_twice() {
        let dir = tempfile::tempdir().unwrap();
        let index = line_index(dir.path(), true);
        index.delete(5).unwrap();
        assert!(matches!(index.delete(5), Err(SpannError::VectorNotFound(5))));
        assert!(matches!(index.delete(10_000), Err(SpannError::VectorNotFound(10_000))));
        assert_eq!(index.labels().deleted_count(), 1);
    }

    #[test]
    fn delete_by_vector_finds_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let index = line_index(dir.path(), true);
        assert_eq!(index.delete_by_vector(&[30.0, 2.0]).unwrap(), 30);
        assert!(index.labels().is_deleted(30));
        assert!(matches!(
            index.delete_by_vector(&[30.0, 2.0]),
            Err(SpannError::ExternalAbort)
        ));
    }

    #[test]
    fn refine_keeps_results() {
        let dir = tempfile::tempdir().unwrap();
        let index = line_index(dir.path(), true);
        index.delete(40).unwrap();
        index.refine().unwrap();
        let hits = index.search(&[41.0, 6.0], 3, false).unwrap();
        assert_eq!(hits[0].vid, 41);
        assert!(hits.iter().all(|h| h.vid != 40));
    }
}
