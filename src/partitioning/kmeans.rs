//! k-means clustering over a subset of a vector set.
//!
//! Used by the hierarchical tree to split one node's members into `k` groups.
//! Initialization is k-means++; assignment runs in parallel with rayon.

use crate::distance::DistCalcMethod;
use crate::error::{Result, SpannError};
use crate::vectors::VectorSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// k-means clustering for partitioning vectors.
pub struct KMeans {
    /// Centroids (k x dimension)
    centroids: Vec<Vec<f32>>,
    k: usize,
    seed: Option<u64>,
    max_iterations: usize,
    method: DistCalcMethod,
}

impl KMeans {
    /// Create new k-means with k clusters.
    pub fn new(k: usize) -> Result<Self> {
        if k == 0 {
            return Err(SpannError::Fail("k must be greater than 0".to_string()));
        }
        Ok(Self {
            centroids: Vec::new(),
            k,
            seed: None,
            max_iterations: 100,
            method: DistCalcMethod::L2,
        })
    }

    /// Configure a deterministic seed for k-means++ initialization.
    ///
    /// When set, repeated `fit(...)` calls on the same inputs produce identical results.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations.max(1);
        self
    }

    #[must_use]
    pub fn with_metric(mut self, method: DistCalcMethod) -> Self {
        self.method = method;
        self
    }

    /// Train on the rows named by `ids`.
    pub fn fit(&mut self, vectors: &VectorSet, ids: &[u32]) -> Result<()> {
        if ids.is_empty() {
            return Err(SpannError::EmptyData);
        }
        if let Some(&bad) = ids.iter().find(|&&id| id as usize >= vectors.len()) {
            return Err(SpannError::Fail(format!("vector id {bad} out of range")));
        }

        self.centroids = self.kmeans_plus_plus(vectors, ids);

        for _iteration in 0..self.max_iterations {
            let assignments = self.assign(vectors, ids);
            let new_centroids = self.update_centroids(vectors, ids, &assignments);

            let converged = self
                .centroids
                .iter()
                .zip(new_centroids.iter())
                .all(|(old, new)| DistCalcMethod::L2.distance(old, new) <= 1e-6);

            self.centroids = new_centroids;
            if converged {
                break;
            }
        }
        Ok(())
    }

    /// k-means++ initialization.
    fn kmeans_plus_plus(&self, vectors: &VectorSet, ids: &[u32]) -> Vec<Vec<f32>> {
        // Use an explicit seed when configured; otherwise derive one from entropy.
        let seed = self.seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);
        let k = self.k.min(ids.len());

        let first = ids[rng.random_range(0..ids.len())];
        let mut centroids = vec![vectors.get(first as usize).to_vec()];
        let mut nearest: Vec<f32> = ids
            .iter()
            .map(|&id| self.method.distance(vectors.get(id as usize), &centroids[0]))
            .collect();

        while centroids.len() < k {
            let total: f64 = nearest.iter().map(|&d| d.max(0.0) as f64).sum();
            let pick = if total <= 0.0 {
                // All remaining points coincide with a centroid.
                rng.random_range(0..ids.len())
            } else {
                let threshold = rng.random::<f64>() * total;
                let mut cumulative = 0.0;
                nearest
                    .iter()
                    .position(|&d| {
                        cumulative += d.max(0.0) as f64;
                        cumulative >= threshold
                    })
                    .unwrap_or(ids.len() - 1)
            };
            let centroid = vectors.get(ids[pick] as usize).to_vec();
            for (slot, &id) in nearest.iter_mut().zip(ids) {
                let d = self.method.distance(vectors.get(id as usize), &centroid);
                if d < *slot {
                    *slot = d;
                }
            }
            centroids.push(centroid);
        }
        centroids
    }

    /// Index of the nearest centroid for each id.
    pub fn assign(&self, vectors: &VectorSet, ids: &[u32]) -> Vec<usize> {
        ids.par_iter()
            .map(|&id| self.nearest_centroid(vectors.get(id as usize)))
            .collect()
    }

    fn nearest_centroid(&self, v: &[f32]) -> usize {
        let mut best_cluster = 0;
        let mut best_dist = f32::INFINITY;
        for (cluster_idx, centroid) in self.centroids.iter().enumerate() {
            let dist = self.method.distance(v, centroid);
            if dist < best_dist {
                best_dist = dist;
                best_cluster = cluster_idx;
            }
        }
        best_cluster
    }

    /// Update centroids based on assignments.
    fn update_centroids(&self, vectors: &VectorSet, ids: &[u32], assignments: &[usize]) -> Vec<Vec<f32>> {
        let k = self.centroids.len();
        let dimension = vectors.dimension();
        let mut sums = vec![vec![0.0f32; dimension]; k];
        let mut counts = vec![0usize; k];

        for (&id, &cluster) in ids.iter().zip(assignments) {
            counts[cluster] += 1;
            for (s, &x) in sums[cluster].iter_mut().zip(vectors.get(id as usize)) {
                *s += x;
            }
        }

        sums.into_iter()
            .zip(counts)
            .zip(&self.centroids)
            .map(|((sum, count), old)| {
                if count > 0 {
                    sum.into_iter().map(|s| s / count as f32).collect()
                } else {
                    // Empty cluster: keep old centroid
                    old.clone()
                }
            })
            .collect()
    }

    /// Get centroids.
    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn separates_two_blobs() {
        let mut rows = Vec::new();
        for i in 0..20 {
            let jitter = i as f32 * 0.01;
            rows.push(vec![jitter, 0.0]);
            rows.push(vec![10.0 + jitter, 10.0]);
        }
        let vectors = VectorSet::from_rows(&rows).unwrap();
        let ids: Vec<u32> = (0..40).collect();
        let mut km = KMeans::new(2).unwrap().with_seed(3);
        km.fit(&vectors, &ids).unwrap();
        let a = km.assign(&vectors, &ids);
        for pair in a.chunks(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert!(a.iter().step_by(2).all(|&c| c == a[0]));
    }

    #[test]
    fn duplicates_do_not_stall_init() {
        let vectors = VectorSet::from_rows(&vec![vec![1.0, 1.0]; 8]).unwrap();
        let ids: Vec<u32> = (0..8).collect();
        let mut km = KMeans::new(4).unwrap().with_seed(1);
        km.fit(&vectors, &ids).unwrap();
        assert_eq!(km.centroids().len(), 4);
    }

    proptest! {
        #[test]
        fn prop_kmeans_fit_is_deterministic_given_seed(
            seed in any::<u64>(),
            dimension in 1usize..16,
            num_vectors in 2usize..64,
            k in 1usize..16,
            raw in proptest::collection::vec(-1.0f32..1.0f32, 2usize..(64*16)),
        ) {
            prop_assume!(k <= num_vectors);
            let needed = num_vectors * dimension;
            prop_assume!(raw.len() >= needed);

            let vectors = VectorSet::new(raw[..needed].to_vec(), dimension).unwrap();
            let ids: Vec<u32> = (0..num_vectors as u32).collect();

            let mut km1 = KMeans::new(k).unwrap().with_seed(seed);
            let mut km2 = KMeans::new(k).unwrap().with_seed(seed);

            km1.fit(&vectors, &ids).unwrap();
            km2.fit(&vectors, &ids).unwrap();

            let a1 = km1.assign(&vectors, &ids);
            let a2 = km2.assign(&vectors, &ids);
            prop_assert_eq!(a1, a2);
        }
    }
}
