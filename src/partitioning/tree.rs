//! Hierarchical k-means tree.
//!
//! Node 0 is a virtual root with no centroid. Every vector appears as exactly
//! one node: each cluster is represented by its medoid (the member nearest the
//! cluster mean), and the remaining members become that node's subtree. Groups
//! at or below `leaf_size` are emitted as leaf nodes directly.
//!
//! Children of a node are contiguous, so a node stores only a child range.

use super::kmeans::KMeans;
use crate::distance::DistCalcMethod;
use crate::error::{Result, SpannError};
use crate::head::ClusterTree;
use crate::vectors::VectorSet;
use std::collections::VecDeque;
use std::ops::Range;

/// Tree construction parameters.
#[derive(Debug, Clone)]
pub struct TreeParams {
    /// Fan-out of each k-means split.
    pub kmeans_k: usize,
    /// Groups this small stop splitting.
    pub leaf_size: usize,
    pub max_iterations: usize,
    pub method: DistCalcMethod,
    pub seed: u64,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            kmeans_k: 32,
            leaf_size: 8,
            max_iterations: 10,
            method: DistCalcMethod::L2,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
struct TreeNode {
    centroid: Option<u32>,
    children: Range<usize>,
}

/// Hierarchical k-means tree over a vector set.
#[derive(Debug, Clone)]
pub struct KMeansTree {
    nodes: Vec<TreeNode>,
}

impl KMeansTree {
    pub fn build(vectors: &VectorSet, params: &TreeParams) -> Result<Self> {
        if vectors.is_empty() {
            return Err(SpannError::EmptyData);
        }
        let k = params.kmeans_k.max(2);
        let leaf_size = params.leaf_size.max(1);

        let mut nodes = vec![TreeNode {
            centroid: None,
            children: 0..0,
        }];
        let mut queue: VecDeque<(usize, Vec<u32>)> = VecDeque::new();
        queue.push_back((0, (0..vectors.len() as u32).collect()));
        let mut splits = 0u64;

        while let Some((node, members)) = queue.pop_front() {
            if members.is_empty() {
                continue;
            }
            let start = nodes.len();

            if members.len() <= leaf_size {
                for id in members {
                    nodes.push(TreeNode {
                        centroid: Some(id),
                        children: 0..0,
                    });
                }
                nodes[node].children = start..nodes.len();
                continue;
            }

            let groups = split_members(vectors, &members, k, params, splits)?;
            splits += 1;
            for (medoid, rest) in groups {
                let child = nodes.len();
                nodes.push(TreeNode {
                    centroid: Some(medoid),
                    children: 0..0,
                });
                queue.push_back((child, rest));
            }
            nodes[node].children = start..nodes.len();
        }

        tracing::debug!(nodes = nodes.len(), splits, "built k-means tree");
        Ok(Self { nodes })
    }
}

/// Partition `members` into `(medoid, remaining members)` groups.
fn split_members(
    vectors: &VectorSet,
    members: &[u32],
    k: usize,
    params: &TreeParams,
    salt: u64,
) -> Result<Vec<(u32, Vec<u32>)>> {
    let mut km = KMeans::new(k.min(members.len()))?
        .with_seed(params.seed.wrapping_add(salt))
        .with_max_iterations(params.max_iterations)
        .with_metric(params.method);
    km.fit(vectors, members)?;
    let assignments = km.assign(vectors, members);

    let mut clusters: Vec<Vec<u32>> = vec![Vec::new(); km.centroids().len()];
    for (&id, &c) in members.iter().zip(&assignments) {
        clusters[c].push(id);
    }
    clusters.retain(|c| !c.is_empty());

    // A degenerate split makes no progress; fall back to even chunks.
    if clusters.len() < 2 {
        let chunk = members.len().div_ceil(k);
        clusters = members.chunks(chunk).map(<[u32]>::to_vec).collect();
    }

    Ok(clusters
        .into_iter()
        .map(|mut cluster| {
            let medoid_pos = medoid(vectors, &cluster, params.method);
            let medoid = cluster.swap_remove(medoid_pos);
            (medoid, cluster)
        })
        .collect())
}

/// Position of the member nearest the cluster mean.
fn medoid(vectors: &VectorSet, cluster: &[u32], method: DistCalcMethod) -> usize {
    let dimension = vectors.dimension();
    let mut mean = vec![0.0f32; dimension];
    for &id in cluster {
        for (m, &x) in mean.iter_mut().zip(vectors.get(id as usize)) {
            *m += x;
        }
    }
    for m in &mut mean {
        *m /= cluster.len() as f32;
    }
    cluster
        .iter()
        .enumerate()
        .map(|(pos, &id)| (pos, method.distance(vectors.get(id as usize), &mean)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(pos, _)| pos)
}

impl ClusterTree for KMeansTree {
    fn root(&self) -> usize {
        0
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn centroid(&self, node: usize) -> Option<u32> {
        self.nodes.get(node).and_then(|n| n.centroid)
    }

    fn children(&self, node: usize) -> Range<usize> {
        self.nodes.get(node).map_or(0..0, |n| n.children.clone())
    }
}
