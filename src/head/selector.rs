//! Adaptive head selection over a hierarchical clustering tree.
//!
//! Each tree node carries a representative vector (its centroid id). A
//! post-order walk accumulates subtree sizes; a node whose accumulated size
//! reaches `select_threshold` promotes its centroid to the head set and reports
//! size 0 upward. When the size also exceeds `split_threshold`, the largest
//! children are promoted too, so one oversized cluster does not hide behind a
//! single head.
//!
//! The realized ratio is a piecewise-constant function of the two thresholds,
//! so [`select_heads`] calibrates them with a small search: every
//! `select ∈ [2, select_threshold]` gets a binary search over
//! `split ∈ [split_factor, split_threshold]`, and the pair closest to the
//! target ratio wins. This is a local search; tests check tolerance, not
//! exact thresholds.

use crate::options::Options;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::ops::Range;

/// Hierarchical clustering tree consumed by the selector.
///
/// Node ids are dense `usize` indices. Children of a node occupy a contiguous
/// id range. A node without a centroid (typically a virtual root) is never
/// selected itself.
pub trait ClusterTree {
    fn root(&self) -> usize;
    /// Number of nodes.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn centroid(&self, node: usize) -> Option<u32>;
    fn children(&self, node: usize) -> Range<usize>;
}

/// Thresholds driving one evaluation of the tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorParams {
    pub ratio: f64,
    pub select_threshold: usize,
    pub split_threshold: usize,
    pub split_factor: usize,
}

impl SelectorParams {
    pub fn from_options(options: &Options) -> Self {
        Self {
            ratio: options.ratio,
            select_threshold: options.select_threshold,
            split_threshold: options.split_threshold,
            split_factor: options.split_factor,
        }
    }
}

/// Fill in ratio-derived defaults before selection.
///
/// `head_vector_count` overrides the ratio. A ratio that rounds to zero heads
/// is raised until it yields one. The tree fan-out is capped at the head count
/// and zero thresholds are derived from the ratio.
pub fn adjust_options(options: &mut Options, vector_count: usize) {
    if vector_count == 0 {
        return;
    }
    let n = vector_count as f64;
    if options.head_vector_count != 0 {
        options.ratio = options.head_vector_count as f64 / n;
    }

    let mut head_count = (options.ratio * n).round() as usize;
    if head_count == 0 {
        let mut min_count = 1.0;
        while head_count == 0 {
            options.ratio = min_count / n;
            head_count = (options.ratio * n).round() as usize;
            min_count += 0.2;
        }
        tracing::info!(head_count, "ratio selects no heads; raised to at least one");
    }

    if options.kmeans_k > head_count {
        options.kmeans_k = head_count;
        tracing::info!(kmeans_k = head_count, "cluster fan-out capped at head count");
    }

    let max = vector_count.saturating_sub(1);
    if options.select_threshold == 0 {
        options.select_threshold = max.min((1.0 / options.ratio) as usize);
        tracing::info!(select_threshold = options.select_threshold, "derived select threshold");
    }
    if options.split_threshold == 0 {
        options.split_threshold = max.min(options.select_threshold * 2);
        tracing::info!(split_threshold = options.split_threshold, "derived split threshold");
    }
    if options.split_factor == 0 {
        options.split_factor = max.min(((1.0 / options.ratio).round() + 0.5) as usize);
        tracing::info!(split_factor = options.split_factor, "derived split factor");
    }
}

/// Outcome of evaluating one subtree.
#[derive(Debug, Default)]
struct Subtree {
    /// Size still unaccounted for; 0 once this subtree selected.
    size: usize,
    selected: Vec<u32>,
}

fn evaluate<T>(tree: &T, node: usize, select: usize, split: usize, factor: usize) -> Subtree
where
    T: ClusterTree + ?Sized,
{
    let mut selected = Vec::new();
    let mut sized_children = Vec::new();
    let mut size = 1usize;
    for child in tree.children(node) {
        let sub = evaluate(tree, child, select, split, factor);
        selected.extend(sub.selected);
        if sub.size > 0 {
            sized_children.push((child, sub.size));
            size += sub.size;
        }
    }

    if size < select {
        return Subtree { size, selected };
    }

    if let Some(centroid) = tree.centroid(node) {
        selected.push(centroid);
    }
    if size > split {
        sized_children.sort_by(|a, b| b.1.cmp(&a.1));
        let count = ((size as f64 / factor.max(1) as f64).ceil() + 0.5) as usize;
        selected.extend(
            sized_children
                .iter()
                .take(count)
                .filter_map(|&(child, _)| tree.centroid(child)),
        );
    }
    Subtree { size: 0, selected }
}

fn evaluate_sorted<T>(tree: &T, select: usize, split: usize, factor: usize) -> Vec<u32>
where
    T: ClusterTree + ?Sized,
{
    if tree.is_empty() {
        return Vec::new();
    }
    let mut selected = evaluate(tree, tree.root(), select, split, factor).selected;
    selected.sort_unstable();
    selected.dedup();
    selected
}

/// Select head vector ids from `tree`, calibrated towards `params.ratio`.
///
/// Returns sorted, deduplicated ids. When the ratio covers the whole
/// population every id is returned without walking the tree.
pub fn select_heads<T>(tree: &T, vector_count: usize, params: &SelectorParams) -> Vec<u32>
where
    T: ClusterTree + Sync + ?Sized,
{
    if vector_count == 0 {
        return Vec::new();
    }
    if (params.ratio * vector_count as f64).round() as usize >= vector_count {
        return (0..vector_count as u32).collect();
    }

    let n = vector_count as f64;
    let factor = params.split_factor;
    let trials: Vec<(f64, usize, usize)> = (2..=params.select_threshold)
        .into_par_iter()
        .filter_map(|select| {
            let mut best: Option<(f64, usize, usize)> = None;
            let (mut l, mut r) = (factor, params.split_threshold);
            while l + 1 < r {
                let split = (l + r) / 2;
                let count = evaluate_sorted(tree, select, split, factor).len();
                let diff = count as f64 / n - params.ratio;
                tracing::debug!(
                    select,
                    split,
                    diff_pct = diff * 100.0,
                    "head calibration trial"
                );
                if best.map_or(true, |(d, _, _)| diff.abs() < d) {
                    best = Some((diff.abs(), select, split));
                }
                if diff > 0.0 {
                    l = split;
                } else {
                    r = split;
                }
            }
            best
        })
        .collect();

    // Earliest trial wins ties.
    let (mut select, split) = trials
        .iter()
        .fold(None, |acc: Option<(f64, usize, usize)>, &t| match acc {
            Some(a) if a.0 <= t.0 => Some(a),
            _ => Some(t),
        })
        .map_or((params.select_threshold, params.split_threshold), |(_, s, t)| {
            (s, t)
        });
    tracing::info!(select, split, "final head selection thresholds");

    let mut selected = evaluate_sorted(tree, select, split, factor);
    while selected.is_empty() && select > 1 {
        select -= 1;
        tracing::info!(select, "no heads selected; relaxing select threshold");
        selected = evaluate_sorted(tree, select, split, factor);
    }
    selected
}

/// Uniform sample of `round(ratio * vector_count)` ids, sorted.
pub fn select_random(vector_count: usize, ratio: f64, seed: u64) -> Vec<u32> {
    let mut ids: Vec<u32> = (0..vector_count as u32).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    ids.shuffle(&mut rng);
    let head_count = ((ratio * vector_count as f64).round() as usize).min(vector_count);
    ids.truncate(head_count);
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Explicit tree: node 0 is a virtual root; every other node `i` has centroid `i - 1`.
    struct TestTree {
        children: Vec<Range<usize>>,
    }

    impl ClusterTree for TestTree {
        fn root(&self) -> usize {
            0
        }
        fn len(&self) -> usize {
            self.children.len()
        }
        fn centroid(&self, node: usize) -> Option<u32> {
            (node > 0).then(|| node as u32 - 1)
        }
        fn children(&self, node: usize) -> Range<usize> {
            self.children[node].clone()
        }
    }

    /// Root -> `fanout` internal nodes -> `fanout` leaves each.
    fn two_level(fanout: usize) -> TestTree {
        let mut children = vec![1..1 + fanout];
        let first_leaf = 1 + fanout;
        for i in 0..fanout {
            let start = first_leaf + i * fanout;
            children.push(start..start + fanout);
        }
        for _ in 0..fanout * fanout {
            children.push(0..0);
        }
        TestTree { children }
    }

    #[test]
    fn leaves_report_size_one() {
        let tree = two_level(3);
        let sub = evaluate(&tree, 4, 2, 100, 1);
        assert_eq!(sub.size, 1);
        assert!(sub.selected.is_empty());
    }

    #[test]
    fn node_reaching_threshold_selects_centroid() {
        let tree = two_level(3);
        // Each internal node: 1 + 3 leaves = 4.
        let selected = evaluate_sorted(&tree, 4, 100, 1);
        assert_eq!(selected, vec![0, 1, 2]);
        // The virtual root never selects itself.
        let root = evaluate(&tree, 0, 4, 100, 1);
        assert_eq!(root.size, 1);
    }

    #[test]
    fn oversized_nodes_also_select_largest_children() {
        let tree = two_level(4);
        // size 5 > split 4: ceil(5 / 2) + 0.5 -> 3 children also selected.
        let selected = evaluate_sorted(&tree, 5, 4, 2);
        assert_eq!(selected.len(), 4 * 4);
    }

    #[test]
    fn full_ratio_selects_everything() {
        let tree = two_level(3);
        let params = SelectorParams {
            ratio: 1.0,
            select_threshold: 2,
            split_threshold: 4,
            split_factor: 2,
        };
        assert_eq!(select_heads(&tree, 12, &params), (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn relaxes_when_nothing_selected() {
        let tree = two_level(2);
        let params = SelectorParams {
            ratio: 0.01,
            select_threshold: 50,
            split_threshold: 60,
            split_factor: 60,
        };
        let selected = select_heads(&tree, 6, &params);
        assert!(!selected.is_empty());
    }

    #[test]
    fn adjust_derives_thresholds() {
        let mut options = Options {
            ratio: 0.1,
            select_threshold: 0,
            split_threshold: 0,
            split_factor: 0,
            kmeans_k: 500,
            ..Options::default()
        };
        adjust_options(&mut options, 1000);
        assert_eq!(options.select_threshold, 10);
        assert_eq!(options.split_threshold, 20);
        assert_eq!(options.split_factor, 10);
        assert_eq!(options.kmeans_k, 100);
    }

    #[test]
    fn adjust_raises_zero_head_ratio() {
        let mut options = Options {
            ratio: 0.0001,
            ..Options::default()
        };
        adjust_options(&mut options, 100);
        assert!((options.ratio * 100.0).round() >= 1.0);
    }

    #[test]
    fn head_count_overrides_ratio() {
        let mut options = Options {
            head_vector_count: 50,
            ..Options::default()
        };
        adjust_options(&mut options, 200);
        assert_eq!(options.ratio, 0.25);
    }

    #[test]
    fn random_selection_is_seeded() {
        let a = select_random(100, 0.1, 7);
        let b = select_random(100, 0.1, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }
}
