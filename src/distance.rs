//! Distance metrics for dense vectors.
//!
//! Both the head index and the posting stores rank candidates with the same
//! [`DistCalcMethod`], so head-stage and disk-stage distances are directly
//! comparable and can share one result set.
//!
//! ## Important nuance
//!
//! [`DistCalcMethod::Cosine`] is computed as `1 - dot(a, b)` and therefore
//! expects **L2-normalized** inputs. The index normalizes vectors on the way in
//! (build, add, query) when the metric is cosine; see [`normalize`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const NORM_EPSILON: f32 = 1e-9;

/// Distance metric used by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistCalcMethod {
    /// Squared Euclidean distance.
    #[default]
    L2,
    /// Cosine distance `1 - cos(a, b)` on normalized vectors.
    Cosine,
}

impl DistCalcMethod {
    /// Compute the distance between two vectors.
    ///
    /// If dimensions mismatch, this returns `f32::INFINITY` (so it is never
    /// selected as a nearest neighbor).
    #[inline]
    #[must_use]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        match self {
            DistCalcMethod::L2 => l2_distance_squared(a, b),
            DistCalcMethod::Cosine => 1.0 - dot(a, b),
        }
    }
}

impl fmt::Display for DistCalcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistCalcMethod::L2 => write!(f, "L2"),
            DistCalcMethod::Cosine => write!(f, "Cosine"),
        }
    }
}

impl FromStr for DistCalcMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("l2") {
            Ok(DistCalcMethod::L2)
        } else if s.eq_ignore_ascii_case("cosine") {
            Ok(DistCalcMethod::Cosine)
        } else {
            Err(())
        }
    }
}

/// Dot product of two vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm of a vector.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// L2 distance squared.
#[inline]
#[must_use]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Normalize a vector in place to unit L2 norm.
///
/// Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > NORM_EPSILON {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}
