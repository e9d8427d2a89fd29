//! Clustering used to pick head vectors.
//!
//! - [`kmeans`]: k-means++ over a subset of rows.
//! - [`tree`]: hierarchical k-means tree implementing [`crate::head::ClusterTree`].

pub mod kmeans;
pub mod tree;

pub use kmeans::KMeans;
pub use tree::{KMeansTree, TreeParams};
