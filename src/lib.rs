//! spann: disk-resident two-tier approximate nearest neighbor search.
//!
//! A small in-memory *head index* holds one representative vector per
//! *posting*; the postings, stored on disk or in an updatable store, hold the
//! full vectors assigned to them. A query asks the head index for the nearest
//! postings, then scans only those.
//!
//! - [`head`]: head index trait, flat head index, adaptive head selection
//! - [`partitioning`]: k-means and the hierarchical tree head selection walks
//! - [`posting`]: posting stores (static file, dynamic key-value), record codec
//! - [`version_label`]: lock-free per-vector status and version labels
//! - [`index`]: build pipeline, search, incremental mutation, persistence
//!
//! # Critical Nuances
//!
//! ## Replicas and the relative neighborhood rule
//!
//! Every vector is written to several postings so that a query landing near a
//! cluster boundary still finds it. Replicas are pruned: a candidate head is
//! skipped when it is closer to an already chosen head than to the vector, so
//! the replicas point in different directions instead of piling into one
//! neighborhood.
//!
//! ## Deletes are labels, not rewrites
//!
//! Deleting marks the vector's label; records stay in their postings and are
//! skipped on read. Reassignment bumps a vector's version, which turns its old
//! replicas stale the same way.
//!
//! ## Head ratio
//!
//! The head ratio trades memory for disk reads. More heads mean smaller
//! postings and a larger in-memory index; fewer heads mean each query reads
//! more bytes.

pub mod distance;
pub mod error;
pub mod head;
pub mod index;
pub mod metadata;
pub mod options;
pub mod partitioning;
pub mod posting;
pub mod query;
pub mod vectors;
pub mod version_label;

// Re-exports
pub use distance::DistCalcMethod;
pub use error::{ErrorCode, Result, SpannError};
pub use head::{FlatHeadIndex, HeadIndex};
pub use index::SpannIndex;
pub use options::{Options, PostingBackend, SelectType};
pub use posting::{DynamicPostingStore, PostingStore, StaticPostingStore};
pub use query::{Neighbor, QueryResultSet, SearchResult, SearchStats};
pub use vectors::VectorSet;
pub use version_label::{PostingStatus, VersionLabel, VersionLabelStore};
