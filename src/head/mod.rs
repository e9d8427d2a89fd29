//! The in-memory head index: routes a query to the postings worth reading.
//!
//! The head index holds one sample per posting (the posting's centroid). Sample
//! `i` of the head index *is* posting `i`. The head index never knows global
//! vector ids; the optional translation table kept by the index maps sample
//! positions back to them.

pub mod flat;
pub mod selector;

pub use flat::FlatHeadIndex;
pub use selector::{adjust_options, select_heads, select_random, ClusterTree, SelectorParams};

use crate::error::Result;
use crate::query::QueryResultSet;
use crate::vectors::VectorSet;
use std::path::Path;

/// In-memory routing index over head vectors.
///
/// Searching is `&self` and must be safe from many threads at once. Building,
/// loading and parameter changes take `&mut self` and happen before serving.
pub trait HeadIndex: Send + Sync {
    /// Build over `vectors`; sample `i` becomes vectors row `i`.
    fn build(&mut self, vectors: &VectorSet) -> Result<()>;

    /// Fill `results` with the nearest samples to `results.target()`.
    fn search(&self, results: &mut QueryResultSet);

    fn save(&self, dir: &Path) -> Result<()>;
    fn load(&mut self, dir: &Path) -> Result<()>;

    /// In-memory serialized form.
    fn to_bytes(&self) -> Result<Vec<u8>>;
    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<()>;
    fn get_parameter(&self, name: &str) -> Option<String>;

    fn num_samples(&self) -> usize;
    fn sample(&self, i: usize) -> &[f32];
    fn dimension(&self) -> usize;

    /// Apply pending structural updates.
    fn update_index(&mut self) -> Result<()>;

    fn set_ready(&mut self, ready: bool);
    fn is_ready(&self) -> bool;
}
