//! The two-tier index: head index + posting store + label store.
//!
//! Lifecycle: [`SpannIndex::new`] with options, [`SpannIndex::build`] over a
//! vector set (or [`SpannIndex::load`] a saved directory), then search and
//! mutate concurrently through `&self`.
//!
//! ```text
//! query ─► head index (internal_result_num candidates)
//!              │ distance cutoff, validity, dedup
//!              ▼
//!          posting store (staged postings) ─► merged, sorted, top-k
//! ```
//!
//! Saved layout (inside one directory):
//! - `spann.toml`: options
//! - `HeadIndex/`: head index
//! - head id file: global vid per head sample (`u64` array)
//! - `DeletedIDs.bin`: label snapshot
//! - `metadata.bin`: optional metadata
//! - posting file (static) or posting snapshot (dynamic / mapped)

mod build;
mod migrate;
mod search;
mod update;

use crate::error::{Result, SpannError};
use crate::head::{FlatHeadIndex, HeadIndex};
use crate::metadata::MetadataStore;
use crate::options::{Options, PostingBackend};
use crate::posting::{DynamicPostingStore, PostingStore, StaticPostingStore, WorkspacePool};
use crate::vectors::{load_ids, save_ids};
use crate::version_label::{VersionLabelStore, DEFAULT_BLOCK_SIZE};
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Options file written by [`SpannIndex::save_index`].
pub const CONFIG_FILE: &str = "spann.toml";
/// Label snapshot file.
pub const LABEL_FILE: &str = "DeletedIDs.bin";
/// Metadata file, present only when the index carries metadata.
pub const METADATA_FILE: &str = "metadata.bin";

/// Two-tier approximate nearest neighbor index.
pub struct SpannIndex {
    options: Options,
    head: Option<Box<dyn HeadIndex>>,
    postings: Option<Box<dyn PostingStore>>,
    labels: Arc<VersionLabelStore>,
    metadata: Option<MetadataStore>,
    /// Global vid of each head sample.
    head_ids: Vec<u64>,
    workspaces: WorkspacePool,
    add_lock: Mutex<()>,
    ready: bool,
}

impl SpannIndex {
    pub fn new(options: Options) -> Self {
        let workspaces = WorkspacePool::new(&options);
        Self {
            options,
            head: None,
            postings: None,
            labels: Arc::new(VersionLabelStore::default()),
            metadata: None,
            head_ids: Vec::new(),
            workspaces,
            add_lock: Mutex::new(()),
            ready: false,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn dimension(&self) -> usize {
        self.options.dim
    }

    /// Vector ids handed out so far, deleted ones included.
    pub fn num_vectors(&self) -> usize {
        self.labels.total_count()
    }

    pub fn labels(&self) -> &VersionLabelStore {
        &self.labels
    }

    pub fn head_index(&self) -> Option<&dyn HeadIndex> {
        self.head.as_deref()
    }

    pub fn posting_store(&self) -> Option<&dyn PostingStore> {
        self.postings.as_deref()
    }

    /// Global vid of each head sample.
    pub fn head_ids(&self) -> &[u64] {
        &self.head_ids
    }

    pub fn workspaces(&self) -> &WorkspacePool {
        &self.workspaces
    }

    /// Metadata for `vid`, if the index carries metadata.
    pub fn metadata(&self, vid: u32) -> Option<Vec<u8>> {
        self.metadata.as_ref().and_then(|m| m.get(vid))
    }

    /// Live vid carrying `meta`, when the index keeps a metadata mapping.
    pub fn vid_by_metadata(&self, meta: &[u8]) -> Option<u32> {
        self.metadata
            .as_ref()?
            .vid_of(meta)
            .filter(|&vid| !self.labels.is_deleted(vid))
    }

    fn head(&self) -> Result<&dyn HeadIndex> {
        self.head.as_deref().ok_or(SpannError::EmptyIndex)
    }

    /// Global vid for head sample `pid`.
    fn translate(&self, pid: u32) -> u32 {
        self.head_ids.get(pid as usize).map_or(pid, |&vid| vid as u32)
    }

    fn label_capacity(&self, initial: usize) -> usize {
        VersionLabelStore::capacity_for(initial, self.options.vector_capacity)
    }

    /// Persist everything needed to [`SpannIndex::load`] the index from `dir`.
    pub fn save_index(&self, dir: &Path) -> Result<()> {
        if !self.ready {
            return Err(SpannError::EmptyIndex);
        }
        let head = self.head()?;
        fs::create_dir_all(dir).map_err(|e| SpannError::create(dir, e))?;

        let mut options = self.options.clone();
        options.index_directory = dir.to_path_buf();
        options.save(&dir.join(CONFIG_FILE))?;

        head.save(&options.head_index_dir())?;
        save_ids(&options.head_id_path(), &self.head_ids)?;
        self.labels.save_to_path(&dir.join(LABEL_FILE))?;
        if let Some(metadata) = &self.metadata {
            metadata.save(&dir.join(METADATA_FILE))?;
        }
        if let Some(postings) = &self.postings {
            postings.save(dir)?;
        }
        tracing::info!(dir = %dir.display(), vectors = self.num_vectors(), "saved index");
        Ok(())
    }

    /// Open an index saved by [`SpannIndex::save_index`].
    pub fn load(dir: &Path) -> Result<Self> {
        let mut options = Options::load(&dir.join(CONFIG_FILE))?;
        options.index_directory = dir.to_path_buf();

        let mut head = FlatHeadIndex::default();
        head.load(&options.head_index_dir())?;
        let head_ids = load_ids(&options.head_id_path(), head.num_samples())?;

        let capacity = options.vector_capacity;
        let labels = Arc::new(VersionLabelStore::load_from_path(
            &dir.join(LABEL_FILE),
            DEFAULT_BLOCK_SIZE,
            capacity,
        )?);

        let metadata_path = dir.join(METADATA_FILE);
        let metadata = if metadata_path.exists() {
            let mut store = MetadataStore::load(&metadata_path)?;
            if options.with_meta_index {
                store.build_mapping(|vid| !labels.is_deleted(vid));
            }
            Some(store)
        } else {
            None
        };

        let postings: Option<Box<dyn PostingStore>> = if options.build_ssd_index {
            let mut store: Box<dyn PostingStore> = match options.backend() {
                PostingBackend::Static => Box::new(StaticPostingStore::new()),
                PostingBackend::Dynamic | PostingBackend::Mapped => Box::new(
                    DynamicPostingStore::new(&options, Arc::clone(&labels)),
                ),
            };
            store.load_index(&options, Arc::clone(&labels))?;
            Some(store)
        } else {
            None
        };

        head.set_ready(true);
        tracing::info!(
            dir = %dir.display(),
            vectors = labels.total_count(),
            deleted = labels.deleted_count(),
            heads = head.num_samples(),
            "loaded index"
        );
        Ok(Self {
            workspaces: WorkspacePool::new(&options),
            options,
            head: Some(Box::new(head)),
            postings,
            labels,
            metadata,
            head_ids,
            add_lock: Mutex::new(()),
            ready: true,
        })
    }
}
