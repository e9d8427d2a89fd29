//! Build pipeline: SelectHead → BuildHeadIndex → BuildPostingStore → Finalize.
//!
//! Each phase can be switched off in [`Options`]; a skipped phase picks up the
//! artifacts an earlier run left in the index directory. Any phase failure
//! aborts the build as [`SpannError::Fail`]. The optional refine pass is the
//! exception: its failure is logged and the build continues.

use super::migrate::build_mapped;
use super::SpannIndex;
use crate::distance::DistCalcMethod;
use crate::error::{Result, SpannError};
use crate::head::{adjust_options, select_heads, select_random, FlatHeadIndex, HeadIndex, SelectorParams};
use crate::metadata::MetadataStore;
use crate::options::{Options, PostingBackend, SelectType};
use crate::partitioning::{KMeansTree, TreeParams};
use crate::posting::{BuildContext, DynamicPostingStore, PostingStore, StaticPostingStore, WorkspacePool};
use crate::vectors::{load_ids, save_ids, VectorSet};
use crate::version_label::{VersionLabelStore, DEFAULT_BLOCK_SIZE};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

fn thread_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|e| SpannError::Fail(format!("failed to start worker pool: {e}")))
}

/// Run one phase with timing, folding its error into `Fail`.
fn run_phase<T>(name: &str, phase: impl FnOnce() -> Result<T>) -> Result<T> {
    let started = Instant::now();
    tracing::info!(phase = name, "phase started");
    match phase() {
        Ok(value) => {
            tracing::info!(
                phase = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "phase finished"
            );
            Ok(value)
        }
        Err(e) => {
            tracing::error!(phase = name, error = %e, "phase failed");
            Err(SpannError::Fail(format!("{name}: {e}")))
        }
    }
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed build artifact"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove build artifact"),
    }
}

/// Choose head vector ids for `vectors`.
pub(crate) fn select_head_ids(options: &mut Options, vectors: &VectorSet) -> Result<Vec<u32>> {
    let n = vectors.len();
    adjust_options(options, n);
    if n == 1 {
        return Ok(vec![0]);
    }

    let selected = match options.select_type {
        SelectType::Random => select_random(n, options.ratio, options.random_seed),
        SelectType::Tree => {
            let params = TreeParams {
                kmeans_k: options.kmeans_k,
                leaf_size: options.leaf_size,
                method: options.dist_calc_method,
                seed: options.random_seed,
                ..TreeParams::default()
            };
            let tree = KMeansTree::build(vectors, &params)?;
            select_heads(&tree, n, &SelectorParams::from_options(options))
        }
    };
    if selected.is_empty() {
        return Err(SpannError::Fail(
            "no vector could be selected as head with the current settings".into(),
        ));
    }
    tracing::info!(
        selected = selected.len(),
        percent = selected.len() as f64 * 100.0 / n as f64,
        "selected head vectors"
    );
    Ok(selected)
}

impl SpannIndex {
    /// Build the index over `vectors`, optionally with one metadata entry per vector.
    pub fn build(&mut self, vectors: VectorSet, metadata: Option<Vec<Vec<u8>>>) -> Result<()> {
        let started = Instant::now();
        if self.options.dim != 0 && self.options.dim != vectors.dimension() {
            return Err(SpannError::DimensionSizeMismatch {
                expected: self.options.dim,
                actual: vectors.dimension(),
            });
        }
        if let Some(meta) = &metadata {
            if meta.len() != vectors.len() {
                return Err(SpannError::Fail(format!(
                    "{} metadata entries for {} vectors",
                    meta.len(),
                    vectors.len()
                )));
            }
        }
        self.options.dim = vectors.dimension();
        self.ready = false;

        let dir = self.options.index_directory.clone();
        fs::create_dir_all(&dir).map_err(|e| SpannError::create(&dir, e))?;

        let mut vectors = vectors;
        if self.options.dist_calc_method == DistCalcMethod::Cosine {
            vectors.normalize();
        }

        let n = vectors.len();
        self.labels = Arc::new(VersionLabelStore::with_capacity(
            n,
            DEFAULT_BLOCK_SIZE,
            self.label_capacity(n),
        )?);
        let with_meta_index = self.options.with_meta_index;
        self.metadata = metadata.map(|entries| {
            let mut store = MetadataStore::new(entries);
            if with_meta_index {
                store.build_mapping(|_| true);
            }
            store
        });

        let mut head_vectors = None;
        if self.options.select_head {
            let pool = thread_pool(self.options.select_head_threads)?;
            let selected = run_phase("SelectHead", || {
                pool.install(|| self.select_head_phase(&vectors))
            })?;
            head_vectors = Some(selected);
        }

        if self.options.build_head {
            let pool = thread_pool(self.options.build_head_threads)?;
            let head = run_phase("BuildHeadIndex", || {
                pool.install(|| self.build_head_phase(head_vectors.take()))
            })?;
            self.head = Some(head);
        } else {
            let head = run_phase("LoadHeadIndex", || {
                let mut head = FlatHeadIndex::default();
                head.load(&self.options.head_index_dir())?;
                Ok(head)
            })?;
            self.head = Some(Box::new(head));
        }

        if self.head_ids.len() != self.head()?.num_samples() {
            let count = self.head()?.num_samples();
            self.head_ids = load_ids(&self.options.head_id_path(), count)?;
        }

        if self.options.build_ssd_index {
            let pool = thread_pool(self.options.ssd_threads)?;
            let store = run_phase("BuildPostingStore", || {
                pool.install(|| self.build_posting_phase(&vectors))
            })?;
            self.postings = Some(store);
        }

        run_phase("Finalize", || self.finalize_phase())?;
        tracing::info!(
            vectors = n,
            heads = self.head_ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index build complete"
        );
        Ok(())
    }

    fn select_head_phase(&mut self, vectors: &VectorSet) -> Result<VectorSet> {
        let selected = select_head_ids(&mut self.options, vectors)?;
        let head_vectors = vectors.select(&selected)?;
        self.head_ids = selected.iter().map(|&id| id as u64).collect();

        if !self.options.no_output {
            head_vectors.save(&self.options.head_vector_path())?;
            save_ids(&self.options.head_id_path(), &self.head_ids)?;
        }
        Ok(head_vectors)
    }

    fn build_head_phase(&self, head_vectors: Option<VectorSet>) -> Result<Box<dyn HeadIndex>> {
        let head_vectors = match head_vectors {
            Some(v) => v,
            None => VectorSet::load(&self.options.head_vector_path())?,
        };

        let mut head = FlatHeadIndex::new(self.options.dist_calc_method);
        head.set_parameter(
            "NumberOfThreads",
            &self.options.build_head_threads.to_string(),
        )?;
        head.build(&head_vectors)?;

        // Serve from the serialized form so the searched index is what gets persisted.
        let mut reloaded = FlatHeadIndex::default();
        if self.options.no_output {
            reloaded.load_bytes(&head.to_bytes()?)?;
        } else {
            let dir = self.options.head_index_dir();
            head.save(&dir)?;
            reloaded.load(&dir)?;
        }
        tracing::info!(samples = reloaded.num_samples(), "head index ready");
        Ok(Box::new(reloaded))
    }

    fn build_posting_phase(&mut self, vectors: &VectorSet) -> Result<Box<dyn PostingStore>> {
        let options = self.options.clone();
        let head = self.head.as_deref_mut().ok_or(SpannError::EmptyIndex)?;
        head.set_parameter("NumberOfThreads", &options.ssd_threads.to_string())?;
        head.set_parameter("MaxCheck", &options.max_check.to_string())?;
        head.set_parameter("HashTableExponent", &options.hash_exp.to_string())?;
        let head: &dyn HeadIndex = head;

        let ctx = BuildContext {
            vectors,
            head,
            head_ids: &self.head_ids,
            options: &options,
            labels: &self.labels,
        };

        let store: Box<dyn PostingStore> = match options.backend() {
            PostingBackend::Static => {
                let mut store = StaticPostingStore::new();
                store.build_index(&ctx)?;
                store.load_index(&options, Arc::clone(&self.labels))?;
                Box::new(store)
            }
            PostingBackend::Dynamic => {
                let mut store = DynamicPostingStore::new(&options, Arc::clone(&self.labels));
                store.build_index(&ctx)?;
                store.load_index(&options, Arc::clone(&self.labels))?;
                Box::new(store)
            }
            PostingBackend::Mapped => Box::new(build_mapped(&ctx)?),
        };

        if options.pre_reassign {
            if let Err(e) = store.refine_index(head) {
                tracing::warn!(error = %e, "refine pass failed; continuing without it");
            }
        }

        if !options.exclude_head {
            remove_artifact(&options.head_id_path());
        }
        Ok(store)
    }

    fn finalize_phase(&mut self) -> Result<()> {
        let head = self.head.as_deref_mut().ok_or(SpannError::EmptyIndex)?;
        head.set_ready(true);
        self.ready = true;
        self.workspaces = WorkspacePool::new(&self.options);

        if self.options.delete_head_vectors {
            remove_artifact(&self.options.head_vector_path());
        }
        Ok(())
    }
}
