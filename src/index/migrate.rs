//! Mapped backend: build a static posting file, then migrate every posting
//! into the updatable store.
//!
//! Workers pull posting ids from a shared atomic cursor. Each record is
//! re-stamped with the version byte the label store currently holds, and each
//! migrated posting is capped at the page-derived vector limit.

use crate::error::{Result, SpannError};
use crate::posting::{BuildContext, DynamicPostingStore, PostingStore, RecordLayout, StaticPostingStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

const PROGRESS_INTERVAL: usize = 1 << 14;

pub(crate) fn build_mapped(ctx: &BuildContext<'_>) -> Result<DynamicPostingStore> {
    let started = Instant::now();
    let options = ctx.options;

    let mut source = StaticPostingStore::new();
    source.build_index(ctx)?;
    source.load_index(options, Arc::clone(ctx.labels))?;

    let mut target = DynamicPostingStore::new(options, Arc::clone(ctx.labels));
    target.init_posting_record(ctx.head)?;

    let num_postings = source.num_postings();
    let limit = RecordLayout::vector_limit(ctx.vectors.dimension(), options.posting_page_limit);
    let workers = options.ssd_threads.clamp(1, num_postings.max(1));
    let cursor = AtomicUsize::new(0);
    tracing::info!(postings = num_postings, workers, vector_limit = limit, "migrating postings");

    let (cursor, source_ref, target_ref) = (&cursor, &source, &target);
    let migrated: Result<usize> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(move || -> Result<usize> {
                    let mut records = 0usize;
                    loop {
                        let pid = cursor.fetch_add(1, Ordering::Relaxed);
                        if pid >= num_postings {
                            return Ok(records);
                        }
                        if pid % PROGRESS_INTERVAL == 0 {
                            tracing::info!(pid, total = num_postings, "migration progress");
                        }
                        records += migrate_posting(ctx, source_ref, target_ref, pid as u32, limit)?;
                    }
                })
            })
            .collect();

        let mut total = 0usize;
        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(n)) => total += n,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(SpannError::Fail("migration worker panicked".into()));
                }
            }
        }
        first_error.map_or(Ok(total), Err)
    });
    let migrated = migrated?;

    target.save(&options.index_directory)?;
    tracing::info!(
        records = migrated,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "posting migration complete"
    );
    Ok(target)
}

/// Copy posting `pid` from `source` into `target`; returns the records written.
fn migrate_posting(
    ctx: &BuildContext<'_>,
    source: &StaticPostingStore,
    target: &DynamicPostingStore,
    pid: u32,
    limit: usize,
) -> Result<usize> {
    let raw = source.get_write_posting(pid)?;
    let from = source.layout();
    let to = target.layout();
    let labels = ctx.labels;

    let mut out = Vec::with_capacity((from.count(&raw)? + 1).min(limit) * to.record_size());
    let mut written = 0usize;

    if ctx.options.exclude_head {
        if let Some(&vid) = ctx.head_ids.get(pid as usize) {
            let vid = vid as u32;
            to.encode(&mut out, vid, labels.version(vid), ctx.head.sample(pid as usize));
            written += 1;
        }
    }

    from.for_each(&raw, |entry| {
        if written < limit {
            to.encode(&mut out, entry.vid, labels.version(entry.vid), entry.vector);
            written += 1;
        }
    })?;

    target.write_posting(pid, &out, true)?;
    Ok(written)
}
