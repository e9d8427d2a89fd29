//! End-to-end tests: build, search, insert, delete across posting backends.

use rand::prelude::*;
use spann::{DistCalcMethod, Options, PostingBackend, QueryResultSet, SpannIndex, VectorSet};
use std::collections::HashSet;
use std::path::Path;

const N: usize = 1_000;
const DIM: usize = 64;

fn random_rows(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
        .collect()
}

fn options(dir: &Path) -> Options {
    Options {
        index_directory: dir.to_path_buf(),
        ratio: 0.1,
        exclude_head: false,
        replica_count: 4,
        // Large enough that no posting is truncated.
        posting_page_limit: 64,
        search_posting_page_limit: 64,
        ..Options::default()
    }
}

fn build(options: Options, rows: &[Vec<f32>]) -> SpannIndex {
    let mut index = SpannIndex::new(options);
    index
        .build(VectorSet::from_rows(rows).expect("rows"), None)
        .expect("build");
    index
}

// =============================================================================
// Build and search
// =============================================================================

#[test]
fn finds_member_vector_at_distance_zero() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(options(dir.path()), &rows);

    assert!(index.is_ready());
    assert_eq!(index.num_vectors(), N);
    let heads = index.head_ids().len();
    assert!(heads > 0 && heads < N, "{heads} heads");

    let hits = index.search(&rows[42], 5, false).expect("search");
    assert_eq!(hits[0].vid, 42);
    assert_eq!(hits[0].distance, 0.0);
    assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
}

#[test]
fn finds_member_vector_with_excluded_heads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(
        Options {
            exclude_head: true,
            ..options(dir.path())
        },
        &rows,
    );

    for vid in [42usize, 7, 999] {
        let hits = index.search(&rows[vid], 1, false).expect("search");
        assert_eq!(hits[0].vid as usize, vid);
        assert_eq!(hits[0].distance, 0.0);
    }

    // A head vector is found through the head stage alone.
    let head_vid = index.head_ids()[0] as usize;
    let hits = index.search(&rows[head_vid], 1, false).expect("search");
    assert_eq!(hits[0].vid as usize, head_vid);
}

#[test]
fn head_only_index_finds_member_vector() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(
        Options {
            ratio: 1.0,
            build_ssd_index: false,
            ..options(dir.path())
        },
        &rows,
    );
    assert!(index.is_ready());
    assert!(index.posting_store().is_none());
    assert_eq!(index.head_ids().len(), N);

    let hits = index.search(&rows[42], 1, false).expect("search");
    assert_eq!(hits[0].vid, 42);
    assert_eq!(hits[0].distance, 0.0);

    let mut results = QueryResultSet::new(rows[42].clone(), 3);
    index.search_index(&mut results, None).expect("search_index");
    let best = results.best().expect("a neighbor");
    assert_eq!(best.vid, 42);
    assert_eq!(best.distance, 0.0);

    index.delete(42).expect("delete");
    let hits = index.search(&rows[42], 1, false).expect("search");
    assert_ne!(hits[0].vid, 42);
}

#[test]
fn recall_against_brute_force() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 3);
    let index = build(options(dir.path()), &rows);
    let queries = random_rows(20, DIM, 99);

    let k = 10;
    let mut found = 0;
    for q in &queries {
        let mut exact: Vec<(usize, f32)> = rows
            .iter()
            .enumerate()
            .map(|(i, r)| (i, DistCalcMethod::L2.distance(q, r)))
            .collect();
        exact.sort_by(|a, b| a.1.total_cmp(&b.1));
        let truth: HashSet<u32> = exact[..k].iter().map(|&(i, _)| i as u32).collect();

        let hits = index.search(q, k, false).expect("search");
        found += hits.iter().filter(|h| truth.contains(&h.vid)).count();
    }
    let recall = found as f64 / (k * queries.len()) as f64;
    assert!(recall >= 0.5, "recall {recall}");
}

#[test]
fn cosine_queries_are_normalized() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(300, 16, 5);
    let index = build(
        Options {
            dist_calc_method: DistCalcMethod::Cosine,
            ..options(dir.path())
        },
        &rows,
    );

    let scaled: Vec<f32> = rows[17].iter().map(|x| x * 3.0).collect();
    let hits = index.search(&scaled, 1, false).expect("search");
    assert_eq!(hits[0].vid, 17);
    assert!(hits[0].distance.abs() < 1e-5);
}

#[test]
fn metadata_is_returned_on_request() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(200, 8, 11);
    let metadata: Vec<Vec<u8>> = (0..rows.len()).map(|i| format!("doc-{i}").into_bytes()).collect();
    let mut index = SpannIndex::new(options(dir.path()));
    index
        .build(VectorSet::from_rows(&rows).expect("rows"), Some(metadata))
        .expect("build");

    let hits = index.search(&rows[9], 1, true).expect("search");
    assert_eq!(hits[0].metadata.as_deref(), Some(&b"doc-9"[..]));
    let hits = index.search(&rows[9], 1, false).expect("search");
    assert_eq!(hits[0].metadata, None);
}

// =============================================================================
// Mutation
// =============================================================================

#[test]
fn inserted_vectors_are_counted_and_searchable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(
        Options {
            use_kv: true,
            ..options(dir.path())
        },
        &rows,
    );
    assert_eq!(index.options().backend(), PostingBackend::Dynamic);

    let extra = random_rows(50, DIM, 7);
    let flat: Vec<f32> = extra.iter().flatten().copied().collect();
    let begin = index.add(&flat, None).expect("add");
    assert_eq!(begin as usize, N);
    assert_eq!(index.num_vectors(), N + 50);

    for (i, v) in extra.iter().enumerate() {
        let hits = index.search(v, 1, false).expect("search");
        assert_eq!(hits[0].vid as usize, N + i);
        assert_eq!(hits[0].distance, 0.0);
    }
}

#[test]
fn deleted_vectors_vanish_from_results() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(options(dir.path()), &rows);

    index.delete(42).expect("delete");
    let hits = index.search(&rows[42], 10, false).expect("search");
    assert!(hits.iter().all(|h| h.vid != 42));
    assert_eq!(index.labels().live_count(), N - 1);
    assert_eq!(index.labels().deleted_count(), 1);
}

fn assert_posting_invalidated_by_deletes(use_kv: bool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(
        Options {
            use_kv,
            ..options(dir.path())
        },
        &rows,
    );
    let store = index.posting_store().expect("posting store");
    assert!(store.check_valid_posting(0));

    let bytes = store.get_write_posting(0).expect("posting");
    let members = store.layout().vids(&bytes).expect("records");
    assert!(!members.is_empty());
    for vid in members {
        // A vector can sit in several postings; deleting it once is enough.
        let _ = index.delete(vid);
    }
    assert!(!store.check_valid_posting(0));
}

#[test]
fn deleting_every_member_invalidates_a_dynamic_posting() {
    assert_posting_invalidated_by_deletes(true);
}

#[test]
fn deleting_every_member_invalidates_a_static_posting() {
    assert_posting_invalidated_by_deletes(false);
}

#[test]
fn delete_by_vector_and_reinsert() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(
        Options {
            use_kv: true,
            ..options(dir.path())
        },
        &rows,
    );

    assert_eq!(index.delete_by_vector(&rows[123]).expect("delete"), 123);
    let vid = index.add(&rows[123], None).expect("reinsert");
    assert_eq!(vid as usize, N);
    let hits = index.search(&rows[123], 1, false).expect("search");
    assert_eq!(hits[0].vid as usize, N);
}

#[test]
fn metadata_mapping_replaces_previous_owner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let metadata: Vec<Vec<u8>> = (0..N).map(|i| format!("doc-{i}").into_bytes()).collect();
    let mut index = SpannIndex::new(Options {
        use_kv: true,
        with_meta_index: true,
        ..options(dir.path())
    });
    index
        .build(VectorSet::from_rows(&rows).expect("rows"), Some(metadata))
        .expect("build");
    assert_eq!(index.vid_by_metadata(b"doc-9"), Some(9));
    assert_eq!(index.vid_by_metadata(b"doc-missing"), None);

    let vid = index
        .add(&rows[9], Some(&[b"doc-9".to_vec()]))
        .expect("add");
    assert_eq!(vid as usize, N);
    assert!(index.labels().is_deleted(9));
    assert_eq!(index.vid_by_metadata(b"doc-9"), Some(vid));

    let hits = index.search(&rows[9], 1, true).expect("search");
    assert_eq!(hits[0].vid, vid);
    assert_eq!(hits[0].metadata.as_deref(), Some(&b"doc-9"[..]));
}

// =============================================================================
// Backends
// =============================================================================

#[test]
fn mapped_backend_matches_static_postings() {
    let rows = random_rows(N, DIM, 42);

    let static_dir = tempfile::tempdir().expect("tempdir");
    let fixed = build(
        Options {
            exclude_head: true,
            ..options(static_dir.path())
        },
        &rows,
    );

    let mapped_dir = tempfile::tempdir().expect("tempdir");
    let mapped = build(
        Options {
            exclude_head: true,
            use_spdk: true,
            ..options(mapped_dir.path())
        },
        &rows,
    );
    assert_eq!(mapped.options().backend(), PostingBackend::Mapped);
    assert_eq!(fixed.head_ids(), mapped.head_ids());

    let from = fixed.posting_store().expect("static store");
    let to = mapped.posting_store().expect("mapped store");
    assert_eq!(from.num_postings(), to.num_postings());
    assert!(to.is_updatable());

    for pid in 0..from.num_postings() as u32 {
        let expected = from.layout().vids(&from.get_write_posting(pid).expect("static")).expect("vids");
        let migrated = to.layout().vids(&to.get_write_posting(pid).expect("mapped")).expect("vids");
        // Excluded heads are prepended to their own posting during migration.
        assert_eq!(migrated[0] as u64, mapped.head_ids()[pid as usize]);
        assert_eq!(&migrated[1..], &expected[..]);
    }

    let hits = mapped.search(&rows[42], 1, false).expect("search");
    assert_eq!(hits[0].vid, 42);
    mapped.add(&rows[0], None).expect("mapped store accepts inserts");
}

#[test]
fn pre_reassign_build_still_finds_members() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(
        Options {
            use_kv: true,
            pre_reassign: true,
            ..options(dir.path())
        },
        &rows,
    );
    // Reassignment bumped every live version once.
    assert_eq!(index.labels().version(42), 1);
    let hits = index.search(&rows[42], 1, false).expect("search");
    assert_eq!(hits[0].vid, 42);
}

#[test]
fn concurrent_search_and_insert() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(
        Options {
            use_kv: true,
            ..options(dir.path())
        },
        &rows,
    );
    let extra = random_rows(40, DIM, 8);

    std::thread::scope(|s| {
        for chunk in extra.chunks(10) {
            let index = &index;
            s.spawn(move || {
                for v in chunk {
                    index.add(v, None).expect("add");
                }
            });
        }
        for t in 0..4 {
            let index = &index;
            let rows = &rows;
            s.spawn(move || {
                for i in (t * 50)..(t * 50 + 50) {
                    let hits = index.search(&rows[i], 1, false).expect("search");
                    assert_eq!(hits[0].vid as usize, i);
                }
            });
        }
    });
    assert_eq!(index.num_vectors(), N + 40);
    assert!(index.workspaces().len() >= 4);
}

#[test]
fn refine_keeps_concurrent_inserts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rows = random_rows(N, DIM, 42);
    let index = build(
        Options {
            use_kv: true,
            ..options(dir.path())
        },
        &rows,
    );
    let extra = random_rows(200, DIM, 17);

    let inserted: Vec<u32> = std::thread::scope(|s| {
        let (index, extra) = (&index, &extra);
        s.spawn(move || {
            for _ in 0..3 {
                index.refine().expect("refine");
            }
        });
        let adder = s.spawn(move || {
            extra
                .iter()
                .map(|v| index.add(v, None).expect("add"))
                .collect::<Vec<_>>()
        });
        adder.join().expect("adder")
    });

    assert_eq!(index.num_vectors(), N + extra.len());
    for (v, vid) in extra.iter().zip(inserted) {
        let hits = index.search(v, 1, false).expect("search");
        assert_eq!(hits[0].vid, vid);
        assert_eq!(hits[0].distance, 0.0);
    }
}
