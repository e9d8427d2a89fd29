//! Save / load round trips of a built index.

use rand::prelude::*;
use spann::index::{CONFIG_FILE, LABEL_FILE};
use spann::{Options, SpannIndex, VectorSet};
use std::path::Path;

fn random_rows(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.random::<f32>()).collect())
        .collect()
}

fn build(dir: &Path, use_kv: bool, rows: &[Vec<f32>], metadata: Option<Vec<Vec<u8>>>) -> SpannIndex {
    let mut index = SpannIndex::new(Options {
        index_directory: dir.to_path_buf(),
        ratio: 0.1,
        use_kv,
        posting_page_limit: 32,
        search_posting_page_limit: 32,
        ..Options::default()
    });
    index
        .build(VectorSet::from_rows(rows).expect("rows"), metadata)
        .expect("build");
    index
}

#[test]
fn static_index_round_trip() {
    let rows = random_rows(500, 24, 1);
    let build_dir = tempfile::tempdir().expect("tempdir");
    let index = build(build_dir.path(), false, &rows, None);
    index.delete(10).expect("delete");

    let save_dir = tempfile::tempdir().expect("tempdir");
    index.save_index(save_dir.path()).expect("save");
    assert!(save_dir.path().join(CONFIG_FILE).exists());
    assert!(save_dir.path().join(LABEL_FILE).exists());

    let loaded = SpannIndex::load(save_dir.path()).expect("load");
    assert!(loaded.is_ready());
    assert_eq!(loaded.num_vectors(), index.num_vectors());
    assert_eq!(loaded.head_ids(), index.head_ids());
    assert!(loaded.labels().is_deleted(10));
    assert_eq!(loaded.options().dim, 24);

    for q in random_rows(10, 24, 2) {
        assert_eq!(
            loaded.search(&q, 5, false).expect("loaded search"),
            index.search(&q, 5, false).expect("search"),
        );
    }
}

#[test]
fn dynamic_index_keeps_inserts_and_metadata() {
    let rows = random_rows(300, 16, 3);
    let metadata: Vec<Vec<u8>> = (0..rows.len()).map(|i| vec![i as u8]).collect();
    let build_dir = tempfile::tempdir().expect("tempdir");
    let index = build(build_dir.path(), true, &rows, Some(metadata));

    let extra = random_rows(5, 16, 4);
    let flat: Vec<f32> = extra.iter().flatten().copied().collect();
    let extra_meta: Vec<Vec<u8>> = (0..5).map(|i| vec![200 + i as u8]).collect();
    let begin = index.add(&flat, Some(&extra_meta)).expect("add");

    let save_dir = tempfile::tempdir().expect("tempdir");
    index.save_index(save_dir.path()).expect("save");
    drop(index);

    let config = std::fs::read_to_string(save_dir.path().join(CONFIG_FILE)).expect("config");
    let table: toml::Table = toml::from_str(&config).expect("toml config");
    assert_eq!(table["BuildSSDIndex"]["UseKV"].as_bool(), Some(true));
    assert_eq!(table["Base"]["Dim"].as_integer(), Some(16));

    let loaded = SpannIndex::load(save_dir.path()).expect("load");
    assert_eq!(loaded.num_vectors(), 305);
    let hits = loaded.search(&extra[2], 1, true).expect("search");
    assert_eq!(hits[0].vid, begin + 2);
    assert_eq!(hits[0].metadata, Some(vec![202]));
    assert_eq!(loaded.metadata(7), Some(vec![7]));

    // Still updatable after reload.
    let vid = loaded.add(&rows[0], None).expect("add after load");
    assert_eq!(vid, 305);
}

#[test]
fn saving_in_place_reloads() {
    let rows = random_rows(200, 8, 5);
    let dir = tempfile::tempdir().expect("tempdir");
    let index = build(dir.path(), false, &rows, None);
    index.save_index(dir.path()).expect("save in place");

    let loaded = SpannIndex::load(dir.path()).expect("load");
    let hits = loaded.search(&rows[33], 1, false).expect("search");
    assert_eq!(hits[0].vid, 33);
}

#[test]
fn unbuilt_index_cannot_be_saved() {
    let dir = tempfile::tempdir().expect("tempdir");
    let index = SpannIndex::new(Options::default());
    assert!(matches!(
        index.save_index(dir.path()),
        Err(spann::SpannError::EmptyIndex)
    ));
}

#[test]
fn metadata_mapping_is_rebuilt_on_load() {
    let rows = random_rows(200, 8, 6);
    let metadata: Vec<Vec<u8>> = (0..rows.len()).map(|i| format!("k{i}").into_bytes()).collect();
    let build_dir = tempfile::tempdir().expect("tempdir");
    let mut index = SpannIndex::new(Options {
        index_directory: build_dir.path().to_path_buf(),
        ratio: 0.1,
        use_kv: true,
        with_meta_index: true,
        ..Options::default()
    });
    index
        .build(VectorSet::from_rows(&rows).expect("rows"), Some(metadata))
        .expect("build");
    let vid = index.add(&rows[5], Some(&[b"k5".to_vec()])).expect("add");

    let save_dir = tempfile::tempdir().expect("tempdir");
    index.save_index(save_dir.path()).expect("save");
    let loaded = SpannIndex::load(save_dir.path()).expect("load");
    assert!(loaded.options().with_meta_index);
    assert_eq!(loaded.vid_by_metadata(b"k5"), Some(vid));
    assert_eq!(loaded.vid_by_metadata(b"k6"), Some(6));
}
