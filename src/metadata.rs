//! Per-vector metadata blobs, kept in lock-step with the vector id space.
//!
//! An optional reverse mapping resolves a metadata value to the newest vid that
//! carries it. The mapping is rebuilt from the entries on load, never saved.

use crate::error::{Result, SpannError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Append-only list of opaque metadata entries, one per vector id.
#[derive(Debug, Default)]
pub struct MetadataStore {
    entries: RwLock<Vec<Vec<u8>>>,
    mapping: Option<RwLock<HashMap<Vec<u8>, u32>>>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<Vec<u8>>,
}

impl MetadataStore {
    pub fn new(entries: Vec<Vec<u8>>) -> Self {
        Self {
            entries: RwLock::new(entries),
            mapping: None,
        }
    }

    /// Map every entry whose vid passes `live` back to its vid. Later vids win.
    pub fn build_mapping(&mut self, live: impl Fn(u32) -> bool) {
        let entries = self.entries.read();
        let mut mapping = HashMap::with_capacity(entries.len());
        for (vid, meta) in entries.iter().enumerate() {
            if live(vid as u32) {
                mapping.insert(meta.clone(), vid as u32);
            }
        }
        drop(entries);
        self.mapping = Some(RwLock::new(mapping));
    }

    pub fn has_mapping(&self) -> bool {
        self.mapping.is_some()
    }

    /// Point `meta` at `vid`; returns the vid it pointed at before.
    pub fn update_mapping(&self, meta: &[u8], vid: u32) -> Option<u32> {
        let mapping = self.mapping.as_ref()?;
        mapping.write().insert(meta.to_vec(), vid).filter(|&old| old != vid)
    }

    /// Newest vid carrying `meta`, when the mapping is enabled.
    pub fn vid_of(&self, meta: &[u8]) -> Option<u32> {
        self.mapping.as_ref()?.read().get(meta).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Append a batch. Returns the id of the first new entry.
    pub fn add_batch(&self, batch: impl IntoIterator<Item = Vec<u8>>) -> u32 {
        let mut entries = self.entries.write();
        let begin = entries.len() as u32;
        entries.extend(batch);
        begin
    }

    /// Copy of the entry for `vid`.
    pub fn get(&self, vid: u32) -> Option<Vec<u8>> {
        self.entries.read().get(vid as usize).cloned()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            entries: self.entries.read().clone(),
        };
        let bytes = postcard::to_stdvec(&snapshot)?;
        fs::write(path, bytes).map_err(|e| SpannError::create(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| SpannError::open(path, e))?;
        let snapshot: Snapshot = postcard::from_bytes(&bytes)?;
        Ok(Self::new(snapshot.entries))
    }
}
