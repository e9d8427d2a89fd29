//! Per-entry lifecycle labels packed into one atomic 64-bit word.
//!
//! Every entry (one per vector id in the index, one per posting in posting-level
//! bookkeeping) owns a single `u64`:
//!
//! ```text
//!  63           37 36           10 9        2 1    0
//! ┌───────────────┬───────────────┬──────────┬──────┐
//! │ primary ref   │ secondary ref │  count   │status│
//! │   (27 bits)   │   (27 bits)   │ (8 bits) │ (2b) │
//! └───────────────┴───────────────┴──────────┴──────┘
//! ```
//!
//! Status moves one way: `Normal -> {Splitting | Merging} -> Deleted`. All
//! mutations are compare-and-swap loops over the *whole* word, so a count bump
//! can never overwrite a concurrent status transition and vice versa.
//!
//! Storage is a fixed directory of lazily allocated blocks. Growing the store
//! allocates new blocks but never moves existing ones, so readers holding an
//! id below the published length never observe relocation.

use crate::error::{Result, SpannError};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

const STATUS_MASK: u64 = 0x0000_0000_0000_0003;
const COUNT_SHIFT: u32 = 2;
const COUNT_MASK: u64 = 0x0000_0000_0000_03fc;
const SECONDARY_SHIFT: u32 = 10;
const SECONDARY_MASK: u64 = 0x0000_001f_ffff_fc00;
const PRIMARY_SHIFT: u32 = 37;
const PRIMARY_MASK: u64 = 0xffff_ffe0_0000_0000;

/// Largest posting id a reference field can hold.
pub const MAX_REFERENCE: u32 = (1 << 27) - 1;

/// Default number of labels per storage block.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 16;

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PostingStatus {
    Normal = 0,
    Splitting = 1,
    Merging = 2,
    Deleted = 3,
}

impl PostingStatus {
    fn from_bits(bits: u64) -> Self {
        match bits & STATUS_MASK {
            0 => PostingStatus::Normal,
            1 => PostingStatus::Splitting,
            2 => PostingStatus::Merging,
            _ => PostingStatus::Deleted,
        }
    }
}

/// A decoded label word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionLabel(u64);

impl VersionLabel {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn status(self) -> PostingStatus {
        PostingStatus::from_bits(self.0)
    }

    #[inline]
    pub fn count(self) -> u8 {
        ((self.0 & COUNT_MASK) >> COUNT_SHIFT) as u8
    }

    #[inline]
    pub fn secondary(self) -> u32 {
        ((self.0 & SECONDARY_MASK) >> SECONDARY_SHIFT) as u32
    }

    #[inline]
    pub fn primary(self) -> u32 {
        ((self.0 & PRIMARY_MASK) >> PRIMARY_SHIFT) as u32
    }

    #[inline]
    #[must_use]
    pub fn with_status(self, status: PostingStatus) -> Self {
        Self((self.0 & !STATUS_MASK) | status as u64)
    }

    #[inline]
    #[must_use]
    pub fn with_count(self, count: u8) -> Self {
        Self((self.0 & !COUNT_MASK) | ((count as u64) << COUNT_SHIFT))
    }

    /// Replace both posting references. Values above [`MAX_REFERENCE`] are masked.
    #[inline]
    #[must_use]
    pub fn with_references(self, primary: u32, secondary: u32) -> Self {
        let kept = self.0 & (STATUS_MASK | COUNT_MASK);
        Self(
            kept | (((primary as u64) << PRIMARY_SHIFT) & PRIMARY_MASK)
                | (((secondary as u64) << SECONDARY_SHIFT) & SECONDARY_MASK),
        )
    }
}

/// Concurrent, growable array of [`VersionLabel`]s with a running deleted counter.
pub struct VersionLabelStore {
    blocks: Box<[OnceLock<Box<[AtomicU64]>>]>,
    block_size: usize,
    capacity: usize,
    len: AtomicUsize,
    deleted: AtomicUsize,
    grow_lock: Mutex<()>,
    count_lock: Mutex<()>,
}

impl VersionLabelStore {
    /// Create a store with `size` zeroed labels and room to grow to `capacity`.
    pub fn with_capacity(size: usize, block_size: usize, capacity: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(SpannError::Fail("label block size must be > 0".into()));
        }
        let capacity = capacity.max(size);
        let num_blocks = capacity.div_ceil(block_size).max(1);
        let blocks = (0..num_blocks).map(|_| OnceLock::new()).collect();
        let store = Self {
            blocks,
            block_size,
            capacity,
            len: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            count_lock: Mutex::new(()),
        };
        if size > 0 {
            store.add_batch(size)?;
        }
        Ok(store)
    }

    /// Capacity for a store starting with `size` labels: `configured`, or
    /// `size + configured` once `size` is already past it, so the store can
    /// still grow.
    pub fn capacity_for(size: usize, configured: usize) -> usize {
        if size > configured {
            size.saturating_add(configured)
        } else {
            configured
        }
    }

    /// Create a store of `size` labels using the default block size.
    pub fn new(size: usize, capacity: usize) -> Result<Self> {
        Self::with_capacity(size, DEFAULT_BLOCK_SIZE.min(capacity.max(1)), capacity)
    }

    /// Append `n` zeroed labels. Returns the first new id.
    ///
    /// Existing labels stay where they are; concurrent readers are unaffected.
    pub fn add_batch(&self, n: usize) -> Result<u32> {
        let _guard = self.grow_lock.lock();
        let begin = self.len.load(Ordering::Acquire);
        let end = begin + n;
        if end > self.capacity || end > u32::MAX as usize {
            return Err(SpannError::CapacityExceeded {
                requested: end,
                capacity: self.capacity,
            });
        }
        if n > 0 {
            let first = begin / self.block_size;
            let last = (end - 1) / self.block_size;
            for block in &self.blocks[first..=last] {
                block.get_or_init(|| (0..self.block_size).map(|_| AtomicU64::new(0)).collect());
            }
        }
        self.len.store(end, Ordering::Release);
        Ok(begin as u32)
    }

    #[inline]
    fn slot(&self, id: u32) -> Option<&AtomicU64> {
        let id = id as usize;
        if id >= self.len.load(Ordering::Acquire) {
            return None;
        }
        self.blocks[id / self.block_size]
            .get()
            .map(|block| &block[id % self.block_size])
    }

    /// Whether `id` is inside the published range.
    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        (id as usize) < self.len.load(Ordering::Acquire)
    }

    /// Current label, or `None` when out of range.
    #[inline]
    pub fn get(&self, id: u32) -> Option<VersionLabel> {
        self.slot(id)
            .map(|slot| VersionLabel(slot.load(Ordering::Acquire)))
    }

    #[inline]
    pub fn raw(&self, id: u32) -> u64 {
        self.get(id).map_or(0, VersionLabel::raw)
    }

    #[inline]
    pub fn status(&self, id: u32) -> Option<PostingStatus> {
        self.get(id).map(VersionLabel::status)
    }

    /// CAS loop applying `update` until it succeeds or `update` declines.
    fn update<F>(&self, id: u32, mut update: F) -> Option<VersionLabel>
    where
        F: FnMut(VersionLabel) -> Option<VersionLabel>,
    {
        let slot = self.slot(id)?;
        let mut current = slot.load(Ordering::Acquire);
        loop {
            let next = update(VersionLabel(current))?;
            match slot.compare_exchange_weak(
                current,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Transition to `Deleted`. Returns `true` only for the first caller.
    pub fn mark_deleted(&self, id: u32) -> bool {
        let won = self
            .update(id, |label| {
                (label.status() != PostingStatus::Deleted)
                    .then(|| label.with_status(PostingStatus::Deleted))
            })
            .is_some();
        if won {
            self.deleted.fetch_add(1, Ordering::AcqRel);
        }
        won
    }

    /// Transition `Normal -> Splitting`.
    pub fn mark_splitting(&self, id: u32) -> bool {
        self.update(id, |label| {
            (label.status() == PostingStatus::Normal)
                .then(|| label.with_status(PostingStatus::Splitting))
        })
        .is_some()
    }

    /// Transition `Normal -> Merging`.
    pub fn mark_merging(&self, id: u32) -> bool {
        self.update(id, |label| {
            (label.status() == PostingStatus::Normal)
                .then(|| label.with_status(PostingStatus::Merging))
        })
        .is_some()
    }

    #[inline]
    pub fn is_deleted(&self, id: u32) -> bool {
        self.status(id) == Some(PostingStatus::Deleted)
    }

    #[inline]
    pub fn is_splitting(&self, id: u32) -> bool {
        self.status(id) == Some(PostingStatus::Splitting)
    }

    #[inline]
    pub fn is_merging(&self, id: u32) -> bool {
        self.status(id) == Some(PostingStatus::Merging)
    }

    /// Current mutation count.
    #[inline]
    pub fn count(&self, id: u32) -> u8 {
        self.get(id).map_or(0, VersionLabel::count)
    }

    /// Version byte stamped into posting records; same field as the count.
    #[inline]
    pub fn version(&self, id: u32) -> u8 {
        self.count(id)
    }

    /// Advance the mutation count by one.
    ///
    /// Returns the new count, or `None` when the entry is deleted or out of
    /// range. The count is 8 bits wide and wraps after 255.
    pub fn increment_count(&self, id: u32) -> Option<u8> {
        let _guard = self.count_lock.lock();
        self.update(id, |label| {
            (label.status() != PostingStatus::Deleted)
                .then(|| label.with_count(label.count().wrapping_add(1)))
        })
        .map(VersionLabel::count)
    }

    /// Store both posting references, keeping status and count.
    ///
    /// Returns `Ok(false)` when the entry is deleted or out of range.
    pub fn set_references(&self, id: u32, primary: u32, secondary: u32) -> Result<bool> {
        if primary > MAX_REFERENCE || secondary > MAX_REFERENCE {
            return Err(SpannError::Fail(format!(
                "posting reference ({primary}, {secondary}) exceeds {MAX_REFERENCE}"
            )));
        }
        Ok(self
            .update(id, |label| {
                (label.status() != PostingStatus::Deleted)
                    .then(|| label.with_references(primary, secondary))
            })
            .is_some())
    }

    #[inline]
    pub fn primary_ref(&self, id: u32) -> u32 {
        self.get(id).map_or(0, VersionLabel::primary)
    }

    #[inline]
    pub fn secondary_ref(&self, id: u32) -> u32 {
        self.get(id).map_or(0, VersionLabel::secondary)
    }

    #[inline]
    pub fn total_count(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::Acquire)
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.total_count() - self.deleted_count()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Serialized size in bytes.
    pub fn buffer_size(&self) -> usize {
        4 + 4 + 4 + self.total_count() * 8
    }

    /// Write the deleted counter followed by the packed label array.
    ///
    /// Format (little-endian): deleted (`i32`), element count (`i32`),
    /// element width in words (`i32`, always 1), then one `u64` per label.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let total = self.total_count();
        writer.write_all(&(self.deleted_count() as i32).to_le_bytes())?;
        writer.write_all(&(total as i32).to_le_bytes())?;
        writer.write_all(&1i32.to_le_bytes())?;
        for id in 0..total as u32 {
            writer.write_all(&self.raw(id).to_le_bytes())?;
        }
        Ok(())
    }

    /// Read a snapshot written by [`VersionLabelStore::save`].
    pub fn load<R: Read>(reader: &mut R, block_size: usize, capacity: usize) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let deleted = i32::from_le_bytes(buf4);
        reader.read_exact(&mut buf4)?;
        let total = i32::from_le_bytes(buf4);
        reader.read_exact(&mut buf4)?;
        let width = i32::from_le_bytes(buf4);
        if deleted < 0 || total < 0 || deleted > total || width != 1 {
            return Err(SpannError::Format(format!(
                "invalid label snapshot header: deleted={deleted}, count={total}, width={width}"
            )));
        }

        let store = Self::with_capacity(
            total as usize,
            block_size,
            Self::capacity_for(total as usize, capacity),
        )?;
        let mut buf8 = [0u8; 8];
        for id in 0..total as u32 {
            reader.read_exact(&mut buf8)?;
            if let Some(slot) = store.slot(id) {
                slot.store(u64::from_le_bytes(buf8), Ordering::Release);
            }
        }
        store.deleted.store(deleted as usize, Ordering::Release);
        Ok(store)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), labels = self.total_count(), "saving version labels");
        let file = File::create(path).map_err(|e| SpannError::create(path, e))?;
        let mut writer = BufWriter::new(file);
        self.save(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_from_path(path: &Path, block_size: usize, capacity: usize) -> Result<Self> {
        tracing::info!(path = %path.display(), "loading version labels");
        let file = File::open(path).map_err(|e| SpannError::open(path, e))?;
        Self::load(&mut BufReader::new(file), block_size, capacity)
    }
}

impl Default for VersionLabelStore {
    /// An empty store with no room to grow.
    fn default() -> Self {
        Self {
            blocks: Box::new([]),
            block_size: 1,
            capacity: 0,
            len: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            count_lock: Mutex::new(()),
        }
    }
}

impl fmt::Debug for VersionLabelStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionLabelStore")
            .field("total", &self.total_count())
            .field("deleted", &self.deleted_count())
            .field("capacity", &self.capacity)
            .field("block_size", &self.block_size)
            .finish()
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Delete(u32),
        Split(u32),
        Merge(u32),
        Increment(u32),
        Grow(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..64u32).prop_map(Op::Delete),
            (0..64u32).prop_map(Op::Split),
            (0..64u32).prop_map(Op::Merge),
            (0..64u32).prop_map(Op::Increment),
            (0..8usize).prop_map(Op::Grow),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// live + deleted == total after any operation sequence
        #[test]
        fn prop_counts_balance(ops in proptest::collection::vec(arb_op(), 0..200)) {
            let store = VersionLabelStore::with_capacity(16, 8, 256).unwrap();
            for op in ops {
                match op {
                    Op::Delete(id) => { store.mark_deleted(id); }
                    Op::Split(id) => { store.mark_splitting(id); }
                    Op::Merge(id) => { store.mark_merging(id); }
                    Op::Increment(id) => { store.increment_count(id); }
                    Op::Grow(n) => { let _ = store.add_batch(n); }
                }
                prop_assert_eq!(store.live_count() + store.deleted_count(), store.total_count());
            }
            let deleted = (0..store.total_count() as u32).filter(|&id| store.is_deleted(id)).count();
            prop_assert_eq!(deleted, store.deleted_count());
        }

        /// Deletion is idempotent
        #[test]
        fn prop_delete_idempotent(id in 0..32u32, repeats in 1..5usize) {
            let store = VersionLabelStore::with_capacity(32, 8, 32).unwrap();
            prop_assert!(store.mark_deleted(id));
            for _ in 0..repeats {
                prop_assert!(!store.mark_deleted(id));
            }
            prop_assert_eq!(store.deleted_count(), 1);
        }

        /// Deleted stays deleted whatever comes after
        #[test]
        fn prop_deleted_is_monotone(ops in proptest::collection::vec(arb_op(), 0..50)) {
            let store = VersionLabelStore::with_capacity(64, 16, 128).unwrap();
            store.mark_deleted(7);
            for op in ops {
                match op {
                    Op::Delete(id) | Op::Split(id) | Op::Merge(id) | Op::Increment(id) => {
                        store.mark_splitting(id);
                        store.mark_merging(id);
                        store.increment_count(id);
                    }
                    Op::Grow(n) => { let _ = store.add_batch(n); }
                }
                prop_assert!(store.is_deleted(7));
            }
        }

        /// Save then load reproduces every word and the counter
        #[test]
        fn prop_roundtrip(ops in proptest::collection::vec(arb_op(), 0..100)) {
            let store = VersionLabelStore::with_capacity(64, 16, 128).unwrap();
            for op in ops {
                match op {
                    Op::Delete(id) => { store.mark_deleted(id); }
                    Op::Split(id) => { store.mark_splitting(id); }
                    Op::Merge(id) => { store.mark_merging(id); }
                    Op::Increment(id) => { store.increment_count(id); }
                    Op::Grow(n) => { let _ = store.add_batch(n); }
                }
            }
            let mut bytes = Vec::new();
            store.save(&mut bytes).unwrap();
            let loaded = VersionLabelStore::load(&mut bytes.as_slice(), 16, 128).unwrap();
            prop_assert_eq!(loaded.deleted_count(), store.deleted_count());
            prop_assert_eq!(loaded.total_count(), store.total_count());
            for id in 0..store.total_count() as u32 {
                prop_assert_eq!(loaded.raw(id), store.raw(id));
            }
        }
    }
}
