//! Posting record layout.
//!
//! A posting is a flat byte string of fixed-size records, little-endian:
//!
//! ```text
//! static:     [vid: u32][vector: f32 x dim]
//! versioned:  [vid: u32][version: u8][vector: f32 x dim]
//! ```
//!
//! Versioned records carry the vector's mutation count at write time; a record
//! whose version no longer matches the label store is a stale replica.

use crate::error::{Result, SpannError};

/// Bytes per storage page; posting sizes are budgeted in pages.
pub const PAGE_SIZE: usize = 4096;

/// Record geometry for one posting store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub dimension: usize,
    pub versioned: bool,
}

/// One decoded record.
#[derive(Debug, Clone, Copy)]
pub struct PostingEntry<'a> {
    pub vid: u32,
    pub version: Option<u8>,
    pub vector: &'a [f32],
}

impl RecordLayout {
    pub fn new(dimension: usize, versioned: bool) -> Self {
        Self {
            dimension,
            versioned,
        }
    }

    #[inline]
    pub fn header_size(&self) -> usize {
        if self.versioned {
            5
        } else {
            4
        }
    }

    #[inline]
    pub fn record_size(&self) -> usize {
        self.header_size() + 4 * self.dimension
    }

    /// Most records that fit in `page_limit` pages, sized as versioned records.
    pub fn vector_limit(dimension: usize, page_limit: usize) -> usize {
        (page_limit * PAGE_SIZE / (4 * dimension + 4 + 1)).max(1)
    }

    pub fn encode(&self, out: &mut Vec<u8>, vid: u32, version: u8, vector: &[f32]) {
        out.extend_from_slice(&vid.to_le_bytes());
        if self.versioned {
            out.push(version);
        }
        for x in vector {
            out.extend_from_slice(&x.to_le_bytes());
        }
    }

    /// Number of whole records in `bytes`; errors on a trailing fragment.
    pub fn count(&self, bytes: &[u8]) -> Result<usize> {
        let size = self.record_size();
        if bytes.len() % size != 0 {
            return Err(SpannError::Format(format!(
                "posting of {} bytes is not a multiple of record size {size}",
                bytes.len()
            )));
        }
        Ok(bytes.len() / size)
    }

    /// Decode every record, handing each to `visit`.
    pub fn for_each<F>(&self, bytes: &[u8], mut visit: F) -> Result<usize>
    where
        F: FnMut(PostingEntry<'_>),
    {
        let count = self.count(bytes)?;
        let header = self.header_size();
        let mut vector = vec![0.0f32; self.dimension];
        for record in bytes.chunks_exact(self.record_size()) {
            let vid = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let version = self.versioned.then(|| record[4]);
            for (x, b) in vector.iter_mut().zip(record[header..].chunks_exact(4)) {
                *x = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
            visit(PostingEntry {
                vid,
                version,
                vector: &vector,
            });
        }
        Ok(count)
    }

    /// Vector ids in record order.
    pub fn vids(&self, bytes: &[u8]) -> Result<Vec<u32>> {
        self.count(bytes)?;
        Ok(bytes
            .chunks_exact(self.record_size())
            .map(|r| u32::from_le_bytes([r[0], r[1], r[2], r[3]]))
            .collect())
    }

    /// `(vid, version)` of each whole record, without decoding vectors.
    pub fn headers<'a>(&self, bytes: &'a [u8]) -> impl Iterator<Item = (u32, Option<u8>)> + 'a {
        let versioned = self.versioned;
        bytes
            .chunks_exact(self.record_size())
            .map(move |r| (u32::from_le_bytes([r[0], r[1], r[2], r[3]]), versioned.then(|| r[4])))
    }
}
