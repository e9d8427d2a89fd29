//! Dense vector sets and their on-disk file format.
//!
//! Format (little-endian):
//! - Count (4 bytes, `i32`)
//! - Dimension (4 bytes, `i32`)
//! - Data (`count * dimension * 4` bytes, `f32`)
//!
//! Id lists (head id file, exclude-head translation table) are flat arrays of
//! `u64` with no header; their length is implied by the head index sample count.

use crate::distance::normalize;
use crate::error::{Result, SpannError};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// A contiguous row-major set of `f32` vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSet {
    data: Vec<f32>,
    dimension: usize,
}

impl VectorSet {
    /// Wrap a flat buffer of `data.len() / dimension` vectors.
    pub fn new(data: Vec<f32>, dimension: usize) -> Result<Self> {
        if dimension == 0 || data.is_empty() {
            return Err(SpannError::EmptyData);
        }
        if data.len() % dimension != 0 {
            return Err(SpannError::DimensionSizeMismatch {
                expected: dimension,
                actual: data.len() % dimension,
            });
        }
        Ok(Self { data, dimension })
    }

    /// Build from row vectors. All rows must share one dimension.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dimension = rows.first().map(Vec::len).ok_or(SpannError::EmptyData)?;
        let mut data = Vec::with_capacity(rows.len() * dimension);
        for row in rows {
            if row.len() != dimension {
                return Err(SpannError::DimensionSizeMismatch {
                    expected: dimension,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Self::new(data, dimension)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn get(&self, i: usize) -> &[f32] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.data.chunks_exact(self.dimension)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Normalize every vector to unit length (cosine metric).
    pub fn normalize(&mut self) {
        for row in self.data.chunks_exact_mut(self.dimension) {
            normalize(row);
        }
    }

    /// Copy out a subset of rows, in the given order.
    pub fn select(&self, ids: &[u32]) -> Result<Self> {
        let mut data = Vec::with_capacity(ids.len() * self.dimension);
        for &id in ids {
            if id as usize >= self.len() {
                return Err(SpannError::Fail(format!(
                    "vector id {id} out of range ({} vectors)",
                    self.len()
                )));
            }
            data.extend_from_slice(self.get(id as usize));
        }
        Self::new(data, self.dimension)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.len() as i32).to_le_bytes())?;
        writer.write_all(&(self.dimension as i32).to_le_bytes())?;
        for x in &self.data {
            writer.write_all(&x.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let count = read_i32(reader)?;
        let dimension = read_i32(reader)?;
        if count <= 0 || dimension <= 0 {
            return Err(SpannError::Format(format!(
                "invalid vector file header: count={count}, dimension={dimension}"
            )));
        }
        let total = count as usize * dimension as usize;
        let mut bytes = vec![0u8; total * 4];
        reader.read_exact(&mut bytes)?;
        let data = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::new(data, dimension as usize)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| SpannError::create(path, e))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| SpannError::open(path, e))?;
        Self::read_from(&mut BufReader::new(file))
    }
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Write a flat `u64` id list.
pub fn save_ids(path: &Path, ids: &[u64]) -> Result<()> {
    let file = File::create(path).map_err(|e| SpannError::create(path, e))?;
    let mut writer = BufWriter::new(file);
    for id in ids {
        writer.write_all(&id.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Read exactly `count` ids from a flat `u64` id list.
pub fn load_ids(path: &Path, count: usize) -> Result<Vec<u64>> {
    let file = File::open(path).map_err(|e| SpannError::open(path, e))?;
    let mut reader = BufReader::new(file);
    let mut bytes = vec![0u8; count * 8];
    reader.read_exact(&mut bytes).map_err(|e| {
        SpannError::Format(format!(
            "id file {} shorter than {count} entries: {e}",
            path.display()
        ))
    })?;
    Ok(bytes
        .chunks_exact(8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect())
}
