//! Exhaustive head index.
//!
//! Scans every sample per query. Exact, simple, and fast enough for head sets
//! of a few hundred thousand samples. `MaxCheck` and `HashTableExponent` are
//! recorded and reported so a build can hand the same knobs to any head index,
//! but a flat scan always checks every sample.
//!
//! On disk a saved index is a directory with `params.json` (serde_json) and
//! `vectors.bin` (the vector file format from [`crate::vectors`]).

use super::HeadIndex;
use crate::distance::DistCalcMethod;
use crate::error::{Result, SpannError};
use crate::query::QueryResultSet;
use crate::vectors::VectorSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const PARAMS_FILE: &str = "params.json";
const VECTORS_FILE: &str = "vectors.bin";

/// Tunables carried by the head index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatParams {
    pub dist_calc_method: DistCalcMethod,
    pub max_check: usize,
    pub threads: usize,
    pub hash_exp: u32,
}

impl Default for FlatParams {
    fn default() -> Self {
        Self {
            dist_calc_method: DistCalcMethod::L2,
            max_check: 8192,
            threads: 1,
            hash_exp: 4,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    params: FlatParams,
    dimension: usize,
    data: Vec<f32>,
}

/// Brute-force [`HeadIndex`].
#[derive(Debug, Default)]
pub struct FlatHeadIndex {
    params: FlatParams,
    vectors: Option<VectorSet>,
    ready: bool,
}

impl FlatHeadIndex {
    pub fn new(dist_calc_method: DistCalcMethod) -> Self {
        Self {
            params: FlatParams {
                dist_calc_method,
                ..FlatParams::default()
            },
            vectors: None,
            ready: false,
        }
    }

    pub fn params(&self) -> &FlatParams {
        &self.params
    }
}

impl HeadIndex for FlatHeadIndex {
    fn build(&mut self, vectors: &VectorSet) -> Result<()> {
        tracing::debug!(
            samples = vectors.len(),
            dimension = vectors.dimension(),
            "building flat head index"
        );
        self.vectors = Some(vectors.clone());
        self.ready = false;
        Ok(())
    }

    fn search(&self, results: &mut QueryResultSet) {
        let Some(vectors) = &self.vectors else {
            return;
        };
        let method = self.params.dist_calc_method;
        for (i, sample) in vectors.iter().enumerate() {
            let d = method.distance(results.target(), sample);
            results.add_point(i as u32, d);
        }
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let vectors = self.vectors.as_ref().ok_or(SpannError::EmptyIndex)?;
        fs::create_dir_all(dir).map_err(|e| SpannError::create(dir, e))?;
        let params_path = dir.join(PARAMS_FILE);
        let json = serde_json::to_string_pretty(&self.params)?;
        fs::write(&params_path, json).map_err(|e| SpannError::create(&params_path, e))?;
        vectors.save(&dir.join(VECTORS_FILE))
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        let params_path = dir.join(PARAMS_FILE);
        let json = fs::read_to_string(&params_path).map_err(|e| SpannError::open(&params_path, e))?;
        self.params = serde_json::from_str(&json)?;
        self.vectors = Some(VectorSet::load(&dir.join(VECTORS_FILE))?);
        Ok(())
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let vectors = self.vectors.as_ref().ok_or(SpannError::EmptyIndex)?;
        let snapshot = Snapshot {
            params: self.params.clone(),
            dimension: vectors.dimension(),
            data: vectors.as_slice().to_vec(),
        };
        Ok(postcard::to_stdvec(&snapshot)?)
    }

    fn load_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let snapshot: Snapshot = postcard::from_bytes(bytes)?;
        self.params = snapshot.params;
        self.vectors = Some(VectorSet::new(snapshot.data, snapshot.dimension)?);
        Ok(())
    }

    fn set_parameter(&mut self, name: &str, value: &str) -> Result<()> {
        let bad = || SpannError::FailedParseValue {
            name: name.to_string(),
            value: value.to_string(),
        };
        let v = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "distcalcmethod" => self.params.dist_calc_method = v.parse().map_err(|_| bad())?,
            "maxcheck" => self.params.max_check = v.parse().map_err(|_| bad())?,
            "numberofthreads" => self.params.threads = v.parse().map_err(|_| bad())?,
            "hashtableexponent" => self.params.hash_exp = v.parse().map_err(|_| bad())?,
            _ => return Err(SpannError::Fail(format!("unknown head index parameter {name}"))),
        }
        Ok(())
    }

    fn get_parameter(&self, name: &str) -> Option<String> {
        match name.to_ascii_lowercase().as_str() {
            "distcalcmethod" => Some(self.params.dist_calc_method.to_string()),
            "maxcheck" => Some(self.params.max_check.to_string()),
            "numberofthreads" => Some(self.params.threads.to_string()),
            "hashtableexponent" => Some(self.params.hash_exp.to_string()),
            _ => None,
        }
    }

    fn num_samples(&self) -> usize {
        self.vectors.as_ref().map_or(0, VectorSet::len)
    }

    fn sample(&self, i: usize) -> &[f32] {
        self.vectors.as_ref().map_or(&[][..], |v| v.get(i))
    }

    fn dimension(&self) -> usize {
        self.vectors.as_ref().map_or(0, VectorSet::dimension)
    }

    fn update_index(&mut self) -> Result<()> {
        // Flat scan has no auxiliary structure to refresh.
        Ok(())
    }

    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_set() -> VectorSet {
        VectorSet::from_rows(&[vec![0.0, 0.0], vec![1.0, 0.0], vec![5.0, 5.0]]).unwrap()
    }

    #[test]
    fn search_is_exact() {
        let mut index = FlatHeadIndex::new(DistCalcMethod::L2);
        index.build(&small_set()).unwrap();
        let mut results = QueryResultSet::new(vec![0.9, 0.0], 2);
        index.search(&mut results);
        let vids: Vec<u32> = results.results().iter().map(|n| n.vid).collect();
        assert_eq!(vids, vec![1, 0]);
    }

    #[test]
    fn dir_and_bytes_roundtrip() {
        let mut index = FlatHeadIndex::new(DistCalcMethod::L2);
        index.build(&small_set()).unwrap();
        index.set_parameter("MaxCheck", "1024").unwrap();

        let dir = tempfile::tempdir().unwrap();
        index.save(dir.path()).unwrap();
        let mut from_dir = FlatHeadIndex::default();
        from_dir.load(dir.path()).unwrap();
        assert_eq!(from_dir.num_samples(), 3);
        assert_eq!(from_dir.get_parameter("maxcheck").as_deref(), Some("1024"));

        let mut from_bytes = FlatHeadIndex::default();
        from_bytes.load_bytes(&index.to_bytes().unwrap()).unwrap();
        assert_eq!(from_bytes.sample(2), &[5.0, 5.0]);
    }

    #[test]
    fn bad_parameter_values() {
        let mut index = FlatHeadIndex::default();
        assert!(matches!(
            index.set_parameter("MaxCheck", "lots"),
            Err(SpannError::FailedParseValue { .. })
        ));
        assert!(index.set_parameter("Unknown", "1").is_err());
    }

    #[test]
    fn empty_index_cannot_save() {
        let index = FlatHeadIndex::default();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(index.save(dir.path()), Err(SpannError::EmptyIndex)));
    }
}
