//! Index configuration.
//!
//! [`Options`] is a plain struct with defaults. String-keyed access
//! (`set_parameter` / `get_parameter`) and the TOML config file both go
//! through one schema table, [`PARAMETERS`], so adding a knob means adding one
//! field and one table row.
//!
//! File layout written by [`Options::to_toml`]:
//!
//! ```toml
//! [Base]
//! Dim = 64
//! DistCalcMethod = "L2"
//!
//! [SelectHead]
//! Ratio = 0.1
//! ```

use crate::distance::DistCalcMethod;
use crate::error::{Result, SpannError};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use toml::{Table, Value};

/// Configuration section a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Base,
    SelectHead,
    BuildHead,
    BuildSSDIndex,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Base,
        Section::SelectHead,
        Section::BuildHead,
        Section::BuildSSDIndex,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Section::Base => "Base",
            Section::SelectHead => "SelectHead",
            Section::BuildHead => "BuildHead",
            Section::BuildSSDIndex => "BuildSSDIndex",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Section::ALL
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

/// How head vectors are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectType {
    /// Adaptive selection over a hierarchical k-means tree.
    #[default]
    Tree,
    /// Seeded uniform sample.
    Random,
}

impl fmt::Display for SelectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectType::Tree => write!(f, "BKT"),
            SelectType::Random => write!(f, "Random"),
        }
    }
}

impl FromStr for SelectType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("bkt") || s.eq_ignore_ascii_case("tree") {
            Ok(SelectType::Tree)
        } else if s.eq_ignore_ascii_case("random") {
            Ok(SelectType::Random)
        } else {
            Err(())
        }
    }
}

/// Posting store backend chosen by the `UseKV` / `UseSPDK` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingBackend {
    /// Read-only posting file.
    Static,
    /// Updatable key-value style store.
    Dynamic,
    /// Static build migrated into the updatable store.
    Mapped,
}

/// All build and search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    // Base
    pub dim: usize,
    pub value_type: String,
    pub dist_calc_method: DistCalcMethod,
    pub index_directory: PathBuf,
    pub head_index_folder: String,
    pub head_vector_file: String,
    pub head_id_file: String,
    pub delete_head_vectors: bool,
    /// Keep a metadata to vid mapping; inserting a known metadata value
    /// deletes the vector that carried it before.
    pub with_meta_index: bool,

    // SelectHead
    pub select_head: bool,
    pub select_type: SelectType,
    pub ratio: f64,
    pub head_vector_count: usize,
    pub select_threshold: usize,
    pub split_threshold: usize,
    pub split_factor: usize,
    pub kmeans_k: usize,
    pub leaf_size: usize,
    pub select_head_threads: usize,
    pub random_seed: u64,
    pub no_output: bool,

    // BuildHead
    pub build_head: bool,
    pub build_head_threads: usize,

    // BuildSSDIndex
    pub build_ssd_index: bool,
    pub internal_result_num: usize,
    pub posting_page_limit: usize,
    pub search_posting_page_limit: usize,
    pub max_dist_ratio: f32,
    pub replica_count: usize,
    pub exclude_head: bool,
    pub use_kv: bool,
    pub use_spdk: bool,
    pub in_place: bool,
    pub ssd_threads: usize,
    pub max_check: usize,
    pub hash_exp: u32,
    pub latency_limit_ms: f64,
    pub pre_reassign: bool,
    pub vector_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dim: 0,
            value_type: "Float".to_string(),
            dist_calc_method: DistCalcMethod::L2,
            index_directory: PathBuf::from("."),
            head_index_folder: "HeadIndex".to_string(),
            head_vector_file: "SPTAGHeadVectors.bin".to_string(),
            head_id_file: "SPTAGHeadVectorIDs.bin".to_string(),
            delete_head_vectors: false,
            with_meta_index: false,

            select_head: true,
            select_type: SelectType::Tree,
            ratio: 0.2,
            head_vector_count: 0,
            select_threshold: 6,
            split_threshold: 25,
            split_factor: 5,
            kmeans_k: 32,
            leaf_size: 8,
            select_head_threads: 4,
            random_seed: 42,
            no_output: false,

            build_head: true,
            build_head_threads: 4,

            build_ssd_index: true,
            internal_result_num: 64,
            posting_page_limit: 3,
            search_posting_page_limit: 3,
            max_dist_ratio: 10_000.0,
            replica_count: 8,
            exclude_head: true,
            use_kv: false,
            use_spdk: false,
            in_place: false,
            ssd_threads: 4,
            max_check: 4096,
            hash_exp: 4,
            latency_limit_ms: 0.0,
            pre_reassign: false,
            vector_capacity: 1 << 20,
        }
    }
}

/// One row of the parameter schema.
pub struct ParamDef {
    pub section: Section,
    pub name: &'static str,
    pub get: fn(&Options) -> String,
    pub set: fn(&mut Options, &str) -> Result<()>,
}

impl fmt::Debug for ParamDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamDef")
            .field("section", &self.section)
            .field("name", &self.name)
            .finish()
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SpannError::FailedParseValue {
            name: name.to_string(),
            value: value.to_string(),
        })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(SpannError::FailedParseValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

/// The parameter schema, in file order.
pub static PARAMETERS: &[ParamDef] = &[
    // Base
    ParamDef {
        section: Section::Base,
        name: "Dim",
        get: |o| o.dim.to_string(),
        set: |o, v| Ok(o.dim = parse("Dim", v)?),
    },
    ParamDef {
        section: Section::Base,
        name: "ValueType",
        get: |o| o.value_type.clone(),
        set: |o, v| {
            if v.trim().eq_ignore_ascii_case("float") {
                o.value_type = "Float".to_string();
                Ok(())
            } else {
                Err(SpannError::FailedParseValue {
                    name: "ValueType".to_string(),
                    value: v.to_string(),
                })
            }
        },
    },
    ParamDef {
        section: Section::Base,
        name: "DistCalcMethod",
        get: |o| o.dist_calc_method.to_string(),
        set: |o, v| Ok(o.dist_calc_method = parse("DistCalcMethod", v)?),
    },
    ParamDef {
        section: Section::Base,
        name: "IndexDirectory",
        get: |o| o.index_directory.display().to_string(),
        set: |o, v| Ok(o.index_directory = PathBuf::from(v.trim())),
    },
    ParamDef {
        section: Section::Base,
        name: "HeadIndexFolder",
        get: |o| o.head_index_folder.clone(),
        set: |o, v| Ok(o.head_index_folder = v.trim().to_string()),
    },
    ParamDef {
        section: Section::Base,
        name: "HeadVectors",
        get: |o| o.head_vector_file.clone(),
        set: |o, v| Ok(o.head_vector_file = v.trim().to_string()),
    },
    ParamDef {
        section: Section::Base,
        name: "HeadVectorIDs",
        get: |o| o.head_id_file.clone(),
        set: |o, v| Ok(o.head_id_file = v.trim().to_string()),
    },
    ParamDef {
        section: Section::Base,
        name: "DeleteHeadVectors",
        get: |o| o.delete_head_vectors.to_string(),
        set: |o, v| Ok(o.delete_head_vectors = parse_bool("DeleteHeadVectors", v)?),
    },
    ParamDef {
        section: Section::Base,
        name: "WithMetaIndex",
        get: |o| o.with_meta_index.to_string(),
        set: |o, v| Ok(o.with_meta_index = parse_bool("WithMetaIndex", v)?),
    },
    // SelectHead
    ParamDef {
        section: Section::SelectHead,
        name: "isExecute",
        get: |o| o.select_head.to_string(),
        set: |o, v| Ok(o.select_head = parse_bool("SelectHead.isExecute", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "SelectType",
        get: |o| o.select_type.to_string(),
        set: |o, v| Ok(o.select_type = parse("SelectType", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "Ratio",
        get: |o| o.ratio.to_string(),
        set: |o, v| Ok(o.ratio = parse("Ratio", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "Count",
        get: |o| o.head_vector_count.to_string(),
        set: |o, v| Ok(o.head_vector_count = parse("Count", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "SelectThreshold",
        get: |o| o.select_threshold.to_string(),
        set: |o, v| Ok(o.select_threshold = parse("SelectThreshold", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "SplitThreshold",
        get: |o| o.split_threshold.to_string(),
        set: |o, v| Ok(o.split_threshold = parse("SplitThreshold", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "SplitFactor",
        get: |o| o.split_factor.to_string(),
        set: |o, v| Ok(o.split_factor = parse("SplitFactor", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "BKTKmeansK",
        get: |o| o.kmeans_k.to_string(),
        set: |o, v| Ok(o.kmeans_k = parse("BKTKmeansK", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "BKTLeafSize",
        get: |o| o.leaf_size.to_string(),
        set: |o, v| Ok(o.leaf_size = parse("BKTLeafSize", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "NumberOfThreads",
        get: |o| o.select_head_threads.to_string(),
        set: |o, v| Ok(o.select_head_threads = parse("SelectHead.NumberOfThreads", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "RandomSeed",
        get: |o| o.random_seed.to_string(),
        set: |o, v| Ok(o.random_seed = parse("RandomSeed", v)?),
    },
    ParamDef {
        section: Section::SelectHead,
        name: "NoOutput",
        get: |o| o.no_output.to_string(),
        set: |o, v| Ok(o.no_output = parse_bool("NoOutput", v)?),
    },
    // BuildHead
    ParamDef {
        section: Section::BuildHead,
        name: "isExecute",
        get: |o| o.build_head.to_string(),
        set: |o, v| Ok(o.build_head = parse_bool("BuildHead.isExecute", v)?),
    },
    ParamDef {
        section: Section::BuildHead,
        name: "NumberOfThreads",
        get: |o| o.build_head_threads.to_string(),
        set: |o, v| Ok(o.build_head_threads = parse("BuildHead.NumberOfThreads", v)?),
    },
    // BuildSSDIndex
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "isExecute",
        get: |o| o.build_ssd_index.to_string(),
        set: |o, v| Ok(o.build_ssd_index = parse_bool("BuildSSDIndex.isExecute", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "SearchInternalResultNum",
        get: |o| o.internal_result_num.to_string(),
        set: |o, v| Ok(o.internal_result_num = parse("SearchInternalResultNum", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "PostingPageLimit",
        get: |o| o.posting_page_limit.to_string(),
        set: |o, v| Ok(o.posting_page_limit = parse("PostingPageLimit", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "SearchPostingPageLimit",
        get: |o| o.search_posting_page_limit.to_string(),
        set: |o, v| Ok(o.search_posting_page_limit = parse("SearchPostingPageLimit", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "MaxDistRatio",
        get: |o| o.max_dist_ratio.to_string(),
        set: |o, v| Ok(o.max_dist_ratio = parse("MaxDistRatio", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "ReplicaCount",
        get: |o| o.replica_count.to_string(),
        set: |o, v| Ok(o.replica_count = parse("ReplicaCount", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "ExcludeHead",
        get: |o| o.exclude_head.to_string(),
        set: |o, v| Ok(o.exclude_head = parse_bool("ExcludeHead", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "UseKV",
        get: |o| o.use_kv.to_string(),
        set: |o, v| Ok(o.use_kv = parse_bool("UseKV", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "UseSPDK",
        get: |o| o.use_spdk.to_string(),
        set: |o, v| Ok(o.use_spdk = parse_bool("UseSPDK", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "InPlace",
        get: |o| o.in_place.to_string(),
        set: |o, v| Ok(o.in_place = parse_bool("InPlace", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "NumberOfThreads",
        get: |o| o.ssd_threads.to_string(),
        set: |o, v| Ok(o.ssd_threads = parse("BuildSSDIndex.NumberOfThreads", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "MaxCheck",
        get: |o| o.max_check.to_string(),
        set: |o, v| Ok(o.max_check = parse("MaxCheck", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "HashTableExponent",
        get: |o| o.hash_exp.to_string(),
        set: |o, v| Ok(o.hash_exp = parse("HashTableExponent", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "LatencyLimit",
        get: |o| o.latency_limit_ms.to_string(),
        set: |o, v| Ok(o.latency_limit_ms = parse("LatencyLimit", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "PreReassign",
        get: |o| o.pre_reassign.to_string(),
        set: |o, v| Ok(o.pre_reassign = parse_bool("PreReassign", v)?),
    },
    ParamDef {
        section: Section::BuildSSDIndex,
        name: "VectorCapacity",
        get: |o| o.vector_capacity.to_string(),
        set: |o, v| Ok(o.vector_capacity = parse("VectorCapacity", v)?),
    },
];

fn lookup(section: Section, name: &str) -> Option<&'static ParamDef> {
    PARAMETERS
        .iter()
        .find(|p| p.section == section && p.name.eq_ignore_ascii_case(name))
}

impl Options {
    /// Set one parameter by section and name.
    pub fn set_parameter(&mut self, section: Section, name: &str, value: &str) -> Result<()> {
        let param = lookup(section, name).ok_or_else(|| {
            SpannError::Fail(format!("unknown parameter {}.{name}", section.name()))
        })?;
        (param.set)(self, value)
    }

    /// Read one parameter as text.
    pub fn get_parameter(&self, section: Section, name: &str) -> Option<String> {
        lookup(section, name).map(|param| (param.get)(self))
    }

    /// Which posting store backend the flags select. `UseSPDK` wins over `UseKV`.
    pub fn backend(&self) -> PostingBackend {
        if self.use_spdk {
            PostingBackend::Mapped
        } else if self.use_kv {
            PostingBackend::Dynamic
        } else {
            PostingBackend::Static
        }
    }

    pub fn head_index_dir(&self) -> PathBuf {
        self.index_directory.join(&self.head_index_folder)
    }

    pub fn head_vector_path(&self) -> PathBuf {
        self.index_directory.join(&self.head_vector_file)
    }

    pub fn head_id_path(&self) -> PathBuf {
        self.index_directory.join(&self.head_id_file)
    }

    /// Every parameter as a TOML document with one table per section.
    pub fn to_table(&self) -> Table {
        let mut root = Table::new();
        for section in Section::ALL {
            let table: Table = PARAMETERS
                .iter()
                .filter(|p| p.section == section)
                .map(|p| (p.name.to_string(), to_value(&(p.get)(self))))
                .collect();
            root.insert(section.name().to_string(), Value::Table(table));
        }
        root
    }

    /// Apply a parsed TOML document on top of the defaults.
    ///
    /// Unknown tables and keys are skipped with a warning; malformed values
    /// are errors.
    pub fn from_table(root: &Table) -> Result<Self> {
        let mut options = Options::default();
        for (name, value) in root {
            let (Some(section), Value::Table(table)) = (Section::parse(name), value) else {
                tracing::warn!(section = %name, "skipping unknown configuration section");
                continue;
            };
            for (key, value) in table {
                match lookup(section, key) {
                    Some(param) => (param.set)(&mut options, &value_text(param.name, value)?)?,
                    None => tracing::warn!(
                        section = section.name(),
                        key = %key,
                        "skipping unknown parameter"
                    ),
                }
            }
        }
        Ok(options)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(&self.to_table())?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let root: Table = toml::from_str(text)?;
        Self::from_table(&root)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_toml()?).map_err(|e| SpannError::create(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| SpannError::open(path, e))?;
        Self::from_toml(&text)
    }
}

/// Typed TOML value for a schema getter's text.
fn to_value(text: &str) -> Value {
    if let Ok(b) = text.parse::<bool>() {
        return Value::Boolean(b);
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::Integer(i);
    }
    // Integers past i64 stay text so they round-trip exactly.
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(f) = text.parse::<f64>() {
            return Value::Float(f);
        }
    }
    Value::String(text.to_string())
}

fn value_text(name: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        other => Err(SpannError::FailedParseValue {
            name: name.to_string(),
            value: other.to_string(),
        }),
    }
}
