//! Read-only posting file.
//!
//! Format (little-endian):
//! - Magic (8 bytes, `SPANNPL1`)
//! - Posting count (4 bytes, `u32`)
//! - Dimension (4 bytes, `u32`)
//! - Table: per posting, offset (`u64`) and record count (`u32`)
//! - Records, unversioned (see [`crate::posting::codec`])
//!
//! Reads go through one file handle guarded by a mutex: seek, then read the
//! posting into the caller's workspace buffer. A search reads at most
//! `SearchPostingPageLimit` pages of a posting.
//!
//! The vid column of every posting is kept in memory after load, so posting
//! validity is a label lookup with no file access.

use super::codec::{RecordLayout, PAGE_SIZE};
use super::workspace::Workspace;
use super::{
    find_exact, is_live, latency_limit, plan_postings, search_postings, BuildContext, GroundTruth,
    PostingSource, PostingStore,
};
use crate::distance::DistCalcMethod;
use crate::error::{Result, SpannError};
use crate::head::HeadIndex;
use crate::options::Options;
use crate::query::{QueryResultSet, SearchStats};
use crate::vectors::VectorSet;
use crate::version_label::VersionLabelStore;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File name of the posting file inside the index directory.
pub const POSTING_FILE: &str = "SPTAGFullList.bin";

const MAGIC: &[u8; 8] = b"SPANNPL1";
const TABLE_ENTRY_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy)]
struct PostingInfo {
    offset: u64,
    count: u32,
}

/// Posting store over a single immutable file.
pub struct StaticPostingStore {
    file: Option<Mutex<File>>,
    path: PathBuf,
    table: Vec<PostingInfo>,
    /// Vids of all postings back to back; posting `pid` starts at `member_start[pid]`.
    members: Vec<u32>,
    member_start: Vec<usize>,
    layout: RecordLayout,
    labels: Option<Arc<VersionLabelStore>>,
    method: DistCalcMethod,
    latency_limit: Option<Duration>,
    search_records: usize,
    candidates: usize,
}

impl Default for StaticPostingStore {
    fn default() -> Self {
        Self {
            file: None,
            path: PathBuf::new(),
            table: Vec::new(),
            members: Vec::new(),
            member_start: vec![0],
            layout: RecordLayout::new(0, false),
            labels: None,
            method: DistCalcMethod::L2,
            latency_limit: None,
            search_records: usize::MAX,
            candidates: 64,
        }
    }
}

impl StaticPostingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record count of posting `pid` as stored.
    pub fn posting_len(&self, pid: u32) -> usize {
        self.table.get(pid as usize).map_or(0, |p| p.count as usize)
    }

    fn posting_members(&self, pid: u32) -> &[u32] {
        let pid = pid as usize;
        match (self.member_start.get(pid), self.member_start.get(pid + 1)) {
            (Some(&begin), Some(&end)) => &self.members[begin..end],
            _ => &[],
        }
    }

    fn configure(&mut self, options: &Options) {
        self.method = options.dist_calc_method;
        self.latency_limit = latency_limit(options);
        self.candidates = options.internal_result_num;
        let record = self.layout.record_size().max(1);
        self.search_records = (options.search_posting_page_limit * PAGE_SIZE / record).max(1);
    }

    fn read_records(&self, pid: u32, max_records: usize, buffer: &mut Vec<u8>) -> Result<()> {
        let info = self
            .table
            .get(pid as usize)
            .ok_or_else(|| SpannError::Fail(format!("posting {pid} out of range")))?;
        let records = (info.count as usize).min(max_records);
        buffer.clear();
        if records == 0 {
            return Ok(());
        }
        let file = self.file.as_ref().ok_or(SpannError::EmptyIndex)?;
        buffer.resize(records * self.layout.record_size(), 0);
        let mut file = file.lock();
        file.seek(SeekFrom::Start(info.offset))?;
        file.read_exact(buffer)?;
        Ok(())
    }

    fn write_file(path: &Path, dimension: usize, vectors: &VectorSet, postings: &[Vec<(u32, f32)>]) -> Result<()> {
        let layout = RecordLayout::new(dimension, false);
        let file = File::create(path).map_err(|e| SpannError::create(path, e))?;
        let mut writer = BufWriter::new(file);

        writer.write_all(MAGIC)?;
        writer.write_all(&(postings.len() as u32).to_le_bytes())?;
        writer.write_all(&(dimension as u32).to_le_bytes())?;

        let mut offset = MAGIC.len() as u64 + 8 + postings.len() as u64 * TABLE_ENTRY_SIZE;
        for posting in postings {
            writer.write_all(&offset.to_le_bytes())?;
            writer.write_all(&(posting.len() as u32).to_le_bytes())?;
            offset += (posting.len() * layout.record_size()) as u64;
        }

        let mut record = Vec::with_capacity(layout.record_size());
        for posting in postings {
            for &(vid, _) in posting {
                record.clear();
                layout.encode(&mut record, vid, 0, vectors.get(vid as usize));
                writer.write_all(&record)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

impl PostingSource for StaticPostingStore {
    fn read_posting(&self, pid: u32, buffer: &mut Vec<u8>) -> Result<()> {
        self.read_records(pid, self.search_records, buffer)
    }

    fn record_layout(&self) -> RecordLayout {
        self.layout
    }

    fn labels(&self) -> Option<&VersionLabelStore> {
        self.labels.as_deref()
    }

    fn method(&self) -> DistCalcMethod {
        self.method
    }
}

impl PostingStore for StaticPostingStore {
    fn load_index(&mut self, options: &Options, labels: Arc<VersionLabelStore>) -> Result<()> {
        let path = options.index_directory.join(POSTING_FILE);
        let file = File::open(&path).map_err(|e| SpannError::open(&path, e))?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SpannError::Format(format!(
                "{} is not a posting file",
                path.display()
            )));
        }
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let num_postings = u32::from_le_bytes(buf4) as usize;
        reader.read_exact(&mut buf4)?;
        let dimension = u32::from_le_bytes(buf4) as usize;
        if options.dim != 0 && dimension != options.dim {
            return Err(SpannError::DimensionSizeMismatch {
                expected: options.dim,
                actual: dimension,
            });
        }

        let layout = RecordLayout::new(dimension, false);
        let mut table = Vec::with_capacity(num_postings);
        let mut buf8 = [0u8; 8];
        for pid in 0..num_postings {
            reader.read_exact(&mut buf8)?;
            reader.read_exact(&mut buf4)?;
            let info = PostingInfo {
                offset: u64::from_le_bytes(buf8),
                count: u32::from_le_bytes(buf4),
            };
            let end = info.offset + info.count as u64 * layout.record_size() as u64;
            if end > file_len {
                return Err(SpannError::Format(format!(
                    "posting {pid} ends at {end}, past end of file ({file_len} bytes)"
                )));
            }
            table.push(info);
        }

        let total: usize = table.iter().map(|p| p.count as usize).sum();
        let mut members = Vec::with_capacity(total);
        let mut member_start = Vec::with_capacity(num_postings + 1);
        member_start.push(0);
        let mut records = Vec::new();
        for info in &table {
            records.resize(info.count as usize * layout.record_size(), 0);
            reader.seek(SeekFrom::Start(info.offset))?;
            reader.read_exact(&mut records)?;
            members.extend(layout.headers(&records).map(|(vid, _)| vid));
            member_start.push(members.len());
        }

        tracing::info!(
            path = %path.display(),
            postings = num_postings,
            records = total,
            dimension,
            "loaded posting file"
        );
        self.file = Some(Mutex::new(reader.into_inner()));
        self.path = path;
        self.table = table;
        self.members = members;
        self.member_start = member_start;
        self.layout = layout;
        self.labels = Some(labels);
        self.configure(options);
        Ok(())
    }

    fn build_index(&mut self, ctx: &BuildContext<'_>) -> Result<()> {
        let postings = plan_postings(ctx);
        let path = ctx.options.index_directory.join(POSTING_FILE);
        Self::write_file(&path, ctx.vectors.dimension(), ctx.vectors, &postings)?;
        tracing::info!(path = %path.display(), "wrote posting file");
        Ok(())
    }

    fn search_index(
        &self,
        ws: &mut Workspace,
        results: &mut QueryResultSet,
        _head: &dyn HeadIndex,
        stats: Option<&mut SearchStats>,
        truth: Option<&mut GroundTruth<'_>>,
    ) -> Result<()> {
        search_postings(self, ws, results, stats, truth, self.latency_limit)
    }

    fn check_valid_posting(&self, pid: u32) -> bool {
        let labels = self.labels.as_deref();
        self.posting_members(pid)
            .iter()
            .any(|&vid| is_live(labels, vid, None))
    }

    fn add_index(&self, _vectors: &VectorSet, _head: &dyn HeadIndex, _begin: u32) -> Result<()> {
        Err(SpannError::Fail(
            "static posting store does not accept inserts".into(),
        ))
    }

    fn search_vector(&self, vector: &[f32], head: &dyn HeadIndex) -> Result<Option<u32>> {
        find_exact(self, head, vector, self.candidates)
    }

    fn refine_index(&self, _head: &dyn HeadIndex) -> Result<()> {
        Err(SpannError::Fail(
            "refine requires an updatable posting store".into(),
        ))
    }

    fn get_write_posting(&self, pid: u32) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.read_records(pid, usize::MAX, &mut buffer)?;
        Ok(buffer)
    }

    fn write_posting(&self, _pid: u32, _bytes: &[u8], _append: bool) -> Result<()> {
        Err(SpannError::Fail("static posting store is read-only".into()))
    }

    fn init_posting_record(&mut self, _head: &dyn HeadIndex) -> Result<()> {
        Err(SpannError::Fail("static posting store is read-only".into()))
    }

    fn num_postings(&self) -> usize {
        self.table.len()
    }

    fn layout(&self) -> RecordLayout {
        self.layout
    }

    fn is_updatable(&self) -> bool {
        false
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let target = dir.join(POSTING_FILE);
        if target != self.path {
            fs::copy(&self.path, &target).map_err(|e| SpannError::create(&target, e))?;
        }
        Ok(())
    }
}
