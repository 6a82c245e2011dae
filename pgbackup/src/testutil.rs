//! Fixtures for tests: WAL segments, data directories, PTRACK maps.

use crate::catalog::{Backup, BackupId, BackupMode, CatalogContext, InstanceCatalog};
use crate::config::{CompressAlg, Config};
use crate::executor::{BackupExecutor, BackupOptions};
use crate::pg::page::empty_page;
use crate::pg::{ClusterState, ControlFileData, Lsn, RelFileNode, TimeLineId, BLCKSZ};
use crate::source::{BackupStartInfo, BackupStopInfo, LocalSource, SourceNode};
use crate::tracking::PtrackMap;
use crate::utils::errors::{EngineError, Result};
use crate::wal::record::{
    encode_record, to_pg_timestamp, LongPageHeader, WalPageHeader, MAXALIGN, RM_XACT_ID,
    RM_XLOG_ID, XLOG_SWITCH, XLOG_XACT_COMMIT, XLP_FIRST_IS_CONTRECORD, XLP_LONG_HEADER,
};
use crate::wal::segment::{history_file_name, XLOG_BLCKSZ};
use crate::wal::{SegmentName, SegmentSource, TimelineHistory};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

pub const TEST_SEG_SIZE: u32 = 1024 * 1024;
const TEST_MAGIC: u16 = 0xD113;
const RM_HEAP_ID: u8 = 10;
const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;

/// Segment images held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySegments {
    segments: HashMap<SegmentName, Vec<u8>>,
}

impl MemorySegments {
    pub fn insert(&mut self, name: SegmentName, data: Vec<u8>) {
        self.segments.insert(name, data);
    }

    pub fn remove(&mut self, name: &SegmentName) {
        self.segments.remove(name);
    }

    pub fn corrupt(&mut self, name: SegmentName, offset: usize) {
        if let Some(data) = self.segments.get_mut(&name) {
            data[offset] ^= 0xFF;
        }
    }
}

impl SegmentSource for MemorySegments {
    fn load_segment(&self, name: &SegmentName) -> Result<Option<Vec<u8>>> {
        Ok(self.segments.get(name).cloned())
    }
}

/// Writes PostgreSQL-format WAL: page headers, continuation records,
/// segment switches and timeline changes.
pub struct WalBuilder {
    sysid: u64,
    tli: TimeLineId,
    seg_size: u32,
    segments: BTreeMap<(TimeLineId, u64), Vec<u8>>,
    history: TimelineHistory,
    history_file: String,
    pos: Lsn,
    prev: Lsn,
}

impl WalBuilder {
    /// `start` must be the first byte of a segment.
    pub fn new(sysid: u64, tli: TimeLineId, seg_size: u32, start: Lsn) -> Self {
        assert_eq!(start.segment_offset(seg_size), 0);
        Self {
            sysid,
            tli,
            seg_size,
            segments: BTreeMap::new(),
            history: TimelineHistory::single(tli),
            history_file: String::new(),
            pos: start,
            prev: Lsn::INVALID,
        }
    }

    /// Next insert position.
    pub fn position(&self) -> Lsn {
        self.pos
    }

    pub fn timeline(&self) -> TimeLineId {
        self.tli
    }

    pub fn history(&self) -> &TimelineHistory {
        &self.history
    }

    fn segment_mut(&mut self, lsn: Lsn) -> &mut Vec<u8> {
        let segno = lsn.segment_number(self.seg_size);
        let size = self.seg_size as usize;
        self.segments
            .entry((self.tli, segno))
            .or_insert_with(|| vec![0u8; size])
    }

    fn begin_page(&mut self, page: Lsn, rem_len: u32) {
        let long = page.segment_offset(self.seg_size) == 0;
        let mut info = if rem_len > 0 { XLP_FIRST_IS_CONTRECORD } else { 0 };
        if long {
            info |= XLP_LONG_HEADER;
        }
        let header = WalPageHeader {
            magic: TEST_MAGIC,
            info,
            tli: self.tli,
            pageaddr: page,
            rem_len,
            long: long.then_some(LongPageHeader {
                system_id: self.sysid,
                seg_size: self.seg_size,
                xlog_blcksz: XLOG_BLCKSZ as u32,
            }),
        };
        let offset = page.segment_offset(self.seg_size) as usize;
        let size = header.size();
        let seg = self.segment_mut(page);
        header.write_to(&mut seg[offset..offset + size]);
        self.pos = Lsn(page.0 + size as u64);
    }

    fn write_record(&mut self, mut rec_for: impl FnMut(Lsn) -> Vec<u8>) -> (Lsn, Lsn) {
        if self.pos.0 % XLOG_BLCKSZ as u64 == 0 {
            self.begin_page(self.pos, 0);
        }
        let lsn = self.pos;
        let rec = rec_for(self.prev);
        let mut written = 0usize;
        while written < rec.len() {
            let page_end = (self.pos.0 / XLOG_BLCKSZ as u64 + 1) * XLOG_BLCKSZ as u64;
            let take = (rec.len() - written).min((page_end - self.pos.0) as usize);
            let offset = self.pos.segment_offset(self.seg_size) as usize;
            let pos = self.pos;
            let seg = self.segment_mut(pos);
            seg[offset..offset + take].copy_from_slice(&rec[written..written + take]);
            written += take;
            self.pos = Lsn(self.pos.0 + take as u64);
            if written < rec.len() {
                self.begin_page(Lsn(page_end), (rec.len() - written) as u32);
            }
        }
        let end = self.pos;
        self.prev = lsn;
        self.pos = end.align_up(MAXALIGN);
        (lsn, end)
    }

    pub fn insert_raw(
        &mut self,
        rmid: u8,
        info: u8,
        xid: u32,
        blocks: &[(RelFileNode, u8, u32)],
        data: &[u8],
    ) -> Lsn {
        self.write_record(|prev| encode_record(xid, prev, rmid, info, blocks, data))
            .0
    }

    /// Heap-style record touching `blocks` (node, fork, block).
    pub fn insert(&mut self, blocks: &[(RelFileNode, u8, u32)], data: &[u8]) -> Lsn {
        self.insert_raw(RM_HEAP_ID, 0, 0, blocks, data)
    }

    pub fn commit(&mut self, xid: u32, time: DateTime<Utc>) -> Lsn {
        self.insert_raw(
            RM_XACT_ID,
            XLOG_XACT_COMMIT,
            xid,
            &[],
            &to_pg_timestamp(time).to_le_bytes(),
        )
    }

    pub fn checkpoint(&mut self) -> Lsn {
        self.insert_raw(RM_XLOG_ID, XLOG_CHECKPOINT_ONLINE, 0, &[], &[0u8; 16])
    }

    /// Write an XLOG_SWITCH record and continue in the next segment.
    pub fn switch_segment(&mut self) -> Lsn {
        let (lsn, end) = self.write_record(|prev| encode_record(0, prev, RM_XLOG_ID, XLOG_SWITCH, &[], &[]));
        let seg = self.seg_size as u64;
        self.pos = if end.0 % seg == 0 {
            end
        } else {
            Lsn((end.0 / seg + 1) * seg)
        };
        lsn
    }

    /// Promote to `new_tli` at the next segment boundary.
    pub fn promote(&mut self, new_tli: TimeLineId) -> Lsn {
        self.switch_segment();
        let switch_point = self.pos;
        self.history_file.push_str(&format!(
            "{}\t{}\tno recovery target specified\n",
            self.tli, switch_point
        ));
        self.tli = new_tli;
        // history parses its own output, so this cannot fail
        self.history = TimelineHistory::parse(new_tli, &self.history_file)
            .unwrap_or_else(|_| TimelineHistory::single(new_tli));
        switch_point
    }

    pub fn segments(&self) -> MemorySegments {
        let mut out = MemorySegments::default();
        for ((tli, segno), data) in &self.segments {
            out.insert(SegmentName::new(*tli, *segno, self.seg_size), data.clone());
        }
        out
    }

    pub fn into_segments(self) -> MemorySegments {
        self.segments()
    }

    /// Write every segment (and the history file) into `dir`.
    pub fn write_segments(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        for ((tli, segno), data) in &self.segments {
            let name = SegmentName::new(*tli, *segno, self.seg_size);
            std::fs::write(dir.join(name.to_string()), data)?;
        }
        if self.tli > 1 {
            std::fs::write(dir.join(history_file_name(self.tli)), &self.history_file)?;
        }
        Ok(())
    }
}

pub fn write_pg_control(pgdata: &Path, sysid: u64, redo: Lsn, tli: TimeLineId, shut_down: bool) {
    let data = ControlFileData {
        system_identifier: sysid,
        pg_control_version: 1300,
        catalog_version: 202_307_071,
        state: if shut_down {
            ClusterState::Shutdowned
        } else {
            ClusterState::InProduction
        },
        time: Utc::now().timestamp(),
        checkpoint: redo,
        redo,
        timeline: tli,
        prev_timeline: tli,
    };
    std::fs::create_dir_all(pgdata.join("global")).unwrap();
    std::fs::write(pgdata.join("global/pg_control"), data.to_bytes()).unwrap();
}

/// Page with LSN `lsn` and a body derived from `seed`.
pub fn data_page(lsn: Lsn, seed: u32) -> Vec<u8> {
    let mut page = empty_page(lsn);
    let body = format!("tuple {} written at {}", seed, lsn);
    let start = BLCKSZ - 512;
    for (i, b) in body.bytes().cycle().take(400).enumerate() {
        page[start + i] = b;
    }
    page
}

/// Relation identity of a `base/<db>/<rel>` path.
pub fn node_of(rel_path: &str) -> RelFileNode {
    crate::pg::relfile::classify(rel_path)
        .map(|key| key.node)
        .unwrap_or(RelFileNode { spc: 0, db: 0, rel: 0 })
}

/// CRC of every regular file under `dir` keyed by relative path.
pub fn dir_digest(dir: &Path) -> BTreeMap<String, u32> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(dir)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            out.insert(rel, crc32fast::hash(&std::fs::read(entry.path()).unwrap()));
        }
    }
    out
}

/// A data directory plus the WAL it has written.
pub struct FakeCluster {
    pgdata: PathBuf,
    archive: Option<PathBuf>,
    sysid: u64,
    wal: WalBuilder,
    redo: Lsn,
    ptrack: Option<PtrackMap>,
    seed: u32,
}

impl FakeCluster {
    /// Data directory `<root>/pgdata` with a handful of relations.
    pub fn new(root: &Path, sysid: u64) -> Self {
        let pgdata = root.join("pgdata");
        for dir in ["base/1", "base/5", "global", "pg_wal", "pg_xact", "pg_tblspc", "pg_replslot"] {
            std::fs::create_dir_all(pgdata.join(dir)).unwrap();
        }
        std::fs::write(pgdata.join("PG_VERSION"), "16\n").unwrap();
        std::fs::write(pgdata.join("postgresql.conf"), "shared_buffers = 128MB\n").unwrap();
        std::fs::write(pgdata.join("pg_xact/0000"), vec![0u8; 8192]).unwrap();
        std::fs::write(pgdata.join("base/5/16384_vm"), vec![0u8; 8192]).unwrap();

        let wal = WalBuilder::new(sysid, 1, TEST_SEG_SIZE, Lsn(TEST_SEG_SIZE as u64));
        let mut cluster = Self {
            pgdata,
            archive: None,
            sysid,
            wal,
            redo: Lsn::INVALID,
            ptrack: None,
            seed: 0,
        };
        for blk in 0..4 {
            cluster.update_page("base/5/16384", blk);
        }
        cluster.update_page("base/5/16390", 0);
        cluster.update_page("base/1/1259", 0);
        cluster.update_page("global/1262", 0);
        cluster.checkpoint();
        cluster
    }

    pub fn pgdata(&self) -> &Path {
        &self.pgdata
    }

    pub fn sysid(&self) -> u64 {
        self.sysid
    }

    pub fn redo(&self) -> Lsn {
        self.redo
    }

    pub fn wal_position(&self) -> Lsn {
        self.wal.position()
    }

    pub fn timeline(&self) -> TimeLineId {
        self.wal.timeline()
    }

    pub fn wal(&mut self) -> &mut WalBuilder {
        &mut self.wal
    }

    /// Also write WAL into an archive directory on every flush.
    pub fn archive_to(&mut self, dir: &Path) {
        self.archive = Some(dir.to_path_buf());
        self.flush();
    }

    pub fn enable_ptrack(&mut self) {
        let map = PtrackMap::cleared(self.wal.position());
        std::fs::write(
            self.pgdata.join(crate::tracking::ptrack::PTRACK_MAP_PATH),
            map.to_bytes(),
        )
        .unwrap();
        self.ptrack = Some(map);
    }

    pub fn source(&self) -> LocalSource {
        LocalSource::new(&self.pgdata).with_segment_size(TEST_SEG_SIZE)
    }

    /// Log a change to one block and write the page with the record's LSN.
    pub fn update_page(&mut self, rel_path: &str, blkno: u32) -> Lsn {
        let node = node_of(rel_path);
        let lsn = self.wal.insert(&[(node, 0, blkno)], &[]);
        self.write_page(rel_path, blkno, lsn);
        if self.ptrack.is_some() {
            if let Ok(Some(mut map)) = PtrackMap::read_from_pgdata(&self.pgdata) {
                map.mark(node, blkno);
                std::fs::write(
                    self.pgdata.join(crate::tracking::ptrack::PTRACK_MAP_PATH),
                    map.to_bytes(),
                )
                .unwrap();
            }
        }
        lsn
    }

    /// Overwrite a page without logging it.
    pub fn write_page(&mut self, rel_path: &str, blkno: u32, lsn: Lsn) {
        use std::io::{Seek, SeekFrom, Write};
        self.seed += 1;
        let path = self.pgdata.join(rel_path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        let len = file.metadata().unwrap().len();
        let mut blk = len / BLCKSZ as u64;
        // fill holes with empty pages
        while blk < blkno as u64 {
            file.seek(SeekFrom::Start(blk * BLCKSZ as u64)).unwrap();
            file.write_all(&data_page(lsn, self.seed + 10_000)).unwrap();
            blk += 1;
        }
        file.seek(SeekFrom::Start(blkno as u64 * BLCKSZ as u64)).unwrap();
        file.write_all(&data_page(lsn, self.seed)).unwrap();
    }

    pub fn truncate(&mut self, rel_path: &str, n_blocks: u32) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.pgdata.join(rel_path))
            .unwrap();
        file.set_len(n_blocks as u64 * BLCKSZ as u64).unwrap();
    }

    pub fn drop_relation(&mut self, rel_path: &str) {
        std::fs::remove_file(self.pgdata.join(rel_path)).unwrap();
    }

    pub fn commit(&mut self, xid: u32, time: DateTime<Utc>) -> Lsn {
        self.wal.commit(xid, time)
    }

    pub fn switch_wal(&mut self) {
        self.wal.switch_segment();
    }

    /// New redo point; pg_control and the WAL files are updated.
    pub fn checkpoint(&mut self) -> Lsn {
        self.redo = self.wal.checkpoint();
        self.flush();
        self.redo
    }

    pub fn promote(&mut self, new_tli: TimeLineId) {
        self.wal.promote(new_tli);
        self.checkpoint();
    }

    /// Write pg_control (running state) and WAL segments out.
    pub fn flush(&self) {
        self.write_control(false);
        self.wal.write_segments(&self.pgdata.join("pg_wal")).unwrap();
        if let Some(archive) = &self.archive {
            self.wal.write_segments(archive).unwrap();
        }
    }

    pub fn write_control(&self, shut_down: bool) {
        write_pg_control(&self.pgdata, self.sysid, self.redo, self.wal.timeline(), shut_down);
    }
}

/// Source wrapper with scripted replication slots, start failures and
/// cluster activity right after stop.
pub struct ScriptedSource {
    pub inner: LocalSource,
    pub slots: Mutex<Vec<(String, bool)>>,
    pub fail_start: Option<String>,
    after_stop: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ScriptedSource {
    pub fn new(inner: LocalSource) -> Self {
        Self {
            inner,
            slots: Mutex::new(Vec::new()),
            fail_start: None,
            after_stop: Mutex::new(None),
        }
    }

    /// Run `hook` once, after the next stop_backup returns its LSN.
    pub fn with_after_stop(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.after_stop.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn with_slot(self, name: &str) -> Self {
        self.slots.lock().unwrap().push((name.to_string(), false));
        self
    }

    pub fn created_slots(&self) -> Vec<(String, bool)> {
        self.slots.lock().unwrap().clone()
    }
}

impl SourceNode for ScriptedSource {
    fn pgdata(&self) -> &Path {
        self.inner.pgdata()
    }

    fn system_identifier(&self) -> Result<u64> {
        self.inner.system_identifier()
    }

    fn server_version(&self) -> Option<String> {
        self.inner.server_version()
    }

    fn wal_segment_size(&self) -> u32 {
        self.inner.wal_segment_size()
    }

    fn start_backup(&self, label: &str) -> Result<BackupStartInfo> {
        if let Some(message) = &self.fail_start {
            return Err(EngineError::ResourceExhausted(message.clone()));
        }
        self.inner.start_backup(label)
    }

    fn stop_backup(&self, label: &str, start: &BackupStartInfo) -> Result<BackupStopInfo> {
        let stop = self.inner.stop_backup(label, start)?;
        if let Some(hook) = self.after_stop.lock().unwrap().take() {
            hook();
        }
        Ok(stop)
    }

    fn timeline_history(&self) -> Result<TimelineHistory> {
        self.inner.timeline_history()
    }

    fn read_ptrack_map(&self) -> Result<Option<PtrackMap>> {
        self.inner.read_ptrack_map()
    }

    fn ptrack_reset(&self) -> Result<Lsn> {
        self.inner.ptrack_reset()
    }

    fn slot_exists(&self, name: &str) -> Result<bool> {
        Ok(self.slots.lock().unwrap().iter().any(|(n, _)| n == name))
    }

    fn create_slot(&self, name: &str, temporary: bool) -> Result<()> {
        self.slots.lock().unwrap().push((name.to_string(), temporary));
        Ok(())
    }
}

/// Catalog with instance "node" over a fake cluster that archives into it.
pub struct Harness {
    pub dir: TempDir,
    pub ctx: CatalogContext,
    pub cluster: FakeCluster,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    pub fn with_compression() -> Self {
        let mut config = Self::config();
        config.compression.algorithm = CompressAlg::Zstd;
        Self::with_config(config)
    }

    pub fn config() -> Config {
        let mut config = Config::default();
        config.performance.threads = 2;
        config.timeouts.archive_timeout_secs = 5;
        config
    }

    pub fn with_config(config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let ctx = CatalogContext::new(dir.path().join("catalog"), config);
        ctx.init().unwrap();
        let mut cluster = FakeCluster::new(dir.path(), 4242);
        ctx.add_instance("node", &cluster.source()).unwrap();
        cluster.archive_to(&ctx.wal_dir("node"));
        Self { dir, ctx, cluster }
    }

    pub fn catalog(&self) -> InstanceCatalog {
        self.ctx.open_instance("node").unwrap()
    }

    pub fn backup_dir(&self, id: BackupId) -> PathBuf {
        self.ctx.instance_dir("node").join(id.to_string())
    }

    /// Empty path under the harness root.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub async fn backup(&self, mode: BackupMode) -> Result<Backup> {
        self.backup_with(BackupOptions::new(mode)).await
    }

    pub async fn backup_with(&self, options: BackupOptions) -> Result<Backup> {
        let source = self.cluster.source();
        BackupExecutor::new(&self.ctx, &source)
            .execute("node", &options)
            .await
    }
}
