//! Segmented on-disk storage backend.
//!
//! Backs the `disk` and `mapped` storage levels. Per-namespace layout:
//!
//! ```text
//! <root>/<namespace>/
//!   meta                    vote record (current_term, voted_for)
//!   <start-index>.log       log segments, named by first contained index
//!   snapshot-<index>        at most one live snapshot
//! ```
//!
//! All whole-file writes (meta, snapshots) go through write-to-temp then
//! rename, so a crash leaves either the old file or the new one. Log
//! appends are framed with per-record checksums; recovery truncates the
//! first torn record and everything after it. At `disk` level every append
//! is fsynced before returning; `mapped` skips the per-append fsync but
//! keeps the identical layout.

mod segment;

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use quorum_storage::{
    LogStore, MetaStore, SnapshotMeta, SnapshotStore, StorageError, StorageLevel,
    StorageNamespace, StorageResult, VoteRecord,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use segment::{
    encode_record, parse_segment_file_name, read_record, scan_segment, segment_file_name,
    RecordLocation, RECORD_HEADER,
};

/// Options for the disk backend
#[derive(Debug, Clone)]
pub struct DiskStorageOptions {
    /// Durability level; `Memory` is rejected (use `quorum-storage-memory`)
    pub level: StorageLevel,
    /// Roll to a new segment once the active one exceeds this size
    pub max_segment_size: u64,
}

impl Default for DiskStorageOptions {
    fn default() -> Self {
        Self {
            level: StorageLevel::Disk,
            max_segment_size: 4 * 1024 * 1024,
        }
    }
}

/// One log segment plus its record index
struct Segment {
    start: u64,
    path: PathBuf,
    records: Vec<RecordLocation>,
    len: u64,
}

impl Segment {
    fn last_index(&self) -> Option<u64> {
        if self.records.is_empty() {
            None
        } else {
            Some(self.start + self.records.len() as u64 - 1)
        }
    }
}

struct NamespaceState {
    dir: PathBuf,
    segments: Vec<Segment>,
}

impl NamespaceState {
    fn bounds(&self) -> Option<(u64, u64)> {
        let first = self.segments.iter().find(|s| !s.records.is_empty())?;
        let last = self.segments.iter().rev().find_map(|s| s.last_index())?;
        Some((first.start, last))
    }

    fn locate(&self, index: u64) -> Option<(&Segment, RecordLocation)> {
        for seg in self.segments.iter().rev() {
            if index >= seg.start {
                let rel = (index - seg.start) as usize;
                return seg.records.get(rel).map(|loc| (seg, *loc));
            }
        }
        None
    }
}

struct Inner {
    root: PathBuf,
    options: DiskStorageOptions,
    namespaces: Mutex<HashMap<StorageNamespace, Arc<Mutex<NamespaceState>>>>,
}

/// On-disk storage implementing the log, snapshot and vote stores
#[derive(Clone)]
pub struct DiskStorage {
    inner: Arc<Inner>,
}

impl DiskStorage {
    /// Open (or create) a storage root.
    pub fn open(root: impl Into<PathBuf>, options: DiskStorageOptions) -> StorageResult<Self> {
        if options.level == StorageLevel::Memory {
            return Err(StorageError::Backend(
                "memory level is served by quorum-storage-memory".to_string(),
            ));
        }
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                options,
                namespaces: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn sync_appends(&self) -> bool {
        self.inner.options.level == StorageLevel::Disk
    }

    async fn namespace(&self, ns: &StorageNamespace) -> StorageResult<Arc<Mutex<NamespaceState>>> {
        let mut namespaces = self.inner.namespaces.lock().await;
        if let Some(state) = namespaces.get(ns) {
            return Ok(state.clone());
        }
        let dir = self.inner.root.join(ns.as_str());
        let state = Arc::new(Mutex::new(recover_namespace(&dir)?));
        namespaces.insert(ns.clone(), state.clone());
        Ok(state)
    }
}

/// Scan a namespace directory, rebuilding segment indices and truncating
/// any torn tail left by a crash.
fn recover_namespace(dir: &Path) -> StorageResult<NamespaceState> {
    fs::create_dir_all(dir)?;

    // Leftover temp files are incomplete writes from a crash.
    let mut starts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".tmp") {
            warn!(file = %name, "removing incomplete write");
            let _ = fs::remove_file(entry.path());
        } else if let Some(start) = parse_segment_file_name(&name) {
            starts.push(start);
        }
    }
    starts.sort_unstable();

    let mut segments: Vec<Segment> = Vec::new();
    let mut drop_rest = false;
    for start in starts {
        let path = dir.join(segment_file_name(start));
        if drop_rest {
            warn!(segment = start, "dropping segment after torn tail");
            fs::remove_file(&path)?;
            continue;
        }

        // A segment must continue exactly where the previous one ended.
        if let Some(prev) = segments.last() {
            let expected = prev.start + prev.records.len() as u64;
            if start != expected {
                warn!(
                    segment = start,
                    expected, "dropping discontiguous segment"
                );
                fs::remove_file(&path)?;
                drop_rest = true;
                continue;
            }
        }

        let scanned = scan_segment(&path)?;
        if scanned.torn {
            warn!(
                segment = start,
                valid_len = scanned.valid_len,
                "truncating torn segment tail"
            );
            let file = fs::OpenOptions::new().write(true).open(&path)?;
            file.set_len(scanned.valid_len)?;
            file.sync_all()?;
            drop_rest = true;
        }
        if scanned.records.is_empty() {
            fs::remove_file(&path)?;
            continue;
        }
        segments.push(Segment {
            start,
            path,
            records: scanned.records,
            len: scanned.valid_len,
        });
    }

    Ok(NamespaceState {
        dir: dir.to_path_buf(),
        segments,
    })
}

/// Write a whole file crash-atomically: temp file, fsync, rename, dir fsync.
fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> StorageResult<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    let target = dir.join(name);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &target)?;
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[async_trait]
impl LogStore for DiskStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let state = self.namespace(namespace).await?;
        let mut state = state.lock().await;

        let first_new = entries[0].0;
        if let Some((_, last)) = state.bounds() {
            if first_new != last + 1 {
                return Err(StorageError::OutOfOrder {
                    expected: last + 1,
                    actual: first_new,
                });
            }
        }
        for (i, (index, _)) in entries.iter().enumerate() {
            let expected = first_new + i as u64;
            if *index != expected {
                return Err(StorageError::OutOfOrder {
                    expected,
                    actual: *index,
                });
            }
        }

        // Roll to a fresh segment when the active one is full.
        let roll = match state.segments.last() {
            Some(seg) => seg.len >= self.inner.options.max_segment_size,
            None => true,
        };
        if roll {
            let path = state.dir.join(segment_file_name(first_new));
            fs::File::create(&path)?.sync_all()?;
            state.segments.push(Segment {
                start: first_new,
                path,
                records: Vec::new(),
                len: 0,
            });
        }

        let sync = self.sync_appends();
        let seg = state.segments.last_mut().expect("active segment exists");

        let mut buf = Vec::new();
        let mut offset = seg.len;
        let mut new_records = Vec::with_capacity(entries.len());
        for (_, data) in &entries {
            new_records.push(RecordLocation {
                offset,
                len: data.len() as u32,
            });
            encode_record(&mut buf, data);
            offset += RECORD_HEADER + data.len() as u64;
        }

        let mut file = fs::OpenOptions::new().append(true).open(&seg.path)?;
        file.write_all(&buf)?;
        if sync {
            file.sync_all()?;
        }
        seg.records.extend(new_records);
        seg.len = offset;
        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        let state = self.namespace(namespace).await?;
        let state = state.lock().await;
        Ok(state.bounds())
    }

    async fn read(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<Option<Bytes>> {
        let state = self.namespace(namespace).await?;
        let state = state.lock().await;
        match state.locate(index) {
            Some((seg, loc)) => match read_record(&seg.path, loc)? {
                Some(payload) => Ok(Some(Bytes::from(payload))),
                None => Err(StorageError::Corruption(format!(
                    "checksum mismatch at index {index} in {}",
                    seg.path.display()
                ))),
            },
            None => Ok(None),
        }
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        let state = self.namespace(namespace).await?;
        let state = state.lock().await;

        let mut out = Vec::new();
        let Some((first, last)) = state.bounds() else {
            return Ok(out);
        };
        let from = start.max(first);
        let to = end.min(last + 1);
        for index in from..to {
            let Some((seg, loc)) = state.locate(index) else {
                continue;
            };
            match read_record(&seg.path, loc)? {
                Some(payload) => out.push((index, Bytes::from(payload))),
                None => {
                    return Err(StorageError::Corruption(format!(
                        "checksum mismatch at index {index} in {}",
                        seg.path.display()
                    )))
                }
            }
        }
        Ok(out)
    }

    async fn truncate_after(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let state = self.namespace(namespace).await?;
        let mut state = state.lock().await;

        let Some((first, _)) = state.bounds() else {
            return Ok(());
        };
        if index < first {
            for seg in state.segments.drain(..) {
                fs::remove_file(&seg.path)?;
            }
            return Ok(());
        }

        while state
            .segments
            .last()
            .map(|seg| seg.start > index)
            .unwrap_or(false)
        {
            if let Some(seg) = state.segments.pop() {
                fs::remove_file(&seg.path)?;
            }
        }
        if let Some(seg) = state.segments.last_mut() {
            let keep = (index - seg.start + 1) as usize;
            if keep < seg.records.len() {
                let new_len = seg.records[keep].offset;
                let file = fs::OpenOptions::new().write(true).open(&seg.path)?;
                file.set_len(new_len)?;
                file.sync_all()?;
                seg.records.truncate(keep);
                seg.len = new_len;
            }
        }
        Ok(())
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let state = self.namespace(namespace).await?;
        let mut state = state.lock().await;

        // Whole segments strictly below the compaction point are removed;
        // a partial prefix inside the containing segment is retained until
        // that segment itself falls below the point.
        let mut kept = Vec::new();
        for seg in state.segments.drain(..) {
            match seg.last_index() {
                Some(last) if last < index => {
                    debug!(segment = seg.start, "removing compacted segment");
                    fs::remove_file(&seg.path)?;
                }
                _ => kept.push(seg),
            }
        }
        state.segments = kept;
        Ok(())
    }

    async fn purge(&self, namespace: &StorageNamespace) -> StorageResult<()> {
        let state = self.namespace(namespace).await?;
        let mut state = state.lock().await;
        for seg in state.segments.drain(..) {
            fs::remove_file(&seg.path)?;
        }
        Ok(())
    }
}

const SNAPSHOT_PREFIX: &str = "snapshot-";

fn snapshot_file_name(index: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{index:020}")
}

fn encode_snapshot(meta: &SnapshotMeta, data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut meta_buf = Vec::new();
    ciborium::ser::into_writer(meta, &mut meta_buf)
        .map_err(|e| StorageError::Backend(format!("snapshot meta encode: {e}")))?;
    let mut out = Vec::with_capacity(meta_buf.len() + data.len() + 12);
    out.extend_from_slice(&(meta_buf.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta_buf);
    out.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

fn decode_snapshot(raw: &[u8]) -> StorageResult<(SnapshotMeta, Bytes)> {
    if raw.len() < 8 {
        return Err(StorageError::Corruption("snapshot too short".to_string()));
    }
    let meta_len = u32::from_le_bytes(raw[0..4].try_into().unwrap()) as usize;
    let crc_start = 4 + meta_len;
    if raw.len() < crc_start + 4 {
        return Err(StorageError::Corruption("snapshot header torn".to_string()));
    }
    let meta: SnapshotMeta = ciborium::de::from_reader(&raw[4..crc_start])
        .map_err(|e| StorageError::Corruption(format!("snapshot meta decode: {e}")))?;
    let crc = u32::from_le_bytes(raw[crc_start..crc_start + 4].try_into().unwrap());
    let data = &raw[crc_start + 4..];
    if crc32fast::hash(data) != crc {
        return Err(StorageError::Corruption(
            "snapshot data checksum mismatch".to_string(),
        ));
    }
    Ok((meta, Bytes::copy_from_slice(data)))
}

#[async_trait]
impl SnapshotStore for DiskStorage {
    async fn save_snapshot(
        &self,
        namespace: &StorageNamespace,
        meta: SnapshotMeta,
        data: Bytes,
    ) -> StorageResult<()> {
        let state = self.namespace(namespace).await?;
        let state = state.lock().await;

        let encoded = encode_snapshot(&meta, &data)?;
        write_atomic(&state.dir, &snapshot_file_name(meta.index), &encoded)?;

        // Older snapshots are superseded only once the rename has landed.
        for entry in fs::read_dir(&state.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(SNAPSHOT_PREFIX) && name != snapshot_file_name(meta.index) {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    async fn load_snapshot(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Option<(SnapshotMeta, Bytes)>> {
        let state = self.namespace(namespace).await?;
        let state = state.lock().await;

        let mut best: Option<(u64, PathBuf)> = None;
        for entry in fs::read_dir(&state.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(index) = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            {
                if best.as_ref().map(|(i, _)| index > *i).unwrap_or(true) {
                    best = Some((index, entry.path()));
                }
            }
        }
        match best {
            Some((_, path)) => {
                let raw = fs::read(path)?;
                decode_snapshot(&raw).map(Some)
            }
            None => Ok(None),
        }
    }
}

const META_FILE: &str = "meta";

#[async_trait]
impl MetaStore for DiskStorage {
    async fn save_vote(
        &self,
        namespace: &StorageNamespace,
        vote: VoteRecord,
    ) -> StorageResult<()> {
        let state = self.namespace(namespace).await?;
        let state = state.lock().await;
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&vote, &mut buf)
            .map_err(|e| StorageError::Backend(format!("vote encode: {e}")))?;
        write_atomic(&state.dir, META_FILE, &buf)
    }

    async fn load_vote(&self, namespace: &StorageNamespace) -> StorageResult<Option<VoteRecord>> {
        let state = self.namespace(namespace).await?;
        let state = state.lock().await;
        let path = state.dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(path)?;
        let vote = ciborium::de::from_reader(raw.as_slice())
            .map_err(|e| StorageError::Corruption(format!("vote decode: {e}")))?;
        Ok(Some(vote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> StorageNamespace {
        StorageNamespace::new("group/0")
    }

    fn open(dir: &Path) -> DiskStorage {
        DiskStorage::open(dir, DiskStorageOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(dir.path());
            let entries = (1..=5).map(|i| (i, Bytes::from(format!("entry-{i}")))).collect();
            storage.append(&ns(), entries).await.unwrap();
        }
        let storage = open(dir.path());
        assert_eq!(storage.bounds(&ns()).await.unwrap(), Some((1, 5)));
        assert_eq!(
            storage.read(&ns(), 3).await.unwrap(),
            Some(Bytes::from("entry-3"))
        );
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(dir.path());
            let entries = (1..=4).map(|i| (i, Bytes::from(format!("entry-{i}")))).collect();
            storage.append(&ns(), entries).await.unwrap();
        }

        // Chop bytes off the tail of the only segment, simulating a crash
        // mid-append.
        let seg_path = dir
            .path()
            .join(ns().as_str())
            .join(segment_file_name(1));
        let len = fs::metadata(&seg_path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&seg_path).unwrap();
        file.set_len(len - 3).unwrap();

        let storage = open(dir.path());
        assert_eq!(storage.bounds(&ns()).await.unwrap(), Some((1, 3)));

        // The log accepts appends continuing after the truncated tail.
        storage
            .append(&ns(), vec![(4, Bytes::from("replacement"))])
            .await
            .unwrap();
        assert_eq!(
            storage.read(&ns(), 4).await.unwrap(),
            Some(Bytes::from("replacement"))
        );
    }

    #[tokio::test]
    async fn corrupt_record_stops_recovery() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(dir.path());
            let entries = (1..=4).map(|i| (i, Bytes::from(format!("entry-{i}")))).collect();
            storage.append(&ns(), entries).await.unwrap();
        }

        // Flip a byte in the last record's payload.
        let seg_path = dir
            .path()
            .join(ns().as_str())
            .join(segment_file_name(1));
        let mut raw = fs::read(&seg_path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&seg_path, raw).unwrap();

        let storage = open(dir.path());
        assert_eq!(storage.bounds(&ns()).await.unwrap(), Some((1, 3)));
    }

    #[tokio::test]
    async fn snapshot_round_trip_and_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path());

        let meta1 = SnapshotMeta {
            index: 10,
            term: 2,
            timestamp: 1000,
        };
        storage
            .save_snapshot(&ns(), meta1, Bytes::from("state-at-10"))
            .await
            .unwrap();
        let meta2 = SnapshotMeta {
            index: 20,
            term: 3,
            timestamp: 2000,
        };
        storage
            .save_snapshot(&ns(), meta2, Bytes::from("state-at-20"))
            .await
            .unwrap();

        let (meta, data) = storage.load_snapshot(&ns()).await.unwrap().unwrap();
        assert_eq!(meta, meta2);
        assert_eq!(data, Bytes::from("state-at-20"));

        // Only one snapshot file remains after replacement.
        let count = fs::read_dir(dir.path().join(ns().as_str()))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(SNAPSHOT_PREFIX)
            })
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn incomplete_snapshot_write_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(dir.path());
            let meta = SnapshotMeta {
                index: 5,
                term: 1,
                timestamp: 500,
            };
            storage
                .save_snapshot(&ns(), meta, Bytes::from("good"))
                .await
                .unwrap();
        }

        // A crash between temp-write and rename leaves a .tmp file behind.
        let tmp = dir
            .path()
            .join(ns().as_str())
            .join(format!("{}.tmp", snapshot_file_name(9)));
        fs::write(&tmp, b"torn half-written snapshot").unwrap();

        let storage = open(dir.path());
        let (meta, data) = storage.load_snapshot(&ns()).await.unwrap().unwrap();
        assert_eq!(meta.index, 5);
        assert_eq!(data, Bytes::from("good"));
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn vote_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = open(dir.path());
            storage
                .save_vote(
                    &ns(),
                    VoteRecord {
                        current_term: 7,
                        voted_for: Some("node-3".to_string()),
                    },
                )
                .await
                .unwrap();
        }
        let storage = open(dir.path());
        let vote = storage.load_vote(&ns()).await.unwrap().unwrap();
        assert_eq!(vote.current_term, 7);
        assert_eq!(vote.voted_for.as_deref(), Some("node-3"));
    }

    #[tokio::test]
    async fn segments_roll_and_compact() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DiskStorage::open(
            dir.path(),
            DiskStorageOptions {
                level: StorageLevel::Disk,
                max_segment_size: 64,
            },
        )
        .unwrap();

        for i in 1..=20u64 {
            storage
                .append(&ns(), vec![(i, Bytes::from(vec![0u8; 32]))])
                .await
                .unwrap();
        }
        assert_eq!(storage.bounds(&ns()).await.unwrap(), Some((1, 20)));

        storage.compact_before(&ns(), 15).await.unwrap();
        let (first, last) = storage.bounds(&ns()).await.unwrap().unwrap();
        assert!(first <= 15, "partial segment below the point is retained");
        assert_eq!(last, 20);
        assert!(storage.read(&ns(), 15).await.unwrap().is_some());
    }
}
