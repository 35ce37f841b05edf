use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use fs2::FileExt;
use parking_lot::Mutex;

use crate::core::Document;
use crate::error::{IndexError, Result};
use crate::index::searcher::{PartitionSearcher, SegmentReader};
use crate::index::snapshot::{CommitPins, PartitionSnapshot};
use crate::storage::directory::{Directory, WRITE_LOCK_NAME};
use crate::storage::segment::{read_segment, write_segment, SegmentData};

#[derive(Debug)]
struct WriterState {
    /// 最近一次提交的内容（refresh 的数据源）
    committed: Arc<SegmentReader>,
    pending: Vec<Document>,
}

/// 一个物理分区：目录 + 单写者提交路径 + 可刷新的 searcher 视图。
///
/// - 写入：`add_document` 缓冲，`commit` 落盘为新一代 segment（对 searcher 不可见）
/// - 读取：`acquire_searcher` 拿当前视图；`maybe_refresh*` 把视图推进到最新提交
/// - 并发：searcher 获取与 refresh 之间只经过 ArcSwap，互不阻塞
#[derive(Debug)]
pub struct IndexPartition {
    folder: PathBuf,
    directory: Mutex<Option<Directory>>,
    write_lock: Mutex<Option<File>>,
    current: ArcSwap<SegmentReader>,
    refresh_lock: Mutex<()>,
    writer: Mutex<WriterState>,
    pins: Arc<CommitPins>,
    live_searchers: Arc<AtomicUsize>,
    closed: AtomicBool,
    #[cfg(test)]
    fail_close: AtomicBool,
}

fn obtain_write_lock(folder: &Path) -> Result<File> {
    let path = folder.join(WRITE_LOCK_NAME);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)?;
    file.try_lock_exclusive().map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("partition write lock held: {} ({})", path.display(), e),
        )
    })?;
    Ok(file)
}

fn load_latest(directory: &Directory) -> Result<(SegmentReader, Vec<u64>)> {
    directory.remove_stale_tmp_files();
    let mut generations = directory.generations()?;
    let Some(latest) = generations.pop() else {
        return Ok((SegmentReader::empty(), Vec::new()));
    };
    let seg = read_segment(&directory.segment_path(latest))?;
    Ok((SegmentReader::from_segment(seg), generations))
}

impl IndexPartition {
    /// 打开分区：拿 write.lock、加载最新提交代。失败时释放已拿到的锁与目录句柄。
    pub fn open(folder: PathBuf, directory: Directory) -> Result<Self> {
        let write_lock = match obtain_write_lock(&folder) {
            Ok(f) => f,
            Err(e) => {
                let _ = directory.close();
                return Err(e);
            }
        };

        let (reader, stale) = match load_latest(&directory) {
            Ok(v) => v,
            Err(e) => {
                let _ = write_lock.unlock();
                let _ = directory.close();
                return Err(e);
            }
        };

        let pins = Arc::new(CommitPins::new(folder.clone()));
        if !stale.is_empty() {
            // 上次 commit 后没来得及删除的旧代
            if let Err(e) = pins.retire(&stale) {
                tracing::warn!("Failed to remove stale segments in {:?}: {}", folder, e);
            }
        }

        let reader = Arc::new(reader);
        tracing::debug!(
            "Partition opened: {:?} (generation={:?}, docs={})",
            folder,
            reader.generation(),
            reader.len()
        );

        Ok(Self {
            folder,
            directory: Mutex::new(Some(directory)),
            write_lock: Mutex::new(Some(write_lock)),
            current: ArcSwap::from(reader.clone()),
            refresh_lock: Mutex::new(()),
            writer: Mutex::new(WriterState {
                committed: reader,
                pending: Vec::new(),
            }),
            pins,
            live_searchers: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            #[cfg(test)]
            fail_close: AtomicBool::new(false),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(IndexError::illegal_state(format!(
                "partition {} is closed",
                self.folder.display()
            )));
        }
        Ok(())
    }

    pub fn acquire_searcher(&self) -> Result<PartitionSearcher> {
        self.ensure_open()?;
        Ok(PartitionSearcher::new(
            self.current.load_full(),
            self.live_searchers.clone(),
        ))
    }

    /// 当前借出未归还的 searcher 数
    pub fn live_searchers(&self) -> usize {
        self.live_searchers.load(Ordering::Acquire)
    }

    /// searcher 当前可见的代
    pub fn visible_generation(&self) -> Option<u64> {
        self.current.load().generation()
    }

    pub fn visible_doc_count(&self) -> usize {
        self.current.load().len()
    }

    pub fn committed_generation(&self) -> Option<u64> {
        self.writer.lock().committed.generation()
    }

    pub fn pending_documents(&self) -> usize {
        self.writer.lock().pending.len()
    }

    pub fn pinned_generations(&self) -> Vec<u64> {
        self.pins.pinned()
    }

    pub fn add_document(&self, doc: Document) -> Result<()> {
        self.ensure_open()?;
        self.writer.lock().pending.push(doc);
        Ok(())
    }

    /// 把缓冲写成新一代 segment（同 id 后写覆盖先写），并淘汰未被 snapshot 持有的旧代。
    /// 无缓冲且已有提交时为空操作。返回当前已提交代。
    pub fn commit(&self) -> Result<u64> {
        self.ensure_open()?;
        let mut w = self.writer.lock();
        if w.pending.is_empty() {
            if let Some(g) = w.committed.generation() {
                return Ok(g);
            }
        }

        let generation = w.committed.generation().map_or(1, |g| g + 1);
        let mut merged: BTreeMap<u64, Document> = w
            .committed
            .documents()
            .iter()
            .map(|d| (d.id, d.clone()))
            .collect();
        for doc in &w.pending {
            merged.insert(doc.id, doc.clone());
        }
        let data = SegmentData {
            generation,
            documents: merged.into_values().collect(),
        };

        let older = {
            let dir = self.directory.lock();
            let dir = dir
                .as_ref()
                .ok_or_else(|| IndexError::illegal_state("partition directory released"))?;
            write_segment(dir.path(), &data)?;
            dir.generations()?
                .into_iter()
                .filter(|g| *g < generation)
                .collect::<Vec<_>>()
        };

        w.committed = Arc::new(SegmentReader::from_segment(data));
        w.pending.clear();

        // 新代已经持久化：旧代删除失败只影响磁盘占用，不影响提交结果
        if let Err(e) = self.pins.retire(&older) {
            tracing::warn!(
                "Commit {} in {:?}: failed to retire old segments: {}",
                generation,
                self.folder,
                e
            );
        }
        Ok(generation)
    }

    fn refresh_locked(&self) {
        let committed = self.writer.lock().committed.clone();
        if committed.generation() != self.current.load().generation() {
            tracing::debug!(
                "Partition {:?} refreshed to generation {:?}",
                self.folder,
                committed.generation()
            );
            self.current.store(committed);
        }
    }

    /// 非阻塞刷新：若已有刷新在进行则直接返回 false。
    pub fn maybe_refresh(&self) -> Result<bool> {
        self.ensure_open()?;
        let Some(_g) = self.refresh_lock.try_lock() else {
            return Ok(false);
        };
        self.refresh_locked();
        Ok(true)
    }

    /// 阻塞刷新：返回后下一次 acquire_searcher 一定能看到最新提交。
    pub fn maybe_refresh_blocking(&self) -> Result<()> {
        self.ensure_open()?;
        let _g = self.refresh_lock.lock();
        self.refresh_locked();
        Ok(())
    }

    /// 持有当前已提交代并返回其文件列表；尚无提交时返回空快照。
    pub fn snapshot(&self) -> Result<PartitionSnapshot> {
        self.ensure_open()?;
        // 持 writer 锁：避免 pin 之前该代被并发 commit 淘汰
        let w = self.writer.lock();
        let Some(generation) = w.committed.generation() else {
            return Ok(PartitionSnapshot::empty());
        };
        let pin = self.pins.pin(generation);
        let file = self
            .folder
            .join(crate::storage::segment::segment_file_name(generation));
        Ok(PartitionSnapshot::pinned(vec![file], pin))
    }

    /// 幂等关闭：丢弃未提交缓冲，释放 write.lock 与目录句柄。已借出的 searcher 仍可读。
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let dropped = std::mem::take(&mut self.writer.lock().pending);
        if !dropped.is_empty() {
            tracing::warn!(
                "Partition {:?} closed with {} uncommitted documents, discarding",
                self.folder,
                dropped.len()
            );
        }

        let mut errors: Vec<IndexError> = Vec::new();
        if let Some(d) = self.directory.lock().take() {
            if let Err(e) = d.close() {
                errors.push(e.into());
            }
        }
        if let Some(f) = self.write_lock.lock().take() {
            if let Err(e) = f.unlock() {
                errors.push(e.into());
            }
        }

        if let Some(e) = self.injected_close_failure() {
            errors.push(e);
        }

        let mut iter = errors.into_iter();
        match iter.next() {
            None => Ok(()),
            Some(first) => Err(first.with_suppressed(iter.collect())),
        }
    }

    /// 下一次 close 在释放完资源后报错
    #[cfg(test)]
    pub(crate) fn fail_next_close(&self) {
        self.fail_close.store(true, Ordering::Release);
    }

    /// 下一次 snapshot pin 释放报错
    #[cfg(test)]
    pub(crate) fn fail_next_pin_release(&self) {
        self.pins.fail_next_release();
    }

    #[cfg(test)]
    fn injected_close_failure(&self) -> Option<IndexError> {
        self.fail_close.swap(false, Ordering::AcqRel).then(|| {
            IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected close failure: {}", self.folder.display()),
            ))
        })
    }

    #[cfg(not(test))]
    fn injected_close_failure(&self) -> Option<IndexError> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::segment_file_name;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("partidx-part-{}-{}", tag, nanos))
    }

    fn open_partition(folder: &Path) -> IndexPartition {
        std::fs::create_dir_all(folder).unwrap();
        let dir = Directory::open(folder).unwrap();
        IndexPartition::open(folder.to_path_buf(), dir).unwrap()
    }

    #[test]
    fn commit_is_invisible_until_refresh() {
        let folder = unique_tmp_dir("refresh");
        let p = open_partition(&folder);

        p.add_document(Document::new(1).with_field("name", "a")).unwrap();
        assert_eq!(p.commit().unwrap(), 1);

        let before = p.acquire_searcher().unwrap();
        assert_eq!(before.generation(), None);
        assert!(before.documents().is_empty());

        assert!(p.maybe_refresh().unwrap());
        let after = p.acquire_searcher().unwrap();
        assert_eq!(after.generation(), Some(1));
        assert_eq!(after.documents().len(), 1);

        // 旧 searcher 仍然读旧视图
        assert!(before.documents().is_empty());
        assert_eq!(p.live_searchers(), 2);
        drop(before);
        drop(after);
        assert_eq!(p.live_searchers(), 0);
    }

    #[test]
    fn later_document_with_same_id_replaces_earlier() {
        let folder = unique_tmp_dir("replace");
        let p = open_partition(&folder);

        p.add_document(Document::new(1).with_field("v", "old")).unwrap();
        p.add_document(Document::new(2).with_field("v", "two")).unwrap();
        p.commit().unwrap();
        p.add_document(Document::new(1).with_field("v", "new")).unwrap();
        assert_eq!(p.commit().unwrap(), 2);
        p.maybe_refresh_blocking().unwrap();

        let s = p.acquire_searcher().unwrap();
        assert_eq!(s.documents().len(), 2);
        assert_eq!(s.reader().get(1).and_then(|d| d.get("v")), Some("new"));

        // 旧代已被淘汰
        assert!(!folder.join(segment_file_name(1)).exists());
        assert!(folder.join(segment_file_name(2)).exists());
    }

    #[test]
    fn commit_without_changes_keeps_generation() {
        let folder = unique_tmp_dir("noop");
        let p = open_partition(&folder);
        assert_eq!(p.commit().unwrap(), 1);
        assert_eq!(p.commit().unwrap(), 1);
        assert_eq!(p.committed_generation(), Some(1));
    }

    #[test]
    fn reopen_loads_latest_commit_and_drops_uncommitted() {
        let folder = unique_tmp_dir("reopen");
        let p = open_partition(&folder);
        p.add_document(Document::new(7)).unwrap();
        p.commit().unwrap();
        p.add_document(Document::new(8)).unwrap();
        assert_eq!(p.pending_documents(), 1);
        p.close().unwrap();

        let p = open_partition(&folder);
        let s = p.acquire_searcher().unwrap();
        assert_eq!(s.generation(), Some(1));
        assert_eq!(s.documents().len(), 1);
        assert_eq!(s.documents()[0].id, 7);
    }

    #[test]
    fn second_open_of_same_folder_fails_on_write_lock() {
        let folder = unique_tmp_dir("lock");
        let p = open_partition(&folder);

        let dir = Directory::open(&folder).unwrap();
        let err = IndexPartition::open(folder.clone(), dir).unwrap_err();
        assert!(matches!(err, IndexError::Io(_)), "{err}");
        assert!(err.to_string().contains("write lock"));

        p.close().unwrap();
        let dir = Directory::open(&folder).unwrap();
        IndexPartition::open(folder.clone(), dir).unwrap();
    }

    #[test]
    fn snapshot_pins_generation_across_commit() {
        let folder = unique_tmp_dir("pin");
        let p = open_partition(&folder);
        assert!(p.snapshot().unwrap().next().is_none());

        p.add_document(Document::new(1)).unwrap();
        p.commit().unwrap();

        let snap = p.snapshot().unwrap();
        assert_eq!(snap.generation(), Some(1));
        assert_eq!(p.pinned_generations(), vec![1]);

        p.add_document(Document::new(2)).unwrap();
        p.commit().unwrap();
        let g1 = folder.join(segment_file_name(1));
        assert!(g1.exists(), "pinned generation must survive a newer commit");

        let files: Vec<PathBuf> = p.snapshot().unwrap().collect();
        assert_eq!(files, vec![folder.join(segment_file_name(2))]);

        snap.close().unwrap();
        assert!(!g1.exists());
        assert!(p.pinned_generations().is_empty());
    }

    #[test]
    fn closed_partition_rejects_use_but_close_is_idempotent() {
        let folder = unique_tmp_dir("closed");
        let p = open_partition(&folder);
        let s = p.acquire_searcher().unwrap();

        p.close().unwrap();
        p.close().unwrap();
        assert!(p.is_closed());
        assert!(p.acquire_searcher().unwrap_err().is_illegal_state());
        assert!(p.snapshot().is_err());
        assert!(p.maybe_refresh().is_err());
        assert!(p.add_document(Document::new(1)).is_err());

        // 已借出的 searcher 不受影响
        assert!(s.documents().is_empty());
    }

    #[test]
    fn open_cleans_stale_tmp_and_older_generations() {
        let folder = unique_tmp_dir("stale");
        std::fs::create_dir_all(&folder).unwrap();
        for generation in 1..=2 {
            write_segment(
                &folder,
                &SegmentData {
                    generation,
                    documents: vec![Document::new(generation)],
                },
            )
            .unwrap();
        }
        std::fs::write(folder.join("segment-0000000000000003.seg.tmp"), b"half").unwrap();

        let p = open_partition(&folder);
        assert_eq!(p.visible_generation(), Some(2));
        assert!(!folder.join(segment_file_name(1)).exists());
        assert!(!folder.join("segment-0000000000000003.seg.tmp").exists());
    }

    #[test]
    fn corrupt_latest_segment_fails_open_and_releases_lock() {
        let folder = unique_tmp_dir("corrupt");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join(segment_file_name(1)), b"garbage").unwrap();

        let dir = Directory::open(&folder).unwrap();
        let err = IndexPartition::open(folder.clone(), dir).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }), "{err}");

        let lock = std::fs::OpenOptions::new()
            .write(true)
            .open(folder.join(WRITE_LOCK_NAME))
            .unwrap();
        lock.try_lock_exclusive().unwrap();
    }
}
