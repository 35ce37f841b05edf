use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::config::IndexConfig;
use crate::error::{close_all, close_all_silently, IndexError, Result};
use crate::index::check::CheckIndex;
use crate::index::partition::IndexPartition;
use crate::index::reader::{AllDocumentsReader, PartitionAllDocumentsReader};
use crate::index::snapshot::IndexSnapshot;
use crate::stats::{IndexReport, PartitionStats};
use crate::storage::directory::Directory;
use crate::storage::planner::PartitionedStorage;
use crate::storage::segment::segment_file_name;

/// 分区列表的不可变快照（写时复制，整体原子替换）
pub type PartitionList = Arc<Vec<Arc<IndexPartition>>>;

/// 逻辑索引：由 1..N 个物理分区组成，负责生命周期与分区编排。
///
/// ## 锁
/// - `commit_close_lock`：create / open / close / drop / snapshot / add_new_partition
/// - `read_write_lock`：分区列表变更、跨分区 reader 构建、refresh
///
/// 两把都是独占锁。需要同时持有时顺序固定为 commit_close → read_write。
///
/// ## 状态
/// `open` 在锁外也会被读取（`is_open` / 快速失败检查），用 Acquire/Release。
/// 持锁后的操作会再检查一次，因为等锁期间可能已被 close。
pub struct PartitionedIndex {
    storage: PartitionedStorage,
    partitions: ArcSwap<Vec<Arc<IndexPartition>>>,
    open: AtomicBool,
    dropped: AtomicBool,
    commit_close_lock: Mutex<()>,
    read_write_lock: Mutex<()>,
}

impl PartitionedIndex {
    pub fn new(storage: PartitionedStorage) -> Self {
        Self {
            storage,
            partitions: ArcSwap::from_pointee(Vec::new()),
            open: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            commit_close_lock: Mutex::new(()),
            read_write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &IndexConfig) -> Self {
        Self::new(PartitionedStorage::with_failure_size(
            config.root.clone(),
            config.failure_size,
        ))
    }

    pub fn storage(&self) -> &PartitionedStorage {
        &self.storage
    }

    /// 准备根目录、预留失败记录、建出 1 号分区目录（不打开）。可重复调用。
    pub fn create(&self) -> Result<()> {
        let _g = self.commit_close_lock.lock();
        self.ensure_not_dropped()?;
        self.storage.prepare_folder(self.storage.index_folder())?;
        self.storage.reserve_failure_storage()?;
        let folder = self.create_new_partition_folder()?;
        tracing::info!(
            "Index created: {:?} (first partition folder {:?})",
            self.storage.index_folder(),
            folder
        );
        Ok(())
    }

    /// 发现并打开磁盘上已有的分区（0 个也合法）。任一分区失败则回滚本次已打开的全部资源。
    pub fn open(&self) -> Result<()> {
        self.ensure_not_dropped()?;
        let _g = self.commit_close_lock.lock();
        // drop 可能在等锁期间完成
        self.ensure_not_dropped()?;
        if self.open.load(Ordering::Acquire) {
            return Err(IndexError::illegal_state("index is already open"));
        }

        let directories = self.storage.open_all_directories()?;
        let mut opened: Vec<Arc<IndexPartition>> = Vec::with_capacity(directories.len());
        let mut remaining = directories.into_iter();
        while let Some((folder, directory)) = remaining.next() {
            match IndexPartition::open(folder, directory) {
                Ok(p) => opened.push(Arc::new(p)),
                Err(e) => {
                    tracing::warn!(
                        "Opening index {:?} failed after {} partitions, rolling back: {}",
                        self.storage.index_folder(),
                        opened.len(),
                        e
                    );
                    close_all_silently(opened, |p| p.close());
                    close_all_silently(remaining, |(_, d): (PathBuf, Directory)| {
                        Ok(d.close()?)
                    });
                    return Err(e);
                }
            }
        }

        let count = opened.len();
        {
            let _rw = self.read_write_lock.lock();
            self.partitions.store(Arc::new(opened));
            self.open.store(true, Ordering::Release);
        }
        tracing::info!(
            "Index opened: {:?} ({} partitions)",
            self.storage.index_folder(),
            count
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// 每个候选分区目录都含有已提交的物理索引才算存在；部分存在视为不存在。
    pub fn exists(&self) -> Result<bool> {
        let folders = self.storage.list_folders()?;
        if folders.is_empty() {
            return Ok(false);
        }
        for folder in folders {
            let directory = self.storage.open_directory(&folder)?;
            let found = match directory.index_exists() {
                Ok(found) => found,
                Err(e) => {
                    let _ = directory.close();
                    return Err(e.into());
                }
            };
            directory.close()?;
            if !found {
                tracing::debug!("Partition folder {:?} has no committed index", folder);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 打开状态直接信任；关闭状态逐个目录做一致性检查。I/O 失败视为无效。
    pub fn is_valid(&self) -> bool {
        if self.open.load(Ordering::Acquire) {
            return true;
        }
        let directories = match self.storage.open_all_directories() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Validity check could not open directories: {}", e);
                return false;
            }
        };
        let valid = directories
            .iter()
            .all(|(folder, directory)| Self::directory_is_valid(folder, directory));
        close_all_silently(directories, |(_, d)| Ok(d.close()?));
        valid
    }

    fn directory_is_valid(folder: &Path, directory: &Directory) -> bool {
        let files = match directory.list_all() {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Validity check failed to list {:?}: {}", folder, e);
                return false;
            }
        };
        // 打开后未写入就关闭的分区目录是空的，合法
        if files.is_empty() {
            return true;
        }
        match CheckIndex::new(directory).check() {
            Ok(status) if status.clean => true,
            Ok(status) => {
                tracing::warn!(
                    "Partition {:?} failed consistency check (segments={}, missing_commit={})",
                    folder,
                    status.segments.len(),
                    status.missing_commit
                );
                false
            }
            Err(e) => {
                tracing::warn!("Consistency check of {:?} hit I/O error: {}", folder, e);
                false
            }
        }
    }

    /// close 后删除整个根目录。close 失败时不做删除；删除本身不是事务性的。
    ///
    /// close、置 dropped、删除目录全程持有 `commit_close_lock`，期间 open/create 无法插入。
    pub fn drop_index(&self) -> Result<()> {
        let _g = self.commit_close_lock.lock();
        self.close_locked()?;
        self.dropped.store(true, Ordering::Release);
        self.storage.cleanup_folder(self.storage.index_folder())?;
        tracing::info!("Index dropped: {:?}", self.storage.index_folder());
        Ok(())
    }

    /// 预留，目前无事可做（提交由各分区自己负责）。
    pub fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// 关闭全部分区（失败不中断，首个失败为主错误），清空列表。幂等。
    pub fn close(&self) -> Result<()> {
        let _g = self.commit_close_lock.lock();
        self.close_locked()
    }

    /// 调用方必须持有 `commit_close_lock`
    fn close_locked(&self) -> Result<()> {
        let (was_open, partitions) = {
            let _rw = self.read_write_lock.lock();
            let was_open = self.open.swap(false, Ordering::AcqRel);
            (was_open, self.partitions.swap(Arc::new(Vec::new())))
        };
        let count = partitions.len();
        let result = close_all(partitions.iter(), |p| p.close());
        if was_open {
            match &result {
                Ok(()) => tracing::info!(
                    "Index closed: {:?} ({} partitions)",
                    self.storage.index_folder(),
                    count
                ),
                Err(e) => tracing::warn!(
                    "Index {:?} closed with errors: {}",
                    self.storage.index_folder(),
                    e
                ),
            }
        }
        result
    }

    /// 每个分区借一个 searcher，组合成跨分区 reader。中途失败归还已借出的 searcher。
    pub fn all_documents_reader(&self) -> Result<AllDocumentsReader> {
        self.ensure_open()?;
        let _rw = self.read_write_lock.lock();
        let partitions = self.partitions()?;

        let mut searchers = Vec::with_capacity(partitions.len());
        for partition in partitions.iter() {
            match partition.acquire_searcher() {
                Ok(s) => searchers.push(s),
                Err(e) => {
                    close_all_silently(searchers, |s| {
                        s.close();
                        Ok(())
                    });
                    return Err(e);
                }
            }
        }

        let readers = searchers
            .into_iter()
            .map(PartitionAllDocumentsReader::new)
            .collect();
        Ok(AllDocumentsReader::new(readers))
    }

    /// 拼接各分区的快照迭代器。任一分区失败：关闭已拿到的快照，清理错误挂为 suppressed。
    pub fn snapshot(&self) -> Result<IndexSnapshot> {
        self.ensure_open()?;
        let _g = self.commit_close_lock.lock();
        let partitions = self.partitions()?;

        let mut snapshots = Vec::with_capacity(partitions.len());
        for partition in partitions.iter() {
            match partition.snapshot() {
                Ok(s) => snapshots.push(s),
                Err(e) => {
                    return Err(match close_all(snapshots, |s| s.close()) {
                        Ok(()) => e,
                        Err(cleanup) => e.with_suppressed(vec![cleanup]),
                    });
                }
            }
        }
        tracing::debug!("Snapshot taken over {} partitions", snapshots.len());
        Ok(IndexSnapshot::new(snapshots))
    }

    /// 尽力刷新：正在被别处刷新的分区直接跳过。首个失败即返回。
    pub fn maybe_refresh(&self) -> Result<()> {
        self.ensure_open()?;
        let _rw = self.read_write_lock.lock();
        for partition in self.partitions()?.iter() {
            partition.maybe_refresh()?;
        }
        Ok(())
    }

    /// 阻塞刷新：返回后所有分区的下一个 searcher 都能看到最新提交。
    pub fn maybe_refresh_blocking(&self) -> Result<()> {
        self.ensure_open()?;
        let _rw = self.read_write_lock.lock();
        self.partitions()?
            .par_iter()
            .try_for_each(|p| p.maybe_refresh_blocking())
    }

    /// 新增第 count+1 个分区并打开。持两把锁（commit_close → read_write），
    /// 保证不会与 close 交错出"关闭后又挂上一个分区"。
    pub fn add_new_partition(&self) -> Result<Arc<IndexPartition>> {
        self.ensure_open()?;
        let _g = self.commit_close_lock.lock();
        let _rw = self.read_write_lock.lock();
        self.ensure_open()?;

        let current = self.partitions.load_full();
        let folder = self.storage.partition_folder(current.len() + 1);
        let existed = folder.exists();
        self.storage.prepare_folder(&folder)?;

        let partition = match self
            .storage
            .open_directory(&folder)
            .map_err(IndexError::from)
            .and_then(|d| IndexPartition::open(folder.clone(), d))
        {
            Ok(p) => Arc::new(p),
            Err(e) => {
                if !existed {
                    if let Err(cleanup) = self.storage.cleanup_folder(&folder) {
                        tracing::warn!(
                            "Failed to remove partition folder {:?} after open failure: {}",
                            folder,
                            cleanup
                        );
                    }
                }
                return Err(e);
            }
        };

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(partition.clone());
        self.partitions.store(Arc::new(next));

        tracing::info!(
            "Partition added: {:?} (now {} partitions)",
            folder,
            current.len() + 1
        );
        Ok(partition)
    }

    /// 当前分区列表快照
    pub fn partitions(&self) -> Result<PartitionList> {
        self.ensure_open()?;
        Ok(self.partitions.load_full())
    }

    pub fn has_single_partition(partitions: &[Arc<IndexPartition>]) -> bool {
        partitions.len() == 1
    }

    /// 持久化失败原因（写入预留的失败记录）
    pub fn mark_as_failed(&self, message: &str) -> Result<()> {
        self.storage.store_failure(message)?;
        tracing::warn!(
            "Index {:?} marked as failed: {}",
            self.storage.index_folder(),
            message
        );
        Ok(())
    }

    pub fn failure(&self) -> Result<Option<String>> {
        Ok(self.storage.load_failure()?)
    }

    pub fn stats(&self) -> IndexReport {
        let partitions = self.partitions.load_full();
        IndexReport {
            root: self.storage.index_folder().to_path_buf(),
            open: self.is_open(),
            partitions: partitions
                .iter()
                .map(|p| {
                    let committed = p.committed_generation();
                    let segment_bytes = committed
                        .and_then(|g| {
                            std::fs::metadata(p.folder().join(segment_file_name(g))).ok()
                        })
                        .map(|m| m.len())
                        .unwrap_or(0);
                    PartitionStats {
                        folder: p.folder().to_path_buf(),
                        committed_generation: committed,
                        visible_generation: p.visible_generation(),
                        visible_docs: p.visible_doc_count(),
                        pending_docs: p.pending_documents(),
                        live_searchers: p.live_searchers(),
                        pinned_generations: p.pinned_generations(),
                        segment_bytes,
                    }
                })
                .collect(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(IndexError::illegal_state("index must be open before use"));
        }
        Ok(())
    }

    fn ensure_not_dropped(&self) -> Result<()> {
        if self.dropped.load(Ordering::Acquire) {
            return Err(IndexError::illegal_state("index has been dropped"));
        }
        Ok(())
    }

    fn create_new_partition_folder(&self) -> Result<PathBuf> {
        let folder = self
            .storage
            .partition_folder(self.partitions.load().len() + 1);
        self.storage.prepare_folder(&folder)?;
        Ok(folder)
    }
}
