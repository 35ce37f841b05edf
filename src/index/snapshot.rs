use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{close_all, Result};
use crate::storage::segment::segment_file_name;

#[derive(Debug, Default)]
struct PinState {
    pins: HashMap<u64, usize>,
    /// 已被新提交取代、但仍被 snapshot 持有的代
    obsolete: BTreeSet<u64>,
}

/// 提交代引用计数：snapshot 持有期间对应 segment 文件不会被删除。
#[derive(Debug)]
pub(crate) struct CommitPins {
    folder: PathBuf,
    state: Mutex<PinState>,
    #[cfg(test)]
    fail_next_release: std::sync::atomic::AtomicBool,
}

impl CommitPins {
    pub(crate) fn new(folder: PathBuf) -> Self {
        Self {
            folder,
            state: Mutex::new(PinState::default()),
            #[cfg(test)]
            fail_next_release: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn pin(self: &Arc<Self>, generation: u64) -> CommitPin {
        *self.state.lock().pins.entry(generation).or_insert(0) += 1;
        CommitPin {
            pins: self.clone(),
            generation,
            released: false,
        }
    }

    pub(crate) fn pinned(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.state.lock().pins.keys().copied().collect();
        v.sort_unstable();
        v
    }

    /// 淘汰旧代：未被持有的立即删除，被持有的延后到最后一个 pin 释放时删除。
    pub(crate) fn retire(&self, generations: &[u64]) -> io::Result<()> {
        let mut st = self.state.lock();
        let mut first_err = None;
        for &g in generations {
            if st.pins.contains_key(&g) {
                st.obsolete.insert(g);
                continue;
            }
            if let Err(e) = self.delete(g) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release(&self, generation: u64) -> io::Result<()> {
        let mut st = self.state.lock();
        let remaining = match st.pins.get_mut(&generation) {
            Some(n) => {
                *n -= 1;
                *n
            }
            None => return Ok(()),
        };
        if remaining > 0 {
            return Ok(());
        }
        st.pins.remove(&generation);
        self.injected_release_failure()?;
        if st.obsolete.remove(&generation) {
            return self.delete(generation);
        }
        Ok(())
    }

    /// 下一次把某代 pin 计数降到 0 时返回错误（计数照常释放）
    #[cfg(test)]
    pub(crate) fn fail_next_release(&self) {
        self.fail_next_release
            .store(true, std::sync::atomic::Ordering::Release);
    }

    #[cfg(test)]
    fn injected_release_failure(&self) -> io::Result<()> {
        if self
            .fail_next_release
            .swap(false, std::sync::atomic::Ordering::AcqRel)
        {
            return Err(io::Error::new(io::ErrorKind::Other, "injected release failure"));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_release_failure(&self) -> io::Result<()> {
        Ok(())
    }

    fn delete(&self, generation: u64) -> io::Result<()> {
        let path = self.folder.join(segment_file_name(generation));
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Deleted obsolete segment {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug)]
pub(crate) struct CommitPin {
    pins: Arc<CommitPins>,
    generation: u64,
    released: bool,
}

impl CommitPin {
    fn release(mut self) -> io::Result<()> {
        self.released = true;
        self.pins.release(self.generation)
    }
}

impl Drop for CommitPin {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.pins.release(self.generation) {
            tracing::warn!(
                "Releasing snapshot pin on generation {} failed: {}",
                self.generation,
                e
            );
        }
    }
}

/// 单个分区的快照：当前已提交代的文件列表 + 该代的 pin。
#[derive(Debug)]
pub struct PartitionSnapshot {
    files: std::vec::IntoIter<PathBuf>,
    pin: Option<CommitPin>,
}

impl PartitionSnapshot {
    pub(crate) fn empty() -> Self {
        Self {
            files: Vec::new().into_iter(),
            pin: None,
        }
    }

    pub(crate) fn pinned(files: Vec<PathBuf>, pin: CommitPin) -> Self {
        Self {
            files: files.into_iter(),
            pin: Some(pin),
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.pin.as_ref().map(|p| p.generation)
    }

    pub fn close(mut self) -> Result<()> {
        match self.pin.take() {
            Some(pin) => Ok(pin.release()?),
            None => Ok(()),
        }
    }
}

impl Iterator for PartitionSnapshot {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        self.files.next()
    }
}

/// 整个逻辑索引的快照：各分区快照按分区顺序拼接。调用方用完必须 `close()`。
#[derive(Debug)]
pub struct IndexSnapshot {
    parts: Vec<PartitionSnapshot>,
    cursor: usize,
}

impl IndexSnapshot {
    pub(crate) fn new(parts: Vec<PartitionSnapshot>) -> Self {
        Self { parts, cursor: 0 }
    }

    pub fn partition_count(&self) -> usize {
        self.parts.len()
    }

    pub fn close(self) -> Result<()> {
        close_all(self.parts, |p| p.close())
    }
}

impl Iterator for IndexSnapshot {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        while let Some(part) = self.parts.get_mut(self.cursor) {
            if let Some(p) = part.next() {
                return Some(p);
            }
            self.cursor += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("partidx-pins-{}-{}", tag, nanos))
    }

    fn touch(folder: &PathBuf, generation: u64) -> PathBuf {
        let p = folder.join(segment_file_name(generation));
        std::fs::write(&p, b"x").unwrap();
        p
    }

    #[test]
    fn retire_defers_pinned_generation_until_last_release() {
        let folder = unique_tmp_dir("defer");
        std::fs::create_dir_all(&folder).unwrap();
        let g1 = touch(&folder, 1);
        let g2 = touch(&folder, 2);

        let pins = Arc::new(CommitPins::new(folder.clone()));
        let a = pins.pin(1);
        let b = pins.pin(1);

        pins.retire(&[1, 2]).unwrap();
        assert!(g1.exists());
        assert!(!g2.exists());

        a.release().unwrap();
        assert!(g1.exists());
        drop(b);
        assert!(!g1.exists());
        assert!(pins.pinned().is_empty());
    }

    #[test]
    fn releasing_live_generation_keeps_file() {
        let folder = unique_tmp_dir("live");
        std::fs::create_dir_all(&folder).unwrap();
        let g3 = touch(&folder, 3);

        let pins = Arc::new(CommitPins::new(folder));
        let snap = PartitionSnapshot::pinned(vec![g3.clone()], pins.pin(3));
        assert_eq!(pins.pinned(), vec![3]);
        assert_eq!(snap.generation(), Some(3));
        snap.close().unwrap();
        assert!(g3.exists());
        assert!(pins.pinned().is_empty());
    }

    #[test]
    fn index_snapshot_concatenates_in_partition_order() {
        let snap = IndexSnapshot::new(vec![
            PartitionSnapshot {
                files: vec![PathBuf::from("1/a")].into_iter(),
                pin: None,
            },
            PartitionSnapshot::empty(),
            PartitionSnapshot {
                files: vec![PathBuf::from("3/b"), PathBuf::from("3/c")].into_iter(),
                pin: None,
            },
        ]);
        assert_eq!(snap.partition_count(), 3);
        let files: Vec<PathBuf> = snap.collect();
        assert_eq!(
            files,
            vec![
                PathBuf::from("1/a"),
                PathBuf::from("3/b"),
                PathBuf::from("3/c")
            ]
        );
    }
}
