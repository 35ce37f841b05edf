use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::storage::segment::{parse_generation, segment_file_name, TMP_SUFFIX};

/// 分区写锁文件名（由 IndexPartition 持有，不属于索引内容）
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// 一个分区目录的句柄：持有目录 fd（用于 fsync 目录项）。
///
/// 只负责"看"目录：列文件、定位 segment。写入与锁由 `IndexPartition` 负责。
#[derive(Debug)]
pub struct Directory {
    path: PathBuf,
    handle: File,
}

impl Directory {
    pub fn open(path: &Path) -> io::Result<Self> {
        let handle = File::open(path)?;
        if !handle.metadata()?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a directory: {}", path.display()),
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 索引文件列表（排除 write.lock 与未完成的 tmp 文件），按名字排序。
    pub fn list_all(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for ent in std::fs::read_dir(&self.path)? {
            let ent = ent?;
            let name = ent.file_name().to_string_lossy().into_owned();
            if name == WRITE_LOCK_NAME || name.ends_with(TMP_SUFFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    /// 目录内所有 segment generation（升序）
    pub fn generations(&self) -> io::Result<Vec<u64>> {
        let mut gens: Vec<u64> = self
            .list_all()?
            .iter()
            .filter_map(|n| parse_generation(n))
            .collect();
        gens.sort_unstable();
        Ok(gens)
    }

    pub fn latest_generation(&self) -> io::Result<Option<u64>> {
        Ok(self.generations()?.last().copied())
    }

    /// 是否存在已提交的物理索引
    pub fn index_exists(&self) -> io::Result<bool> {
        Ok(self.latest_generation()?.is_some())
    }

    pub fn segment_path(&self, generation: u64) -> PathBuf {
        self.path.join(segment_file_name(generation))
    }

    /// 清理崩溃残留的 tmp 文件（best-effort）
    pub fn remove_stale_tmp_files(&self) {
        let Ok(rd) = std::fs::read_dir(&self.path) else {
            return;
        };
        for ent in rd.flatten() {
            let name = ent.file_name();
            if name.to_string_lossy().ends_with(TMP_SUFFIX) {
                tracing::debug!("Removing stale tmp file {:?}", ent.path());
                let _ = std::fs::remove_file(ent.path());
            }
        }
    }

    /// 释放目录句柄：先把目录项刷盘，再关闭 fd。
    pub fn close(self) -> io::Result<()> {
        self.handle.sync_all()
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
        std::env::temp_dir().join(format!("partidx-dir-{}-{}", tag, nanos))
    }

    #[test]
    fn list_all_hides_lock_and_tmp_files() {
        let dir = unique_tmp_dir("list");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(WRITE_LOCK_NAME), b"").unwrap();
        std::fs::write(dir.join("segment-0000000000000002.seg.tmp"), b"x").unwrap();
        std::fs::write(dir.join(segment_file_name(2)), b"x").unwrap();
        std::fs::write(dir.join(segment_file_name(1)), b"x").unwrap();

        let d = Directory::open(&dir).unwrap();
        assert_eq!(
            d.list_all().unwrap(),
            vec![segment_file_name(1), segment_file_name(2)]
        );
        assert_eq!(d.generations().unwrap(), vec![1, 2]);
        assert_eq!(d.latest_generation().unwrap(), Some(2));
        assert!(d.index_exists().unwrap());

        d.remove_stale_tmp_files();
        assert!(!dir.join("segment-0000000000000002.seg.tmp").exists());
        d.close().unwrap();
    }

    #[test]
    fn empty_directory_has_no_index() {
        let dir = unique_tmp_dir("empty");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(WRITE_LOCK_NAME), b"").unwrap();

        let d = Directory::open(&dir).unwrap();
        assert!(d.list_all().unwrap().is_empty());
        assert!(!d.index_exists().unwrap());
    }

    #[test]
    fn opening_missing_or_file_path_fails() {
        let dir = unique_tmp_dir("missing");
        assert!(Directory::open(&dir).is_err());

        std::fs::create_dir_all(&dir).unwrap();
        let f = dir.join("plain");
        std::fs::write(&f, b"x").unwrap();
        assert!(Directory::open(&f).is_err());
    }
}
