use std::io;
use std::path::{Path, PathBuf};

use crate::error::{close_all_silently, Result};
use crate::storage::directory::Directory;

const FAILURE_FILE_NAME: &str = "failure-message";
/// 失败记录预留大小（预先占位，避免磁盘满时写不进失败原因）
pub const DEFAULT_FAILURE_SIZE: usize = 16 * 1024;

/// 分区存储规划：逻辑索引根目录下按 1..N 编号的分区子目录 + 一个失败记录文件。
///
/// ```text
/// <root>/
/// +-- failure-message
/// +-- 1/
/// |   +-- write.lock
/// |   +-- segment-0000000000000003.seg
/// +-- 2/
/// ```
#[derive(Clone, Debug)]
pub struct PartitionedStorage {
    root: PathBuf,
    failure_size: usize,
}

impl PartitionedStorage {
    pub fn new(root: PathBuf) -> Self {
        Self::with_failure_size(root, DEFAULT_FAILURE_SIZE)
    }

    pub fn with_failure_size(root: PathBuf, failure_size: usize) -> Self {
        Self {
            root,
            failure_size: failure_size.max(1),
        }
    }

    pub fn index_folder(&self) -> &Path {
        &self.root
    }

    /// 第 n 个分区目录（n 从 1 开始）
    pub fn partition_folder(&self, n: usize) -> PathBuf {
        debug_assert!(n >= 1, "partition numbers start at 1");
        self.root.join(n.to_string())
    }

    /// 幂等建目录
    pub fn prepare_folder(&self, folder: &Path) -> io::Result<()> {
        std::fs::create_dir_all(folder)
    }

    /// 递归删除；目录不存在视为成功
    pub fn cleanup_folder(&self, folder: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(folder) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn failure_file(&self) -> PathBuf {
        self.root.join(FAILURE_FILE_NAME)
    }

    /// 预留失败记录文件（全零占位）
    pub fn reserve_failure_storage(&self) -> io::Result<()> {
        std::fs::write(self.failure_file(), vec![0u8; self.failure_size])
    }

    /// 写入失败原因（超出预留大小的部分截断，按字符边界）
    pub fn store_failure(&self, message: &str) -> io::Result<()> {
        let mut end = message.len().min(self.failure_size);
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = vec![0u8; self.failure_size];
        buf[..end].copy_from_slice(&message.as_bytes()[..end]);
        std::fs::write(self.failure_file(), buf)
    }

    /// 读取失败原因；未预留或全零返回 None
    pub fn load_failure(&self) -> io::Result<Option<String>> {
        let bytes = match std::fs::read(self.failure_file()) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        if end == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes[..end]).into_owned()))
    }

    /// 列出已存在的分区目录（仅数字命名的子目录），按编号升序。
    pub fn list_folders(&self) -> io::Result<Vec<PathBuf>> {
        let rd = match std::fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut numbered: Vec<(usize, PathBuf)> = Vec::new();
        for ent in rd {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let Some(n) = ent
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n >= 1)
            else {
                continue;
            };
            numbered.push((n, ent.path()));
        }
        numbered.sort_by_key(|(n, _)| *n);
        Ok(numbered.into_iter().map(|(_, p)| p).collect())
    }

    pub fn open_directory(&self, folder: &Path) -> io::Result<Directory> {
        Directory::open(folder)
    }

    /// 打开全部分区目录（按编号顺序）。中途失败时释放已打开的句柄再返回错误。
    pub fn open_all_directories(&self) -> Result<Vec<(PathBuf, Directory)>> {
        let folders = self.list_folders()?;
        let mut opened: Vec<(PathBuf, Directory)> = Vec::with_capacity(folders.len());
        for folder in folders {
            match Directory::open(&folder) {
                Ok(d) => opened.push((folder, d)),
                Err(e) => {
                    close_all_silently(opened, |(_, d)| Ok(d.close()?));
                    return Err(e.into());
                }
            }
        }
        Ok(opened)
    }
}
