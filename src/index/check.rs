use std::io;

use crate::error::IndexError;
use crate::storage::directory::Directory;
use crate::storage::segment::read_segment;

#[derive(Clone, Debug)]
pub struct SegmentStatus {
    pub generation: u64,
    pub doc_count: usize,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct CheckStatus {
    pub clean: bool,
    /// 目录里有文件但找不到任何 segment
    pub missing_commit: bool,
    pub segments: Vec<SegmentStatus>,
}

/// 物理格式一致性检查：逐个 segment 做完整解码与校验。
pub struct CheckIndex<'a> {
    directory: &'a Directory,
}

impl<'a> CheckIndex<'a> {
    pub fn new(directory: &'a Directory) -> Self {
        Self { directory }
    }

    /// 只有 I/O 失败才返回 Err；格式损坏体现在 `CheckStatus::clean == false`。
    pub fn check(&self) -> io::Result<CheckStatus> {
        let generations = self.directory.generations()?;
        if generations.is_empty() {
            return Ok(CheckStatus {
                clean: false,
                missing_commit: true,
                segments: Vec::new(),
            });
        }

        let mut status = CheckStatus {
            clean: true,
            missing_commit: false,
            segments: Vec::with_capacity(generations.len()),
        };
        for generation in generations {
            let path = self.directory.segment_path(generation);
            let seg_status = match read_segment(&path) {
                Ok(seg) => SegmentStatus {
                    generation,
                    doc_count: seg.documents.len(),
                    error: None,
                },
                Err(IndexError::Io(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!("CheckIndex: {}", e);
                    status.clean = false;
                    SegmentStatus {
                        generation,
                        doc_count: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            status.segments.push(seg_status);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Document;
    use crate::storage::segment::{segment_file_name, write_segment, SegmentData};
    use std::path::PathBuf;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("partidx-check-{}-{}", tag, nanos))
    }

    #[test]
    fn valid_segments_are_clean() {
        let dir = unique_tmp_dir("clean");
        std::fs::create_dir_all(&dir).unwrap();
        for generation in 1..=2 {
            write_segment(
                &dir,
                &SegmentData {
                    generation,
                    documents: vec![Document::new(generation)],
                },
            )
            .unwrap();
        }

        let d = Directory::open(&dir).unwrap();
        let status = CheckIndex::new(&d).check().unwrap();
        assert!(status.clean);
        assert_eq!(status.segments.len(), 2);
        assert!(status.segments.iter().all(|s| s.doc_count == 1));
    }

    #[test]
    fn one_bad_segment_makes_directory_dirty() {
        let dir = unique_tmp_dir("dirty");
        std::fs::create_dir_all(&dir).unwrap();
        write_segment(
            &dir,
            &SegmentData {
                generation: 1,
                documents: Vec::new(),
            },
        )
        .unwrap();
        std::fs::write(dir.join(segment_file_name(2)), b"garbage garbage garbage!").unwrap();

        let d = Directory::open(&dir).unwrap();
        let status = CheckIndex::new(&d).check().unwrap();
        assert!(!status.clean);
        assert!(status.segments[0].error.is_none());
        assert!(status.segments[1].error.is_some());
    }

    #[test]
    fn stray_files_without_commit_are_not_clean() {
        let dir = unique_tmp_dir("stray");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("random.bin"), [1u8, 2, 3]).unwrap();

        let d = Directory::open(&dir).unwrap();
        let status = CheckIndex::new(&d).check().unwrap();
        assert!(!status.clean);
        assert!(status.missing_commit);
    }
}
