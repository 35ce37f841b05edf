use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::core::Document;
use crate::error::{IndexError, Result};

/// Segment 文件 Header
const MAGIC: u32 = 0x5049_4458; // "PIDX"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 4 + 8; // magic + version + state + data_len + checksum

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".seg";
pub const TMP_SUFFIX: &str = ".tmp";

/// 一个提交代（generation）的完整内容
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SegmentData {
    pub generation: u64,
    pub documents: Vec<Document>,
}

pub fn segment_file_name(generation: u64) -> String {
    format!("{SEGMENT_PREFIX}{generation:016x}{SEGMENT_SUFFIX}")
}

pub fn parse_generation(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn encode_header(state: u32, data_len: u32, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    header[8..12].copy_from_slice(&state.to_le_bytes());
    header[12..16].copy_from_slice(&data_len.to_le_bytes());
    header[16..24].copy_from_slice(&checksum.to_le_bytes());
    header
}

/// 原子写入一个 segment（atomic replacement）
///
/// 落盘流程：
/// 1) 写 `<name>.tmp` 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into` 流式写 body，边写边算 xxh3 / data_len
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)
/// 6) fsync(dir)
///
/// 任何一步之前崩溃，目标文件要么不存在，要么是完整的 COMMITTED segment。
pub fn write_segment(dir: &Path, data: &SegmentData) -> Result<PathBuf> {
    let target = dir.join(segment_file_name(data.generation));
    let tmp_path = dir.join(format!(
        "{}{TMP_SUFFIX}",
        segment_file_name(data.generation)
    ));

    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(&encode_header(STATE_INCOMPLETE, 0, 0))?;

    let (data_len_u64, checksum) = {
        let mut cw = ChecksumWriter::new(&mut file);
        bincode::serialize_into(&mut cw, data).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, format!("encode segment: {e}"))
        })?;
        cw.finish()
    };

    let data_len: u32 = data_len_u64.try_into().map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("segment too large (>{} bytes)", u32::MAX),
        )
    })?;

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&encode_header(STATE_COMMITTED, data_len, checksum))?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, &target)?;

    if let Ok(d) = std::fs::File::open(dir) {
        let _ = d.sync_all();
    }

    tracing::debug!(
        "Segment written: {} ({} docs, {} bytes)",
        target.display(),
        data.documents.len(),
        HEADER_SIZE + data_len as usize
    );
    Ok(target)
}

/// 读取并完整校验一个 segment。校验失败一律返回 `Corrupt`，I/O 失败返回 `Io`。
pub fn read_segment(path: &Path) -> Result<SegmentData> {
    let data = std::fs::read(path)?;
    decode_segment(path, &data)
}

fn decode_segment(path: &Path, data: &[u8]) -> Result<SegmentData> {
    if data.len() < HEADER_SIZE {
        return Err(IndexError::corrupt(path, "file shorter than header"));
    }

    let le_u32 = |r: std::ops::Range<usize>| -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&data[r]);
        u32::from_le_bytes(b)
    };
    let magic = le_u32(0..4);
    let version = le_u32(4..8);
    let state = le_u32(8..12);
    let data_len = le_u32(12..16) as usize;
    let mut cb = [0u8; 8];
    cb.copy_from_slice(&data[16..24]);
    let stored_checksum = u64::from_le_bytes(cb);

    if magic != MAGIC {
        return Err(IndexError::corrupt(
            path,
            format!("magic mismatch: {magic:#x} != {MAGIC:#x}"),
        ));
    }
    if version != VERSION_CURRENT {
        return Err(IndexError::corrupt(
            path,
            format!("unsupported version {version}"),
        ));
    }
    if state != STATE_COMMITTED {
        return Err(IndexError::corrupt(path, "segment state INCOMPLETE"));
    }

    let body = &data[HEADER_SIZE..];
    if body.len() != data_len {
        return Err(IndexError::corrupt(
            path,
            format!("data length mismatch: {} != {}", body.len(), data_len),
        ));
    }

    let computed = xxhash_rust::xxh3::xxh3_64(body);
    if computed != stored_checksum {
        return Err(IndexError::corrupt(
            path,
            format!("checksum mismatch: {computed:#x} != {stored_checksum:#x}"),
        ));
    }

    let seg: SegmentData = bincode::deserialize(body)
        .map_err(|e| IndexError::corrupt(path, format!("decode failed: {e}")))?;

    let expected = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_generation);
    if let Some(g) = expected {
        if g != seg.generation {
            return Err(IndexError::corrupt(
                path,
                format!("generation mismatch: file {} != body {}", g, seg.generation),
            ));
        }
    }
    Ok(seg)
}
