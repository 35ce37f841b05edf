use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::Document;
use crate::storage::segment::SegmentData;

/// 某一提交代的只读视图（按 id 升序）
#[derive(Debug, Default)]
pub struct SegmentReader {
    generation: Option<u64>,
    documents: Vec<Document>,
}

impl SegmentReader {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_segment(seg: SegmentData) -> Self {
        let mut documents = seg.documents;
        documents.sort_by_key(|d| d.id);
        Self {
            generation: Some(seg.generation),
            documents,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Document> {
        self.documents
            .binary_search_by_key(&id, |d| d.id)
            .ok()
            .map(|i| &self.documents[i])
    }
}

/// 从分区借出的 searcher。分区保留底层 reader 的所有权；drop / close 即归还。
#[derive(Debug)]
pub struct PartitionSearcher {
    reader: Arc<SegmentReader>,
    live: Arc<AtomicUsize>,
}

impl PartitionSearcher {
    pub(crate) fn new(reader: Arc<SegmentReader>, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self { reader, live }
    }

    pub fn reader(&self) -> &SegmentReader {
        &self.reader
    }

    pub fn generation(&self) -> Option<u64> {
        self.reader.generation()
    }

    pub fn documents(&self) -> &[Document] {
        self.reader.documents()
    }

    /// 按字段精确匹配
    pub fn find<'a>(
        &'a self,
        field: &'a str,
        value: &'a str,
    ) -> impl Iterator<Item = &'a Document> + 'a {
        self.reader
            .documents()
            .iter()
            .filter(move |d| d.get(field) == Some(value))
    }

    pub fn close(self) {}
}

impl Drop for PartitionSearcher {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}
