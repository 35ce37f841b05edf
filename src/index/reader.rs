use crate::core::Document;
use crate::index::searcher::PartitionSearcher;

/// 单分区全量文档读取（持有该分区借出的 searcher）
#[derive(Debug)]
pub struct PartitionAllDocumentsReader {
    searcher: PartitionSearcher,
}

impl PartitionAllDocumentsReader {
    pub fn new(searcher: PartitionSearcher) -> Self {
        Self { searcher }
    }

    pub fn max_count(&self) -> usize {
        self.searcher.documents().len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.searcher.documents().iter()
    }

    pub fn close(self) {
        self.searcher.close();
    }
}

/// 跨分区只读视图：分区顺序拼接，分区内按 id 升序。
///
/// `iter()` 每次调用都从头开始，惰性展开；`close()`（或 drop）归还全部 searcher。
#[derive(Debug)]
pub struct AllDocumentsReader {
    readers: Vec<PartitionAllDocumentsReader>,
}

impl AllDocumentsReader {
    pub fn new(readers: Vec<PartitionAllDocumentsReader>) -> Self {
        Self { readers }
    }

    pub fn partition_count(&self) -> usize {
        self.readers.len()
    }

    pub fn max_count(&self) -> usize {
        self.readers.iter().map(|r| r.max_count()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> + '_ {
        self.readers.iter().flat_map(|r| r.iter())
    }

    pub fn close(self) {
        for r in self.readers {
            r.close();
        }
    }
}

impl<'a> IntoIterator for &'a AllDocumentsReader {
    type Item = &'a Document;
    type IntoIter = Box<dyn Iterator<Item = &'a Document> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::searcher::SegmentReader;
    use crate::storage::segment::SegmentData;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn searcher(ids: &[u64], live: &Arc<AtomicUsize>) -> PartitionSearcher {
        let reader = SegmentReader::from_segment(SegmentData {
            generation: 1,
            documents: ids.iter().map(|id| Document::new(*id)).collect(),
        });
        PartitionSearcher::new(Arc::new(reader), live.clone())
    }

    #[test]
    fn iterates_partitions_in_order_and_restarts_per_call() {
        let live = Arc::new(AtomicUsize::new(0));
        let reader = AllDocumentsReader::new(vec![
            PartitionAllDocumentsReader::new(searcher(&[5, 1], &live)),
            PartitionAllDocumentsReader::new(searcher(&[], &live)),
            PartitionAllDocumentsReader::new(searcher(&[2], &live)),
        ]);

        assert_eq!(reader.partition_count(), 3);
        assert_eq!(reader.max_count(), 3);
        let first: Vec<u64> = reader.iter().map(|d| d.id).collect();
        let second: Vec<u64> = (&reader).into_iter().map(|d| d.id).collect();
        assert_eq!(first, vec![1, 5, 2]);
        assert_eq!(first, second);

        assert_eq!(live.load(Ordering::Acquire), 3);
        reader.close();
        assert_eq!(live.load(Ordering::Acquire), 0);
    }
}
