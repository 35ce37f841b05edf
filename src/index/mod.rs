pub mod check;
pub mod partition;
pub mod partitioned;
pub mod reader;
pub mod searcher;
pub mod snapshot;

pub use check::{CheckIndex, CheckStatus, SegmentStatus};
pub use partition::IndexPartition;
pub use partitioned::{PartitionList, PartitionedIndex};
pub use reader::{AllDocumentsReader, PartitionAllDocumentsReader};
pub use searcher::{PartitionSearcher, SegmentReader};
pub use snapshot::{IndexSnapshot, PartitionSnapshot};
