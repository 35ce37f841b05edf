pub mod directory;
pub mod planner;
pub mod segment;

pub use directory::Directory;
pub use planner::PartitionedStorage;
pub use segment::{read_segment, write_segment, SegmentData};
