//! Write-ahead log: segment naming, timelines, record decoding and the
//! per-instance archive.

pub mod archive;
pub mod crc;
pub mod reader;
pub mod record;
pub mod segment;
pub mod timeline;

pub use archive::{PushOutcome, SegmentState, WalArchive};
pub use reader::{SegmentSource, WalReader};
pub use segment::{SegmentName, DEFAULT_WAL_SEGMENT_SIZE};
pub use timeline::{check_catchup_timelines, TimelineHistory};
