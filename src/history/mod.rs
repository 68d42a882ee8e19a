//! Region change history.
//!
//! Changes are kept in a bounded in-memory buffer indexed by a monotonically
//! increasing counter. Only the counter (the watermark) is durable, so a
//! restarted leader keeps numbering where it left off but has no history to
//! replay.

mod buffer;
mod watermark;

pub use buffer::{HistoryBuffer, HistoryLookup, DEFAULT_HISTORY_CAPACITY};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};
