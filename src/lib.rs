//! # Region Syncer
//!
//! Replicates region metadata from the leading coordinator to the other
//! coordinator replicas without writing every change through the consensus
//! log. Consistency is best effort; store heartbeats restore it eventually.
//!
//! ## Core Concepts
//!
//! - **History**: Bounded in-memory log of region changes with a durable index watermark
//! - **Broadcast**: One loop that batches changes and fans them out to followers
//! - **Sessions**: Per-connection handshake that replays missed history, then registers the stream
//! - **Followers**: Client-side index tracking with gap detection
//!
//! ## Example
//!
//! ```ignore
//! use region_syncer::{FileWatermarkStore, RegionSyncer, StaticCluster, SyncerConfig};
//!
//! let syncer = Arc::new(RegionSyncer::new(
//!     SyncerConfig::default(),
//!     Arc::new(StaticCluster::new(cluster_id, "pd-1")),
//!     Arc::new(FileWatermarkStore::open("./region-sync")?),
//! )?);
//!
//! let handle = syncer.start(region_notifier)?;
//! ```

pub mod codec;
pub mod error;
pub mod follower;
pub mod history;
pub mod stream;
pub mod syncer;
pub mod types;

// Re-exports
pub use codec::{FrameReader, FrameWriter, MAX_FRAME_SIZE};
pub use error::{ErrorCode, Result, SyncError};
pub use follower::{ApplyOutcome, SyncFollower};
pub use history::{
    FileWatermarkStore, HistoryBuffer, HistoryLookup, MemoryWatermarkStore, WatermarkStore,
};
pub use stream::{ClusterContext, RequestStream, ResponseStream, ServerStream, StaticCluster};
pub use syncer::{FollowerId, FollowerTable, RegionSyncer, SyncerConfig, SyncerHandle};
pub use types::*;
