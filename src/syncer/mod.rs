//! Leader-to-follower region synchronization.
//!
//! The leader runs one broadcast loop that:
//! - Drains changed regions from a notifier channel in bounded batches
//! - Records every change in the history buffer
//! - Fans each batch out to all registered followers
//! - Emits a heartbeat carrying the next index when idle
//!
//! Each follower connection runs a session that validates the cluster id,
//! replays missed history, and registers the connection for live batches.
//!
//! # Example
//!
//! ```ignore
//! let syncer = Arc::new(RegionSyncer::new(config, cluster, store)?);
//! let handle = syncer.start(region_notifier)?;
//!
//! // per accepted connection, on its own thread
//! syncer.sync(&mut FrameReader::new(read_half), Arc::new(FrameWriter::new(write_half)))?;
//!
//! handle.shutdown()?;
//! syncer.close();
//! ```

mod config;
mod followers;
mod server;

pub use config::{
    SyncerConfig, DEFAULT_FOLLOWER_QUEUE_SIZE, DEFAULT_KEEP_ALIVE_INTERVAL,
    DEFAULT_MAX_BATCH_SIZE,
};
pub use followers::{FollowerId, FollowerTable};
pub use server::{RegionSyncer, SyncerHandle};
