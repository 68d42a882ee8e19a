//! Core types for region synchronization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a region.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionId(pub u64);

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegionId({})", self.0)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a storage node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreId(pub u64);

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.0)
    }
}

/// Configuration version stamp of a region.
///
/// `conf_ver` moves on membership changes, `version` on splits and merges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

impl RegionEpoch {
    pub fn new(conf_ver: u64, version: u64) -> Self {
        Self { conf_ver, version }
    }

    /// True if this epoch dominates `other` and is not equal to it.
    pub fn is_newer_than(&self, other: &RegionEpoch) -> bool {
        (self.conf_ver >= other.conf_ver && self.version >= other.version) && self != other
    }
}

/// One replica of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: StoreId,
}

/// Snapshot of a region's metadata at the moment it changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub id: RegionId,

    /// Inclusive start of the key range (empty = unbounded).
    pub start_key: Vec<u8>,

    /// Exclusive end of the key range (empty = unbounded).
    pub end_key: Vec<u8>,

    pub epoch: RegionEpoch,

    pub peers: Vec<Peer>,
}

impl RegionRecord {
    /// Region with no peers covering `[start_key, end_key)`.
    pub fn new(id: u64, start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            id: RegionId(id),
            start_key: start_key.into(),
            end_key: end_key.into(),
            epoch: RegionEpoch::default(),
            peers: Vec::new(),
        }
    }

    pub fn with_epoch(mut self, conf_ver: u64, version: u64) -> Self {
        self.epoch = RegionEpoch::new(conf_ver, version);
        self
    }

    pub fn with_peer(mut self, peer_id: u64, store_id: u64) -> Self {
        self.peers.push(Peer {
            id: peer_id,
            store_id: StoreId(store_id),
        });
        self
    }

    /// Stores hosting a replica of this region.
    pub fn store_ids(&self) -> impl Iterator<Item = StoreId> + '_ {
        self.peers.iter().map(|p| p.store_id)
    }
}

/// A coordinator replica, as seen by the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub client_urls: Vec<String>,
}

impl Member {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_urls: Vec::new(),
        }
    }
}

/// Sent by a follower to open (or renegotiate) a sync stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub cluster_id: u64,
    pub follower_name: String,
    /// First history index the follower has not seen yet.
    pub start_index: u64,
}

/// Sent by the leader: a catch-up slice, a live batch, or a heartbeat.
///
/// The record at position `i` of `regions` has history index `start_index + i`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub cluster_id: u64,
    pub regions: Vec<RegionRecord>,
    pub start_index: u64,
}

impl SyncResponse {
    /// A heartbeat carries no regions; `next_index` is the leader's next index.
    pub fn heartbeat(cluster_id: u64, next_index: u64) -> Self {
        Self {
            cluster_id,
            regions: Vec::new(),
            start_index: next_index,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.regions.is_empty()
    }

    /// Index one past the last region in this response.
    pub fn end_index(&self) -> u64 {
        self.start_index + self.regions.len() as u64
    }
}
