//! Follower side of region synchronization.
//!
//! A follower remembers the next history index it expects. It presents that
//! index when it (re)connects and uses `start_index + position` on every
//! response to spot records it never received.

use crate::error::{Result, SyncError};
use crate::stream::ResponseStream;
use crate::types::{RegionRecord, SyncRequest, SyncResponse};

/// What applying one response did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New records, in index order.
    Applied(Vec<RegionRecord>),
    /// A heartbeat confirming the follower is current.
    Heartbeat,
    /// Nothing new: every record was already applied.
    UpToDate,
    /// The leader is ahead of us by records we never got; reconnect.
    Gap { expected: u64, got: u64 },
}

/// Tracks a follower's position in the leader's history.
#[derive(Clone, Debug)]
pub struct SyncFollower {
    cluster_id: u64,
    name: String,
    next_index: u64,
}

impl SyncFollower {
    /// A follower that has seen every index below `next_index`.
    pub fn new(cluster_id: u64, name: impl Into<String>, next_index: u64) -> Self {
        Self {
            cluster_id,
            name: name.into(),
            next_index,
        }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request to send when (re)connecting.
    pub fn request(&self) -> SyncRequest {
        SyncRequest {
            cluster_id: self.cluster_id,
            follower_name: self.name.clone(),
            start_index: self.next_index,
        }
    }

    /// Apply one response from the leader.
    pub fn apply(&mut self, response: &SyncResponse) -> Result<ApplyOutcome> {
        if response.cluster_id != self.cluster_id {
            return Err(SyncError::ClusterMismatch {
                expected: self.cluster_id,
                got: response.cluster_id,
            });
        }

        if response.start_index > self.next_index {
            tracing::warn!(
                follower = %self.name,
                expected = self.next_index,
                got = response.start_index,
                "region sync gap detected"
            );
            return Ok(ApplyOutcome::Gap {
                expected: self.next_index,
                got: response.start_index,
            });
        }

        if response.is_heartbeat() && response.start_index == self.next_index {
            return Ok(ApplyOutcome::Heartbeat);
        }

        // Skip the prefix we already have from an overlapping replay.
        let skip = (self.next_index - response.start_index) as usize;
        if skip >= response.regions.len() {
            return Ok(ApplyOutcome::UpToDate);
        }

        let fresh = response.regions[skip..].to_vec();
        self.next_index = response.end_index();
        Ok(ApplyOutcome::Applied(fresh))
    }

    /// Apply responses until the leader closes the stream or a gap appears.
    ///
    /// `on_records` sees every applied batch. Returns the gap, if that is
    /// why it stopped.
    pub fn follow<S, F>(&mut self, responses: &mut S, mut on_records: F) -> Result<Option<ApplyOutcome>>
    where
        S: ResponseStream + ?Sized,
        F: FnMut(&[RegionRecord]),
    {
        while let Some(response) = responses.recv()? {
            match self.apply(&response)? {
                ApplyOutcome::Applied(records) => on_records(&records),
                ApplyOutcome::Heartbeat | ApplyOutcome::UpToDate => {}
                gap @ ApplyOutcome::Gap { .. } => return Ok(Some(gap)),
            }
        }
        Ok(None)
    }
}
