//! Transport seams for sync sessions.
//!
//! The syncer never opens connections itself. Whoever accepts a follower
//! connection hands the session an inbound [`RequestStream`] and an outbound
//! [`ServerStream`]; [`crate::codec`] provides framed implementations over any
//! byte stream.

use crate::error::Result;
use crate::types::{Member, SyncRequest, SyncResponse};

/// Outbound half of a follower connection, held by the leader.
///
/// Shared between the session and the follower's flush worker, so sends must
/// be safe to issue from any thread.
pub trait ServerStream: Send + Sync {
    fn send(&self, response: &SyncResponse) -> Result<()>;
}

/// Inbound half of a follower connection, held by the leader.
pub trait RequestStream {
    /// Next request, or `None` once the follower closed the stream cleanly.
    fn recv(&mut self) -> Result<Option<SyncRequest>>;
}

/// Inbound half of the leader connection, held by a follower.
pub trait ResponseStream {
    /// Next response, or `None` once the leader closed the stream cleanly.
    fn recv(&mut self) -> Result<Option<SyncResponse>>;
}

/// Identity of the coordinator running the syncer.
pub trait ClusterContext: Send + Sync {
    fn cluster_id(&self) -> u64;

    /// Name of this coordinator replica.
    fn name(&self) -> &str;

    /// The current leader, if known.
    fn leader(&self) -> Option<Member>;
}

/// A fixed cluster identity.
#[derive(Clone, Debug)]
pub struct StaticCluster {
    pub cluster_id: u64,
    pub member: Member,
    pub leader: Option<Member>,
}

impl StaticCluster {
    /// Identity of a coordinator that is itself the leader.
    pub fn new(cluster_id: u64, name: impl Into<String>) -> Self {
        let member = Member::new(name);
        Self {
            cluster_id,
            leader: Some(member.clone()),
            member,
        }
    }
}

impl ClusterContext for StaticCluster {
    fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    fn name(&self) -> &str {
        &self.member.name
    }

    fn leader(&self) -> Option<Member> {
        self.leader.clone()
    }
}
