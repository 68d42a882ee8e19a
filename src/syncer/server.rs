//! Leader side of region synchronization.

use crate::error::{Result, SyncError};
use crate::history::{HistoryBuffer, HistoryLookup, WatermarkStore};
use crate::stream::{ClusterContext, RequestStream, ServerStream};
use crate::types::{RegionRecord, SyncRequest, SyncResponse};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::config::SyncerConfig;
use super::followers::{FollowerId, FollowerTable};

/// Replicates region changes to follower coordinators without going through
/// the consensus log.
///
/// Delivery is best effort: a follower that misses records (evicted history,
/// dropped stream) is brought back in line by store heartbeats, not by this
/// syncer.
pub struct RegionSyncer {
    config: SyncerConfig,
    cluster: Arc<dyn ClusterContext>,
    history: HistoryBuffer,
    followers: Arc<FollowerTable>,
}

impl RegionSyncer {
    /// Create a syncer whose history is seeded from `store`'s watermark.
    pub fn new(
        config: SyncerConfig,
        cluster: Arc<dyn ClusterContext>,
        store: Arc<dyn WatermarkStore>,
    ) -> Result<Self> {
        config.validate()?;

        let history = HistoryBuffer::open(config.history_capacity, store)?;
        let followers = Arc::new(FollowerTable::new(config.follower_queue_size));

        Ok(Self {
            config,
            cluster,
            history,
            followers,
        })
    }

    pub fn config(&self) -> &SyncerConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// Names of the currently registered followers, sorted.
    pub fn follower_names(&self) -> Vec<String> {
        self.followers.names()
    }

    // --- Broadcast engine ---

    /// Run the broadcast loop on a dedicated thread.
    pub fn start(self: &Arc<Self>, notifier: Receiver<RegionRecord>) -> Result<SyncerHandle> {
        let (quit, quit_receiver) = bounded(1);
        let syncer = Arc::clone(self);

        let thread = thread::Builder::new()
            .name("region-syncer".into())
            .spawn(move || syncer.run_server(notifier, quit_receiver))
            .map_err(|e| SyncError::Worker(e.to_string()))?;

        Ok(SyncerHandle {
            quit,
            thread: Some(thread),
        })
    }

    /// Drain `notifier` into the history and fan changes out to followers.
    ///
    /// Emits a heartbeat every keep-alive interval. Returns when `quit` fires
    /// or is dropped, or when the notifier has no producers left.
    pub fn run_server(&self, notifier: Receiver<RegionRecord>, quit: Receiver<()>) {
        let ticker = tick(self.config.keep_alive_interval());
        tracing::info!(
            name = %self.cluster.name(),
            leader = ?self.cluster.leader().map(|m| m.name),
            next_index = self.history.next_index(),
            "region syncer started"
        );

        loop {
            select! {
                recv(quit) -> _ => {
                    tracing::info!("exit region syncer");
                    return;
                }
                recv(notifier) -> first => match first {
                    Ok(first) => {
                        if let Some(batch) = self.collect_batch(first, &notifier) {
                            self.broadcast(batch);
                        }
                    }
                    Err(_) => {
                        tracing::info!("region notifier closed, exit region syncer");
                        return;
                    }
                },
                recv(ticker) -> _ => {
                    self.heartbeat();
                }
            }
        }
    }

    /// Record `first` plus whatever is already queued, up to the batch cap.
    ///
    /// Returns `None` if no record could be recorded.
    fn collect_batch(
        &self,
        first: RegionRecord,
        notifier: &Receiver<RegionRecord>,
    ) -> Option<SyncResponse> {
        let mut regions = Vec::new();
        let mut start_index = None;
        let mut taken = 0;
        let mut next = Some(first);

        while let Some(region) = next.take() {
            taken += 1;
            match self.history.record(region.clone()) {
                Ok(index) => {
                    start_index.get_or_insert(index);
                    regions.push(region);
                }
                Err(e) => {
                    tracing::error!(region = %region.id, error = %e, "failed to record region change");
                }
            }

            if taken < self.config.max_batch_size {
                next = notifier.try_recv().ok();
            }
        }

        let start_index = start_index?;
        tracing::debug!(start_index, count = regions.len(), "broadcast region batch");

        Some(SyncResponse {
            cluster_id: self.cluster.cluster_id(),
            regions,
            start_index,
        })
    }

    /// Broadcast an empty message carrying the next index.
    pub fn heartbeat(&self) -> usize {
        let next_index = self.history.next_index();
        tracing::debug!(next_index, "broadcast region sync heartbeat");
        self.broadcast(SyncResponse::heartbeat(self.cluster.cluster_id(), next_index))
    }

    /// Queue `response` for every registered follower.
    ///
    /// Followers that cannot take it are deregistered and must reconnect.
    pub fn broadcast(&self, response: SyncResponse) -> usize {
        self.followers.broadcast(response)
    }

    /// Register (or replace) the stream for `name`.
    pub fn bind_stream(&self, name: &str, stream: Arc<dyn ServerStream>) -> Result<FollowerId> {
        self.followers.bind(name, stream)
    }

    /// Deregister every follower; their workers flush and exit.
    pub fn close(&self) {
        let closed = self.followers.clear();
        if closed > 0 {
            tracing::info!(count = closed, "closed region sync streams");
        }
    }

    // --- Sessions ---

    /// Serve one follower connection.
    ///
    /// Each request is validated, answered with any history the follower is
    /// missing, and then binds `outbound` for live broadcasts. The follower may
    /// send further requests on the same connection to renegotiate. Returns
    /// `Ok(())` when the follower closes cleanly; streams bound by this session
    /// are deregistered either way.
    pub fn sync<S>(&self, requests: &mut S, outbound: Arc<dyn ServerStream>) -> Result<()>
    where
        S: RequestStream + ?Sized,
    {
        let mut bound = Vec::new();
        let result = self.serve_session(requests, &outbound, &mut bound);

        for (name, id) in bound {
            self.followers.remove_if(&name, id);
        }

        if let Err(ref e) = result {
            tracing::warn!(error = %e, "region sync session terminated");
        }
        result
    }

    fn serve_session<S>(
        &self,
        requests: &mut S,
        outbound: &Arc<dyn ServerStream>,
        bound: &mut Vec<(String, FollowerId)>,
    ) -> Result<()>
    where
        S: RequestStream + ?Sized,
    {
        while let Some(request) = requests.recv()? {
            let cluster_id = self.cluster.cluster_id();
            if request.cluster_id != cluster_id {
                return Err(SyncError::ClusterMismatch {
                    expected: cluster_id,
                    got: request.cluster_id,
                });
            }
            tracing::info!(
                follower = %request.follower_name,
                start_index = request.start_index,
                "establish sync region stream"
            );

            // The replay goes through the follower's queue so it never races
            // broadcasts already queued on this connection.
            let replay = self.sync_history(&request);
            let id = self
                .followers
                .bind_with(&request.follower_name, Arc::clone(outbound), replay)?;
            if !bound.contains(&(request.follower_name.clone(), id)) {
                bound.push((request.follower_name, id));
            }
        }

        Ok(())
    }

    /// Everything the follower missed, if the history still has it.
    fn sync_history(&self, request: &SyncRequest) -> Option<SyncResponse> {
        let name = &request.follower_name;

        match self.history.lookup(request.start_index) {
            HistoryLookup::Current => {
                tracing::info!(
                    follower = %name,
                    leader = %self.cluster.name(),
                    last_index = request.start_index,
                    "follower already in sync"
                );
                None
            }
            HistoryLookup::Unavailable {
                requested,
                start_index,
                next_index,
            } => {
                // No full resync exists; the follower only sees live changes from here.
                tracing::warn!(
                    follower = %name,
                    requested,
                    start_index,
                    next_index,
                    "no history regions from index, the leader maybe restarted"
                );
                None
            }
            HistoryLookup::Records {
                start_index,
                records,
            } => {
                tracing::info!(
                    follower = %name,
                    start_index,
                    own_last_index = self.history.next_index(),
                    count = records.len(),
                    "sync the history regions"
                );
                Some(SyncResponse {
                    cluster_id: self.cluster.cluster_id(),
                    regions: records,
                    start_index,
                })
            }
        }
    }
}

/// Handle to a running broadcast loop.
pub struct SyncerHandle {
    quit: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl SyncerHandle {
    /// Stop the loop and wait for it to exit.
    pub fn shutdown(mut self) -> Result<()> {
        let _ = self.quit.try_send(());
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| SyncError::Worker("region syncer thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for SyncerHandle {
    fn drop(&mut self) {
        // Best-effort stop; the thread is detached if not joined.
        let _ = self.quit.try_send(());
    }
}
