//! Registered follower streams and fan-out.

use crate::error::{Result, SyncError};
use crate::stream::ServerStream;
use crate::types::SyncResponse;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

/// Identifies one registration; a name re-registered gets a fresh id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FollowerId(pub u64);

/// One registered follower.
struct FollowerStream {
    id: FollowerId,
    stream: Arc<dyn ServerStream>,
    /// Outbound queue drained by the flush worker.
    sender: Sender<Arc<SyncResponse>>,
    /// Set by the worker once the underlying stream failed.
    closed: Arc<AtomicBool>,
}

impl FollowerStream {
    /// Queue a message. Returns false if the follower should be dropped.
    fn try_send(&self, name: &str, response: Arc<SyncResponse>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        match self.sender.try_send(response) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(follower = %name, "region syncer outbound queue is full");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Followers by name.
///
/// Each follower gets a bounded queue and its own flush thread, so a slow
/// or dead follower never holds up delivery to the others. Order of delivery
/// to one follower matches the order of `broadcast` calls.
pub struct FollowerTable {
    streams: RwLock<HashMap<String, FollowerStream>>,
    next_id: AtomicU64,
    queue_size: usize,
}

impl FollowerTable {
    pub fn new(queue_size: usize) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_size: queue_size.max(1),
        }
    }

    /// Register `stream` under `name`, replacing any earlier registration.
    pub fn bind(self: &Arc<Self>, name: &str, stream: Arc<dyn ServerStream>) -> Result<FollowerId> {
        self.bind_with(name, stream, None)
    }

    /// Register `stream` under `name` with `first` queued ahead of any later
    /// broadcast.
    ///
    /// Binding the stream `name` already holds keeps its queue and worker, so
    /// a connection is only ever written by one thread. A different stream
    /// replaces the registration; the replaced worker flushes what it already
    /// queued and exits.
    pub fn bind_with(
        self: &Arc<Self>,
        name: &str,
        stream: Arc<dyn ServerStream>,
        first: Option<SyncResponse>,
    ) -> Result<FollowerId> {
        let mut streams = self.streams.write();

        if let Some(current) = streams.get(name) {
            if same_stream(&current.stream, &stream) && !current.closed.load(Ordering::Acquire) {
                let id = current.id;
                let queued = match first {
                    Some(first) => current.try_send(name, Arc::new(first)),
                    None => true,
                };
                if !queued {
                    streams.remove(name);
                    tracing::info!(follower = %name, "region syncer delete the stream");
                    return Err(SyncError::Transport(format!(
                        "outbound queue of {} is full",
                        name
                    )));
                }
                return Ok(id);
            }
        }

        let id = FollowerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.queue_size);
        let closed = Arc::new(AtomicBool::new(false));
        if let Some(first) = first {
            sender
                .try_send(Arc::new(first))
                .map_err(|e| SyncError::Worker(e.to_string()))?;
        }

        let worker = FlushWorker {
            name: name.to_string(),
            id,
            stream: Arc::clone(&stream),
            receiver,
            closed: Arc::clone(&closed),
            table: Arc::downgrade(self),
        };
        thread::Builder::new()
            .name(format!("region-sync-{}", name))
            .spawn(move || worker.run())
            .map_err(|e| SyncError::Worker(e.to_string()))?;

        let previous = streams.insert(
            name.to_string(),
            FollowerStream {
                id,
                stream,
                sender,
                closed,
            },
        );
        if let Some(previous) = previous {
            tracing::info!(follower = %name, superseded = previous.id.0, "replaced region sync stream");
        }

        Ok(id)
    }

    /// Queue `response` for every follower, dropping the ones that cannot take it.
    ///
    /// Returns the number of followers the message was queued for.
    pub fn broadcast(&self, response: SyncResponse) -> usize {
        let response = Arc::new(response);
        let mut failed = Vec::new();
        let mut delivered = 0;

        {
            let streams = self.streams.read();
            for (name, stream) in streams.iter() {
                if stream.try_send(name, Arc::clone(&response)) {
                    delivered += 1;
                } else {
                    failed.push((name.clone(), stream.id));
                }
            }
        }

        if !failed.is_empty() {
            let mut streams = self.streams.write();
            for (name, id) in failed {
                if streams.get(&name).map(|s| s.id) == Some(id) {
                    streams.remove(&name);
                    tracing::info!(follower = %name, "region syncer delete the stream");
                }
            }
        }

        delivered
    }

    /// Remove `name` only if it is still the registration `id`.
    pub fn remove_if(&self, name: &str, id: FollowerId) -> bool {
        let mut streams = self.streams.write();
        if streams.get(name).map(|s| s.id) == Some(id) {
            streams.remove(name);
            true
        } else {
            false
        }
    }

    /// Remove `name` regardless of which registration holds it.
    pub fn remove(&self, name: &str) -> bool {
        self.streams.write().remove(name).is_some()
    }

    /// Drop every registration. Workers flush their queues and exit.
    pub fn clear(&self) -> usize {
        let mut streams = self.streams.write();
        let count = streams.len();
        streams.clear();
        count
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.read().contains_key(name)
    }

    /// Registered follower names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same_stream(a: &Arc<dyn ServerStream>, b: &Arc<dyn ServerStream>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Drains one follower's queue into its stream.
struct FlushWorker {
    name: String,
    id: FollowerId,
    stream: Arc<dyn ServerStream>,
    receiver: Receiver<Arc<SyncResponse>>,
    closed: Arc<AtomicBool>,
    table: Weak<FollowerTable>,
}

impl FlushWorker {
    fn run(self) {
        for response in self.receiver.iter() {
            if let Err(e) = self.stream.send(&response) {
                tracing::error!(follower = %self.name, error = %e, "region syncer send data meet error");
                self.closed.store(true, Ordering::Release);

                if let Some(table) = self.table.upgrade() {
                    if table.remove_if(&self.name, self.id) {
                        tracing::info!(follower = %self.name, "region syncer delete the stream");
                    }
                }
                return;
            }
        }

        tracing::debug!(follower = %self.name, registration = self.id.0, "region sync stream retired");
    }
}
