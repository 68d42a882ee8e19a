//! Integration tests for the region syncer.

use crossbeam_channel::{unbounded, Receiver, Sender};
use region_syncer::{
    ApplyOutcome, FileWatermarkStore, FrameReader, FrameWriter, MemoryWatermarkStore,
    RegionRecord, RegionSyncer, RequestStream, Result, ServerStream, StaticCluster, SyncError,
    SyncFollower, SyncRequest, SyncResponse, SyncerConfig,
};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CLUSTER_ID: u64 = 6_001;

fn test_syncer(config: SyncerConfig) -> Arc<RegionSyncer> {
    Arc::new(
        RegionSyncer::new(
            config,
            Arc::new(StaticCluster::new(CLUSTER_ID, "pd-1")),
            Arc::new(MemoryWatermarkStore::new()),
        )
        .unwrap(),
    )
}

fn region(id: u64) -> RegionRecord {
    RegionRecord::new(id, format!("t_{:04}", id), format!("t_{:04}", id + 1))
        .with_epoch(1, id)
        .with_peer(id * 10 + 1, 1)
        .with_peer(id * 10 + 2, 2)
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Forwards sends to a channel; fails once `broken` is set.
struct TestStream {
    sender: Sender<SyncResponse>,
    broken: Arc<AtomicBool>,
}

impl ServerStream for TestStream {
    fn send(&self, response: &SyncResponse) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("broken pipe".into()));
        }
        self.sender
            .send(response.clone())
            .map_err(|e| SyncError::Transport(e.to_string()))
    }
}

fn test_stream() -> (Arc<TestStream>, Receiver<SyncResponse>, Arc<AtomicBool>) {
    let (sender, receiver) = unbounded();
    let broken = Arc::new(AtomicBool::new(false));
    let stream = Arc::new(TestStream {
        sender,
        broken: Arc::clone(&broken),
    });
    (stream, receiver, broken)
}

// --- Broadcast Engine ---

#[test]
fn test_n_events_advance_next_index_by_n() {
    let syncer = test_syncer(SyncerConfig::default());
    let before = syncer.history().next_index();

    let (notifier, notifications) = unbounded();
    let handle = syncer.start(notifications).unwrap();
    for i in 0..250 {
        notifier.send(region(i)).unwrap();
    }

    assert!(wait_until(|| syncer.history().next_index() == before + 250));
    handle.shutdown().unwrap();
}

#[test]
fn test_batch_cap_with_150_queued() {
    let syncer = test_syncer(SyncerConfig::default());
    let (stream, received, _) = test_stream();
    syncer.bind_stream("pd-2", stream).unwrap();

    let (notifier, notifications) = unbounded();
    for i in 0..150 {
        notifier.send(region(i)).unwrap();
    }
    let handle = syncer.start(notifications).unwrap();

    let first = received.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.regions.len(), 100);
    assert_eq!(first.start_index, 0);
    assert_eq!(first.regions[0], region(0));

    let second = received.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(second.regions.len(), 50);
    assert_eq!(second.start_index, 100);
    assert_eq!(second.regions[49], region(149));

    handle.shutdown().unwrap();
}

#[test]
fn test_batches_preserve_arrival_order() {
    let syncer = test_syncer(SyncerConfig {
        max_batch_size: 7,
        ..Default::default()
    });
    let (stream, received, _) = test_stream();
    syncer.bind_stream("pd-2", stream).unwrap();

    let (notifier, notifications) = unbounded();
    let handle = syncer.start(notifications).unwrap();
    for i in 0..40 {
        notifier.send(region(i)).unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 40 {
        let batch = received.recv_timeout(Duration::from_secs(2)).unwrap();
        if batch.is_heartbeat() {
            continue;
        }
        assert!(batch.regions.len() <= 7);
        assert_eq!(batch.start_index, seen.len() as u64);
        seen.extend(batch.regions);
    }
    let expected: Vec<_> = (0..40).map(region).collect();
    assert_eq!(seen, expected);

    handle.shutdown().unwrap();
}

#[test]
fn test_heartbeat_on_idle() {
    let syncer = test_syncer(SyncerConfig {
        keep_alive_interval_ms: 20,
        ..Default::default()
    });
    syncer.history().record(region(1)).unwrap();
    syncer.history().record(region(2)).unwrap();
    let (stream, received, _) = test_stream();
    syncer.bind_stream("pd-2", stream).unwrap();

    let (_notifier, notifications) = unbounded::<RegionRecord>();
    let handle = syncer.start(notifications).unwrap();

    let heartbeat = received.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(heartbeat, SyncResponse::heartbeat(CLUSTER_ID, 2));

    handle.shutdown().unwrap();
}

#[test]
fn test_failed_follower_is_dropped_and_others_continue() {
    init_logging();
    let syncer = test_syncer(SyncerConfig::default());
    let (a, a_received, a_broken) = test_stream();
    let (b, b_received, _) = test_stream();
    syncer.bind_stream("a", a).unwrap();
    syncer.bind_stream("b", b).unwrap();

    let first = SyncResponse::heartbeat(CLUSTER_ID, 0);
    assert_eq!(syncer.broadcast(first.clone()), 2);
    assert_eq!(a_received.recv_timeout(Duration::from_secs(1)).unwrap(), first);
    assert_eq!(b_received.recv_timeout(Duration::from_secs(1)).unwrap(), first);

    a_broken.store(true, Ordering::SeqCst);
    syncer.broadcast(SyncResponse::heartbeat(CLUSTER_ID, 1));
    assert!(wait_until(|| syncer.follower_names() == vec!["b".to_string()]));

    let third = SyncResponse::heartbeat(CLUSTER_ID, 2);
    assert_eq!(syncer.broadcast(third.clone()), 1);
    assert_eq!(
        b_received.recv_timeout(Duration::from_secs(1)).unwrap().start_index,
        1
    );
    assert_eq!(b_received.recv_timeout(Duration::from_secs(1)).unwrap(), third);
    assert!(a_received.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_shutdown_stops_broadcasts() {
    let syncer = test_syncer(SyncerConfig::default());
    let (stream, received, _) = test_stream();
    syncer.bind_stream("pd-2", stream).unwrap();

    let (notifier, notifications) = unbounded();
    let handle = syncer.start(notifications).unwrap();
    handle.shutdown().unwrap();

    // The loop dropped its end of the notifier on exit.
    assert!(notifier.send(region(1)).is_err());
    assert!(received.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(syncer.history().next_index(), 0);

    syncer.close();
    assert!(syncer.follower_names().is_empty());
}

#[test]
fn test_notifier_closed_ends_loop() {
    let syncer = test_syncer(SyncerConfig::default());
    let (notifier, notifications) = unbounded::<RegionRecord>();
    let handle = syncer.start(notifications).unwrap();

    drop(notifier);
    handle.shutdown().unwrap();
}

// --- Sessions over TCP ---

/// Accept one connection and serve it on a background thread.
fn serve_one(
    syncer: &Arc<RegionSyncer>,
) -> (std::net::SocketAddr, thread::JoinHandle<Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let syncer = Arc::clone(syncer);

    let server = thread::spawn(move || {
        let (conn, _) = listener.accept().unwrap();
        let outbound = Arc::new(FrameWriter::new(conn.try_clone().unwrap()));
        syncer.sync(&mut FrameReader::new(conn), outbound)
    });

    (addr, server)
}

fn connect(addr: std::net::SocketAddr) -> (FrameWriter<TcpStream>, FrameReader<TcpStream>) {
    let conn = TcpStream::connect(addr).unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    (
        FrameWriter::new(conn.try_clone().unwrap()),
        FrameReader::new(conn),
    )
}

fn next_response(reader: &mut FrameReader<TcpStream>) -> SyncResponse {
    region_syncer::ResponseStream::recv(reader).unwrap().unwrap()
}

#[test]
fn test_follower_catches_up_then_follows_live() {
    let syncer = test_syncer(SyncerConfig::default());
    for i in 0..5 {
        syncer.history().record(region(i)).unwrap();
    }

    let (addr, server) = serve_one(&syncer);
    let (writer, mut reader) = connect(addr);
    let mut follower = SyncFollower::new(CLUSTER_ID, "pd-2", 2);
    writer.write_message(&follower.request()).unwrap();

    let replay = next_response(&mut reader);
    assert_eq!(replay.start_index, 2);
    assert_eq!(
        follower.apply(&replay).unwrap(),
        ApplyOutcome::Applied(vec![region(2), region(3), region(4)])
    );

    assert!(wait_until(|| syncer.follower_names() == vec!["pd-2".to_string()]));

    let (notifier, notifications) = unbounded();
    let handle = syncer.start(notifications).unwrap();
    notifier.send(region(5)).unwrap();

    let live = next_response(&mut reader);
    assert_eq!(live.start_index, 5);
    assert_eq!(
        follower.apply(&live).unwrap(),
        ApplyOutcome::Applied(vec![region(5)])
    );
    assert_eq!(follower.next_index(), 6);

    handle.shutdown().unwrap();

    // Clean close from the follower ends the session without error.
    writer.into_inner().shutdown(Shutdown::Write).unwrap();
    server.join().unwrap().unwrap();
    assert!(syncer.follower_names().is_empty());
}

#[test]
fn test_current_follower_gets_no_replay() {
    let syncer = test_syncer(SyncerConfig::default());
    for i in 0..3 {
        syncer.history().record(region(i)).unwrap();
    }

    let (addr, server) = serve_one(&syncer);
    let (writer, mut reader) = connect(addr);
    let follower = SyncFollower::new(CLUSTER_ID, "pd-2", 3);
    writer.write_message(&follower.request()).unwrap();

    assert!(wait_until(|| !syncer.follower_names().is_empty()));

    // First thing on the wire is the live heartbeat, not a replay.
    syncer.heartbeat();
    assert_eq!(
        next_response(&mut reader),
        SyncResponse::heartbeat(CLUSTER_ID, 3)
    );

    writer.into_inner().shutdown(Shutdown::Write).unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn test_renegotiate_on_same_connection() {
    init_logging();
    let syncer = test_syncer(SyncerConfig::default());
    for i in 0..4 {
        syncer.history().record(region(i)).unwrap();
    }

    let (addr, server) = serve_one(&syncer);
    let (writer, mut reader) = connect(addr);

    writer
        .write_message(&SyncFollower::new(CLUSTER_ID, "pd-2", 3).request())
        .unwrap();
    assert_eq!(next_response(&mut reader).regions, vec![region(3)]);

    writer
        .write_message(&SyncFollower::new(CLUSTER_ID, "pd-2", 1).request())
        .unwrap();
    let replay = next_response(&mut reader);
    assert_eq!(replay.start_index, 1);
    assert_eq!(replay.regions, vec![region(1), region(2), region(3)]);

    assert!(wait_until(|| syncer.follower_names() == vec!["pd-2".to_string()]));

    writer.into_inner().shutdown(Shutdown::Write).unwrap();
    server.join().unwrap().unwrap();
}

// --- Renegotiation Ordering ---

/// Requests fed from a channel; `polled` fires each time the session asks for
/// the next one, i.e. once the previous request has been handled.
struct ChannelRequests {
    requests: Receiver<SyncRequest>,
    polled: Sender<()>,
}

impl RequestStream for ChannelRequests {
    fn recv(&mut self) -> Result<Option<SyncRequest>> {
        let _ = self.polled.send(());
        Ok(self.requests.recv().ok())
    }
}

/// Stalls on the first send, then forwards every response to a channel.
struct SlowStartStream {
    sender: Sender<SyncResponse>,
    started: AtomicBool,
}

impl ServerStream for SlowStartStream {
    fn send(&self, response: &SyncResponse) -> Result<()> {
        if !self.started.swap(true, Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(200));
        }
        self.sender
            .send(response.clone())
            .map_err(|e| SyncError::Transport(e.to_string()))
    }
}

#[test]
fn test_renegotiation_during_slow_send_keeps_order() {
    init_logging();
    let syncer = test_syncer(SyncerConfig::default());
    for i in 0..4 {
        syncer.history().record(region(i)).unwrap();
    }

    let (sender, received) = unbounded();
    let outbound: Arc<dyn ServerStream> = Arc::new(SlowStartStream {
        sender,
        started: AtomicBool::new(false),
    });
    let (request_sender, requests) = unbounded();
    let (polled, polls) = unbounded();

    let session_syncer = Arc::clone(&syncer);
    let session = thread::spawn(move || {
        let mut requests = ChannelRequests { requests, polled };
        session_syncer.sync(&mut requests, outbound)
    });
    let await_poll = || polls.recv_timeout(Duration::from_secs(2)).unwrap();
    await_poll();

    // Current follower: registered with no replay.
    request_sender
        .send(SyncFollower::new(CLUSTER_ID, "pd-2", 4).request())
        .unwrap();
    await_poll();

    // The first of these stalls inside the stream.
    syncer.broadcast(SyncResponse::heartbeat(CLUSTER_ID, 100));
    syncer.broadcast(SyncResponse::heartbeat(CLUSTER_ID, 101));

    request_sender
        .send(SyncFollower::new(CLUSTER_ID, "pd-2", 1).request())
        .unwrap();
    await_poll();
    syncer.broadcast(SyncResponse::heartbeat(CLUSTER_ID, 102));

    let got: Vec<(u64, usize)> = (0..4)
        .map(|_| {
            let response = received.recv_timeout(Duration::from_secs(2)).unwrap();
            (response.start_index, response.regions.len())
        })
        .collect();
    assert_eq!(got, vec![(100, 0), (101, 0), (1, 3), (102, 0)]);
    assert!(received.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(syncer.follower_names(), vec!["pd-2".to_string()]);

    drop(request_sender);
    session.join().unwrap().unwrap();
    assert!(syncer.follower_names().is_empty());
}

// --- Restart ---

#[test]
fn test_restart_keeps_numbering_but_loses_history() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let cluster = Arc::new(StaticCluster::new(CLUSTER_ID, "pd-1"));

    {
        let store = Arc::new(FileWatermarkStore::open(dir.path()).unwrap());
        let syncer = RegionSyncer::new(SyncerConfig::default(), cluster.clone(), store).unwrap();
        for i in 0..5 {
            syncer.history().record(region(i)).unwrap();
        }
    }

    let store = Arc::new(FileWatermarkStore::open(dir.path()).unwrap());
    let syncer = Arc::new(RegionSyncer::new(SyncerConfig::default(), cluster, store).unwrap());
    assert_eq!(syncer.history().next_index(), 5);
    assert!(syncer.history().records_from(2).is_empty());

    // A stale follower gets no catch-up but is still registered for live data.
    let (addr, server) = serve_one(&syncer);
    let (writer, mut reader) = connect(addr);
    writer
        .write_message(&SyncFollower::new(CLUSTER_ID, "pd-2", 2).request())
        .unwrap();
    assert!(wait_until(|| !syncer.follower_names().is_empty()));

    syncer.history().record(region(9)).unwrap();
    syncer.heartbeat();

    let mut follower = SyncFollower::new(CLUSTER_ID, "pd-2", 2);
    let outcome = follower.apply(&next_response(&mut reader)).unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Gap {
            expected: 2,
            got: 6
        }
    );

    writer.into_inner().shutdown(Shutdown::Write).unwrap();
    server.join().unwrap().unwrap();
}
