//! Broadcast and deduplication integration tests
//!
//! Runs the shell manager inside a real scheduler. The tests play the
//! remote peer: they hold the session's tx receiver to observe what the
//! shell sends, and inject inbound frames through the session's rx
//! sender.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use lattice_core::config::NetworkConfig;
use lattice_core::frame::BroadcastKind;
use lattice_core::messages::{
    BroadcastRequest, InboundFrame, PeerActiveInd, PeerAskToCloseInd, PeerCloseConfirm,
};
use lattice_core::{
    ChainFrame, ContentKey, Direction, Error, FrameKind, Handshake, KeyStatus, NodeId, PeerKey,
    PeerStatus, SubnetId,
};
use lattice_scheduler::{EventBody, Message, Scheduler, TaskDescriptor, TaskHandle, SHELL_MGR_NAME};
use lattice_shell::{KeyMapOutcome, ShellManager, ShellShared};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

struct ShellHarness {
    sched: Scheduler,
    shell: TaskHandle,
    shared: Arc<ShellShared>,
    #[allow(dead_code)]
    upstream: mpsc::Receiver<InboundFrame>,
}

/// One scripted remote peer: the test drives both session channels.
struct FakePeer {
    key: PeerKey,
    tx_rx: mpsc::Receiver<ChainFrame>,
    rx_tx: mpsc::Sender<InboundFrame>,
}

impl FakePeer {
    async fn expect_frame(&mut self, kind: FrameKind) -> ChainFrame {
        let frame = timeout(Duration::from_secs(1), self.tx_rx.recv())
            .await
            .expect("frame expected on peer tx")
            .expect("peer tx channel open");
        assert_eq!(frame.kind, kind, "unexpected frame kind");
        frame
    }

    async fn expect_quiet(&mut self) {
        let got = timeout(Duration::from_millis(250), self.tx_rx.recv()).await;
        assert!(got.is_err(), "peer tx should be quiet, got {got:?}");
    }

    async fn inject(&self, frame: ChainFrame) {
        self.rx_tx
            .send(InboundFrame {
                peer: self.key,
                frame,
            })
            .await
            .expect("rx worker alive");
    }
}

fn handshake(seed: u8) -> Handshake {
    Handshake {
        subnet: SubnetId::ANY,
        node: NodeId::from_bytes(&[seed]),
        dir: Direction::Outbound,
        ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, seed)),
        tcp_port: 30_303,
        proto_version: 1,
    }
}

async fn start_shell(cfg: NetworkConfig) -> ShellHarness {
    let sched = Scheduler::new(cfg.scheduler.clone()).unwrap();
    let (mgr, upstream) = ShellManager::new(&cfg);
    let shared = mgr.shared();
    let by_name = sched
        .start(
            vec![TaskDescriptor::new(SHELL_MGR_NAME, mgr).with_mailbox(32)],
            &[],
        )
        .await
        .unwrap();
    // let the power-on land before the first peer indication
    sleep(Duration::from_millis(20)).await;
    ShellHarness {
        sched,
        shell: by_name[SHELL_MGR_NAME],
        shared,
        upstream,
    }
}

impl ShellHarness {
    async fn send(&self, body: EventBody) {
        self.sched
            .send_message(Message::new(self.shell, self.shell, body))
            .await
            .unwrap();
    }

    async fn attach_peer(&self, seed: u8, tx_cap: usize) -> FakePeer {
        let hs = handshake(seed);
        let key = hs.peer_key();
        let (tx, tx_rx) = mpsc::channel(tx_cap);
        let (rx_tx, rx) = mpsc::channel(16);
        self.send(EventBody::PeerActive(PeerActiveInd {
            handshake: hs,
            tx,
            rx,
        }))
        .await;
        // wait until the table shows it
        timeout(Duration::from_secs(1), async {
            while self.shared.active_peer_snapshot().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer registered");
        FakePeer { key, tx_rx, rx_tx }
    }

    async fn shutdown(self) {
        self.sched.stop().await.unwrap();
    }
}

fn broadcast_req(kind: BroadcastKind, key_byte: u8, data: &[u8]) -> BroadcastRequest {
    BroadcastRequest {
        kind,
        key: vec![key_byte; 4],
        data: data.to_vec(),
        exclude: None,
    }
}

// ----------------------------------------------------------------------------
// Scenario 1: Solo Broadcast
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_solo_broadcast_records_key_until_eviction() {
    let cfg = NetworkConfig::testing();
    let harness = start_shell(cfg.clone()).await;
    let shared = harness.shared.clone();

    shared
        .broadcast(broadcast_req(BroadcastKind::Event, 0x01, b"hello"))
        .unwrap();
    assert_eq!(shared.known_key_count(), 1);
    assert_eq!(shared.pending_check_count(), 0);

    // the key stays known for the key ttl, then the wheel evicts it
    timeout(Duration::from_secs(2), async {
        while shared.known_key_count() != 0 {
            sleep(cfg.dedup.tick).await;
        }
    })
    .await
    .expect("known key evicted after its ttl");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_key_map_law_duplicate_within_ttl_ok_after() {
    let cfg = NetworkConfig::testing();
    let harness = start_shell(cfg.clone()).await;
    let shared = harness.shared.clone();
    let key = ContentKey::from_payload(b"law");

    assert_eq!(shared.set_key_map(key), KeyMapOutcome::Ok);
    assert_eq!(shared.check_key_map(&key), KeyMapOutcome::Duplicated);
    assert_eq!(shared.set_key_map(key), KeyMapOutcome::Duplicated);

    timeout(Duration::from_secs(2), async {
        while shared.check_key_map(&key) == KeyMapOutcome::Duplicated {
            sleep(cfg.dedup.tick).await;
        }
    })
    .await
    .expect("key evicted after its ttl");
    assert_eq!(shared.set_key_map(key), KeyMapOutcome::Ok);

    harness.shutdown().await;
}

// ----------------------------------------------------------------------------
// Scenario 2: Two-Node Negotiated Delivery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_two_node_dedup_handshake_delivers_once() {
    let harness = start_shell(NetworkConfig::testing()).await;
    let shared = harness.shared.clone();
    let mut peer = harness.attach_peer(2, 16).await;

    shared
        .broadcast(broadcast_req(BroadcastKind::Transaction, 0xaa, b"payload"))
        .unwrap();

    // wire order: check-key out first
    let chkk = peer.expect_frame(FrameKind::CheckKey).await;
    let key = ContentKey::from_bytes(&chkk.decode_check_key().unwrap().key);
    assert_eq!(shared.pending_check_count(), 1);

    // peer reports it does not hold the key: payload follows
    peer.inject(ChainFrame::report_key(&key, KeyStatus::NotExist).unwrap())
        .await;
    let payload = peer.expect_frame(FrameKind::Transaction).await;
    assert_eq!(payload.payload, b"payload".to_vec());
    assert_eq!(payload.key, vec![0xaa; 4]);

    timeout(Duration::from_secs(1), async {
        while shared.pending_check_count() != 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pending check cleared by report");

    // identical broadcast within the window is rejected and emits nothing
    let err = shared
        .broadcast(broadcast_req(BroadcastKind::Transaction, 0xaa, b"payload"))
        .unwrap_err();
    assert!(matches!(err, Error::Duplicated(_)));
    peer.expect_quiet().await;

    let stats = shared.broadcast_stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.skm_ok, 1);
    assert_eq!(stats.skm_failed, 1);
    assert_eq!(stats.chkk_ok, 1);

    harness.shutdown().await;
}

// ----------------------------------------------------------------------------
// Scenario 3: Cross-Origination
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_cross_origination_suppresses_payload() {
    let cfg = NetworkConfig::testing();
    let harness = start_shell(cfg.clone()).await;
    let shared = harness.shared.clone();
    let mut peer = harness.attach_peer(3, 16).await;

    shared
        .broadcast(broadcast_req(BroadcastKind::BlockHeader, 0xbb, b"header"))
        .unwrap();
    let chkk = peer.expect_frame(FrameKind::CheckKey).await;
    let key = ContentKey::from_bytes(&chkk.decode_check_key().unwrap().key);

    // before answering, the peer originates the same content and asks us
    peer.inject(ChainFrame::check_key(&key).unwrap()).await;
    let report = peer.expect_frame(FrameKind::ReportKey).await;
    assert_eq!(
        report.decode_report_key().unwrap().status,
        KeyStatus::Exist
    );

    // our own pending check times out; the payload is never sent
    timeout(Duration::from_secs(2), async {
        while shared.pending_check_count() != 0 {
            sleep(cfg.dedup.tick).await;
        }
    })
    .await
    .expect("pending check expired");
    peer.expect_quiet().await;

    harness.shutdown().await;
}

// ----------------------------------------------------------------------------
// Scenario 4: Backpressure
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_full_tx_queue_drops_without_blocking() {
    let mut cfg = NetworkConfig::testing();
    cfg.dedup.enabled = false; // direct fan-out path
    let harness = start_shell(cfg).await;
    let shared = harness.shared.clone();
    let mut peer = harness.attach_peer(4, 4).await;

    // fill the tx queue without draining it
    for n in 0..4 {
        shared
            .broadcast(broadcast_req(BroadcastKind::Event, n, b"burst"))
            .unwrap();
    }
    // the fifth is discarded silently, nothing blocks
    shared
        .broadcast(broadcast_req(BroadcastKind::Event, 4, b"burst"))
        .unwrap();

    let snapshot = shared.active_peer_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].tx_discarded, 1);

    let stats = shared.broadcast_stats();
    assert_eq!(stats.send_ok, 4);
    assert_eq!(stats.send_failed, 1);

    // the four queued frames are intact
    for _ in 0..4 {
        peer.expect_frame(FrameKind::Event).await;
    }
    peer.expect_quiet().await;

    harness.shutdown().await;
}

// ----------------------------------------------------------------------------
// Scenario 5: Peer Close During Negotiation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_close_race_drops_late_report() {
    let cfg = NetworkConfig::testing();
    let harness = start_shell(cfg.clone()).await;
    let shared = harness.shared.clone();
    let mut peer = harness.attach_peer(5, 16).await;

    shared
        .broadcast(broadcast_req(BroadcastKind::Block, 0xcc, b"block"))
        .unwrap();
    let chkk = peer.expect_frame(FrameKind::CheckKey).await;
    let key = ContentKey::from_bytes(&chkk.decode_check_key().unwrap().key);
    assert_eq!(shared.pending_check_count(), 1);

    // upper layers ask for the close, then the peer manager confirms it
    harness
        .send(EventBody::PeerAskToClose(PeerAskToCloseInd {
            subnet: peer.key.subnet,
            node: peer.key.node,
            dir: peer.key.dir,
            why: "test close".into(),
        }))
        .await;
    timeout(Duration::from_secs(1), async {
        loop {
            let snap = shared.active_peer_snapshot();
            if snap.first().map(|p| p.status) == Some(PeerStatus::Closing) {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peer moved to closing");

    harness
        .send(EventBody::PeerCloseConfirm(PeerCloseConfirm {
            subnet: peer.key.subnet,
            node: peer.key.node,
            dir: peer.key.dir,
        }))
        .await;
    timeout(Duration::from_secs(1), async {
        while !shared.active_peer_snapshot().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("peer removed");

    // a late report from the closed peer is dropped, no payload goes out
    peer.inject(ChainFrame::report_key(&key, KeyStatus::NotExist).unwrap())
        .await;
    peer.expect_quiet().await;

    // the orphaned pending entry drains through its timer
    timeout(Duration::from_secs(2), async {
        while shared.pending_check_count() != 0 {
            sleep(cfg.dedup.tick).await;
        }
    })
    .await
    .expect("pending check expired after close");

    harness.shutdown().await;
}

// ----------------------------------------------------------------------------
// Exclusion and Inbound Filtering
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_origin_peer_is_excluded_from_fanout() {
    let harness = start_shell(NetworkConfig::testing()).await;
    let shared = harness.shared.clone();
    let mut origin = harness.attach_peer(6, 16).await;

    let mut req = broadcast_req(BroadcastKind::Event, 0x66, b"gossip");
    req.exclude = Some(origin.key.node);
    shared.broadcast(req).unwrap();

    origin.expect_quiet().await;
    assert_eq!(shared.broadcast_stats().excluded, 1);
    assert_eq!(shared.pending_check_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_inbound_payload_filtered_before_upstream() {
    let cfg = NetworkConfig::testing();
    let mut harness = start_shell(cfg).await;
    let peer = harness.attach_peer(7, 16).await;

    let frame = ChainFrame::broadcast(BroadcastKind::Transaction, vec![0x77; 4], b"tx".to_vec());
    peer.inject(frame.clone()).await;
    let first = timeout(Duration::from_secs(1), harness.upstream.recv())
        .await
        .expect("first sighting forwarded upstream")
        .expect("upstream channel open");
    assert_eq!(first.frame, frame);

    // the upper layer accepts it, recording the key
    assert_eq!(
        harness.shared.set_key_map(first.frame.content_key()),
        KeyMapOutcome::Ok
    );

    // the same payload from the network is now dropped at the shell
    peer.inject(frame.clone()).await;
    let quiet = timeout(Duration::from_millis(250), harness.upstream.recv()).await;
    assert!(quiet.is_err(), "duplicate payload must not pass upstream");

    harness.shutdown().await;
}
