//! Discovery listener loopback tests
//!
//! Runs the listener inside a real scheduler with a stub neighbor
//! manager, then exercises both directions over localhost UDP: inbound
//! datagrams surface as indications, and write requests land on a test
//! socket.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use lattice_core::config::{NetworkConfig, NetworkType, StaticPeer};
use lattice_core::discovery::{DiscoveryMessage, NodeEndpoint, Ping};
use lattice_core::messages::{UdpDataRequest, UdpMsgIndication};
use lattice_core::{NodeId, Result, SubnetId};
use lattice_scheduler::{
    EventBody, Message, Scheduler, TaskContext, TaskDescriptor, TaskLogic, ExitCode,
    NGB_LSN_NAME, NGB_MGR_NAME,
};
use lattice_discovery::ListenerManager;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

// ----------------------------------------------------------------------------
// Stub Neighbor Manager
// ----------------------------------------------------------------------------

struct NeighborStub {
    seen: mpsc::Sender<UdpMsgIndication>,
}

#[async_trait]
impl TaskLogic for NeighborStub {
    async fn handle(&mut self, ctx: &TaskContext, msg: Message) -> Result<()> {
        match msg.body {
            EventBody::PowerOff => ctx.done(ExitCode::PowerOff)?,
            EventBody::UdpMsgInd(ind) => {
                let _ = self.seen.send(ind).await;
            }
            _ => {}
        }
        Ok(())
    }
}

fn endpoint(seed: u8, addr: SocketAddr) -> NodeEndpoint {
    NodeEndpoint {
        id: NodeId::from_bytes(&[seed]),
        ip: addr.ip(),
        udp_port: addr.port(),
        tcp_port: 30_303,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_datagram_roundtrip_through_listener() {
    let cfg = NetworkConfig::testing();
    let sched = Scheduler::new(cfg.scheduler.clone()).unwrap();

    let (seen_tx, mut seen_rx) = mpsc::channel(8);
    let listener = ListenerManager::new(cfg);
    let mut addr_watch = listener.local_addr_watch();

    let by_name = sched
        .start(
            vec![
                TaskDescriptor::new(NGB_MGR_NAME, NeighborStub { seen: seen_tx }).with_mailbox(16),
                TaskDescriptor::new(NGB_LSN_NAME, listener).with_mailbox(16),
            ],
            &[],
        )
        .await
        .unwrap();

    // wait for the socket to bind and publish its port
    let listen_addr = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(addr) = *addr_watch.borrow() {
                return addr;
            }
            if addr_watch.changed().await.is_err() {
                panic!("listener dropped its address watch");
            }
        }
    })
    .await
    .expect("listener bound");

    // inbound: a ping datagram becomes a neighbor-manager indication
    let probe = UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .unwrap();
    let probe_addr = probe.local_addr().unwrap();
    let ping = DiscoveryMessage::Ping(Ping {
        from: endpoint(1, probe_addr),
        to: endpoint(2, listen_addr),
        expiry: 42,
    });
    probe
        .send_to(&ping.encode().unwrap(), listen_addr)
        .await
        .unwrap();

    let ind = timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("indication expected")
        .expect("stub alive");
    assert_eq!(ind.kind(), "ping");
    assert_eq!(ind.message, ping);

    // garbage datagrams are dropped without killing the reader
    probe.send_to(&[0xde, 0xad], listen_addr).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    // outbound: a write request lands on the probe socket
    let payload = ping.encode().unwrap();
    sched
        .send_message(Message::new(
            by_name[NGB_MGR_NAME],
            by_name[NGB_LSN_NAME],
            EventBody::UdpDataReq(UdpDataRequest {
                payload: payload.clone(),
                target: probe_addr,
            }),
        ))
        .await
        .unwrap();

    let mut buf = vec![0u8; payload.len() + 16];
    let (len, from) = timeout(Duration::from_secs(2), probe.recv_from(&mut buf))
        .await
        .expect("datagram expected on probe socket")
        .unwrap();
    assert_eq!(from, listen_addr);
    assert_eq!(&buf[..len], payload.as_slice());

    // the reader still works after the write path was used
    probe
        .send_to(&ping.encode().unwrap(), listen_addr)
        .await
        .unwrap();
    let again = timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .expect("second indication expected")
        .expect("stub alive");
    assert_eq!(again.kind(), "ping");

    sched.stop().await.unwrap();
}

#[tokio::test]
async fn test_static_network_skips_discovery() {
    let mut cfg = NetworkConfig::testing();
    cfg.network_type = NetworkType::Static;
    cfg.static_peers = vec![StaticPeer {
        subnet: SubnetId::ANY,
        address: cfg.local.clone(),
    }];
    cfg.validate().unwrap();

    let sched = Scheduler::new(cfg.scheduler.clone()).unwrap();
    let pool = sched.task_pool_size();
    let listener = ListenerManager::new(cfg);
    let addr_watch = listener.local_addr_watch();

    sched
        .start(
            vec![TaskDescriptor::new(NGB_LSN_NAME, listener).with_mailbox(8)],
            &[],
        )
        .await
        .unwrap();

    // the listener powers itself off without ever binding
    timeout(Duration::from_secs(2), async {
        while sched.free_task_count() != pool {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener reaped on static network");
    assert!(addr_watch.borrow().is_none());

    sched.stop().await.unwrap();
}
