//! Inter-task payload types
//!
//! The structs exchanged between scheduler tasks: broadcast submissions,
//! peer lifecycle indications from the peer manager, chain-info routing
//! and the UDP discovery surface. Channel ends travel inside the peer
//! indications, the same way the session channels are handed over in the
//! original protocol.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::discovery::DiscoveryMessage;
use crate::frame::{BroadcastKind, ChainFrame};
use crate::types::{Direction, Handshake, NodeId, PeerKey, SubnetId};

// ----------------------------------------------------------------------------
// Broadcast Submission
// ----------------------------------------------------------------------------

/// A payload submitted for fan-out to every active peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRequest {
    pub kind: BroadcastKind,
    /// Content key identifying the payload for deduplication.
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    /// Peer the payload came from; never offered back to it.
    pub exclude: Option<NodeId>,
}

// ----------------------------------------------------------------------------
// Chain-Info Routing
// ----------------------------------------------------------------------------

/// Request fanned out to every active peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChainInfoRequest {
    pub seq: u64,
    pub kind: String,
    pub key: Vec<u8>,
}

/// Response routed back to one specific peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChainInfoResponse {
    pub seq: u64,
    pub kind: String,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
    pub peer: PeerKey,
}

// ----------------------------------------------------------------------------
// Reconfiguration
// ----------------------------------------------------------------------------

/// Subnet membership change, fanned out to the peer, neighbor and table
/// managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigRequest {
    pub add: Vec<SubnetId>,
    pub remove: Vec<SubnetId>,
}

// ----------------------------------------------------------------------------
// Peer Lifecycle Indications
// ----------------------------------------------------------------------------

/// An inbound frame as delivered by a peer session: the decoded frame
/// plus the session it arrived on.
#[derive(Debug)]
pub struct InboundFrame {
    pub peer: PeerKey,
    pub frame: ChainFrame,
}

/// Peer manager indication: a session completed its handshake and is
/// ready for traffic. Carries both ends of the session's channels.
#[derive(Debug)]
pub struct PeerActiveInd {
    pub handshake: Handshake,
    /// Frames enqueued here are written to the peer by its session.
    pub tx: mpsc::Sender<ChainFrame>,
    /// Frames read from the peer arrive here; consumed by the shell's
    /// per-peer rx worker.
    pub rx: mpsc::Receiver<InboundFrame>,
}

/// Peer manager confirmation that a previously requested close finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCloseConfirm {
    pub subnet: SubnetId,
    pub node: NodeId,
    pub dir: Direction,
}

/// Indication that a peer closed on its own. The protocol does not allow
/// this; the handler exists for robustness only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCloseInd {
    pub subnet: SubnetId,
    pub node: NodeId,
    pub dir: Direction,
}

/// Indication that upper layers want a peer closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAskToCloseInd {
    pub subnet: SubnetId,
    pub node: NodeId,
    pub dir: Direction,
    pub why: String,
}

/// Why the shell asks the peer manager to close a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Upper layers asked for the close.
    AskedTo,
    /// The node is shutting down.
    PowerOff,
}

/// Close request issued downward to the peer manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCloseRequest {
    pub subnet: SubnetId,
    pub node: NodeId,
    pub dir: Direction,
    pub reason: CloseReason,
}

// ----------------------------------------------------------------------------
// UDP Discovery Surface
// ----------------------------------------------------------------------------

/// A decoded discovery datagram, posted to the neighbor manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMsgIndication {
    pub message: DiscoveryMessage,
    pub from: SocketAddr,
}

impl UdpMsgIndication {
    /// Name of the carried message type, for dispatch and logging.
    pub fn kind(&self) -> &'static str {
        self.message.kind()
    }
}

/// A raw datagram to be written by the discovery listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDataRequest {
    pub payload: Vec<u8>,
    pub target: SocketAddr,
}
