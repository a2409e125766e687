//! Scheduler messages
//!
//! Every message delivered to a task mailbox carries its sender, its
//! receiver and a body drawn from the closed [`EventBody`] set, so task
//! handlers can match exhaustively instead of downcasting.

use lattice_core::messages::{
    BroadcastRequest, GetChainInfoRequest, GetChainInfoResponse, PeerActiveInd,
    PeerAskToCloseInd, PeerCloseConfirm, PeerCloseInd, PeerCloseRequest, ReconfigRequest,
    UdpDataRequest, UdpMsgIndication,
};

use crate::registry::TaskHandle;

// ----------------------------------------------------------------------------
// Exit Codes
// ----------------------------------------------------------------------------

/// Why a task left its dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The task finished its work.
    Normal,
    /// The task observed power-off and reported itself done.
    PowerOff,
    /// The task was stopped from outside.
    Killed,
    /// The task failed or its channels broke underneath it.
    Fault,
}

// ----------------------------------------------------------------------------
// Event Body
// ----------------------------------------------------------------------------

/// The closed set of events a task can receive.
#[derive(Debug)]
pub enum EventBody {
    /// First message a task receives after the scheduler powers it on.
    PowerOn,
    /// The node is shutting down; the task must report itself done.
    PowerOff,
    /// A timer owned by the receiving task expired. `user_id` is the id
    /// the owner assigned when creating the timer; `extra` is the opaque
    /// payload attached at creation.
    TimerExpired { user_id: u32, extra: Option<Vec<u8>> },
    /// Diagnostic no-op event carrying a caller-chosen value; used by
    /// health checks and tests.
    Probe(u64),

    // Peer lifecycle (peer manager -> shell)
    PeerActive(PeerActiveInd),
    PeerCloseConfirm(PeerCloseConfirm),
    PeerCloseInd(PeerCloseInd),
    PeerAskToClose(PeerAskToCloseInd),
    /// Close request issued by the shell to the peer manager.
    PeerCloseRequest(PeerCloseRequest),

    // Chain shell surface (upper layers -> shell)
    Broadcast(BroadcastRequest),
    GetChainInfoReq(GetChainInfoRequest),
    GetChainInfoRsp(GetChainInfoResponse),
    Reconfig(ReconfigRequest),
    /// Local subnet information changed; managers refresh their view.
    SubnetUpdate,

    // UDP discovery surface
    /// Decoded discovery datagram (reader -> neighbor manager).
    UdpMsgInd(UdpMsgIndication),
    /// Datagram write request (any task -> listener manager).
    UdpDataReq(UdpDataRequest),
    /// Listener manager self-events driving its state machine.
    ListenerStart,
    ListenerStop,
}

impl EventBody {
    /// Short name for logging and statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::PowerOn => "power-on",
            EventBody::PowerOff => "power-off",
            EventBody::TimerExpired { .. } => "timer-expired",
            EventBody::Probe(_) => "probe",
            EventBody::PeerActive(_) => "peer-active",
            EventBody::PeerCloseConfirm(_) => "peer-close-confirm",
            EventBody::PeerCloseInd(_) => "peer-close-ind",
            EventBody::PeerAskToClose(_) => "peer-ask-to-close",
            EventBody::PeerCloseRequest(_) => "peer-close-request",
            EventBody::Broadcast(_) => "broadcast",
            EventBody::GetChainInfoReq(_) => "get-chain-info-req",
            EventBody::GetChainInfoRsp(_) => "get-chain-info-rsp",
            EventBody::Reconfig(_) => "reconfig",
            EventBody::SubnetUpdate => "subnet-update",
            EventBody::UdpMsgInd(_) => "udp-msg-ind",
            EventBody::UdpDataReq(_) => "udp-data-req",
            EventBody::ListenerStart => "listener-start",
            EventBody::ListenerStop => "listener-stop",
        }
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// One mailbox message.
#[derive(Debug)]
pub struct Message {
    pub sender: TaskHandle,
    pub receiver: TaskHandle,
    pub body: EventBody,
}

impl Message {
    pub fn new(sender: TaskHandle, receiver: TaskHandle, body: EventBody) -> Self {
        Self {
            sender,
            receiver,
            body,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_body_kinds() {
        assert_eq!(EventBody::PowerOn.kind(), "power-on");
        assert_eq!(
            EventBody::TimerExpired {
                user_id: 3,
                extra: None
            }
            .kind(),
            "timer-expired"
        );
    }
}
