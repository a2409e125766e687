//! Discovery datagram messages
//!
//! The message set exchanged over the UDP discovery channel and its
//! codec. The wire layout is a collaborator detail; frames are
//! bincode-encoded with a strict size cap matching the listener's read
//! buffer.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ContentKey, NodeId};

/// Largest datagram the discovery channel accepts.
pub const MAX_DATAGRAM_SIZE: usize = 32 * 1024;

// ----------------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------------

/// Network endpoint of a discovered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub id: NodeId,
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub from: NodeEndpoint,
    pub to: NodeEndpoint,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub from: NodeEndpoint,
    pub to: NodeEndpoint,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNode {
    pub from: NodeEndpoint,
    pub target: NodeId,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbors {
    pub from: NodeEndpoint,
    pub nodes: Vec<NodeEndpoint>,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutValue {
    pub from: NodeEndpoint,
    pub key: ContentKey,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetValue {
    pub from: NodeEndpoint,
    pub key: ContentKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutProvider {
    pub from: NodeEndpoint,
    pub key: ContentKey,
    pub provider: NodeEndpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProvider {
    pub from: NodeEndpoint,
    pub key: ContentKey,
}

/// A decoded discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
    PutValue(PutValue),
    GetValue(GetValue),
    PutProvider(PutProvider),
    GetProvider(GetProvider),
}

impl DiscoveryMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryMessage::Ping(_) => "ping",
            DiscoveryMessage::Pong(_) => "pong",
            DiscoveryMessage::FindNode(_) => "findnode",
            DiscoveryMessage::Neighbors(_) => "neighbors",
            DiscoveryMessage::PutValue(_) => "putvalue",
            DiscoveryMessage::GetValue(_) => "getvalue",
            DiscoveryMessage::PutProvider(_) => "putprovider",
            DiscoveryMessage::GetProvider(_) => "getprovider",
        }
    }

    /// Encode for transmission; rejects messages above the datagram cap.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self)
            .map_err(|e| Error::parameter(format!("discovery encode failed: {e}")))?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::parameter(format!(
                "discovery message too large: {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Decode a received datagram.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::parameter(format!(
                "datagram too large: {} bytes",
                bytes.len()
            )));
        }
        bincode::deserialize(bytes)
            .map_err(|e| Error::parameter(format!("discovery decode failed: {e}")))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
