//! Identity types for the lattice substrate
//!
//! Newtype wrappers for the identities that flow through the system: node,
//! subnet and content identity, plus the composite key the peer session
//! table is indexed by.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ----------------------------------------------------------------------------
// Node Identifier
// ----------------------------------------------------------------------------

/// Identity of a participant, derived from its public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Create a NodeId from exactly 32 bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a NodeId from a byte slice, truncating or zero-padding to 32.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; 32];
        let len = bytes.len().min(32);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// ----------------------------------------------------------------------------
// Subnet Identifier
// ----------------------------------------------------------------------------

/// Identity of a logical peer partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubnetId([u8; 2]);

impl SubnetId {
    /// Subnet every node belongs to when no partitioning is configured.
    pub const ANY: Self = Self([0xff, 0xff]);

    pub fn new(bytes: [u8; 2]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Session Direction
// ----------------------------------------------------------------------------

/// Role of the local node in a TCP peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Session was accepted from the remote node.
    Inbound,
    /// Session was dialed by the local node.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

// ----------------------------------------------------------------------------
// Peer Key
// ----------------------------------------------------------------------------

/// Key of an active peer session. A node may hold one inbound and one
/// outbound session with the same remote node on the same subnet, so the
/// direction is part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey {
    pub subnet: SubnetId,
    pub dir: Direction,
    pub node: NodeId,
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subnet, self.dir, self.node)
    }
}

// ----------------------------------------------------------------------------
// Content Key
// ----------------------------------------------------------------------------

/// Application-level hash identifying a broadcast payload for
/// deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create a ContentKey from a byte slice, truncating or zero-padding
    /// to 32 bytes. Wire frames carry keys as variable-length bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut key = [0u8; 32];
        let len = bytes.len().min(32);
        key[..len].copy_from_slice(&bytes[..len]);
        Self(key)
    }

    /// Derive a ContentKey as the SHA-256 of a payload.
    pub fn from_payload(payload: &[u8]) -> Self {
        let digest = Sha256::digest(payload);
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// ----------------------------------------------------------------------------
// Handshake Record
// ----------------------------------------------------------------------------

/// Result of a completed peer handshake, as reported by the peer manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub subnet: SubnetId,
    pub node: NodeId,
    pub dir: Direction,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub proto_version: u32,
}

impl Handshake {
    /// Session-table key for the peer this handshake was completed with.
    pub fn peer_key(&self) -> PeerKey {
        PeerKey {
            subnet: self.subnet,
            dir: self.dir,
            node: self.node,
        }
    }
}

// ----------------------------------------------------------------------------
// Peer Status
// ----------------------------------------------------------------------------

/// Lifecycle status of an active peer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Session is established and usable for tx.
    Active,
    /// A close has been requested; new tx is refused while rx drains.
    Closing,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Active => write!(f, "active"),
            PeerStatus::Closing => write!(f, "closing"),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
