//! Chain wire-frame codec
//!
//! A [`ChainFrame`] is the unit written to and read from a peer session:
//! a protocol id, a frame kind, the content key and an opaque payload.
//! Broadcast payloads travel as-is; the deduplication opcodes carry small
//! bincode-encoded bodies in the payload field.

use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::types::ContentKey;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Maximum key length carried in a frame.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Maximum payload length carried in a frame.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Fixed part of the encoded layout: proto, kind, key length, payload
/// length.
const HEADER_SIZE: usize = 1 + 1 + 2 + 4;

// ----------------------------------------------------------------------------
// Protocol and Frame Kinds
// ----------------------------------------------------------------------------

/// Protocol a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtocolId {
    /// Substrate-internal traffic.
    P2p = 0x00,
    /// Chain application traffic.
    Chain = 0xff,
}

impl ProtocolId {
    fn from_u8(value: u8) -> std::result::Result<Self, FrameError> {
        match value {
            0x00 => Ok(ProtocolId::P2p),
            0xff => Ok(ProtocolId::Chain),
            other => Err(FrameError::UnknownProtocol(other)),
        }
    }
}

/// Kind of payload a broadcast request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastKind {
    Event,
    Transaction,
    BlockHeader,
    Block,
}

/// Discriminant of a chain frame.
///
/// The low values mirror the broadcast kinds; the high values are the
/// deduplication and chain-data opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    Event = 0x00,
    Transaction = 0x01,
    BlockHeader = 0x02,
    Block = 0x03,
    /// "Do you have this key?"
    CheckKey = 0xf0,
    /// Answer to [`FrameKind::CheckKey`].
    ReportKey = 0xf1,
    GetChainData = 0xf2,
    PutChainData = 0xf3,
}

impl FrameKind {
    fn from_u8(value: u8) -> std::result::Result<Self, FrameError> {
        match value {
            0x00 => Ok(FrameKind::Event),
            0x01 => Ok(FrameKind::Transaction),
            0x02 => Ok(FrameKind::BlockHeader),
            0x03 => Ok(FrameKind::Block),
            0xf0 => Ok(FrameKind::CheckKey),
            0xf1 => Ok(FrameKind::ReportKey),
            0xf2 => Ok(FrameKind::GetChainData),
            0xf3 => Ok(FrameKind::PutChainData),
            other => Err(FrameError::UnknownKind(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Event => "event",
            FrameKind::Transaction => "transaction",
            FrameKind::BlockHeader => "block-header",
            FrameKind::Block => "block",
            FrameKind::CheckKey => "check-key",
            FrameKind::ReportKey => "report-key",
            FrameKind::GetChainData => "get-chain-data",
            FrameKind::PutChainData => "put-chain-data",
        }
    }
}

impl From<BroadcastKind> for FrameKind {
    fn from(kind: BroadcastKind) -> Self {
        match kind {
            BroadcastKind::Event => FrameKind::Event,
            BroadcastKind::Transaction => FrameKind::Transaction,
            BroadcastKind::BlockHeader => FrameKind::BlockHeader,
            BroadcastKind::Block => FrameKind::Block,
        }
    }
}

// ----------------------------------------------------------------------------
// Dedup Sub-Bodies
// ----------------------------------------------------------------------------

/// Whether the responder holds the queried key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum KeyStatus {
    NotExist = 0,
    Exist = 1,
}

/// Body of a [`FrameKind::CheckKey`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckKey {
    pub key: Vec<u8>,
}

/// Body of a [`FrameKind::ReportKey`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportKey {
    pub key: Vec<u8>,
    pub status: KeyStatus,
}

/// Body of a [`FrameKind::GetChainData`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetChainData {
    pub seq: u64,
    pub kind: String,
    pub key: Vec<u8>,
}

/// Body of a [`FrameKind::PutChainData`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutChainData {
    pub seq: u64,
    pub kind: String,
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

// ----------------------------------------------------------------------------
// Chain Frame
// ----------------------------------------------------------------------------

/// One frame on a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFrame {
    pub proto: ProtocolId,
    pub kind: FrameKind,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl ChainFrame {
    /// Broadcast payload frame.
    pub fn broadcast(kind: BroadcastKind, key: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            proto: ProtocolId::Chain,
            kind: kind.into(),
            key,
            payload,
        }
    }

    /// Check-key query frame.
    pub fn check_key(key: &ContentKey) -> Result<Self> {
        let body = CheckKey {
            key: key.as_bytes().to_vec(),
        };
        Ok(Self {
            proto: ProtocolId::Chain,
            kind: FrameKind::CheckKey,
            key: key.as_bytes().to_vec(),
            payload: bincode::serialize(&body).map_err(FrameError::Body)?,
        })
    }

    /// Report-key answer frame.
    pub fn report_key(key: &ContentKey, status: KeyStatus) -> Result<Self> {
        let body = ReportKey {
            key: key.as_bytes().to_vec(),
            status,
        };
        Ok(Self {
            proto: ProtocolId::Chain,
            kind: FrameKind::ReportKey,
            key: key.as_bytes().to_vec(),
            payload: bincode::serialize(&body).map_err(FrameError::Body)?,
        })
    }

    /// Get-chain-data request frame.
    pub fn get_chain_data(body: &GetChainData) -> Result<Self> {
        Ok(Self {
            proto: ProtocolId::Chain,
            kind: FrameKind::GetChainData,
            key: body.key.clone(),
            payload: bincode::serialize(body).map_err(FrameError::Body)?,
        })
    }

    /// Put-chain-data response frame.
    pub fn put_chain_data(body: &PutChainData) -> Result<Self> {
        Ok(Self {
            proto: ProtocolId::Chain,
            kind: FrameKind::PutChainData,
            key: body.key.clone(),
            payload: bincode::serialize(body).map_err(FrameError::Body)?,
        })
    }

    /// Decode the check-key body carried by this frame.
    pub fn decode_check_key(&self) -> Result<CheckKey> {
        self.expect_kind(FrameKind::CheckKey)?;
        Ok(bincode::deserialize(&self.payload).map_err(FrameError::Body)?)
    }

    /// Decode the report-key body carried by this frame.
    pub fn decode_report_key(&self) -> Result<ReportKey> {
        self.expect_kind(FrameKind::ReportKey)?;
        Ok(bincode::deserialize(&self.payload).map_err(FrameError::Body)?)
    }

    /// Decode the get-chain-data body carried by this frame.
    pub fn decode_get_chain_data(&self) -> Result<GetChainData> {
        self.expect_kind(FrameKind::GetChainData)?;
        Ok(bincode::deserialize(&self.payload).map_err(FrameError::Body)?)
    }

    /// Decode the put-chain-data body carried by this frame.
    pub fn decode_put_chain_data(&self) -> Result<PutChainData> {
        self.expect_kind(FrameKind::PutChainData)?;
        Ok(bincode::deserialize(&self.payload).map_err(FrameError::Body)?)
    }

    fn expect_kind(&self, expected: FrameKind) -> std::result::Result<(), FrameError> {
        if self.kind != expected {
            return Err(FrameError::KindMismatch {
                expected: expected.name(),
                actual: self.kind.name(),
            });
        }
        Ok(())
    }

    /// Content key this frame is about.
    pub fn content_key(&self) -> ContentKey {
        ContentKey::from_bytes(&self.key)
    }

    /// Encode to the binary wire layout.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.key.len() > MAX_KEY_SIZE {
            return Err(FrameError::KeyTooLarge(self.key.len()).into());
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(self.payload.len()).into());
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.key.len() + self.payload.len());
        bytes.push(self.proto as u8);
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.key);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Decode from the binary wire layout; trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            }
            .into());
        }

        let proto = ProtocolId::from_u8(bytes[0])?;
        let kind = FrameKind::from_u8(bytes[1])?;
        let key_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload_len).into());
        }

        let expected = HEADER_SIZE + key_len + payload_len;
        if bytes.len() < expected {
            return Err(FrameError::Truncated {
                expected,
                actual: bytes.len(),
            }
            .into());
        }
        if bytes.len() > expected {
            return Err(FrameError::TrailingBytes(bytes.len() - expected).into());
        }

        let key = bytes[HEADER_SIZE..HEADER_SIZE + key_len].to_vec();
        let payload = bytes[HEADER_SIZE + key_len..].to_vec();
        Ok(Self {
            proto,
            kind,
            key,
            payload,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
