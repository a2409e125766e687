//! Core vocabulary for the lattice peer-to-peer substrate
//!
//! This crate defines the types shared by every other lattice crate: peer
//! and content identity, configuration, error types, the chain wire-frame
//! codec and the payload structs exchanged between scheduler tasks. It
//! contains no task machinery of its own.

pub mod config;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod messages;
pub mod types;

pub use config::{DedupConfig, NetworkConfig, NetworkType, NodeAddress, SchedulerConfig};
pub use error::{Error, FrameError, Result};
pub use frame::{BroadcastKind, ChainFrame, FrameKind, KeyStatus, ProtocolId};
pub use types::{ContentKey, Direction, Handshake, NodeId, PeerKey, PeerStatus, SubnetId};
