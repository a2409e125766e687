//! Peer session table entries
//!
//! One [`PeerEntry`] per active session, keyed by (subnet, direction,
//! node). The entry owns the session's tx channel; sends never block,
//! a full queue drops the frame and counts it against the peer.

use lattice_core::{ChainFrame, Error, Handshake, PeerKey, PeerStatus, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

// ----------------------------------------------------------------------------
// Peer Entry
// ----------------------------------------------------------------------------

/// One active peer session.
pub struct PeerEntry {
    key: PeerKey,
    handshake: Handshake,
    tx: mpsc::Sender<ChainFrame>,
    pub(crate) status: PeerStatus,
    tx_discarded: u64,
}

impl PeerEntry {
    pub(crate) fn new(key: PeerKey, handshake: Handshake, tx: mpsc::Sender<ChainFrame>) -> Self {
        Self {
            key,
            handshake,
            tx,
            status: PeerStatus::Active,
            tx_discarded: 0,
        }
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    /// Frames dropped on this session because its tx queue was full.
    pub fn tx_discarded(&self) -> u64 {
        self.tx_discarded
    }

    /// Enqueue a frame without blocking. A full queue discards the
    /// frame, bumps the drop counter and reports `Resource`.
    pub(crate) fn enqueue(&mut self, frame: ChainFrame) -> Result<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.tx_discarded += 1;
                trace!(peer = %self.key, "tx queue full, frame discarded");
                if self.tx_discarded & 0x1f == 0 {
                    debug!(
                        peer = %self.key,
                        discarded = self.tx_discarded,
                        "tx frames discarded on full queue"
                    );
                }
                Err(Error::resource("peer tx queue full"))
            }
            Err(TrySendError::Closed(_)) => Err(Error::not_found("peer tx channel closed")),
        }
    }

    pub(crate) fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            key: self.key,
            handshake: self.handshake.clone(),
            status: self.status,
            tx_discarded: self.tx_discarded,
        }
    }
}

// ----------------------------------------------------------------------------
// Snapshot
// ----------------------------------------------------------------------------

/// Immutable view of one peer entry, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub key: PeerKey,
    pub handshake: Handshake,
    pub status: PeerStatus,
    pub tx_discarded: u64,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
