//! Chain-peer shell
//!
//! Multiplexes chain broadcast traffic over the active peer sessions
//! with content-based deduplication. Locally originated payloads are
//! offered to each peer through a check-key/report-key negotiation so a
//! payload reaches any given peer at most once per deduplication window;
//! inbound frames are filtered against the known-key set before they are
//! handed upstream.
//!
//! Lock order across the shell: peer table, then dedup state, then the
//! known-key set. The scheduler's task and registry locks sit strictly
//! below all three.

pub mod manager;
pub mod peer;
pub mod timers;

pub use manager::{BroadcastStats, KeyMapOutcome, ShellManager, ShellShared};
pub use peer::{PeerEntry, PeerSnapshot};
pub use timers::{EvictTarget, PendingKey, TickTimers, TimerToken};
