//! Configuration for the lattice substrate
//!
//! All knobs live here: network shape, per-subnet session caps,
//! deduplication windows and scheduler pool sizes. Structs provide a
//! production `Default`, a `testing()` constructor with short windows,
//! and `validate()`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, SubnetId};

// ----------------------------------------------------------------------------
// Network Type
// ----------------------------------------------------------------------------

/// Whether the peer set is fixed at configuration time or discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkType {
    /// Peers come from the static peer list; discovery is not run.
    Static,
    /// Peers are found through UDP discovery and bootstrap nodes.
    Dynamic,
}

// ----------------------------------------------------------------------------
// Addresses
// ----------------------------------------------------------------------------

/// Address and identity of the local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub node_id: NodeId,
}

/// A statically configured remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPeer {
    pub subnet: SubnetId,
    pub address: NodeAddress,
}

// ----------------------------------------------------------------------------
// Per-Subnet Limits
// ----------------------------------------------------------------------------

/// Session caps for one subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetLimits {
    pub max_peers: usize,
    pub max_inbound: usize,
    pub max_outbound: usize,
}

impl Default for SubnetLimits {
    fn default() -> Self {
        Self {
            max_peers: 32,
            max_inbound: 16,
            max_outbound: 16,
        }
    }
}

// ----------------------------------------------------------------------------
// Deduplication Configuration
// ----------------------------------------------------------------------------

/// Windows and channel sizes for the broadcast deduplication engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Master switch; with deduplication off, broadcasts go straight to
    /// every peer tx queue.
    pub enabled: bool,
    /// Lifetime of an entry in the known-key set.
    pub key_ttl: Duration,
    /// Lifetime of a pending check-key negotiation.
    pub check_ttl: Duration,
    /// Granularity of the eviction timer wheel.
    pub tick: Duration,
    /// Upper bound on concurrently armed eviction timers.
    pub max_timers: usize,
    /// Capacity of the upstream rx channel carrying filtered inbound
    /// frames.
    pub rx_channel_size: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_ttl: Duration::from_secs(55),
            check_ttl: Duration::from_secs(8),
            tick: Duration::from_secs(1),
            max_timers: 65_536,
            rx_channel_size: 128,
        }
    }
}

impl DedupConfig {
    /// Short windows so eviction behavior is observable in tests.
    pub fn testing() -> Self {
        Self {
            enabled: true,
            key_ttl: Duration::from_millis(200),
            check_ttl: Duration::from_millis(100),
            tick: Duration::from_millis(25),
            max_timers: 256,
            rx_channel_size: 16,
        }
    }
}

// ----------------------------------------------------------------------------
// Scheduler Configuration
// ----------------------------------------------------------------------------

/// Pool sizes and defaults for the task scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of task slots in the arena.
    pub task_pool_size: usize,
    /// Number of timer slots in the arena.
    pub timer_pool_size: usize,
    /// Mailbox capacity used when a descriptor does not specify one.
    pub default_mailbox_size: usize,
    /// Grace period a stopping scheduler grants tasks before aborting
    /// them.
    pub stop_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_pool_size: 1024,
            timer_pool_size: 1024,
            default_mailbox_size: 64,
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl SchedulerConfig {
    pub fn testing() -> Self {
        Self {
            task_pool_size: 16,
            timer_pool_size: 64,
            default_mailbox_size: 16,
            stop_grace: Duration::from_secs(2),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.task_pool_size == 0 {
            return Err("task_pool_size must be greater than zero".into());
        }
        if self.timer_pool_size == 0 {
            return Err("timer_pool_size must be greater than zero".into());
        }
        if self.default_mailbox_size == 0 {
            return Err("default_mailbox_size must be greater than zero".into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Network Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration for one lattice node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network_type: NetworkType,
    pub local: NodeAddress,
    /// Per-subnet session caps; subnets absent from the map use
    /// [`SubnetLimits::default`].
    pub subnets: HashMap<SubnetId, SubnetLimits>,
    /// Remote peers dialed when `network_type` is [`NetworkType::Static`].
    pub static_peers: Vec<StaticPeer>,
    /// Bootstrap node URLs used when `network_type` is
    /// [`NetworkType::Dynamic`].
    pub bootstrap_nodes: Vec<String>,
    pub dedup: DedupConfig,
    pub scheduler: SchedulerConfig,
    /// Deadline applied to discovery datagram writes.
    pub udp_write_timeout: Duration,
    /// Deadline applied to discovery datagram reads; used to make the
    /// reader loop observe shutdown.
    pub udp_read_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_type: NetworkType::Dynamic,
            local: NodeAddress {
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                udp_port: 30_304,
                tcp_port: 30_303,
                node_id: NodeId::from_bytes(&[]),
            },
            subnets: HashMap::new(),
            static_peers: Vec::new(),
            bootstrap_nodes: Vec::new(),
            dedup: DedupConfig::default(),
            scheduler: SchedulerConfig::default(),
            udp_write_timeout: Duration::from_secs(2),
            udp_read_timeout: Duration::from_millis(500),
        }
    }
}

impl NetworkConfig {
    /// Loopback node with short dedup windows and small pools.
    pub fn testing() -> Self {
        Self {
            network_type: NetworkType::Dynamic,
            local: NodeAddress {
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                udp_port: 0,
                tcp_port: 0,
                node_id: NodeId::from_bytes(b"test-node"),
            },
            dedup: DedupConfig::testing(),
            scheduler: SchedulerConfig::testing(),
            udp_read_timeout: Duration::from_millis(50),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.scheduler.validate()?;
        if self.dedup.rx_channel_size == 0 {
            return Err("dedup.rx_channel_size must be greater than zero".into());
        }
        if self.dedup.tick.is_zero() {
            return Err("dedup.tick must be greater than zero".into());
        }
        if self.dedup.key_ttl < self.dedup.tick || self.dedup.check_ttl < self.dedup.tick {
            return Err("dedup ttls must be at least one tick".into());
        }
        if self.network_type == NetworkType::Static && self.static_peers.is_empty() {
            return Err("static network requires a static peer list".into());
        }
        for (subnet, limits) in &self.subnets {
            if limits.max_peers < limits.max_inbound.max(limits.max_outbound) {
                return Err(format!(
                    "subnet {subnet}: max_peers below directional limit"
                ));
            }
        }
        Ok(())
    }

    /// Caps for one subnet, falling back to the default limits.
    pub fn subnet_limits(&self, subnet: &SubnetId) -> SubnetLimits {
        self.subnets.get(subnet).copied().unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
        assert!(NetworkConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_static_network_requires_peers() {
        let cfg = NetworkConfig {
            network_type: NetworkType::Static,
            ..NetworkConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut cfg = NetworkConfig::default();
        cfg.scheduler.task_pool_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_subnet_limits_fall_back_to_default() {
        let cfg = NetworkConfig::default();
        let limits = cfg.subnet_limits(&SubnetId::ANY);
        assert_eq!(limits.max_peers, SubnetLimits::default().max_peers);
    }
}
