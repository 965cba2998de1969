//! Bridge registry
//!
//! Every node keeps a map of known bridges, fed by BridgeStatus (610) and
//! BridgeCoordination (613) beacons. Entries expire when a bridge goes
//! quiet; a bridge inserts itself because mesh broadcasts never loop back
//! to their sender.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::debug;

use canopy_core::{BridgeCoordinationPackage, BridgeRole, BridgeStatusPackage, NodeId};

/// Default lifetime of a registry entry without fresh beacons
pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(90);

/// Everything known about one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    pub node_id: NodeId,
    pub internet_connected: bool,
    pub router_rssi: i16,
    pub router_channel: u8,
    pub uptime_s: u64,
    pub gateway_ip: Option<Ipv4Addr>,
    pub last_seen_us: u64,
    pub priority: u8,
    pub role: BridgeRole,
    pub load_pct: u8,
}

impl BridgeInfo {
    /// Usable for internet egress right now
    pub fn healthy(&self, now_us: u64, timeout_us: u64) -> bool {
        self.internet_connected && now_us.saturating_sub(self.last_seen_us) <= timeout_us
    }
}

/// Map of known bridges with expiry
#[derive(Debug)]
pub struct BridgeRegistry {
    entries: HashMap<NodeId, BridgeInfo>,
    timeout_us: u64,
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_BRIDGE_TIMEOUT)
    }
}

impl BridgeRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout_us: timeout.as_micros() as u64,
        }
    }

    /// Ingest a status beacon
    pub fn apply_status(&mut self, pkg: &BridgeStatusPackage, now_us: u64) {
        let entry = self.entries.entry(pkg.from).or_insert_with(|| BridgeInfo {
            node_id: pkg.from,
            internet_connected: false,
            router_rssi: i16::MIN,
            router_channel: 0,
            uptime_s: 0,
            gateway_ip: None,
            last_seen_us: now_us,
            priority: 5,
            role: BridgeRole::Primary,
            load_pct: 0,
        });
        entry.internet_connected = pkg.internet_connected;
        entry.router_rssi = pkg.router_rssi;
        entry.router_channel = pkg.router_channel;
        entry.uptime_s = pkg.uptime_s;
        entry.gateway_ip = pkg.gateway_ip;
        entry.priority = pkg.priority;
        entry.role = pkg.role;
        entry.load_pct = pkg.load_pct;
        entry.last_seen_us = now_us;
    }

    /// Ingest a coordination beacon (refreshes liveness and role data)
    pub fn apply_coordination(&mut self, pkg: &BridgeCoordinationPackage, now_us: u64) {
        if let Some(entry) = self.entries.get_mut(&pkg.from) {
            entry.priority = pkg.priority;
            entry.role = pkg.role;
            entry.load_pct = pkg.load_pct;
            entry.last_seen_us = now_us;
        }
        // A coordination beacon from an unknown bridge is not enough to
        // create an entry; the status beacon carries the link facts.
    }

    /// Drop expired entries, returning their ids
    pub fn prune(&mut self, now_us: u64) -> Vec<NodeId> {
        let timeout = self.timeout_us;
        let expired: Vec<NodeId> = self
            .entries
            .values()
            .filter(|e| now_us.saturating_sub(e.last_seen_us) > timeout)
            .map(|e| e.node_id)
            .collect();
        for id in &expired {
            debug!(bridge = %id, "bridge entry expired");
            self.entries.remove(id);
        }
        expired
    }

    pub fn remove(&mut self, id: NodeId) -> Option<BridgeInfo> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&BridgeInfo> {
        self.entries.get(&id)
    }

    /// Bridges currently usable for egress
    pub fn healthy(&self, now_us: u64) -> Vec<&BridgeInfo> {
        let mut out: Vec<&BridgeInfo> = self
            .entries
            .values()
            .filter(|e| e.healthy(now_us, self.timeout_us))
            .collect();
        out.sort_by_key(|e| e.node_id);
        out
    }

    pub fn has_healthy(&self, now_us: u64) -> bool {
        self.entries
            .values()
            .any(|e| e.healthy(now_us, self.timeout_us))
    }

    pub fn all(&self) -> Vec<&BridgeInfo> {
        let mut out: Vec<&BridgeInfo> = self.entries.values().collect();
        out.sort_by_key(|e| e.node_id);
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::Routing;

    fn status(from: u32, internet: bool, rssi: i16) -> BridgeStatusPackage {
        BridgeStatusPackage {
            from: NodeId(from),
            routing: Routing::Broadcast,
            internet_connected: internet,
            router_rssi: rssi,
            router_channel: 6,
            uptime_s: 100,
            gateway_ip: None,
            priority: 5,
            role: BridgeRole::Primary,
            load_pct: 10,
        }
    }

    #[test]
    fn test_apply_status_creates_and_updates() {
        let mut reg = BridgeRegistry::default();
        reg.apply_status(&status(1, true, -50), 1_000);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(NodeId(1)).unwrap().internet_connected);

        reg.apply_status(&status(1, false, -60), 2_000);
        let info = reg.get(NodeId(1)).unwrap();
        assert!(!info.internet_connected);
        assert_eq!(info.router_rssi, -60);
        assert_eq!(info.last_seen_us, 2_000);
    }

    #[test]
    fn test_healthy_requires_internet_and_freshness() {
        let mut reg = BridgeRegistry::new(Duration::from_secs(90));
        reg.apply_status(&status(1, true, -50), 0);
        reg.apply_status(&status(2, false, -40), 0);

        assert_eq!(reg.healthy(0).len(), 1);
        assert!(reg.has_healthy(89_999_999));
        assert!(!reg.has_healthy(90_000_001));
    }

    #[test]
    fn test_prune_removes_expired() {
        let mut reg = BridgeRegistry::new(Duration::from_secs(90));
        reg.apply_status(&status(1, true, -50), 0);
        reg.apply_status(&status(2, true, -50), 50_000_000);

        let expired = reg.prune(100_000_000);
        assert_eq!(expired, vec![NodeId(1)]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_coordination_refreshes_existing_only() {
        let mut reg = BridgeRegistry::default();
        let coord = BridgeCoordinationPackage {
            from: NodeId(1),
            routing: Routing::Broadcast,
            priority: 9,
            role: BridgeRole::Secondary,
            peer_bridges: vec![],
            load_pct: 77,
            timestamp_us: 0,
        };
        reg.apply_coordination(&coord, 1_000);
        assert!(reg.is_empty());

        reg.apply_status(&status(1, true, -50), 0);
        reg.apply_coordination(&coord, 5_000);
        let info = reg.get(NodeId(1)).unwrap();
        assert_eq!(info.priority, 9);
        assert_eq!(info.role, BridgeRole::Secondary);
        assert_eq!(info.load_pct, 77);
        assert_eq!(info.last_seen_us, 5_000);
    }
}
