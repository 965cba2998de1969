//! Multi-bridge coordination
//!
//! When several bridges coexist, every non-bridge node picks the one its
//! internet traffic routes through. The strategy is configurable; a
//! manual pin overrides any strategy until cleared.

use tracing::debug;

use canopy_core::NodeId;

use crate::registry::BridgeRegistry;

/// How a node picks its egress bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Highest advertised priority among healthy bridges
    #[default]
    PriorityBased,
    /// Cycle through healthy bridges
    RoundRobin,
    /// Strongest router RSSI
    BestSignal,
}

/// Picks and remembers the egress bridge
#[derive(Debug, Default)]
pub struct BridgeSelector {
    strategy: SelectionStrategy,
    pinned: Option<NodeId>,
    rr_cursor: usize,
    last_known: Option<NodeId>,
}

impl BridgeSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: SelectionStrategy) {
        self.strategy = strategy;
    }

    /// Pin a specific bridge until [`clear_pin`](Self::clear_pin)
    pub fn pin(&mut self, bridge: NodeId) {
        self.pinned = Some(bridge);
    }

    pub fn clear_pin(&mut self) {
        self.pinned = None;
    }

    pub fn pinned(&self) -> Option<NodeId> {
        self.pinned
    }

    /// The last bridge a selection returned, healthy or not
    pub fn last_known(&self) -> Option<NodeId> {
        self.last_known
    }

    /// Pick the bridge for the next internet request
    pub fn select(&mut self, registry: &BridgeRegistry, now_us: u64) -> Option<NodeId> {
        if let Some(pinned) = self.pinned {
            if registry.get(pinned).is_some() {
                self.last_known = Some(pinned);
                return Some(pinned);
            }
            debug!(bridge = %pinned, "pinned bridge unknown, falling back to strategy");
        }

        let healthy = registry.healthy(now_us);
        if healthy.is_empty() {
            return None;
        }
        let chosen = match self.strategy {
            SelectionStrategy::PriorityBased => healthy
                .iter()
                .max_by_key(|b| (b.priority, std::cmp::Reverse(b.node_id)))
                .map(|b| b.node_id),
            SelectionStrategy::RoundRobin => {
                let idx = self.rr_cursor % healthy.len();
                self.rr_cursor = self.rr_cursor.wrapping_add(1);
                Some(healthy[idx].node_id)
            }
            SelectionStrategy::BestSignal => healthy
                .iter()
                .max_by_key(|b| (b.router_rssi, std::cmp::Reverse(b.node_id)))
                .map(|b| b.node_id),
        };
        if chosen.is_some() {
            self.last_known = chosen;
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{BridgeRole, BridgeStatusPackage, Routing};

    fn registry_with(bridges: &[(u32, i16, u8)]) -> BridgeRegistry {
        let mut reg = BridgeRegistry::default();
        for (id, rssi, priority) in bridges {
            reg.apply_status(
                &BridgeStatusPackage {
                    from: NodeId(*id),
                    routing: Routing::Broadcast,
                    internet_connected: true,
                    router_rssi: *rssi,
                    router_channel: 1,
                    uptime_s: 10,
                    gateway_ip: None,
                    priority: *priority,
                    role: BridgeRole::Primary,
                    load_pct: 0,
                },
                0,
            );
        }
        reg
    }

    #[test]
    fn test_priority_based_picks_highest() {
        let reg = registry_with(&[(1, -70, 3), (2, -50, 8), (3, -40, 5)]);
        let mut sel = BridgeSelector::default();
        assert_eq!(sel.select(&reg, 0), Some(NodeId(2)));
        assert_eq!(sel.last_known(), Some(NodeId(2)));
    }

    #[test]
    fn test_priority_tie_prefers_lower_id() {
        let reg = registry_with(&[(5, -70, 8), (2, -50, 8)]);
        let mut sel = BridgeSelector::default();
        assert_eq!(sel.select(&reg, 0), Some(NodeId(2)));
    }

    #[test]
    fn test_best_signal() {
        let reg = registry_with(&[(1, -70, 9), (2, -45, 1)]);
        let mut sel = BridgeSelector::new(SelectionStrategy::BestSignal);
        assert_eq!(sel.select(&reg, 0), Some(NodeId(2)));
    }

    #[test]
    fn test_round_robin_cycles() {
        let reg = registry_with(&[(1, -50, 5), (2, -50, 5), (3, -50, 5)]);
        let mut sel = BridgeSelector::new(SelectionStrategy::RoundRobin);
        let picks: Vec<_> = (0..4).map(|_| sel.select(&reg, 0).unwrap()).collect();
        assert_eq!(picks, vec![NodeId(1), NodeId(2), NodeId(3), NodeId(1)]);
    }

    #[test]
    fn test_pin_overrides_strategy() {
        let reg = registry_with(&[(1, -50, 9), (2, -70, 1)]);
        let mut sel = BridgeSelector::default();
        sel.pin(NodeId(2));
        assert_eq!(sel.select(&reg, 0), Some(NodeId(2)));
        sel.clear_pin();
        assert_eq!(sel.select(&reg, 0), Some(NodeId(1)));
    }

    #[test]
    fn test_unknown_pin_falls_back() {
        let reg = registry_with(&[(1, -50, 9)]);
        let mut sel = BridgeSelector::default();
        sel.pin(NodeId(42));
        assert_eq!(sel.select(&reg, 0), Some(NodeId(1)));
    }

    #[test]
    fn test_no_healthy_bridges() {
        let reg = BridgeRegistry::default();
        let mut sel = BridgeSelector::default();
        assert_eq!(sel.select(&reg, 0), None);
        assert_eq!(sel.last_known(), None);
    }
}
