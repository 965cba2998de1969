//! Mesh time
//!
//! Every node keeps `mesh_time = local_monotonic + offset`. The offset is
//! adjusted by the four-timestamp exchange: nodes synchronise upward
//! toward the time authority (the node toward the mesh root, or the
//! lowest node id when no root is marked), so the whole tree converges on
//! one clock. A bridge with an external source can additionally anchor
//! mesh time to the wall clock.

use chrono::{DateTime, Utc};
use tracing::debug;

use canopy_core::TimeStamps;
use canopy_routing::RoutingTable;

/// Local clock state: the mesh offset and an optional wall-clock anchor
#[derive(Debug, Default)]
pub struct TimeKeeper {
    offset_us: i64,
    /// epoch_ms - mesh_time_ms, learned from NTP packages or the RTC
    wall_anchor_ms: Option<i64>,
}

impl TimeKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronized mesh time for a local monotonic reading
    pub fn mesh_time_us(&self, now_us: u64) -> u64 {
        (now_us as i64).saturating_add(self.offset_us).max(0) as u64
    }

    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    /// Apply an offset delta atomically
    pub fn adjust(&mut self, delta_us: i64) {
        self.offset_us = self.offset_us.saturating_add(delta_us);
        debug!(delta_us, total_us = self.offset_us, "mesh time adjusted");
    }

    /// Process a sync reply; returns `(offset, delay)` if the stamps were
    /// complete and the offset was applied
    pub fn apply_reply(&mut self, stamps: &TimeStamps, t4_mesh_us: u64) -> Option<(i64, i64)> {
        let (offset, delay) = stamps.offset_and_delay(t4_mesh_us)?;
        self.adjust(offset);
        Some((offset, delay))
    }

    /// Anchor mesh time to a wall-clock reading
    pub fn set_wall_anchor(&mut self, epoch_ms: i64, mesh_time_us: u64) {
        self.wall_anchor_ms = Some(epoch_ms - (mesh_time_us / 1000) as i64);
    }

    pub fn has_wall_anchor(&self) -> bool {
        self.wall_anchor_ms.is_some()
    }

    /// Wall-clock time, if an anchor has been learned
    pub fn wall_time(&self, now_us: u64) -> Option<DateTime<Utc>> {
        let anchor = self.wall_anchor_ms?;
        let epoch_ms = anchor + (self.mesh_time_us(now_us) / 1000) as i64;
        DateTime::<Utc>::from_timestamp_millis(epoch_ms)
    }
}

/// Who this node should initiate time sync with
///
/// The authority is reached through the connection whose sub-tree holds
/// the root; with no root marked anywhere, the mesh-wide lowest node id
/// is the authority and we sync toward it. The authority itself (and any
/// node with no peers) initiates nothing.
pub fn sync_target(table: &RoutingTable) -> Option<canopy_core::ConnId> {
    if table.is_root() {
        return None;
    }
    for node in table.node_list(false) {
        if let Some(conn) = table.next_hop(node) {
            if table.conn_contains_root(conn) {
                return Some(conn);
            }
        }
    }
    // No root anywhere: defer to the lowest id in the mesh.
    let lowest = table.node_list(true).into_iter().min()?;
    if lowest == table.self_id() {
        return None;
    }
    table.next_hop(lowest)
}
