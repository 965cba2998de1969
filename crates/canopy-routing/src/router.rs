//! Forwarding
//!
//! Unicast goes to exactly the connection whose sub-tree holds the
//! destination; broadcast fans out to every live connection except the
//! one it arrived on. Each peer carries a small bounded cache of
//! recently seen frame fingerprints, so a re-flood arriving again on the
//! same link is cut even while the topology is transiently inconsistent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use tracing::{debug, trace};

use canopy_core::{ConnId, MeshError, Package, RoutingError};
use canopy_transport::ConnectionSet;

use crate::table::RoutingTable;

/// Where a unicast ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicastOutcome {
    /// The destination is this node
    Local,
    /// Enqueued on the next hop
    Enqueued(ConnId),
    /// The next hop refused the frame (egress back-pressure)
    Congested(ConnId),
}

/// Recently seen fingerprints for one peer, FIFO-bounded
#[derive(Debug, Default)]
struct PeerCache {
    recent: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl PeerCache {
    fn note(&mut self, fp: u64, capacity: usize) -> bool {
        if self.seen.contains(&fp) {
            return true;
        }
        if self.recent.len() == capacity {
            if let Some(old) = self.recent.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.recent.push_back(fp);
        self.seen.insert(fp);
        false
    }
}

/// Forwarding engine with per-peer duplicate-broadcast suppression
#[derive(Debug)]
pub struct Router {
    caches: HashMap<ConnId, PeerCache>,
    capacity: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::with_capacity(32)
    }

    /// `capacity` bounds each peer's fingerprint cache
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            caches: HashMap::new(),
            capacity,
        }
    }

    /// Record a frame fingerprint against its arrival peer; `true` if
    /// that peer delivered the same bytes recently
    ///
    /// Identical bytes mean the same origin and payload, so suppressing a
    /// recurrence is always safe in a tree overlay.
    pub fn note_seen(&mut self, conn: ConnId, frame: &[u8]) -> bool {
        let fp = fingerprint(frame);
        let duplicate = self
            .caches
            .entry(conn)
            .or_default()
            .note(fp, self.capacity);
        if duplicate {
            trace!(%conn, fp, "duplicate broadcast suppressed");
        }
        duplicate
    }

    /// Drop the fingerprint cache of a departed peer
    pub fn forget(&mut self, conn: ConnId) {
        self.caches.remove(&conn);
    }

    /// Route a single-destination package
    pub fn unicast(
        &self,
        table: &RoutingTable,
        conns: &mut ConnectionSet,
        pkg: &Package,
    ) -> Result<UnicastOutcome, MeshError> {
        let dest = pkg
            .dest()
            .ok_or(MeshError::Protocol(canopy_core::ProtocolError::MissingField(
                "dest",
            )))?;
        if dest == table.self_id() {
            return Ok(UnicastOutcome::Local);
        }
        let hop = table
            .next_hop(dest)
            .ok_or(MeshError::Routing(RoutingError::UnreachablePeer(dest)))?;
        let json = pkg.to_json()?;
        self.forward_to(conns, hop, &json, pkg.is_priority())
    }

    fn forward_to(
        &self,
        conns: &mut ConnectionSet,
        hop: ConnId,
        json: &str,
        priority: bool,
    ) -> Result<UnicastOutcome, MeshError> {
        let conn = conns
            .get_mut(hop)
            .ok_or(MeshError::Routing(RoutingError::UnknownConnection(hop.0)))?;
        if conn.enqueue(json, priority) {
            Ok(UnicastOutcome::Enqueued(hop))
        } else {
            debug!(%hop, "unicast hit egress back-pressure");
            Ok(UnicastOutcome::Congested(hop))
        }
    }

    /// Forward an already-serialized unicast frame toward its destination
    pub fn forward_unicast(
        &self,
        table: &RoutingTable,
        conns: &mut ConnectionSet,
        dest: canopy_core::NodeId,
        json: &str,
        priority: bool,
    ) -> Result<UnicastOutcome, MeshError> {
        let hop = table
            .next_hop(dest)
            .ok_or(MeshError::Routing(RoutingError::UnreachablePeer(dest)))?;
        self.forward_to(conns, hop, json, priority)
    }

    /// Fan a frame out to every live connection except `except`
    ///
    /// Returns the connections the frame was enqueued on. Loop prevention
    /// is structural: the overlay is a tree and the frame never goes back
    /// where it came from.
    pub fn broadcast(
        &self,
        conns: &mut ConnectionSet,
        json: &str,
        priority: bool,
        except: Option<ConnId>,
    ) -> Vec<ConnId> {
        let mut sent = Vec::new();
        for conn in conns.live_mut() {
            if Some(conn.id()) == except {
                continue;
            }
            if conn.enqueue(json, priority) {
                sent.push(conn.id());
            } else {
                debug!(conn = %conn.id(), "broadcast dropped by egress back-pressure");
            }
        }
        sent
    }
}

fn fingerprint(frame: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    frame.hash(&mut hasher);
    hasher.finish()
}
