//! Topology synchronisation
//!
//! Each node periodically (and on attach) sends every peer a
//! NodeSyncRequest carrying its view of the mesh minus the peer's own
//! side; the peer answers with a NodeSyncReply carrying its side. Applying
//! an advertised tree replaces that connection's sub-tree, resolves
//! duplicate node ids (the older-attached connection loses), and reports
//! whether the aggregate node set changed.

use tracing::{info, warn};

use canopy_core::{ConnId, NodeId, NodeSyncPackage, Package, Routing, WireTree};
use canopy_transport::ConnectionSet;

use crate::table::RoutingTable;
use crate::tree::SubTree;

/// Result of applying one advertised tree
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// The tree was installed for the advertising connection
    pub accepted: bool,
    /// Connections that must now be dropped (duplicate id or cycle)
    pub evict: Vec<ConnId>,
    /// The union of known node ids changed
    pub node_set_changed: bool,
    /// The advertising connection's node id became known just now
    pub learned_peer: Option<NodeId>,
}

/// Build the sync package this node sends to one peer
pub fn build_sync(
    table: &RoutingTable,
    for_conn: ConnId,
    dest: NodeId,
    reply: bool,
) -> Package {
    let body = NodeSyncPackage {
        from: table.self_id(),
        dest,
        routing: Routing::Neighbour,
        tree: table.advertise_tree(Some(for_conn)),
    };
    if reply {
        Package::NodeSyncReply(body)
    } else {
        Package::NodeSyncRequest(body)
    }
}

/// Apply the tree a peer advertised on `conn`
pub fn apply_tree(
    table: &mut RoutingTable,
    conns: &mut ConnectionSet,
    conn: ConnId,
    advertised: &WireTree,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let peer_id = advertised.node_id;

    if !peer_id.is_valid() {
        warn!(%conn, "peer advertised the zero node id");
        outcome.evict.push(conn);
        return outcome;
    }

    let before = table.node_list(false);

    // Pin the peer's identity; a changed id means a misbehaving peer.
    let learned = match conns.get_mut(conn) {
        Some(c) => {
            let was_unknown = c.node_id().is_none();
            if !c.set_node_id(peer_id) {
                warn!(%conn, %peer_id, "peer changed its node id, dropping");
                outcome.evict.push(conn);
                return outcome;
            }
            was_unknown
        }
        None => return outcome,
    };
    if learned {
        outcome.learned_peer = Some(peer_id);
    }

    let tree = SubTree::from_wire(advertised);
    if tree.contains(table.self_id()) {
        warn!(%conn, "advertised tree contains our own id, dropping peer");
        outcome.evict.push(conn);
        table.remove_conn(conn);
        outcome.node_set_changed = table.node_list(false) != before;
        return outcome;
    }

    // Duplicate ids across connections: the older attachment loses.
    let conn_attached = conns.get(conn).map(|c| c.attached_at_us()).unwrap_or(0);
    for (other, dup_id) in table.conflicts_with(conn, &tree) {
        let other_attached = conns
            .get(other)
            .map(|c| c.attached_at_us())
            .unwrap_or(u64::MAX);
        if other_attached <= conn_attached {
            info!(node = %dup_id, dropped = %other, kept = %conn, "duplicate node id, dropping older connection");
            if !outcome.evict.contains(&other) {
                outcome.evict.push(other);
            }
        } else {
            info!(node = %dup_id, dropped = %conn, kept = %other, "duplicate node id, dropping older connection");
            outcome.evict.push(conn);
            table.remove_conn(conn);
            outcome.node_set_changed = table.node_list(false) != before;
            return outcome;
        }
    }
    for evicted in &outcome.evict {
        table.remove_conn(*evicted);
    }

    if table.set_subtree(conn, tree).is_err() {
        outcome.evict.push(conn);
        table.remove_conn(conn);
    } else {
        outcome.accepted = true;
    }
    outcome.node_set_changed = table.node_list(false) != before;
    outcome
}
