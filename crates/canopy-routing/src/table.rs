//! Routing table
//!
//! The forest of per-connection sub-trees plus the local node id. All
//! forwarding decisions reduce to "which connection's sub-tree holds the
//! destination"; the absence of cycles is structural (a tree overlay and
//! never-back-to-arrival forwarding), so no TTL is carried on the wire.

use tracing::debug;

use canopy_core::{ConnId, NodeId, RoutingError, WireTree};

use crate::tree::SubTree;

/// Routing state for the whole node
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    is_root: bool,
    entries: Vec<(ConnId, SubTree)>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            is_root: false,
            entries: Vec::new(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Mark this node as the mesh root
    pub fn set_root(&mut self, is_root: bool) {
        self.is_root = is_root;
    }

    /// Install or replace the sub-tree advertised by a connection
    ///
    /// Rejects a tree containing our own id: the peer would be describing
    /// a cycle through us.
    pub fn set_subtree(&mut self, conn: ConnId, tree: SubTree) -> Result<(), RoutingError> {
        if tree.contains(self.self_id) {
            return Err(RoutingError::SelfInSubTree(self.self_id));
        }
        match self.entries.iter_mut().find(|(id, _)| *id == conn) {
            Some((_, existing)) => *existing = tree,
            None => self.entries.push((conn, tree)),
        }
        Ok(())
    }

    /// Drop a connection's sub-tree
    pub fn remove_conn(&mut self, conn: ConnId) {
        self.entries.retain(|(id, _)| *id != conn);
    }

    pub fn subtree(&self, conn: ConnId) -> Option<&SubTree> {
        self.entries
            .iter()
            .find(|(id, _)| *id == conn)
            .map(|(_, t)| t)
    }

    /// The connection through which `dest` is reachable
    pub fn next_hop(&self, dest: NodeId) -> Option<ConnId> {
        self.entries
            .iter()
            .find(|(_, tree)| tree.contains(dest))
            .map(|(conn, _)| *conn)
    }

    /// Whether `node` is known anywhere in the mesh
    pub fn contains(&self, node: NodeId) -> bool {
        node == self.self_id || self.next_hop(node).is_some()
    }

    /// Every known node id, sorted
    pub fn node_list(&self, include_self: bool) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .entries
            .iter()
            .flat_map(|(_, tree)| tree.ids())
            .collect();
        if include_self {
            out.push(self.self_id);
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Number of directly connected peers with known sub-trees
    pub fn peer_count(&self) -> usize {
        self.entries.len()
    }

    /// Ids that `tree` shares with sub-trees of connections other than
    /// `conn` — each one is a duplicate-id conflict
    pub fn conflicts_with(&self, conn: ConnId, tree: &SubTree) -> Vec<(ConnId, NodeId)> {
        let mut conflicts = Vec::new();
        for (other, other_tree) in &self.entries {
            if *other == conn {
                continue;
            }
            for id in tree.ids() {
                if other_tree.contains(id) {
                    debug!(%conn, %other, node = %id, "duplicate node id across connections");
                    conflicts.push((*other, id));
                }
            }
        }
        conflicts
    }

    /// Whether the mesh root is reachable through `conn`
    pub fn conn_contains_root(&self, conn: ConnId) -> bool {
        self.subtree(conn).is_some_and(SubTree::contains_root)
    }

    /// Whether any peer advertises the mesh root
    pub fn sees_root(&self) -> bool {
        self.is_root || self.entries.iter().any(|(_, t)| t.contains_root())
    }

    /// The tree this node advertises to `exclude`'s peer: ourselves as
    /// root plus every other connection's sub-tree as a branch
    pub fn advertise_tree(&self, exclude: Option<ConnId>) -> WireTree {
        WireTree {
            node_id: self.self_id,
            root: self.is_root,
            subs: self
                .entries
                .iter()
                .filter(|(conn, _)| Some(*conn) != exclude)
                .map(|(_, tree)| tree.to_wire())
                .collect(),
        }
    }

    /// Clear every entry (for `stop()`)
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::WireTree;

    fn table_with_two_peers() -> RoutingTable {
        let mut table = RoutingTable::new(NodeId(1));
        table
            .set_subtree(
                ConnId(10),
                SubTree::from_wire(&WireTree {
                    node_id: NodeId(2),
                    root: false,
                    subs: vec![WireTree::leaf(NodeId(4))],
                }),
            )
            .unwrap();
        table
            .set_subtree(ConnId(11), SubTree::leaf(NodeId(3)))
            .unwrap();
        table
    }

    #[test]
    fn test_next_hop() {
        let table = table_with_two_peers();
        assert_eq!(table.next_hop(NodeId(2)), Some(ConnId(10)));
        assert_eq!(table.next_hop(NodeId(4)), Some(ConnId(10)));
        assert_eq!(table.next_hop(NodeId(3)), Some(ConnId(11)));
        assert_eq!(table.next_hop(NodeId(99)), None);
    }

    #[test]
    fn test_node_list_union() {
        let table = table_with_two_peers();
        assert_eq!(
            table.node_list(true),
            vec![NodeId(1), NodeId(2), NodeId(3), NodeId(4)]
        );
        assert_eq!(
            table.node_list(false),
            vec![NodeId(2), NodeId(3), NodeId(4)]
        );
    }

    #[test]
    fn test_rejects_self_in_subtree() {
        let mut table = table_with_two_peers();
        let cyclic = SubTree::from_wire(&WireTree {
            node_id: NodeId(5),
            root: false,
            subs: vec![WireTree::leaf(NodeId(1))],
        });
        assert!(matches!(
            table.set_subtree(ConnId(12), cyclic),
            Err(RoutingError::SelfInSubTree(_))
        ));
    }

    #[test]
    fn test_conflicts_with() {
        let table = table_with_two_peers();
        let dup = SubTree::from_wire(&WireTree {
            node_id: NodeId(7),
            root: false,
            subs: vec![WireTree::leaf(NodeId(4))],
        });
        let conflicts = table.conflicts_with(ConnId(12), &dup);
        assert_eq!(conflicts, vec![(ConnId(10), NodeId(4))]);

        // A replacement tree for the same connection never conflicts
        // with itself.
        assert!(table.conflicts_with(ConnId(10), &dup.clone()).is_empty());
    }

    #[test]
    fn test_advertise_tree_excludes_target_branch() {
        let table = table_with_two_peers();
        let adv = table.advertise_tree(Some(ConnId(10)));
        assert_eq!(adv.node_id, NodeId(1));
        assert_eq!(adv.subs.len(), 1);
        assert_eq!(adv.subs[0].node_id, NodeId(3));

        let full = table.advertise_tree(None);
        assert_eq!(full.subs.len(), 2);
    }

    #[test]
    fn test_root_flags() {
        let mut table = table_with_two_peers();
        assert!(!table.sees_root());
        table.set_root(true);
        assert!(table.sees_root());
        assert!(table.advertise_tree(None).root);

        table.set_root(false);
        table
            .set_subtree(
                ConnId(11),
                SubTree::from_wire(&WireTree {
                    node_id: NodeId(3),
                    root: true,
                    subs: vec![],
                }),
            )
            .unwrap();
        assert!(table.sees_root());
        assert!(table.conn_contains_root(ConnId(11)));
        assert!(!table.conn_contains_root(ConnId(10)));
    }

    #[test]
    fn test_replace_subtree() {
        let mut table = table_with_two_peers();
        table
            .set_subtree(ConnId(10), SubTree::leaf(NodeId(2)))
            .unwrap();
        assert_eq!(table.next_hop(NodeId(4)), None);
        assert_eq!(table.peer_count(), 2);
    }

    #[test]
    fn test_remove_conn() {
        let mut table = table_with_two_peers();
        table.remove_conn(ConnId(10));
        assert_eq!(table.node_list(false), vec![NodeId(3)]);
    }
}
