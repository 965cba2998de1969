//! Sub-tree storage
//!
//! Each connection owns the tree of node ids reachable through its peer,
//! rooted at the peer itself. The tree is stored as an arena of entries
//! with parent indices, which keeps membership checks and whole-tree
//! iteration cheap and avoids recursive ownership.

use canopy_core::{NodeId, WireTree};

#[derive(Debug, Clone, PartialEq, Eq)]
struct TreeEntry {
    id: NodeId,
    parent: Option<usize>,
    root_flag: bool,
}

/// Arena-backed rooted tree of node ids
///
/// Index 0 is always the root (the directly connected peer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTree {
    entries: Vec<TreeEntry>,
}

impl SubTree {
    /// A tree holding only the peer itself
    pub fn leaf(root: NodeId) -> Self {
        Self {
            entries: vec![TreeEntry {
                id: root,
                parent: None,
                root_flag: false,
            }],
        }
    }

    /// Build from the wire representation
    pub fn from_wire(tree: &WireTree) -> Self {
        let mut entries = Vec::new();
        Self::build(tree, None, &mut entries);
        Self { entries }
    }

    fn build(node: &WireTree, parent: Option<usize>, entries: &mut Vec<TreeEntry>) {
        let idx = entries.len();
        entries.push(TreeEntry {
            id: node.node_id,
            parent,
            root_flag: node.root,
        });
        for sub in &node.subs {
            Self::build(sub, Some(idx), entries);
        }
    }

    /// Convert back to the wire representation
    pub fn to_wire(&self) -> WireTree {
        let mut wires: Vec<WireTree> = self
            .entries
            .iter()
            .map(|e| WireTree {
                node_id: e.id,
                root: e.root_flag,
                subs: Vec::new(),
            })
            .collect();
        // Children attach to parents back-to-front, so every node's
        // sub-list is complete before it is moved into its own parent.
        for idx in (1..self.entries.len()).rev() {
            let parent = match self.entries[idx].parent {
                Some(p) => p,
                None => continue,
            };
            let wire = std::mem::replace(&mut wires[idx], WireTree::leaf(NodeId(0)));
            wires[parent].subs.insert(0, wire);
        }
        wires.swap_remove(0)
    }

    /// The directly connected peer
    pub fn root_id(&self) -> NodeId {
        self.entries[0].id
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Every id in the tree, root first
    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub fn node_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mesh root lives in this tree
    pub fn contains_root(&self) -> bool {
        self.entries.iter().any(|e| e.root_flag)
    }
}
