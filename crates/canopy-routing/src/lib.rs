//! # Canopy Routing
//!
//! The routing layer of the Canopy mesh. The mesh overlay is a tree, so
//! the routing table is a forest: every live connection owns the sub-tree
//! of node ids reachable through it, and the union of sub-trees plus the
//! local id is the whole mesh.
//!
//! - [`SubTree`]: arena-backed rooted tree owned by one connection
//! - [`RoutingTable`]: the forest, next-hop lookup, node-list union
//! - [`Router`]: unicast and broadcast forwarding with duplicate
//!   suppression
//! - [`sync`]: the NodeSyncRequest/Reply engine that keeps the forest
//!   consistent and resolves duplicate node ids

pub mod router;
pub mod sync;
pub mod table;
pub mod tree;

pub use router::*;
pub use sync::*;
pub use table::*;
pub use tree::*;
