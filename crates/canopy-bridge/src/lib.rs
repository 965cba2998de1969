//! # Canopy Bridge
//!
//! Everything a mesh needs to reach the Internet through one of its own
//! nodes:
//!
//! - [`BridgeRegistry`]: who is currently bridging, learned from status
//!   and coordination beacons, with expiry
//! - [`Election`]: RSSI-weighted campaign for the bridge role when none
//!   is healthy
//! - [`BridgeSelector`]: which bridge a sender routes internet traffic
//!   through (priority / round-robin / best-signal / manual pin)
//! - [`GatewaySender`] / [`serve_gateway_request`]: the `send_to_internet`
//!   RPC with pre-flight checks, captive-portal detection, and retry
//!   classification
//! - [`OfflineQueue`]: bounded four-priority store-and-flush queue for
//!   messages produced while the mesh has no internet

pub mod coord;
pub mod election;
pub mod gateway;
pub mod queue;
pub mod registry;

pub use coord::*;
pub use election::*;
pub use gateway::*;
pub use queue::*;
pub use registry::*;
