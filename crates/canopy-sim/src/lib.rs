//! # Canopy Sim
//!
//! A deterministic, single-process platform for driving whole Canopy
//! meshes in tests: a shared [`Airspace`] of access points, an in-memory
//! TCP [`SimWire`], a scripted [`SimHttp`] client, and a [`SimNet`]
//! harness that builds nodes against a hand-driven clock.
//!
//! Every double is a cheap handle over shared state, so a test keeps a
//! clone for fault injection (remove an AP, kill a node's sockets, queue
//! an HTTP response) while the node under test owns the other.
//!
//! Passphrases are not modelled: association succeeds whenever the AP is
//! visible. Scans likewise return every visible AP regardless of channel;
//! channel policy is covered by the station unit tests.

pub mod airspace;
pub mod harness;
pub mod http;
pub mod radio;
pub mod wire;

pub use airspace::*;
pub use harness::*;
pub use http::*;
pub use radio::*;
pub use wire::*;
