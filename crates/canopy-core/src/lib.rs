//! # Canopy Core
//!
//! Core types, wire protocol, and platform abstractions for the Canopy mesh.
//!
//! Canopy nodes form a tree-shaped overlay over 2.4 GHz WiFi: every node
//! runs an access point for its children and a station link to its parent,
//! and peers exchange newline-delimited JSON packages over TCP. This crate
//! provides the foundations shared by every layer of the stack:
//!
//! ## Key Types
//!
//! - [`NodeId`]: 32-bit node identity derived from the chip MAC, with the
//!   mesh subnet addressing scheme
//! - [`Package`]: the tagged wire protocol, keyed on the integer `type` field
//! - [`MeshError`] and the per-concern error enums
//!
//! ## Key Traits
//!
//! - [`Radio`], [`TcpStack`], [`HttpClient`], [`Rtc`]: platform seams; the
//!   platform delivers events through `poll_events()` inboxes consumed on
//!   the mesh task
//! - [`MonotonicClock`]: time abstraction for testability
//!
//! All mesh state lives on a single cooperative task. The [`Scheduler`]
//! provides delayed and periodic tasks driven by an explicit tick; nothing
//! in this stack spawns threads or suspends outside of it.

pub mod error;
pub mod ident;
pub mod platform;
pub mod proto;
pub mod sched;

// Re-export main types
pub use error::*;
pub use ident::*;
pub use platform::*;
pub use proto::*;
pub use sched::*;
