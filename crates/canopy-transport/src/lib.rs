//! # Canopy Transport
//!
//! Turns a raw platform socket into a bi-directional stream of framed
//! JSON messages, and owns the lifetime of each peer socket.
//!
//! - [`FrameBuffer`]: newline-delimited framing with an oversize guard
//! - [`BufferedConnection`]: one peer link — ingress framer, prioritised
//!   egress queue with back-pressure, single outstanding write, idle
//!   bookkeeping
//! - [`ConnectionSet`]: the mesh's live connections
//! - [`ReleaseGate`]: spacing-enforced deferred close-then-free of socket
//!   handles

pub mod connection;
pub mod framing;
pub mod release;

pub use connection::*;
pub use framing::*;
pub use release::*;
