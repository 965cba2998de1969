//! Multi-node harness
//!
//! [`SimNet`] owns the shared clock, airspace, wire, and release gate,
//! and builds nodes whose identity is a plain u32. Tests step nodes in
//! lockstep against the hand-driven clock, so every run is reproducible.

use std::time::Duration;

use canopy_core::{ManualClock, MonotonicClock, NodeId};
use canopy_node::{MeshConfig, MeshNode};
use canopy_transport::ReleaseGate;

use crate::airspace::Airspace;
use crate::http::SimHttp;
use crate::radio::SimRadio;
use crate::wire::{SimTcp, SimWire};

/// A mesh node running on the simulation platform
pub type SimNode = MeshNode<SimRadio, SimTcp, ManualClock, SimHttp>;

/// A node with a skewed view of the shared clock
pub type SkewedNode = MeshNode<SimRadio, SimTcp, SkewClock, SimHttp>;

/// The shared clock plus a fixed skew, for time sync scenarios
#[derive(Clone)]
pub struct SkewClock {
    base: ManualClock,
    skew_us: u64,
}

impl SkewClock {
    pub fn new(base: ManualClock, skew: Duration) -> Self {
        Self {
            base,
            skew_us: skew.as_micros() as u64,
        }
    }
}

impl MonotonicClock for SkewClock {
    fn now_us(&self) -> u64 {
        self.base.now_us() + self.skew_us
    }
}

/// Shared simulation world
pub struct SimNet {
    pub clock: ManualClock,
    pub airspace: Airspace,
    pub wire: SimWire,
    pub gate: ReleaseGate,
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNet {
    pub fn new() -> Self {
        let clock = ManualClock::new();
        Self {
            airspace: Airspace::new(),
            wire: SimWire::new(clock.clone()),
            gate: ReleaseGate::isolated(Duration::from_millis(1000)),
            clock,
        }
    }

    /// Deterministic MAC for a node id; `NodeId::from_mac` recovers `id`
    pub fn mac_for(id: u32) -> [u8; 6] {
        let b = id.to_be_bytes();
        [0x02, 0x00, b[0], b[1], b[2], b[3]]
    }

    /// Build the platform pieces for one node
    pub fn platform(&self, id: u32) -> (SimRadio, SimTcp) {
        let radio = SimRadio::new(self.airspace.clone(), Self::mac_for(id));
        let tcp = SimTcp::new(self.wire.clone());
        tcp.add_ip(NodeId(id).ap_ip());
        (radio, tcp)
    }

    /// Build a node on the shared clock
    pub fn node(&self, id: u32, config: MeshConfig) -> SimNode {
        self.node_with_handles(id, config).0
    }

    /// Build a node and keep platform handles for fault injection
    pub fn node_with_handles(&self, id: u32, config: MeshConfig) -> (SimNode, SimRadio, SimTcp) {
        let (radio, tcp) = self.platform(id);
        let node = MeshNode::new(config, radio.clone(), tcp.clone(), self.clock.clone())
            .with_release_gate(self.gate.clone());
        (node, radio, tcp)
    }

    /// Build a node whose clock runs ahead of the shared one
    pub fn node_with_skew(&self, id: u32, config: MeshConfig, skew: Duration) -> SkewedNode {
        let (radio, tcp) = self.platform(id);
        MeshNode::new(config, radio, tcp, SkewClock::new(self.clock.clone(), skew))
            .with_release_gate(self.gate.clone())
    }

    /// Step a set of nodes in lockstep for `duration`
    pub fn run(&self, nodes: &mut [&mut SimNode], duration: Duration, step: Duration) {
        let steps = (duration.as_micros() / step.as_micros().max(1)) as u64;
        for _ in 0..steps {
            for node in nodes.iter_mut() {
                node.update();
            }
            self.clock.advance(step);
        }
    }
}
