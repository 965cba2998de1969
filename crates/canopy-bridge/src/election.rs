//! Bridge election
//!
//! When no healthy bridge exists, nodes with router credentials campaign
//! for the role. A campaigner broadcasts its candidacy, collects peer
//! candidacies for a randomised window, and takes over if its tuple is
//! the best seen. The tuple ordering is fixed here in one place:
//! router RSSI, then uptime, then free memory (all descending), then the
//! lower node id.

use std::cmp::Ordering;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use canopy_core::{BridgeElectionPackage, NodeId, Routing};

/// One node's standing in an election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTuple {
    pub router_rssi: i16,
    pub uptime_s: u64,
    pub free_memory: u32,
    pub node_id: NodeId,
}

impl ElectionTuple {
    pub fn from_package(pkg: &BridgeElectionPackage) -> Self {
        Self {
            router_rssi: pkg.router_rssi,
            uptime_s: pkg.uptime_s,
            free_memory: pkg.free_memory,
            node_id: pkg.from,
        }
    }

    pub fn to_package(self, timestamp_us: u64) -> BridgeElectionPackage {
        BridgeElectionPackage {
            from: self.node_id,
            routing: Routing::Broadcast,
            router_rssi: self.router_rssi,
            uptime_s: self.uptime_s,
            free_memory: self.free_memory,
            timestamp_us,
        }
    }
}

impl Ord for ElectionTuple {
    // Greater means a better candidate.
    fn cmp(&self, other: &Self) -> Ordering {
        self.router_rssi
            .cmp(&other.router_rssi)
            .then(self.uptime_s.cmp(&other.uptime_s))
            .then(self.free_memory.cmp(&other.free_memory))
            .then(other.node_id.cmp(&self.node_id))
    }
}

impl PartialOrd for ElectionTuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Campaign window bounds; the actual window is randomised between
    /// them to decorrelate simultaneous campaigners
    pub window_min: Duration,
    pub window_max: Duration,
    /// No new campaign for this long after any role change
    pub cooldown: Duration,
    /// Monitor silence before the very first campaign after boot
    pub startup_grace: Duration,
    /// How often the monitor looks for a missing bridge
    pub monitor_period: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            window_min: Duration::from_secs(1),
            window_max: Duration::from_secs(3),
            cooldown: Duration::from_secs(60),
            startup_grace: Duration::from_secs(60),
            monitor_period: Duration::from_secs(30),
        }
    }
}

impl ElectionConfig {
    /// Pick a campaign window inside the configured bounds
    pub fn random_window(&self) -> Duration {
        let (min, max) = (self.window_min.as_micros() as u64, self.window_max.as_micros() as u64);
        if max <= min {
            return self.window_min;
        }
        Duration::from_micros(rand::rng().random_range(min..=max))
    }
}

/// Where the election state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    Campaigning { deadline_us: u64 },
    Cooldown { until_us: u64 },
}

/// What the owner should do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node's tuple won: broadcast a takeover and become the bridge
    Won,
    /// A better candidate was seen; stand down
    Lost { winner: NodeId },
}

/// Campaign state machine
#[derive(Debug)]
pub struct Election {
    own: ElectionTuple,
    phase: ElectionPhase,
    best_seen: Option<ElectionTuple>,
    config: ElectionConfig,
}

impl Election {
    pub fn new(own: ElectionTuple, config: ElectionConfig) -> Self {
        Self {
            own,
            phase: ElectionPhase::Idle,
            best_seen: None,
            config,
        }
    }

    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Refresh this node's own standing (RSSI and uptime drift over time)
    pub fn update_own(&mut self, own: ElectionTuple) {
        self.own = own;
    }

    /// Whether a new campaign may start now
    pub fn can_campaign(&self, now_us: u64) -> bool {
        match self.phase {
            ElectionPhase::Idle => true,
            ElectionPhase::Campaigning { .. } => false,
            ElectionPhase::Cooldown { until_us } => now_us >= until_us,
        }
    }

    /// Enter the campaign; returns the window deadline
    ///
    /// The caller broadcasts `own.to_package(..)` and arranges a tick at
    /// the returned deadline.
    pub fn start_campaign(&mut self, now_us: u64, window: Duration) -> u64 {
        let deadline_us = now_us + window.as_micros() as u64;
        info!(node = %self.own.node_id, deadline_us, "entering bridge campaign");
        self.phase = ElectionPhase::Campaigning { deadline_us };
        self.best_seen = Some(self.own);
        deadline_us
    }

    /// Ingest a peer's candidacy
    pub fn observe(&mut self, tuple: ElectionTuple) {
        if !matches!(self.phase, ElectionPhase::Campaigning { .. }) {
            return;
        }
        debug!(candidate = %tuple.node_id, "observed election package");
        match self.best_seen {
            Some(best) if best >= tuple => {}
            _ => self.best_seen = Some(tuple),
        }
    }

    /// Evaluate the window; call on or after the campaign deadline
    pub fn evaluate(&mut self, now_us: u64) -> Option<ElectionOutcome> {
        let ElectionPhase::Campaigning { deadline_us } = self.phase else {
            return None;
        };
        if now_us < deadline_us {
            return None;
        }
        let best = self.best_seen.unwrap_or(self.own);
        self.best_seen = None;
        if best.node_id == self.own.node_id {
            // Role change is imminent; cooldown starts immediately so a
            // flapping registry cannot re-trigger a campaign.
            self.note_role_change(now_us);
            Some(ElectionOutcome::Won)
        } else {
            self.phase = ElectionPhase::Idle;
            Some(ElectionOutcome::Lost {
                winner: best.node_id,
            })
        }
    }

    /// A takeover arrived from `winner` while we were campaigning (or had
    /// just won). Split-brain rule: the lower node id yields.
    ///
    /// Returns `true` if this node must yield.
    pub fn on_takeover_heard(&mut self, winner: NodeId, now_us: u64) -> bool {
        match self.phase {
            ElectionPhase::Campaigning { .. } => {
                info!(%winner, "takeover heard mid-campaign, standing down");
                self.phase = ElectionPhase::Idle;
                self.best_seen = None;
                true
            }
            _ => {
                if self.own.node_id < winner {
                    info!(%winner, "split-brain resolved: lower id yields");
                    self.note_role_change(now_us);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a role change, arming the oscillation guard
    pub fn note_role_change(&mut self, now_us: u64) {
        self.phase = ElectionPhase::Cooldown {
            until_us: now_us + self.config.cooldown.as_micros() as u64,
        };
    }

    /// Abandon any campaign (for `stop()`)
    pub fn reset(&mut self) {
        self.phase = ElectionPhase::Idle;
        self.best_seen = None;
    }
}
