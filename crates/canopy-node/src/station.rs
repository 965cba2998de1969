//! Station scan & join
//!
//! A non-bridge node finds its parent by scanning for the mesh SSID,
//! scoring candidates, associating to the best one, and opening a TCP
//! connection to the parent's well-known mesh address. Peers that keep
//! refusing TCP go on a time-bounded blocklist so the node tries someone
//! else instead of hammering a broken parent.
//!
//! ```text
//! Idle ──▶ Scanning ──▶ Associating ──▶ TcpConnecting ──▶ Joined
//!             ▲   ▲          │                 │
//!             │   └──────────┘ (wifi backoff)  │ (retry budget,
//!             └────────────────────────────────┘  then blocklist)
//! ```

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tracing::{debug, info, warn};

use canopy_core::{ApRecord, NodeId};

/// Station configuration
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// TCP connect attempts per parent before blocklisting it
    pub tcp_max_retries: u32,
    /// First TCP retry delay; doubles per attempt
    pub tcp_backoff_base: Duration,
    /// Upper bound on the TCP retry delay
    pub tcp_backoff_cap: Duration,
    /// How long a blocklisted parent stays off-limits
    pub block_duration: Duration,
    /// Pause after a failed association before the next scan
    pub wifi_backoff: Duration,
    /// Pause between scans while nothing is found
    pub rescan_interval: Duration,
    /// Consecutive empty scans before an isolated node with router
    /// credentials promotes itself to bridge
    pub isolated_scan_threshold: u32,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            tcp_max_retries: 5,
            tcp_backoff_base: Duration::from_secs(1),
            tcp_backoff_cap: Duration::from_secs(8),
            block_duration: Duration::from_secs(60),
            wifi_backoff: Duration::from_secs(5),
            rescan_interval: Duration::from_secs(10),
            isolated_scan_threshold: 6,
        }
    }
}

/// TCP-failure blocklist: node id to block-until timestamp
#[derive(Debug, Default)]
pub struct Blocklist {
    entries: HashMap<NodeId, u64>,
}

impl Blocklist {
    pub fn insert(&mut self, node: NodeId, now_us: u64, duration: Duration) {
        let until = now_us + duration.as_micros() as u64;
        info!(%node, until, "peer blocklisted after TCP failures");
        self.entries.insert(node, until);
    }

    pub fn is_blocked(&self, node: NodeId, now_us: u64) -> bool {
        self.entries.get(&node).is_some_and(|until| *until > now_us)
    }

    /// Lazily drop expired entries; called at scan time
    pub fn cleanup(&mut self, now_us: u64) {
        self.entries.retain(|_, until| *until > now_us);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Exponential TCP retry delay: `base * 2^(attempt-1)`, capped
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}

/// Where the join state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StationPhase {
    #[default]
    Idle,
    Scanning,
    Associating,
    WifiBackoff,
    TcpConnecting,
    Joined,
}

/// What the node should do next on behalf of the station
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationAction {
    None,
    /// Kick off a radio scan
    StartScan { all_channels: bool },
    /// Scan again after a pause
    Rescan { delay: Duration },
    /// Associate to the chosen parent AP
    Associate { record: ApRecord },
    /// Open the mesh TCP connection to the parent
    Connect { ip: Ipv4Addr, port: u16 },
    /// Try the TCP connect again after a backoff
    RetryConnect { delay: Duration },
    /// No mesh anywhere and we hold router credentials
    PromoteIsolatedBridge,
}

/// Scan-and-join state machine
#[derive(Debug)]
pub struct Station {
    config: StationConfig,
    phase: StationPhase,
    blocklist: Blocklist,
    /// Fixed channel, or 0 while auto-detecting
    channel: u8,
    auto_channel: bool,
    empty_scans: u32,
    attempt: u32,
    target: Option<ApRecord>,
}

impl Station {
    pub fn new(config: StationConfig, configured_channel: u8) -> Self {
        Self {
            config,
            phase: StationPhase::Idle,
            blocklist: Blocklist::default(),
            channel: configured_channel,
            auto_channel: configured_channel == 0,
            empty_scans: 0,
            attempt: 0,
            target: None,
        }
    }

    pub fn phase(&self) -> StationPhase {
        self.phase
    }

    /// The channel in use: configured, or adopted from the mesh found
    /// during auto-detection (0 while still unknown)
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    pub fn target(&self) -> Option<&ApRecord> {
        self.target.as_ref()
    }

    /// Begin (or restart) the join process
    pub fn begin(&mut self) -> StationAction {
        self.phase = StationPhase::Scanning;
        self.attempt = 0;
        self.target = None;
        StationAction::StartScan {
            all_channels: self.auto_channel && self.channel == 0,
        }
    }

    /// Process scan results
    ///
    /// `in_mesh` reports whether a node id is already reachable through
    /// our routing table (joining it would close a cycle).
    pub fn on_scan_results(
        &mut self,
        aps: &[ApRecord],
        mesh_ssid: &str,
        has_router_credentials: bool,
        now_us: u64,
        in_mesh: impl Fn(NodeId) -> bool,
    ) -> StationAction {
        if self.phase != StationPhase::Scanning {
            return StationAction::None;
        }
        self.blocklist.cleanup(now_us);

        let best = aps
            .iter()
            .filter(|ap| ap.ssid == mesh_ssid)
            .filter(|ap| !self.blocklist.is_blocked(ap.node_id(), now_us))
            .filter(|ap| !in_mesh(ap.node_id()))
            .max_by_key(|ap| (ap.rssi, std::cmp::Reverse(ap.node_id())));

        match best {
            Some(record) => {
                self.empty_scans = 0;
                if self.auto_channel {
                    self.channel = record.channel;
                    debug!(channel = record.channel, "adopted mesh channel");
                }
                info!(parent = %record, "selected mesh parent");
                self.phase = StationPhase::Associating;
                self.target = Some(record.clone());
                StationAction::Associate {
                    record: record.clone(),
                }
            }
            None => {
                self.empty_scans += 1;
                if has_router_credentials && self.empty_scans >= self.config.isolated_scan_threshold
                {
                    info!(
                        empty_scans = self.empty_scans,
                        "no mesh found, promoting isolated bridge"
                    );
                    self.empty_scans = 0;
                    self.phase = StationPhase::Idle;
                    return StationAction::PromoteIsolatedBridge;
                }
                StationAction::Rescan {
                    delay: self.config.rescan_interval,
                }
            }
        }
    }

    /// Consecutive scans that found no joinable mesh AP
    pub fn empty_scans(&self) -> u32 {
        self.empty_scans
    }

    /// The station interface associated to the chosen parent
    pub fn on_associated(&mut self, mesh_port: u16) -> StationAction {
        let Some(target) = &self.target else {
            return StationAction::None;
        };
        self.phase = StationPhase::TcpConnecting;
        self.attempt = 1;
        StationAction::Connect {
            ip: target.node_id().ap_ip(),
            port: mesh_port,
        }
    }

    /// Association failed or dropped before the TCP join finished
    pub fn on_associate_failed(&mut self) -> StationAction {
        warn!(candidate = ?self.target, "association failed, backing off");
        self.phase = StationPhase::WifiBackoff;
        self.target = None;
        StationAction::Rescan {
            delay: self.config.wifi_backoff,
        }
    }

    /// A scheduled (re)scan kick is due
    pub fn on_backoff_elapsed(&mut self) -> StationAction {
        match self.phase {
            StationPhase::Idle | StationPhase::WifiBackoff | StationPhase::Scanning => self.begin(),
            _ => StationAction::None,
        }
    }

    /// The mesh TCP connection is up
    pub fn on_tcp_connected(&mut self) {
        info!(parent = ?self.target.as_ref().map(ApRecord::node_id), "joined mesh");
        self.phase = StationPhase::Joined;
        self.attempt = 0;
    }

    /// A TCP connect attempt failed
    ///
    /// Within budget the connect is retried with exponential backoff (the
    /// delay is a scheduler delay, so even zero would not run inline).
    /// After the budget the parent is blocklisted and scanning restarts.
    pub fn on_tcp_failed(&mut self, now_us: u64) -> StationAction {
        if self.phase != StationPhase::TcpConnecting {
            return StationAction::None;
        }
        if self.attempt < self.config.tcp_max_retries {
            let delay = backoff_delay(
                self.attempt,
                self.config.tcp_backoff_base,
                self.config.tcp_backoff_cap,
            );
            self.attempt += 1;
            debug!(attempt = self.attempt, ?delay, "TCP connect retry");
            return StationAction::RetryConnect { delay };
        }
        if let Some(target) = self.target.take() {
            self.blocklist
                .insert(target.node_id(), now_us, self.config.block_duration);
        }
        self.begin()
    }

    /// The scheduled TCP retry is due
    pub fn on_retry_due(&mut self, mesh_port: u16) -> StationAction {
        let Some(target) = &self.target else {
            return StationAction::None;
        };
        if self.phase != StationPhase::TcpConnecting {
            return StationAction::None;
        }
        StationAction::Connect {
            ip: target.node_id().ap_ip(),
            port: mesh_port,
        }
    }

    /// The established uplink died; rejoin from scratch
    pub fn on_link_lost(&mut self) -> StationAction {
        if self.phase != StationPhase::Joined {
            return StationAction::None;
        }
        warn!("uplink lost, rescanning");
        self.begin()
    }

    /// Abandon everything (for `stop()`)
    pub fn reset(&mut self) {
        self.phase = StationPhase::Idle;
        self.target = None;
        self.attempt = 0;
        self.empty_scans = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ap(id: u32, rssi: i16, channel: u8) -> ApRecord {
        ApRecord {
            ssid: "canopy".into(),
            bssid: [0, 0, (id >> 24) as u8, (id >> 16) as u8, (id >> 8) as u8, id as u8],
            channel,
            rssi,
        }
    }

    fn station() -> Station {
        Station::new(StationConfig::default(), 0)
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(8);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(4, base, cap), Duration::from_secs(8));
        assert_eq!(backoff_delay(10, base, cap), Duration::from_secs(8));
    }

    #[test]
    fn test_begin_scans_all_channels_when_auto() {
        let mut s = station();
        assert_eq!(s.begin(), StationAction::StartScan { all_channels: true });

        let mut fixed = Station::new(StationConfig::default(), 6);
        assert_eq!(
            fixed.begin(),
            StationAction::StartScan {
                all_channels: false
            }
        );
    }

    #[test]
    fn test_scan_picks_best_rssi_then_lowest_id() {
        let mut s = station();
        s.begin();
        let aps = [ap(30, -70, 1), ap(20, -50, 6), ap(10, -50, 6)];
        let action = s.on_scan_results(&aps, "canopy", false, 0, |_| false);
        match action {
            StationAction::Associate { record } => {
                assert_eq!(record.node_id(), NodeId(10));
            }
            other => panic!("expected associate, got {other:?}"),
        }
        // Auto-channel adopted from the winner.
        assert_eq!(s.channel(), 6);
        assert_eq!(s.phase(), StationPhase::Associating);
    }

    #[test]
    fn test_scan_filters_ssid_blocklist_and_own_subtree() {
        let mut s = station();
        s.begin();
        s.blocklist
            .insert(NodeId(20), 0, Duration::from_secs(60));

        let mut other_ssid = ap(40, -40, 1);
        other_ssid.ssid = "not-canopy".into();
        let aps = [other_ssid, ap(20, -45, 1), ap(30, -50, 1)];

        // Node 30 is already in our sub-tree.
        let action = s.on_scan_results(&aps, "canopy", false, 0, |id| id == NodeId(30));
        assert!(matches!(action, StationAction::Rescan { .. }));
        assert_eq!(s.empty_scans(), 1);

        // Once the blocklist entry expires, node 20 is eligible again.
        let later = 61_000_000;
        s.begin();
        let action = s.on_scan_results(&aps, "canopy", false, later, |id| id == NodeId(30));
        assert!(matches!(action, StationAction::Associate { .. }));
        assert!(s.blocklist().is_empty());
    }

    #[test]
    fn test_tcp_retry_budget_then_blocklist() {
        let mut s = station();
        s.begin();
        s.on_scan_results(&[ap(10, -50, 6)], "canopy", false, 0, |_| false);
        let action = s.on_associated(5555);
        assert_eq!(
            action,
            StationAction::Connect {
                ip: NodeId(10).ap_ip(),
                port: 5555
            }
        );

        // Attempts 1..5 retry with doubling backoff.
        let mut delays = Vec::new();
        for _ in 0..4 {
            match s.on_tcp_failed(0) {
                StationAction::RetryConnect { delay } => delays.push(delay.as_secs()),
                other => panic!("expected retry, got {other:?}"),
            }
            assert!(matches!(s.on_retry_due(5555), StationAction::Connect { .. }));
        }
        assert_eq!(delays, vec![1, 2, 4, 8]);

        // Budget exhausted: blocklist and rescan.
        let action = s.on_tcp_failed(1_000);
        assert!(matches!(action, StationAction::StartScan { .. }));
        assert!(s.blocklist().is_blocked(NodeId(10), 1_000));
        assert_eq!(s.phase(), StationPhase::Scanning);
    }

    #[test]
    fn test_isolated_bridge_promotion_needs_credentials() {
        let mut s = station();
        s.begin();
        for i in 0..6 {
            let action = s.on_scan_results(&[], "canopy", false, i, |_| false);
            assert!(matches!(action, StationAction::Rescan { .. }));
        }
        assert_eq!(s.empty_scans(), 6);

        // With credentials, the threshold triggers promotion.
        let mut s = station();
        s.begin();
        for i in 0..5 {
            s.on_scan_results(&[], "canopy", true, i, |_| false);
        }
        let action = s.on_scan_results(&[], "canopy", true, 5, |_| false);
        assert_eq!(action, StationAction::PromoteIsolatedBridge);
    }

    #[test]
    fn test_join_and_link_loss_cycle() {
        let mut s = station();
        s.begin();
        s.on_scan_results(&[ap(10, -50, 6)], "canopy", false, 0, |_| false);
        s.on_associated(5555);
        s.on_tcp_connected();
        assert_eq!(s.phase(), StationPhase::Joined);

        let action = s.on_link_lost();
        assert!(matches!(action, StationAction::StartScan { .. }));
        // Channel stays adopted across rejoins.
        assert_eq!(s.channel(), 6);
    }

    #[test]
    fn test_associate_failure_backs_off() {
        let mut s = station();
        s.begin();
        s.on_scan_results(&[ap(10, -50, 6)], "canopy", false, 0, |_| false);
        let action = s.on_associate_failed();
        assert_eq!(
            action,
            StationAction::Rescan {
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(s.phase(), StationPhase::WifiBackoff);
        assert!(matches!(
            s.on_backoff_elapsed(),
            StationAction::StartScan { .. }
        ));
    }
}
