//! Node configuration

use std::time::Duration;

use canopy_bridge::{ElectionConfig, GatewayServerConfig, SelectionStrategy};
use canopy_transport::ConnectionConfig;

use crate::station::StationConfig;

/// Default mesh TCP port
pub const DEFAULT_MESH_PORT: u16 = 5555;

/// Credentials for the external router, required for bridge roles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterCredentials {
    pub ssid: String,
    pub password: String,
}

/// Complete configuration of one mesh node
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Mesh network name; all members share it
    pub ssid: String,
    pub password: String,
    /// TCP port peers connect to
    pub port: u16,
    /// WiFi channel; 0 means auto-detect by scanning for the mesh
    pub channel: u8,
    /// Channel adopted when auto-detect finds no mesh
    pub fallback_channel: u8,
    pub hidden: bool,
    /// Soft AP client limit
    pub max_conn: u8,
    /// Router credentials, enabling bridge election on this node
    pub router: Option<RouterCredentials>,
    /// Advertised bridge priority (1-10) when this node bridges
    pub bridge_priority: u8,
    /// Free heap hint advertised in elections, provided by the platform
    pub free_memory_hint: u32,

    pub connection: ConnectionConfig,
    pub station: StationConfig,
    pub election: ElectionConfig,
    pub gateway_server: GatewayServerConfig,
    pub selection_strategy: SelectionStrategy,

    /// Period of the sub-tree exchange
    pub node_sync_period: Duration,
    /// Period of the clock exchange
    pub time_sync_period: Duration,
    /// Period of the housekeeping pass (idle links, registry expiry,
    /// internet transitions)
    pub watchdog_period: Duration,
    /// Period of the bridge status beacon
    pub bridge_status_interval: Duration,
    /// Period of the multi-bridge coordination beacon
    pub coordination_interval: Duration,
    /// Lifetime of a bridge registry entry without beacons
    pub bridge_timeout: Duration,
    /// Period of the gateway deadline sweeper
    pub gateway_sweep_period: Duration,
    /// Offline queue capacity
    pub max_queue_size: usize,
    /// Gap between sends while flushing the offline queue
    pub queue_flush_gap: Duration,
}

impl MeshConfig {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            port: DEFAULT_MESH_PORT,
            channel: 0,
            fallback_channel: 1,
            hidden: false,
            max_conn: 10,
            router: None,
            bridge_priority: 5,
            free_memory_hint: 50_000,
            connection: ConnectionConfig::default(),
            station: StationConfig::default(),
            election: ElectionConfig::default(),
            gateway_server: GatewayServerConfig::default(),
            selection_strategy: SelectionStrategy::default(),
            node_sync_period: Duration::from_secs(10),
            time_sync_period: Duration::from_secs(30),
            watchdog_period: Duration::from_secs(1),
            bridge_status_interval: Duration::from_secs(30),
            coordination_interval: Duration::from_secs(30),
            bridge_timeout: Duration::from_secs(90),
            gateway_sweep_period: Duration::from_secs(5),
            max_queue_size: 50,
            queue_flush_gap: Duration::from_millis(200),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_router(mut self, ssid: impl Into<String>, password: impl Into<String>) -> Self {
        self.router = Some(RouterCredentials {
            ssid: ssid.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_bridge_priority(mut self, priority: u8) -> Self {
        self.bridge_priority = priority.clamp(1, 10);
        self
    }

    pub fn with_selection_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.selection_strategy = strategy;
        self
    }
}
