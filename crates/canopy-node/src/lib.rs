//! # Canopy Node
//!
//! The mesh façade: [`MeshNode`] ties the transport, routing, time sync,
//! station join, and bridge subsystems together behind the public API.
//!
//! A node is generic over its platform ([`Radio`], [`TcpStack`],
//! [`MonotonicClock`], [`HttpClient`]), so the same mesh logic runs on an
//! embedded target, a desktop shim, or the deterministic simulation used
//! by the test suite.
//!
//! Everything happens on one cooperative task: the owner calls
//! [`MeshNode::update`] from its main loop, which drains platform events,
//! runs due scheduler tasks, pumps connection writes, and processes
//! deferred socket releases. User callbacks receive a [`CallbackContext`]
//! and can never re-enter mesh state.
//!
//! ```rust,ignore
//! let mut mesh = MeshNode::new(MeshConfig::new("canopy", "secret"), radio, tcp, clock);
//! mesh.init()?;
//! mesh.on_receive(|_ctx, from, msg| println!("{from}: {msg}"));
//! loop {
//!     mesh.update();
//!     platform_idle();
//! }
//! ```

mod config;
mod handler;
mod station;
mod timesync;

pub use config::*;
pub use handler::*;
pub use station::*;
pub use timesync::*;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, trace, warn};

use canopy_bridge::{
    BridgeInfo, BridgeRegistry, BridgeSelector, Election, ElectionOutcome, ElectionTuple,
    GatewayCallback, GatewaySender, OfflineQueue, Priority, RequestOptions,
    serve_gateway_request,
};
use canopy_core::{
    BridgeCoordinationPackage, BridgeRole, BridgeStatusPackage, BridgeTakeoverPackage, ConnId,
    GatewayAckPackage, GatewayDataPackage, GatewayError, HttpClient, HttpResponse, MeshError,
    MonotonicClock, NodeId, NodeSyncPackage, NtpTimeSyncPackage, Package, Radio, RadioEvent,
    Routing, Rtc, Scheduler, TaskHandle, TcpEvent, TcpStack, TimeStamps, TimeSyncPackage,
};
use canopy_routing::{Router, RoutingTable, UnicastOutcome, apply_tree, build_sync};
use canopy_transport::{
    BufferedConnection, ConnectionSet, Direction, ReleaseGate, ReleaseQueue,
};

/// Connection id used for locally delivered (loopback) packages
pub const LOCAL_CONN: ConnId = ConnId(0);

/// Operating mode selected at init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MeshMode {
    /// Regular mesh member
    #[default]
    Node,
    /// Mesh member with an uplink to the external router
    Bridge,
    /// Every node is also associated to the router and may serve egress
    SharedGateway,
}

/// Node-level counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshStats {
    pub packages_in: u64,
    pub packages_forwarded: u64,
    pub frames_dropped: u64,
    pub duplicates_suppressed: u64,
    pub broadcasts_sent: u64,
    pub singles_sent: u64,
}

/// Placeholder HTTP client for nodes that never bridge
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHttp;

impl HttpClient for NoopHttp {
    fn get(&mut self, _url: &str, _t: Duration) -> Result<HttpResponse, GatewayError> {
        Err(GatewayError::Http("no http client configured".into()))
    }

    fn post(&mut self, _url: &str, _b: &str, _t: Duration) -> Result<HttpResponse, GatewayError> {
        Err(GatewayError::Http("no http client configured".into()))
    }
}

/// User task scheduled through [`MeshNode::add_task`]
pub struct UserTask(pub Box<dyn FnMut(&mut CallbackContext<'_>)>);

impl fmt::Debug for UserTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserTask")
    }
}

/// Internal scheduler payload
#[derive(Debug)]
enum TaskKind {
    Noop,
    Watchdog,
    NodeSync,
    TimeSync,
    StationKick,
    StationRetry,
    BridgeJoinKick,
    BridgeStatus,
    BridgeMonitor,
    ElectionWindow,
    Coordination,
    GatewaySweep,
    GatewayRetry,
    QueueFlushStep,
    Loopback(Package),
    User(UserTask),
}

/// Registered user callbacks
#[derive(Default)]
struct Callbacks {
    on_receive: Option<Box<dyn FnMut(&mut CallbackContext<'_>, NodeId, &Value)>>,
    on_new_connection: Option<Box<dyn FnMut(&mut CallbackContext<'_>, NodeId)>>,
    on_dropped_connection: Option<Box<dyn FnMut(&mut CallbackContext<'_>, NodeId)>>,
    on_changed_connections: Option<Box<dyn FnMut(&mut CallbackContext<'_>)>>,
    on_node_time_adjusted: Option<Box<dyn FnMut(&mut CallbackContext<'_>, i64)>>,
    on_bridge_status_changed: Option<Box<dyn FnMut(&mut CallbackContext<'_>, &BridgeInfo)>>,
    on_bridge_role_changed: Option<Box<dyn FnMut(&mut CallbackContext<'_>, bool, &str)>>,
    on_gateway_changed: Option<Box<dyn FnMut(&mut CallbackContext<'_>, Option<NodeId>)>>,
    on_queue_full: Option<Box<dyn FnMut(&mut CallbackContext<'_>)>>,
    on_message_queued: Option<Box<dyn FnMut(&mut CallbackContext<'_>)>>,
    on_queue_flushed: Option<Box<dyn FnMut(&mut CallbackContext<'_>)>>,
}

/// Run one user callback with panic isolation and batched sends
macro_rules! fire {
    ($self:ident, $cb:ident, |$ctx:ident, $f:ident| $call:expr) => {{
        if let Some(mut cb) = $self.callbacks.$cb.take() {
            let mut outbox = Vec::new();
            let now_us = $self.clock.now_us();
            let mesh_time = $self.time.mesh_time_us(now_us);
            {
                let mut $ctx = CallbackContext::new($self.node_id, mesh_time, &mut outbox);
                let $f = &mut cb;
                let result = catch_unwind(AssertUnwindSafe(|| $call));
                if result.is_err() {
                    warn!(callback = stringify!($cb), "user callback panicked");
                }
            }
            $self.callbacks.$cb = Some(cb);
            $self.apply_outbox(outbox);
        }
    }};
}

/// One Canopy mesh node
pub struct MeshNode<R, T, C, H = NoopHttp>
where
    R: Radio,
    T: TcpStack,
    C: MonotonicClock,
    H: HttpClient,
{
    config: MeshConfig,
    radio: R,
    tcp: T,
    clock: C,
    http: Option<H>,
    rtc: Option<Box<dyn Rtc>>,

    node_id: NodeId,
    started: bool,
    started_at_us: u64,
    mode: MeshMode,
    is_bridge: bool,
    bridge_up: bool,
    bridge_role: BridgeRole,
    /// Why the pending bridge promotion happened; reported once up
    pending_role_reason: Option<String>,
    ap_channel: u8,
    ap_started: bool,
    last_router_rssi: i16,
    router_visible: bool,
    election_scan_pending: bool,
    bridge_task_handles: Vec<TaskHandle>,

    conns: ConnectionSet,
    table: RoutingTable,
    router: Router,
    sched: Scheduler<TaskKind>,
    time: TimeKeeper,
    station: Station,

    bridges: BridgeRegistry,
    selector: BridgeSelector,
    election: Election,
    gateway_tx: GatewaySender,
    sweeper_installed: bool,
    queue: OfflineQueue,
    had_internet: bool,
    flush_in_progress: bool,

    handlers: PackageHandler,
    callbacks: Callbacks,

    release_gate: ReleaseGate,
    releases: ReleaseQueue,

    stats: MeshStats,
}

impl<R, T, C, H> MeshNode<R, T, C, H>
where
    R: Radio,
    T: TcpStack,
    C: MonotonicClock,
    H: HttpClient,
{
    pub fn new(config: MeshConfig, radio: R, tcp: T, clock: C) -> Self {
        let node_id = NodeId::from_mac(&radio.mac());
        let election_own = ElectionTuple {
            router_rssi: i16::MIN,
            uptime_s: 0,
            free_memory: config.free_memory_hint,
            node_id,
        };
        let station = Station::new(config.station.clone(), config.channel);
        let election = Election::new(election_own, config.election.clone());
        let bridges = BridgeRegistry::new(config.bridge_timeout);
        let selector = BridgeSelector::new(config.selection_strategy);
        let queue = OfflineQueue::new(config.max_queue_size);
        Self {
            table: RoutingTable::new(node_id),
            config,
            radio,
            tcp,
            clock,
            http: None,
            rtc: None,
            node_id,
            started: false,
            started_at_us: 0,
            mode: MeshMode::Node,
            is_bridge: false,
            bridge_up: false,
            bridge_role: BridgeRole::Primary,
            pending_role_reason: None,
            ap_channel: 0,
            ap_started: false,
            last_router_rssi: i16::MIN,
            router_visible: false,
            election_scan_pending: false,
            bridge_task_handles: Vec::new(),
            conns: ConnectionSet::new(),
            router: Router::new(),
            sched: Scheduler::new(),
            time: TimeKeeper::new(),
            station,
            bridges,
            selector,
            election,
            gateway_tx: GatewaySender::new(),
            sweeper_installed: false,
            queue,
            had_internet: false,
            flush_in_progress: false,
            handlers: PackageHandler::new(),
            callbacks: Callbacks::default(),
            release_gate: ReleaseGate::process_wide(),
            releases: ReleaseQueue::new(),
            stats: MeshStats::default(),
        }
    }

    /// Attach the HTTP client used when this node serves gateway requests
    pub fn with_http(mut self, http: H) -> Self {
        self.http = Some(http);
        self
    }

    /// Attach an optional battery-backed RTC
    pub fn with_rtc(mut self, rtc: Box<dyn Rtc>) -> Self {
        self.rtc = Some(rtc);
        self
    }

    /// Use an isolated release gate (simulations and tests)
    pub fn with_release_gate(mut self, gate: ReleaseGate) -> Self {
        self.release_gate = gate;
        self
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start as a regular mesh member
    pub fn init(&mut self) -> Result<(), MeshError> {
        self.init_common(MeshMode::Node)?;
        if self.config.channel != 0 {
            self.ensure_ap(self.config.channel)?;
        }
        self.tcp.listen(self.config.port)?;
        let now = self.clock.now_us();
        self.sched.add_once(now, Duration::ZERO, TaskKind::StationKick);
        if self.config.router.is_some() {
            let grace = self.config.election.startup_grace;
            let period = self.config.election.monitor_period;
            self.sched.add(
                now,
                grace,
                period,
                canopy_core::Repeat::Forever,
                TaskKind::BridgeMonitor,
            );
        }
        info!(node = %self.node_id, "mesh node initialized");
        Ok(())
    }

    /// Start as a bridge: join the router first, adopt its channel, then
    /// serve the mesh on it
    pub fn init_as_bridge(
        &mut self,
        router_ssid: impl Into<String>,
        router_password: impl Into<String>,
        priority: Option<u8>,
    ) -> Result<(), MeshError> {
        self.config.router = Some(RouterCredentials {
            ssid: router_ssid.into(),
            password: router_password.into(),
        });
        if let Some(p) = priority {
            self.config.bridge_priority = p.clamp(1, 10);
        }
        self.init_common(MeshMode::Bridge)?;
        self.is_bridge = true;
        self.pending_role_reason
            .get_or_insert_with(|| "initialized as bridge".into());
        self.radio.request_scan(true)?;
        info!(node = %self.node_id, "bridge node initializing, scanning for router");
        Ok(())
    }

    /// Start in shared-gateway mode: join the router and the mesh on the
    /// router's channel; this node may serve egress for its peers
    pub fn init_as_shared_gateway(
        &mut self,
        router_ssid: impl Into<String>,
        router_password: impl Into<String>,
    ) -> Result<(), MeshError> {
        self.config.router = Some(RouterCredentials {
            ssid: router_ssid.into(),
            password: router_password.into(),
        });
        self.init_common(MeshMode::SharedGateway)?;
        self.radio.request_scan(true)?;
        info!(node = %self.node_id, "shared-gateway node initializing");
        Ok(())
    }

    fn init_common(&mut self, mode: MeshMode) -> Result<(), MeshError> {
        if self.started {
            return Err(MeshError::AlreadyInitialized);
        }
        let now = self.clock.now_us();
        self.started = true;
        self.started_at_us = now;
        self.mode = mode;
        self.had_internet = false;
        self.sched
            .add_periodic(now, self.config.watchdog_period, TaskKind::Watchdog);
        self.sched
            .add_periodic(now, self.config.node_sync_period, TaskKind::NodeSync);
        self.sched
            .add_periodic(now, self.config.time_sync_period, TaskKind::TimeSync);
        Ok(())
    }

    /// Detach every peer, cancel all tasks, and tear the radio down
    ///
    /// Socket frees still honour deletion spacing: keep calling
    /// [`update`](Self::update) and they drain on schedule. A later
    /// `init*` on a future tick is valid.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!(node = %self.node_id, "mesh stopping");
        // Cleared first so dropping the uplink cannot restart the join
        // machinery mid-teardown.
        self.started = false;
        let now = self.clock.now_us();
        let ids: Vec<ConnId> = self.conns.iter().map(|c| c.id()).collect();
        for id in ids {
            self.drop_connection(id, now, "mesh stopped");
        }
        self.sched.clear();
        self.bridge_task_handles.clear();
        self.table.clear();
        self.table.set_root(false);
        self.bridges.clear();
        self.gateway_tx.fail_all("Mesh stopped");
        self.election.reset();
        self.station.reset();
        self.radio.stop_ap();
        self.radio.disassociate();
        self.is_bridge = false;
        self.bridge_up = false;
        self.ap_started = false;
        self.sweeper_installed = false;
        self.flush_in_progress = false;
        self.pending_role_reason = None;
    }

    /// One cooperative tick
    pub fn update(&mut self) {
        let now = self.clock.now_us();

        let events = self.tcp.poll_events();
        for event in events {
            self.handle_tcp_event(event, now);
        }
        let events = self.radio.poll_events();
        for event in events {
            self.handle_radio_event(event, now);
        }

        let due = self.sched.poll_due(now);
        for mut entry in due {
            let payload = std::mem::replace(&mut entry.payload, TaskKind::Noop);
            entry.payload = self.run_task(payload, now);
            self.sched.requeue(entry);
        }

        self.pump_writes(now);

        for socket in self.releases.take_due(now) {
            trace!(%socket, "freeing socket");
            self.tcp.free(socket);
        }
    }

    // ------------------------------------------------------------------
    // Public sends
    // ------------------------------------------------------------------

    /// Flood a payload to every node
    ///
    /// With `include_self` the local `on_receive` fires too, on the next
    /// tick rather than inline.
    pub fn send_broadcast(&mut self, msg: Value, include_self: bool) -> bool {
        let pkg = Package::broadcast(self.node_id, msg);
        let json = match pkg.to_json() {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "broadcast serialization failed");
                return false;
            }
        };
        let sent = self.router.broadcast(&mut self.conns, &json, false, None);
        self.stats.broadcasts_sent += 1;
        if include_self {
            let now = self.clock.now_us();
            self.sched
                .add_once(now, Duration::ZERO, TaskKind::Loopback(pkg));
        }
        !sent.is_empty() || include_self
    }

    /// Send a payload to one node
    pub fn send_single(&mut self, dest: NodeId, msg: Value) -> Result<(), MeshError> {
        let pkg = Package::single(self.node_id, dest, msg);
        self.stats.singles_sent += 1;
        self.send_package(pkg)
    }

    /// Install the gateway ack sweeper; required once on sending nodes
    pub fn enable_send_to_internet(&mut self) {
        if self.sweeper_installed {
            return;
        }
        self.sweeper_installed = true;
        let now = self.clock.now_us();
        self.sched
            .add_periodic(now, self.config.gateway_sweep_period, TaskKind::GatewaySweep);
    }

    /// Ask the selected bridge to perform an HTTP request
    ///
    /// The callback fires exactly once, on success, final failure, or
    /// deadline. Returns the request's message id.
    pub fn send_to_internet(
        &mut self,
        url: impl Into<String>,
        payload: Value,
        opts: RequestOptions,
        callback: GatewayCallback,
    ) -> Result<u64, MeshError> {
        self.enable_send_to_internet();
        let now = self.clock.now_us();
        let gateway = self
            .selector
            .select(&self.bridges, now)
            .ok_or(MeshError::Gateway(GatewayError::NoBridge))?;
        let pkg = self
            .gateway_tx
            .create(now, self.node_id, gateway, url.into(), payload, opts, callback);
        let message_id = pkg.message_id;
        self.send_package(Package::GatewayData(pkg))?;
        Ok(message_id)
    }

    /// Queue an internet-bound message for delivery once the mesh has
    /// internet again; never blocks
    pub fn queue_message(&mut self, url: impl Into<String>, payload: Value, priority: Priority) -> bool {
        let now = self.clock.now_us();
        match self.queue.enqueue(url.into(), payload, priority, now) {
            Ok(_) => {
                fire!(self, on_message_queued, |ctx, f| f(&mut ctx));
                true
            }
            Err(_) => {
                fire!(self, on_queue_full, |ctx, f| f(&mut ctx));
                false
            }
        }
    }

    /// Register an application package handler for one wire type
    pub fn register_handler(&mut self, type_code: u16, handler: AppHandler) {
        self.handlers.register(type_code, handler);
    }

    /// Schedule a user task; a zero delay still waits one tick
    pub fn add_task(
        &mut self,
        delay: Duration,
        repeat: canopy_core::Repeat,
        f: impl FnMut(&mut CallbackContext<'_>) + 'static,
    ) -> TaskHandle {
        let now = self.clock.now_us();
        self.sched
            .add(now, delay, delay, repeat, TaskKind::User(UserTask(Box::new(f))))
    }

    /// Cancel a task scheduled with [`add_task`](Self::add_task)
    pub fn cancel_task(&mut self, handle: TaskHandle) {
        self.sched.cancel(handle);
    }

    // ------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------

    pub fn on_receive(&mut self, cb: impl FnMut(&mut CallbackContext<'_>, NodeId, &Value) + 'static) {
        self.callbacks.on_receive = Some(Box::new(cb));
    }

    pub fn on_new_connection(&mut self, cb: impl FnMut(&mut CallbackContext<'_>, NodeId) + 'static) {
        self.callbacks.on_new_connection = Some(Box::new(cb));
    }

    pub fn on_dropped_connection(
        &mut self,
        cb: impl FnMut(&mut CallbackContext<'_>, NodeId) + 'static,
    ) {
        self.callbacks.on_dropped_connection = Some(Box::new(cb));
    }

    pub fn on_changed_connections(&mut self, cb: impl FnMut(&mut CallbackContext<'_>) + 'static) {
        self.callbacks.on_changed_connections = Some(Box::new(cb));
    }

    pub fn on_node_time_adjusted(&mut self, cb: impl FnMut(&mut CallbackContext<'_>, i64) + 'static) {
        self.callbacks.on_node_time_adjusted = Some(Box::new(cb));
    }

    pub fn on_bridge_status_changed(
        &mut self,
        cb: impl FnMut(&mut CallbackContext<'_>, &BridgeInfo) + 'static,
    ) {
        self.callbacks.on_bridge_status_changed = Some(Box::new(cb));
    }

    pub fn on_bridge_role_changed(
        &mut self,
        cb: impl FnMut(&mut CallbackContext<'_>, bool, &str) + 'static,
    ) {
        self.callbacks.on_bridge_role_changed = Some(Box::new(cb));
    }

    pub fn on_gateway_changed(
        &mut self,
        cb: impl FnMut(&mut CallbackContext<'_>, Option<NodeId>) + 'static,
    ) {
        self.callbacks.on_gateway_changed = Some(Box::new(cb));
    }

    pub fn on_queue_full(&mut self, cb: impl FnMut(&mut CallbackContext<'_>) + 'static) {
        self.callbacks.on_queue_full = Some(Box::new(cb));
    }

    pub fn on_message_queued(&mut self, cb: impl FnMut(&mut CallbackContext<'_>) + 'static) {
        self.callbacks.on_message_queued = Some(Box::new(cb));
    }

    pub fn on_queue_flushed(&mut self, cb: impl FnMut(&mut CallbackContext<'_>) + 'static) {
        self.callbacks.on_queue_flushed = Some(Box::new(cb));
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Synchronized mesh time in microseconds
    pub fn node_time(&self) -> u64 {
        self.time.mesh_time_us(self.clock.now_us())
    }

    /// Wall-clock time, when an NTP anchor has been learned
    pub fn wall_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.time.wall_time(self.clock.now_us())
    }

    pub fn node_list(&self, include_self: bool) -> Vec<NodeId> {
        self.table.node_list(include_self)
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.table.contains(node)
    }

    pub fn has_active_mesh_connections(&self) -> bool {
        self.conns.live().any(|c| c.node_id().is_some())
    }

    /// Whether internet egress is currently available
    ///
    /// A bridging node answers from its own uplink (associated with an
    /// address); everyone else answers from the bridge registry. The DNS
    /// and captive-portal probes run at egress time, not here.
    pub fn has_internet_connection(&self) -> bool {
        if self.can_serve_gateway() {
            self.local_uplink_up()
        } else {
            self.bridges.has_healthy(self.clock.now_us())
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_bridge(&self) -> bool {
        self.is_bridge
    }

    pub fn mode(&self) -> MeshMode {
        self.mode
    }

    pub fn station_phase(&self) -> StationPhase {
        self.station.phase()
    }

    /// The bridge internet traffic currently routes through
    pub fn primary_bridge(&mut self) -> Option<NodeId> {
        let now = self.clock.now_us();
        self.selector.select(&self.bridges, now)
    }

    /// The last bridge a selection returned, healthy or not
    pub fn last_known_bridge(&self) -> Option<NodeId> {
        self.selector.last_known()
    }

    pub fn bridges(&self) -> Vec<BridgeInfo> {
        self.bridges.all().into_iter().cloned().collect()
    }

    /// Pin internet traffic to one bridge until cleared
    pub fn select_bridge(&mut self, bridge: Option<NodeId>) {
        match bridge {
            Some(id) => self.selector.pin(id),
            None => self.selector.clear_pin(),
        }
    }

    pub fn stats(&self) -> MeshStats {
        self.stats
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.len()
    }

    /// Outstanding scheduler tasks (zero after `stop()`)
    pub fn scheduled_tasks(&self) -> usize {
        self.sched.len()
    }

    /// Socket frees still waiting on deletion spacing
    pub fn pending_releases(&self) -> usize {
        self.releases.len()
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    fn handle_tcp_event(&mut self, event: TcpEvent, now: u64) {
        match event {
            TcpEvent::Accepted { socket, remote_ip } => {
                debug!(%socket, %remote_ip, "accepted peer connection");
                let id = self.conns.next_id();
                let conn = BufferedConnection::new(
                    id,
                    socket,
                    Direction::Accepted,
                    now,
                    &self.config.connection,
                );
                self.conns.insert(conn);
                self.send_initial_sync(id);
            }
            TcpEvent::Connected { token: _, socket } => {
                debug!(%socket, "uplink TCP connected");
                let id = self.conns.next_id();
                let conn = BufferedConnection::new(
                    id,
                    socket,
                    Direction::Initiated,
                    now,
                    &self.config.connection,
                );
                self.conns.insert(conn);
                self.station.on_tcp_connected();
                self.send_initial_sync(id);
            }
            TcpEvent::ConnectFailed { token: _, error } => {
                debug!(%error, "uplink TCP connect failed");
                let action = self.station.on_tcp_failed(now);
                self.perform_station_action(action, now);
            }
            TcpEvent::Data { socket, data } => {
                let frames = match self.conns.by_socket_mut(socket) {
                    Some(conn) if !conn.is_closed() => conn.feed(&data, now),
                    _ => return,
                };
                let conn_id = match self.conns.by_socket_mut(socket) {
                    Some(conn) => conn.id(),
                    None => return,
                };
                for frame in frames {
                    self.handle_frame(conn_id, &frame, now);
                }
            }
            TcpEvent::WriteDone { socket } => {
                if let Some(conn) = self.conns.by_socket_mut(socket) {
                    conn.write_done();
                }
            }
            TcpEvent::Error { socket, error } => {
                if let Some(id) = self.conns.by_socket_mut(socket).map(|c| c.id()) {
                    warn!(%socket, %error, "connection error");
                    self.drop_connection(id, now, "transport error");
                }
            }
            TcpEvent::Disconnected { socket } => {
                if let Some(id) = self.conns.by_socket_mut(socket).map(|c| c.id()) {
                    self.drop_connection(id, now, "peer disconnected");
                }
            }
        }
    }

    fn handle_radio_event(&mut self, event: RadioEvent, now: u64) {
        match event {
            RadioEvent::ScanDone(aps) => self.handle_scan_done(aps, now),
            RadioEvent::StaConnected => {
                if self.wants_router_uplink() && !self.bridge_up {
                    self.finish_bridge_up(now);
                } else {
                    let action = self.station.on_associated(self.config.port);
                    self.perform_station_action(action, now);
                }
            }
            RadioEvent::StaDisconnected => {
                if self.bridge_up {
                    warn!("router uplink lost");
                    self.bridge_up = false;
                    self.sched.add_once(
                        now,
                        self.config.station.wifi_backoff,
                        TaskKind::BridgeJoinKick,
                    );
                } else if matches!(
                    self.station.phase(),
                    StationPhase::Associating | StationPhase::TcpConnecting
                ) {
                    let action = self.station.on_associate_failed();
                    self.perform_station_action(action, now);
                }
                // A joined uplink death also surfaces as a TCP error and
                // is handled there.
            }
            RadioEvent::ApStarted => debug!("soft AP up"),
            RadioEvent::ApStopped => debug!("soft AP down"),
        }
    }

    fn handle_scan_done(&mut self, aps: Vec<canopy_core::ApRecord>, now: u64) {
        if let Some(router) = &self.config.router {
            let best = aps
                .iter()
                .filter(|ap| ap.ssid == router.ssid)
                .map(|ap| ap.rssi)
                .max();
            self.router_visible = best.is_some();
            if let Some(rssi) = best {
                self.last_router_rssi = rssi;
            }
        }

        if self.wants_router_uplink() && !self.bridge_up {
            self.bridge_router_scan_done(&aps, now);
            return;
        }

        if self.election_scan_pending {
            self.election_scan_pending = false;
            if self.router_visible && self.election.can_campaign(now) {
                self.start_campaign(now);
            }
        }

        if self.station.phase() == StationPhase::Scanning {
            let table = &self.table;
            let ssid = self.config.ssid.clone();
            let has_creds = self.config.router.is_some();
            let action =
                self.station
                    .on_scan_results(&aps, &ssid, has_creds, now, |id| table.contains(id));
            // Auto-detect found nothing: serve the mesh on the fallback
            // channel while scans continue.
            if !self.ap_started
                && self.config.channel == 0
                && matches!(action, StationAction::Rescan { .. })
            {
                let fallback = self.config.fallback_channel;
                let _ = self.ensure_ap(fallback);
            }
            self.perform_station_action(action, now);
        }
    }

    fn perform_station_action(&mut self, action: StationAction, now: u64) {
        match action {
            StationAction::None => {}
            StationAction::StartScan { all_channels } => {
                if self.radio.request_scan(all_channels).is_err() {
                    self.sched.add_once(
                        now,
                        self.config.station.rescan_interval,
                        TaskKind::StationKick,
                    );
                }
            }
            StationAction::Rescan { delay } => {
                self.sched.add_once(now, delay, TaskKind::StationKick);
            }
            StationAction::Associate { record } => {
                if self.ensure_ap(record.channel).is_err()
                    || self
                        .radio
                        .associate(
                            &self.config.ssid.clone(),
                            &self.config.password.clone(),
                            record.channel,
                            Some(record.bssid),
                        )
                        .is_err()
                {
                    let action = self.station.on_associate_failed();
                    self.perform_station_action(action, now);
                }
            }
            StationAction::Connect { ip, port } => match self.tcp.connect(ip, port) {
                Ok(_token) => {}
                Err(e) => {
                    debug!(error = %e, "TCP connect submission failed");
                    let action = self.station.on_tcp_failed(now);
                    self.perform_station_action(action, now);
                }
            },
            StationAction::RetryConnect { delay } => {
                self.sched.add_once(now, delay, TaskKind::StationRetry);
            }
            StationAction::PromoteIsolatedBridge => {
                self.promote_to_bridge("isolated node with router credentials", None, now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Frame path
    // ------------------------------------------------------------------

    fn handle_frame(&mut self, conn: ConnId, frame: &[u8], now: u64) {
        self.stats.packages_in += 1;
        let pkg = match Package::parse(frame, self.config.connection.max_frame_len) {
            Ok(pkg) => pkg,
            Err(e) => {
                self.stats.frames_dropped += 1;
                debug!(%conn, error = %e, "dropping frame");
                return;
            }
        };

        match pkg.routing() {
            Routing::Broadcast => {
                if self.router.note_seen(conn, frame) {
                    self.stats.duplicates_suppressed += 1;
                    return;
                }
                let json = String::from_utf8_lossy(frame).into_owned();
                let forwarded =
                    self.router
                        .broadcast(&mut self.conns, &json, pkg.is_priority(), Some(conn));
                self.stats.packages_forwarded += forwarded.len() as u64;
                self.handle_package(pkg, conn, now);
            }
            Routing::Single => match pkg.dest() {
                Some(dest) if dest == self.node_id => self.handle_package(pkg, conn, now),
                Some(dest) => {
                    let json = String::from_utf8_lossy(frame).into_owned();
                    match self.router.forward_unicast(
                        &self.table,
                        &mut self.conns,
                        dest,
                        &json,
                        pkg.is_priority(),
                    ) {
                        Ok(UnicastOutcome::Enqueued(_)) => self.stats.packages_forwarded += 1,
                        Ok(_) => {}
                        Err(e) => debug!(%dest, error = %e, "cannot forward unicast"),
                    }
                }
                None => self.stats.frames_dropped += 1,
            },
            Routing::Neighbour => self.handle_package(pkg, conn, now),
        }
    }

    fn handle_package(&mut self, pkg: Package, conn: ConnId, now: u64) {
        match pkg {
            Package::NodeSyncRequest(body) => self.handle_node_sync(body, conn, false, now),
            Package::NodeSyncReply(body) => self.handle_node_sync(body, conn, true, now),
            Package::TimeSync(body) => self.handle_time_sync(body, conn, now, true),
            Package::TimeDelay(body) => self.handle_time_sync(body, conn, now, false),
            Package::Broadcast(body) | Package::Single(body) => {
                let from = body.from;
                let msg = body.msg;
                fire!(self, on_receive, |ctx, f| f(&mut ctx, from, &msg));
            }
            Package::BridgeStatus(body) => self.handle_bridge_status(body, now),
            Package::BridgeElection(body) => {
                self.election.observe(ElectionTuple::from_package(&body));
            }
            Package::BridgeTakeover(body) => self.handle_takeover(body, now),
            Package::BridgeCoordination(body) => {
                self.bridges.apply_coordination(&body, now);
                self.update_gateway_selection(now);
            }
            Package::NtpTimeSync(body) => self.handle_ntp_time(body, now),
            Package::GatewayData(body) => self.handle_gateway_data(body, now),
            Package::GatewayAck(body) => self.handle_gateway_ack(body, now),
            Package::App(app) => {
                let mut handlers = std::mem::take(&mut self.handlers);
                let mut outbox = Vec::new();
                let mesh_time = self.time.mesh_time_us(now);
                let consumed = {
                    let mut ctx = CallbackContext::new(self.node_id, mesh_time, &mut outbox);
                    handlers.dispatch(&mut ctx, &app, conn, mesh_time)
                };
                self.handlers = handlers;
                self.apply_outbox(outbox);
                if !consumed {
                    trace!(type_code = app.type_code, "application package unhandled");
                }
            }
        }
    }

    fn handle_node_sync(&mut self, body: NodeSyncPackage, conn: ConnId, is_reply: bool, now: u64) {
        if body.tree.node_id != body.from {
            debug!(%conn, "node sync tree root does not match sender");
            return;
        }
        let outcome = apply_tree(&mut self.table, &mut self.conns, conn, &body.tree);

        if !is_reply && outcome.accepted {
            let reply = build_sync(&self.table, conn, body.from, true);
            self.enqueue_on(conn, &reply);
        }
        let self_evicted = outcome.evict.contains(&conn);
        for evicted in outcome.evict {
            self.drop_connection(evicted, now, "topology conflict");
        }
        if let Some(peer) = outcome.learned_peer {
            if !self_evicted {
                fire!(self, on_new_connection, |ctx, f| f(&mut ctx, peer));
                self.initiate_time_sync(now);
            }
        }
        if outcome.node_set_changed {
            fire!(self, on_changed_connections, |ctx, f| f(&mut ctx));
        }
    }

    fn handle_time_sync(&mut self, body: TimeSyncPackage, conn: ConnId, now: u64, apply: bool) {
        if body.msg.is_reply() {
            if body.dest != self.node_id {
                return;
            }
            let t4 = self.time.mesh_time_us(now);
            if apply {
                if let Some((offset, delay)) = self.time.apply_reply(&body.msg, t4) {
                    debug!(offset, delay, "time sync applied");
                    fire!(self, on_node_time_adjusted, |ctx, f| f(&mut ctx, offset));
                }
            } else if let Some((_, delay)) = body.msg.offset_and_delay(t4) {
                debug!(delay, "time delay measured");
            }
        } else {
            let t2 = self.time.mesh_time_us(now);
            let t3 = self.time.mesh_time_us(self.clock.now_us());
            let reply_body = TimeSyncPackage {
                from: self.node_id,
                dest: body.from,
                routing: Routing::Neighbour,
                msg: TimeStamps::reply(body.msg.t1, t2, t3),
            };
            let reply = if apply {
                Package::TimeSync(reply_body)
            } else {
                Package::TimeDelay(reply_body)
            };
            self.enqueue_on(conn, &reply);
        }
    }

    fn handle_ntp_time(&mut self, body: NtpTimeSyncPackage, now: u64) {
        let mesh_time = self.time.mesh_time_us(now);
        self.time.set_wall_anchor(body.epoch_ms, mesh_time);
        debug!(epoch_ms = body.epoch_ms, precision_ms = body.precision_ms, "wall clock anchored");
    }

    // ------------------------------------------------------------------
    // Internal plumbing
    // ------------------------------------------------------------------

    fn send_package(&mut self, pkg: Package) -> Result<(), MeshError> {
        if pkg.routing() == Routing::Broadcast {
            let json = pkg.to_json()?;
            self.router
                .broadcast(&mut self.conns, &json, pkg.is_priority(), None);
            return Ok(());
        }
        if pkg.dest() == Some(self.node_id) {
            let now = self.clock.now_us();
            self.sched
                .add_once(now, Duration::ZERO, TaskKind::Loopback(pkg));
            return Ok(());
        }
        self.router
            .unicast(&self.table, &mut self.conns, &pkg)
            .map(|_| ())
    }

    fn enqueue_on(&mut self, conn: ConnId, pkg: &Package) {
        let json = match pkg.to_json() {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "package serialization failed");
                return;
            }
        };
        if let Some(c) = self.conns.get_mut(conn) {
            if !c.enqueue(&json, pkg.is_priority()) {
                debug!(%conn, "egress refused package");
            }
        }
    }

    fn send_initial_sync(&mut self, conn: ConnId) {
        let pkg = build_sync(&self.table, conn, NodeId(0), false);
        self.enqueue_on(conn, &pkg);
    }

    fn initiate_time_sync(&mut self, now: u64) {
        let Some(conn) = sync_target(&self.table) else {
            return;
        };
        let dest = self
            .conns
            .get(conn)
            .and_then(|c| c.node_id())
            .unwrap_or(NodeId(0));
        let t1 = self.time.mesh_time_us(now);
        let pkg = Package::TimeSync(TimeSyncPackage {
            from: self.node_id,
            dest,
            routing: Routing::Neighbour,
            msg: TimeStamps::request(t1),
        });
        self.enqueue_on(conn, &pkg);
    }

    fn drop_connection(&mut self, conn: ConnId, now: u64, reason: &str) {
        let Some(mut conn) = self.conns.remove(conn) else {
            return;
        };
        let before = self.table.node_list(false);
        self.table.remove_conn(conn.id());
        self.router.forget(conn.id());
        let changed = self.table.node_list(false) != before;
        let was_station = conn.is_station();
        let peer = conn.node_id();

        if conn.close() {
            debug!(id = %conn.id(), ?peer, reason, "dropping connection");
            self.tcp.close(conn.socket(), false);
            self.releases.defer(&self.release_gate, conn.socket(), now);
            if let Some(peer) = peer {
                fire!(self, on_dropped_connection, |ctx, f| f(&mut ctx, peer));
            }
        }
        if changed {
            fire!(self, on_changed_connections, |ctx, f| f(&mut ctx));
        }
        if was_station && self.started {
            let action = self.station.on_link_lost();
            self.perform_station_action(action, now);
        }
    }

    fn pump_writes(&mut self, now: u64) {
        let mut to_write = Vec::new();
        for conn in self.conns.live_mut() {
            if let Some(frame) = conn.next_write() {
                to_write.push((conn.id(), conn.socket(), frame));
            }
        }
        for (id, socket, frame) in to_write {
            if let Err(e) = self.tcp.write(socket, &frame) {
                warn!(%socket, error = %e, "write failed");
                self.drop_connection(id, now, "write failure");
            }
        }
    }

    fn ensure_ap(&mut self, channel: u8) -> Result<(), MeshError> {
        if self.ap_started && self.ap_channel == channel {
            return Ok(());
        }
        if self.ap_started {
            self.radio.stop_ap();
        }
        self.radio.start_ap(
            &self.config.ssid.clone(),
            &self.config.password.clone(),
            channel,
            self.config.hidden,
            self.config.max_conn,
        )?;
        self.ap_started = true;
        self.ap_channel = channel;
        info!(channel, "serving mesh access point");
        Ok(())
    }

    fn apply_outbox(&mut self, outbox: Vec<OutboundCommand>) {
        for command in outbox {
            match command {
                OutboundCommand::Broadcast { msg, include_self } => {
                    self.send_broadcast(msg, include_self);
                }
                OutboundCommand::Single { dest, msg } => {
                    if let Err(e) = self.send_single(dest, msg) {
                        debug!(%dest, error = %e, "handler-issued unicast failed");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduled tasks
    // ------------------------------------------------------------------

    fn run_task(&mut self, kind: TaskKind, now: u64) -> TaskKind {
        match kind {
            TaskKind::Noop => TaskKind::Noop,
            TaskKind::Watchdog => {
                self.run_watchdog(now);
                TaskKind::Watchdog
            }
            TaskKind::NodeSync => {
                self.run_node_sync(now);
                TaskKind::NodeSync
            }
            TaskKind::TimeSync => {
                self.initiate_time_sync(now);
                TaskKind::TimeSync
            }
            TaskKind::StationKick => {
                let action = self.station.on_backoff_elapsed();
                self.perform_station_action(action, now);
                TaskKind::StationKick
            }
            TaskKind::StationRetry => {
                let action = self.station.on_retry_due(self.config.port);
                self.perform_station_action(action, now);
                TaskKind::StationRetry
            }
            TaskKind::BridgeJoinKick => {
                if !self.bridge_up && self.wants_router_uplink() {
                    let _ = self.radio.request_scan(true);
                }
                TaskKind::BridgeJoinKick
            }
            TaskKind::BridgeStatus => {
                self.broadcast_bridge_status(now);
                TaskKind::BridgeStatus
            }
            TaskKind::BridgeMonitor => {
                self.run_bridge_monitor(now);
                TaskKind::BridgeMonitor
            }
            TaskKind::ElectionWindow => {
                self.run_election_window(now);
                TaskKind::ElectionWindow
            }
            TaskKind::Coordination => {
                self.broadcast_coordination(now);
                TaskKind::Coordination
            }
            TaskKind::GatewaySweep => {
                self.gateway_tx.sweep(now);
                self.dispatch_gateway_retries(now);
                TaskKind::GatewaySweep
            }
            TaskKind::GatewayRetry => {
                self.dispatch_gateway_retries(now);
                TaskKind::GatewayRetry
            }
            TaskKind::QueueFlushStep => {
                self.run_queue_flush_step(now);
                TaskKind::QueueFlushStep
            }
            TaskKind::Loopback(pkg) => {
                self.handle_package(pkg, LOCAL_CONN, now);
                TaskKind::Noop
            }
            TaskKind::User(mut task) => {
                let mut outbox = Vec::new();
                let mesh_time = self.time.mesh_time_us(now);
                {
                    let mut ctx = CallbackContext::new(self.node_id, mesh_time, &mut outbox);
                    let result = catch_unwind(AssertUnwindSafe(|| (task.0)(&mut ctx)));
                    if result.is_err() {
                        warn!("user task panicked");
                    }
                }
                self.apply_outbox(outbox);
                TaskKind::User(task)
            }
        }
    }

    fn run_watchdog(&mut self, now: u64) {
        // Idle links die through the deferred-release path.
        let idle: Vec<ConnId> = self
            .conns
            .live()
            .filter(|c| c.idle_timed_out(now))
            .map(|c| c.id())
            .collect();
        for id in idle {
            self.drop_connection(id, now, "idle timeout");
        }

        let expired = self.bridges.prune(now);
        if !expired.is_empty() {
            self.update_gateway_selection(now);
        }

        let internet = self.has_internet_connection();
        if internet && !self.had_internet && !self.queue.is_empty() && !self.flush_in_progress {
            info!(queued = self.queue.len(), "internet restored, flushing offline queue");
            self.flush_in_progress = true;
            self.sched
                .add_once(now, Duration::ZERO, TaskKind::QueueFlushStep);
        }
        self.had_internet = internet;
    }

    fn run_node_sync(&mut self, _now: u64) {
        let targets: Vec<(ConnId, NodeId)> = self
            .conns
            .live()
            .map(|c| (c.id(), c.node_id().unwrap_or(NodeId(0))))
            .collect();
        for (conn, dest) in targets {
            let pkg = build_sync(&self.table, conn, dest, false);
            self.enqueue_on(conn, &pkg);
        }
    }

    fn run_queue_flush_step(&mut self, now: u64) {
        if !self.has_internet_connection() {
            self.flush_in_progress = false;
            return;
        }
        match self.queue.pop_next() {
            Some(msg) => {
                let sent = self.send_to_internet(
                    msg.url.clone(),
                    msg.payload.clone(),
                    RequestOptions::default(),
                    Box::new(|outcome| {
                        if !outcome.success {
                            debug!(message_id = outcome.message_id, "flushed message failed");
                        }
                    }),
                );
                match sent {
                    Ok(_) => {
                        let gap = self.config.queue_flush_gap;
                        self.sched.add_once(now, gap, TaskKind::QueueFlushStep);
                    }
                    Err(e) => {
                        debug!(error = %e, "flush interrupted, re-queueing message");
                        let _ = self.queue.enqueue(msg.url, msg.payload, msg.priority, now);
                        self.flush_in_progress = false;
                    }
                }
            }
            None => {
                self.flush_in_progress = false;
                fire!(self, on_queue_flushed, |ctx, f| f(&mut ctx));
            }
        }
    }

    // ------------------------------------------------------------------
    // Bridge role
    // ------------------------------------------------------------------

    fn wants_router_uplink(&self) -> bool {
        matches!(self.mode, MeshMode::Bridge | MeshMode::SharedGateway)
    }

    fn can_serve_gateway(&self) -> bool {
        self.is_bridge || self.mode == MeshMode::SharedGateway
    }

    fn local_uplink_up(&self) -> bool {
        self.radio.is_associated() && self.radio.local_ip().is_some()
    }

    fn bridge_router_scan_done(&mut self, aps: &[canopy_core::ApRecord], now: u64) {
        let Some(router) = self.config.router.clone() else {
            return;
        };
        let best = aps
            .iter()
            .filter(|ap| ap.ssid == router.ssid)
            .max_by_key(|ap| ap.rssi);
        match best {
            Some(ap) => {
                self.last_router_rssi = ap.rssi;
                self.ap_channel = ap.channel;
                if self
                    .radio
                    .associate(&router.ssid, &router.password, ap.channel, Some(ap.bssid))
                    .is_err()
                {
                    self.sched.add_once(
                        now,
                        self.config.station.wifi_backoff,
                        TaskKind::BridgeJoinKick,
                    );
                }
            }
            None => {
                debug!(ssid = %router.ssid, "router not visible, rescanning");
                self.sched.add_once(
                    now,
                    self.config.station.rescan_interval,
                    TaskKind::BridgeJoinKick,
                );
            }
        }
    }

    /// The router uplink came up: serve the mesh on the router's channel
    /// and start the bridge beacons
    fn finish_bridge_up(&mut self, now: u64) {
        let channel = self.ap_channel.max(1);
        if self.ensure_ap(channel).is_err() {
            self.sched.add_once(
                now,
                self.config.station.wifi_backoff,
                TaskKind::BridgeJoinKick,
            );
            return;
        }
        if let Err(e) = self.tcp.listen(self.config.port) {
            warn!(error = %e, "mesh listen failed");
        }
        self.bridge_up = true;
        if self.mode == MeshMode::Bridge {
            self.is_bridge = true;
            self.table.set_root(true);
        }
        // A shared-gateway node keeps its router association (the radio
        // has one station interface); mesh members attach to its AP.

        if self.is_bridge {
            let h1 = self.sched.add_periodic(
                now,
                self.config.bridge_status_interval,
                TaskKind::BridgeStatus,
            );
            let h2 = self.sched.add_periodic(
                now,
                self.config.coordination_interval,
                TaskKind::Coordination,
            );
            // Early self-registration so peers and our own registry see
            // the bridge well before the first periodic beacon.
            let h3 = self
                .sched
                .add_once(now, Duration::from_millis(100), TaskKind::BridgeStatus);
            let h4 = self
                .sched
                .add_once(now, Duration::from_millis(150), TaskKind::BridgeStatus);
            self.bridge_task_handles.extend([h1, h2, h3, h4]);
        }

        let reason = self
            .pending_role_reason
            .take()
            .unwrap_or_else(|| "bridge uplink established".into());
        info!(node = %self.node_id, channel, %reason, "bridge up");
        if self.is_bridge {
            fire!(self, on_bridge_role_changed, |ctx, f| f(&mut ctx, true, &reason));
        }
    }

    fn build_status(&mut self, now: u64) -> BridgeStatusPackage {
        let load_pct = if self.config.max_conn > 0 {
            ((self.conns.len() as u32 * 100) / self.config.max_conn as u32).min(100) as u8
        } else {
            0
        };
        BridgeStatusPackage {
            from: self.node_id,
            routing: Routing::Broadcast,
            internet_connected: self.local_uplink_up(),
            router_rssi: self.radio.rssi().unwrap_or(self.last_router_rssi),
            router_channel: self.ap_channel,
            uptime_s: now.saturating_sub(self.started_at_us) / 1_000_000,
            gateway_ip: self.radio.local_ip(),
            priority: self.config.bridge_priority,
            role: self.bridge_role,
            load_pct,
        }
    }

    fn broadcast_bridge_status(&mut self, now: u64) {
        if !self.is_bridge {
            return;
        }
        let status = self.build_status(now);
        // Broadcasts do not loop back, so the bridge registers itself.
        self.bridges.apply_status(&status, now);
        let _ = self.send_package(Package::BridgeStatus(status));
        self.update_gateway_selection(now);

        if let Some(rtc) = self.rtc.as_mut() {
            if let Some(epoch_ms) = rtc.read_epoch_ms() {
                let mesh_time = self.time.mesh_time_us(now);
                self.time.set_wall_anchor(epoch_ms, mesh_time);
                let _ = self.send_package(Package::NtpTimeSync(NtpTimeSyncPackage {
                    from: self.node_id,
                    routing: Routing::Broadcast,
                    epoch_ms,
                    precision_ms: 1000,
                }));
            }
        }
    }

    fn broadcast_coordination(&mut self, now: u64) {
        if !self.is_bridge {
            return;
        }
        let peer_bridges: Vec<NodeId> = self
            .bridges
            .all()
            .iter()
            .map(|b| b.node_id)
            .filter(|id| *id != self.node_id)
            .collect();
        let load_pct = self.build_status(now).load_pct;
        let pkg = BridgeCoordinationPackage {
            from: self.node_id,
            routing: Routing::Broadcast,
            priority: self.config.bridge_priority,
            role: self.bridge_role,
            peer_bridges,
            load_pct,
            timestamp_us: self.time.mesh_time_us(now),
        };
        let _ = self.send_package(Package::BridgeCoordination(pkg));
    }

    fn handle_bridge_status(&mut self, body: BridgeStatusPackage, now: u64) {
        if body.from == self.node_id {
            return;
        }
        let known_state = self
            .bridges
            .get(body.from)
            .map(|b| b.internet_connected);
        self.bridges.apply_status(&body, now);
        if known_state != Some(body.internet_connected) {
            if let Some(info) = self.bridges.get(body.from).cloned() {
                fire!(self, on_bridge_status_changed, |ctx, f| f(&mut ctx, &info));
            }
        }
        self.update_gateway_selection(now);
    }

    fn handle_takeover(&mut self, body: BridgeTakeoverPackage, now: u64) {
        info!(winner = %body.from, reason = %body.reason, "bridge takeover heard");
        if let Some(previous) = body.previous_bridge {
            self.bridges.remove(previous);
        }
        let must_yield = self.election.on_takeover_heard(body.from, now);
        if must_yield && self.is_bridge {
            self.demote_from_bridge("yielded to concurrent takeover", now);
        }
        self.update_gateway_selection(now);
    }

    fn run_bridge_monitor(&mut self, now: u64) {
        if self.is_bridge
            || self.config.router.is_none()
            || !self.election.can_campaign(now)
            || self.bridges.has_healthy(now)
        {
            return;
        }
        // Refresh router visibility and RSSI before campaigning.
        self.election_scan_pending = true;
        if self.radio.request_scan(true).is_err() {
            self.election_scan_pending = false;
        }
    }

    fn start_campaign(&mut self, now: u64) {
        let tuple = ElectionTuple {
            router_rssi: self.last_router_rssi,
            uptime_s: now.saturating_sub(self.started_at_us) / 1_000_000,
            free_memory: self.config.free_memory_hint,
            node_id: self.node_id,
        };
        self.election.update_own(tuple);
        let window = self.election.config().random_window();
        self.election.start_campaign(now, window);
        let _ = self.send_package(Package::BridgeElection(
            tuple.to_package(self.time.mesh_time_us(now)),
        ));
        self.sched.add_once(now, window, TaskKind::ElectionWindow);
    }

    fn run_election_window(&mut self, now: u64) {
        match self.election.evaluate(now) {
            Some(ElectionOutcome::Won) => {
                let previous = self.selector.last_known();
                self.promote_to_bridge("won bridge election", previous, now);
            }
            Some(ElectionOutcome::Lost { winner }) => {
                debug!(%winner, "lost bridge election");
            }
            None => {}
        }
    }

    /// Become the bridge: announce the takeover while the mesh links are
    /// still up, then restart against the router
    fn promote_to_bridge(&mut self, reason: &str, previous: Option<NodeId>, now: u64) {
        info!(node = %self.node_id, reason, "promoting to bridge");
        let takeover = Package::BridgeTakeover(BridgeTakeoverPackage {
            from: self.node_id,
            routing: Routing::Broadcast,
            previous_bridge: previous,
            reason: reason.to_string(),
            timestamp_us: self.time.mesh_time_us(now),
        });
        let _ = self.send_package(takeover);
        self.pump_writes(now);

        self.election.note_role_change(now);
        // Role flags and the station reset come first so dropping the
        // uplink below cannot restart the join machinery.
        self.station.reset();
        self.mode = MeshMode::Bridge;
        self.is_bridge = true;
        self.bridge_up = false;
        self.pending_role_reason = Some(reason.to_string());
        let ids: Vec<ConnId> = self.conns.iter().map(|c| c.id()).collect();
        for id in ids {
            self.drop_connection(id, now, "restarting as bridge");
        }
        self.radio.disassociate();
        if self.radio.request_scan(true).is_err() {
            self.sched.add_once(
                now,
                self.config.station.wifi_backoff,
                TaskKind::BridgeJoinKick,
            );
        }
    }

    /// Voluntarily give the bridge role up
    ///
    /// A final status beacon advertising no internet goes out first, so
    /// peers mark this bridge unhealthy and their monitors can elect a
    /// successor without waiting for the registry timeout.
    pub fn abdicate_bridge(&mut self, reason: &str) {
        if !self.is_bridge {
            return;
        }
        let now = self.clock.now_us();
        let mut status = self.build_status(now);
        status.internet_connected = false;
        let _ = self.send_package(Package::BridgeStatus(status));
        self.pump_writes(now);
        self.demote_from_bridge(reason, now);
    }

    /// Stop bridging and rejoin the mesh as a regular node
    fn demote_from_bridge(&mut self, reason: &str, now: u64) {
        info!(node = %self.node_id, reason, "ceasing bridge role");
        for handle in self.bridge_task_handles.drain(..) {
            self.sched.cancel(handle);
        }
        self.is_bridge = false;
        self.bridge_up = false;
        self.mode = MeshMode::Node;
        self.table.set_root(false);
        self.bridges.remove(self.node_id);
        self.election.note_role_change(now);
        self.radio.disassociate();
        let reason_owned = reason.to_string();
        fire!(self, on_bridge_role_changed, |ctx, f| f(&mut ctx, false, &reason_owned));
        let action = self.station.begin();
        self.perform_station_action(action, now);
    }

    fn update_gateway_selection(&mut self, now: u64) {
        let previous = self.selector.last_known();
        let current = self.selector.select(&self.bridges, now);
        if current != previous {
            fire!(self, on_gateway_changed, |ctx, f| f(&mut ctx, current));
        }
    }

    // ------------------------------------------------------------------
    // Gateway RPC plumbing
    // ------------------------------------------------------------------

    fn handle_gateway_data(&mut self, body: GatewayDataPackage, _now: u64) {
        if !self.can_serve_gateway() {
            debug!(from = %body.from, "gateway request at a non-gateway node");
            return;
        }
        let ack = match self.http.as_mut() {
            Some(http) => {
                // The HTTP exchange may outlast a link-idle window; the
                // return path must survive it.
                for conn in self.conns.iter_mut() {
                    conn.pause_timeouts(true);
                }
                let wifi = self.radio.is_associated() && self.radio.local_ip().is_some();
                let config = self.config.gateway_server.clone();
                let ack = serve_gateway_request(http, &config, wifi, &body, self.node_id);
                for conn in self.conns.iter_mut() {
                    conn.pause_timeouts(false);
                }
                ack
            }
            None => GatewayAckPackage {
                from: self.node_id,
                dest: body.from,
                routing: Routing::Single,
                message_id: body.message_id,
                success: false,
                http_status: 0,
                error: Some("gateway has no http client".into()),
            },
        };
        if let Err(e) = self.send_package(Package::GatewayAck(ack)) {
            debug!(error = %e, "gateway ack could not be routed");
        }
    }

    fn handle_gateway_ack(&mut self, body: GatewayAckPackage, now: u64) {
        if body.dest != self.node_id {
            return;
        }
        if let canopy_bridge::AckDisposition::RetryScheduled { at_us } =
            self.gateway_tx.on_ack(&body, now)
        {
            let delay = Duration::from_micros(at_us.saturating_sub(now));
            self.sched.add_once(now, delay, TaskKind::GatewayRetry);
        }
    }

    fn dispatch_gateway_retries(&mut self, now: u64) {
        let connected = self.has_active_mesh_connections() || self.can_serve_gateway();
        let retries = self.gateway_tx.due_retries(now, self.node_id, connected);
        for pkg in retries {
            if let Err(e) = self.send_package(Package::GatewayData(pkg)) {
                debug!(error = %e, "gateway retry could not be routed");
            }
        }
    }
}
