//! Buffered peer connections
//!
//! A [`BufferedConnection`] owns exactly one platform socket and turns it
//! into a framed message stream. The mesh holds all live connections in a
//! [`ConnectionSet`]; a connection leaves the set when it closes and its
//! socket is released through the deferred-release path (see
//! [`crate::release`]).

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use canopy_core::{ConnId, NodeId, SocketHandle};

use crate::framing::{DEFAULT_MAX_FRAME_LEN, FrameBuffer, encode_frame};

/// Who initiated the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The peer connected to our access point
    Accepted,
    /// We connected to the peer (they are our parent)
    Initiated,
}

/// Configuration for buffered connections
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Maximum inbound or outbound frame length in bytes
    pub max_frame_len: usize,
    /// Egress messages beyond this are rejected unless priority
    pub egress_soft_cap: usize,
    /// Idle time after which a connection is considered dead (microseconds)
    pub idle_timeout_us: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            egress_soft_cap: 16,
            idle_timeout_us: 10_000_000,
        }
    }
}

/// Counters for one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub rejected_egress: u64,
}

/// One peer link: socket, framer, and egress queue
#[derive(Debug)]
pub struct BufferedConnection {
    id: ConnId,
    socket: SocketHandle,
    direction: Direction,
    /// Remote node id, unknown until node sync completes
    node_id: Option<NodeId>,
    /// Whether this link is our uplink toward the parent
    station: bool,
    ingress: FrameBuffer,
    egress: VecDeque<Bytes>,
    egress_soft_cap: usize,
    max_frame_len: usize,
    write_outstanding: bool,
    closed: bool,
    timeouts_paused: bool,
    idle_timeout_us: u64,
    attached_at_us: u64,
    last_received_us: u64,
    stats: ConnectionStats,
}

impl BufferedConnection {
    pub fn new(
        id: ConnId,
        socket: SocketHandle,
        direction: Direction,
        now_us: u64,
        config: &ConnectionConfig,
    ) -> Self {
        debug!(%id, %socket, ?direction, "connection attached");
        Self {
            id,
            socket,
            direction,
            node_id: None,
            station: direction == Direction::Initiated,
            ingress: FrameBuffer::new(config.max_frame_len),
            egress: VecDeque::new(),
            egress_soft_cap: config.egress_soft_cap,
            max_frame_len: config.max_frame_len,
            write_outstanding: false,
            closed: false,
            timeouts_paused: false,
            idle_timeout_us: config.idle_timeout_us,
            attached_at_us: now_us,
            last_received_us: now_us,
            stats: ConnectionStats::default(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn socket(&self) -> SocketHandle {
        self.socket
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    /// Record the remote node id once node sync reveals it
    ///
    /// The id is immutable once set; a peer that advertises a different id
    /// afterwards is misbehaving and the caller should drop the link.
    pub fn set_node_id(&mut self, node_id: NodeId) -> bool {
        match self.node_id {
            None => {
                self.node_id = Some(node_id);
                true
            }
            Some(existing) => existing == node_id,
        }
    }

    pub fn is_station(&self) -> bool {
        self.station
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn attached_at_us(&self) -> u64 {
        self.attached_at_us
    }

    pub fn last_received_us(&self) -> u64 {
        self.last_received_us
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Queue one serialized message for sending
    ///
    /// Priority messages go to the head of the queue and are always
    /// accepted. Non-priority messages are rejected once the queue holds
    /// `egress_soft_cap` entries; the caller sees the back-pressure as
    /// `false`.
    pub fn enqueue(&mut self, json: &str, priority: bool) -> bool {
        if self.closed {
            return false;
        }
        if json.len() > self.max_frame_len {
            warn!(id = %self.id, len = json.len(), "refusing oversized outbound frame");
            return false;
        }
        if !priority && self.egress.len() >= self.egress_soft_cap {
            self.stats.rejected_egress += 1;
            trace!(id = %self.id, queued = self.egress.len(), "egress back-pressure");
            return false;
        }
        let frame = encode_frame(json);
        if priority {
            self.egress.push_front(frame);
        } else {
            self.egress.push_back(frame);
        }
        true
    }

    /// Hand the next frame to the platform writer
    ///
    /// Returns `None` while a write is outstanding or the queue is empty.
    /// The caller must report completion via [`write_done`](Self::write_done)
    /// before the next frame is released; a priority enqueue can overtake
    /// queued frames but never one already in flight.
    pub fn next_write(&mut self) -> Option<Bytes> {
        if self.closed || self.write_outstanding {
            return None;
        }
        let frame = self.egress.pop_front()?;
        self.write_outstanding = true;
        self.stats.bytes_out += frame.len() as u64;
        self.stats.frames_out += 1;
        Some(frame)
    }

    /// The platform finished the outstanding write
    pub fn write_done(&mut self) {
        self.write_outstanding = false;
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.egress.is_empty() && !self.write_outstanding
    }

    /// Feed received bytes through the framer
    pub fn feed(&mut self, data: &[u8], now_us: u64) -> Vec<Bytes> {
        self.last_received_us = now_us;
        self.stats.bytes_in += data.len() as u64;
        let frames = self.ingress.push(data);
        self.stats.frames_in += frames.len() as u64;
        frames
    }

    /// Suspend or resume the idle timeout
    ///
    /// Used by a bridge while it executes an HTTP request on behalf of the
    /// mesh, so the return path is not torn down before the ack ships.
    pub fn pause_timeouts(&mut self, paused: bool) {
        self.timeouts_paused = paused;
    }

    pub fn timeouts_paused(&self) -> bool {
        self.timeouts_paused
    }

    /// Whether the link has been silent past its idle timeout
    pub fn idle_timed_out(&self, now_us: u64) -> bool {
        if self.closed || self.timeouts_paused {
            return false;
        }
        now_us.saturating_sub(self.last_received_us) > self.idle_timeout_us
    }

    /// Mark closed; returns `true` on the first call only
    ///
    /// A closed connection is excluded from routing and never yields
    /// frames again, but its memory (and socket handle) stay owned until
    /// the deferred release runs.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        debug!(id = %self.id, node = ?self.node_id, "connection closed");
        self.closed = true;
        self.egress.clear();
        true
    }
}

/// The mesh's set of live connections
#[derive(Debug, Default)]
pub struct ConnectionSet {
    connections: Vec<BufferedConnection>,
    next_id: u64,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a new connection
    pub fn next_id(&mut self) -> ConnId {
        self.next_id += 1;
        ConnId(self.next_id)
    }

    pub fn insert(&mut self, conn: BufferedConnection) {
        self.connections.push(conn);
    }

    pub fn get(&self, id: ConnId) -> Option<&BufferedConnection> {
        self.connections.iter().find(|c| c.id() == id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut BufferedConnection> {
        self.connections.iter_mut().find(|c| c.id() == id)
    }

    pub fn by_socket_mut(&mut self, socket: SocketHandle) -> Option<&mut BufferedConnection> {
        self.connections.iter_mut().find(|c| c.socket() == socket)
    }

    pub fn by_node(&self, node_id: NodeId) -> Option<&BufferedConnection> {
        self.connections
            .iter()
            .find(|c| c.node_id() == Some(node_id))
    }

    /// Remove a connection, returning it for socket release
    pub fn remove(&mut self, id: ConnId) -> Option<BufferedConnection> {
        let idx = self.connections.iter().position(|c| c.id() == id)?;
        Some(self.connections.remove(idx))
    }

    /// Live (not closed) connections
    pub fn live(&self) -> impl Iterator<Item = &BufferedConnection> {
        self.connections.iter().filter(|c| !c.is_closed())
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut BufferedConnection> {
        self.connections.iter_mut().filter(|c| !c.is_closed())
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedConnection> {
        self.connections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferedConnection> {
        self.connections.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// The station (uplink) connection, if joined
    pub fn station(&self) -> Option<&BufferedConnection> {
        self.live().find(|c| c.is_station())
    }

    /// Drain every connection out of the set (for `stop()`)
    pub fn drain(&mut self) -> Vec<BufferedConnection> {
        std::mem::take(&mut self.connections)
    }
}
