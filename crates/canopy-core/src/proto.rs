//! Wire protocol packages
//!
//! Every message on a Canopy link is one newline-terminated JSON object
//! with an integer `type` field, a `from` node id, and a `routing`
//! discipline. [`Package`] is the tagged view over all package kinds the
//! core understands; application types (200–699) pass through untouched.
//!
//! Parsing treats the wire as untrusted: the raw byte length is checked
//! against the frame limit before the parser runs, and a parse failure
//! drops the frame without touching the connection.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::ident::NodeId;

/// Application package types are passed through the core unmodified.
pub const APP_TYPE_RANGE: RangeInclusive<u16> = 200..=699;

/// Routing discipline of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Routing {
    /// Consumed by the directly connected peer
    #[default]
    Neighbour,
    /// Forwarded hop-by-hop toward `dest`
    Single,
    /// Flooded to every node exactly once
    Broadcast,
}

impl From<Routing> for u8 {
    fn from(r: Routing) -> u8 {
        match r {
            Routing::Neighbour => 0,
            Routing::Single => 1,
            Routing::Broadcast => 2,
        }
    }
}

impl TryFrom<u8> for Routing {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Routing::Neighbour),
            1 => Ok(Routing::Single),
            2 => Ok(Routing::Broadcast),
            other => Err(format!("invalid routing discipline {other}")),
        }
    }
}

/// Four-timestamp block of a time sync exchange
///
/// The initiator sends `t1` alone; the responder fills `t2` (receipt) and
/// `t3` (send). `t4` is stamped by the initiator on arrival and never
/// travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeStamps {
    pub t1: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t2: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t3: Option<u64>,
}

impl TimeStamps {
    /// A fresh request carrying only the initiator's send time
    pub fn request(t1: u64) -> Self {
        Self {
            t1,
            t2: None,
            t3: None,
        }
    }

    /// The responder's reply, echoing `t1`
    pub fn reply(t1: u64, t2: u64, t3: u64) -> Self {
        Self {
            t1,
            t2: Some(t2),
            t3: Some(t3),
        }
    }

    /// Whether both responder stamps are present
    pub fn is_reply(&self) -> bool {
        self.t2.is_some() && self.t3.is_some()
    }

    /// Clock offset and round-trip delay, given the arrival stamp `t4`
    ///
    /// `offset = ((t2 - t1) + (t3 - t4)) / 2`,
    /// `delay = (t4 - t1) - (t3 - t2)`; both signed microseconds.
    pub fn offset_and_delay(&self, t4: u64) -> Option<(i64, i64)> {
        let (t2, t3) = (self.t2?, self.t3?);
        let (t1, t2, t3, t4) = (self.t1 as i64, t2 as i64, t3 as i64, t4 as i64);
        let offset = ((t2 - t1) + (t3 - t4)) / 2;
        let delay = (t4 - t1) - (t3 - t2);
        Some((offset, delay))
    }
}

/// Time sync package body (types 3 and 4)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSyncPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub routing: Routing,
    pub msg: TimeStamps,
}

/// One node of a serialized sub-tree
///
/// The wire form is recursive: `{"nodeId": …, "root": …, "subs": […]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTree {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub root: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subs: Vec<WireTree>,
}

impl WireTree {
    /// A leaf node
    pub fn leaf(node_id: NodeId) -> Self {
        Self {
            node_id,
            root: false,
            subs: Vec::new(),
        }
    }

    /// All node ids in this tree, depth-first
    pub fn ids(&self) -> Vec<NodeId> {
        let mut out = vec![self.node_id];
        let mut stack: Vec<&WireTree> = self.subs.iter().collect();
        while let Some(n) = stack.pop() {
            out.push(n.node_id);
            stack.extend(n.subs.iter());
        }
        out
    }

    /// Whether any node in the tree carries the root flag
    pub fn contains_root(&self) -> bool {
        self.root || self.subs.iter().any(WireTree::contains_root)
    }
}

/// Node sync package body (types 5 and 6)
///
/// `tree` is rooted at the sender and advertises everything reachable
/// through the sender *excluding* the receiving peer's own side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSyncPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub routing: Routing,
    pub tree: WireTree,
}

/// Application payload carrier (types 8 and 9)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPackage {
    pub from: NodeId,
    pub routing: Routing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<NodeId>,
    pub msg: Value,
}

/// Role a bridge advertises in coordination beacons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeRole {
    #[default]
    Primary,
    Secondary,
    Standby,
}

/// Bridge status beacon (type 610)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatusPackage {
    pub from: NodeId,
    pub routing: Routing,
    pub internet_connected: bool,
    pub router_rssi: i16,
    pub router_channel: u8,
    pub uptime_s: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<std::net::Ipv4Addr>,
    pub priority: u8,
    pub role: BridgeRole,
    pub load_pct: u8,
}

/// Bridge election campaign package (type 611)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeElectionPackage {
    pub from: NodeId,
    pub routing: Routing,
    pub router_rssi: i16,
    pub uptime_s: u64,
    pub free_memory: u32,
    pub timestamp_us: u64,
}

/// Bridge takeover announcement (type 612)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeTakeoverPackage {
    pub from: NodeId,
    pub routing: Routing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_bridge: Option<NodeId>,
    pub reason: String,
    pub timestamp_us: u64,
}

/// Multi-bridge coordination beacon (type 613)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeCoordinationPackage {
    pub from: NodeId,
    pub routing: Routing,
    pub priority: u8,
    pub role: BridgeRole,
    pub peer_bridges: Vec<NodeId>,
    pub load_pct: u8,
    pub timestamp_us: u64,
}

/// Wall-clock time from a bridge with a trusted external source (type 614)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtpTimeSyncPackage {
    pub from: NodeId,
    pub routing: Routing,
    pub epoch_ms: i64,
    pub precision_ms: u32,
}

/// Internet egress request, sender to bridge (type 620)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayDataPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub routing: Routing,
    pub message_id: u64,
    pub url: String,
    pub payload: Value,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub deadline_ms: u64,
}

/// Internet egress acknowledgement, bridge to sender (type 621)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAckPackage {
    pub from: NodeId,
    pub dest: NodeId,
    pub routing: Routing,
    pub message_id: u64,
    pub success: bool,
    pub http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opaque application package (any other type in 200–699)
///
/// The full wire object is retained so forwarding is byte-lossless.
#[derive(Debug, Clone, PartialEq)]
pub struct AppPackage {
    pub type_code: u16,
    pub from: NodeId,
    pub routing: Routing,
    pub dest: Option<NodeId>,
    pub raw: Value,
}

/// A parsed wire package, keyed on the integer `type` field
#[derive(Debug, Clone, PartialEq)]
pub enum Package {
    /// Type 3: delay measurement (no offset is applied)
    TimeDelay(TimeSyncPackage),
    /// Type 4: four-timestamp clock synchronisation
    TimeSync(TimeSyncPackage),
    /// Type 5: sub-tree advertisement request
    NodeSyncRequest(NodeSyncPackage),
    /// Type 6: sub-tree advertisement reply
    NodeSyncReply(NodeSyncPackage),
    /// Type 8: flood broadcast payload
    Broadcast(DataPackage),
    /// Type 9: unicast payload
    Single(DataPackage),
    /// Type 610
    BridgeStatus(BridgeStatusPackage),
    /// Type 611
    BridgeElection(BridgeElectionPackage),
    /// Type 612
    BridgeTakeover(BridgeTakeoverPackage),
    /// Type 613
    BridgeCoordination(BridgeCoordinationPackage),
    /// Type 614
    NtpTimeSync(NtpTimeSyncPackage),
    /// Type 620
    GatewayData(GatewayDataPackage),
    /// Type 621
    GatewayAck(GatewayAckPackage),
    /// Any other type in 200–699, passed through opaquely
    App(AppPackage),
}

impl Package {
    pub const TYPE_TIME_DELAY: u16 = 3;
    pub const TYPE_TIME_SYNC: u16 = 4;
    pub const TYPE_NODE_SYNC_REQUEST: u16 = 5;
    pub const TYPE_NODE_SYNC_REPLY: u16 = 6;
    pub const TYPE_CONTROL: u16 = 7;
    pub const TYPE_BROADCAST: u16 = 8;
    pub const TYPE_SINGLE: u16 = 9;
    pub const TYPE_BRIDGE_STATUS: u16 = 610;
    pub const TYPE_BRIDGE_ELECTION: u16 = 611;
    pub const TYPE_BRIDGE_TAKEOVER: u16 = 612;
    pub const TYPE_BRIDGE_COORDINATION: u16 = 613;
    pub const TYPE_NTP_TIME_SYNC: u16 = 614;
    pub const TYPE_GATEWAY_DATA: u16 = 620;
    pub const TYPE_GATEWAY_ACK: u16 = 621;

    /// The integer `type` this package carries on the wire
    pub fn type_code(&self) -> u16 {
        match self {
            Package::TimeDelay(_) => Self::TYPE_TIME_DELAY,
            Package::TimeSync(_) => Self::TYPE_TIME_SYNC,
            Package::NodeSyncRequest(_) => Self::TYPE_NODE_SYNC_REQUEST,
            Package::NodeSyncReply(_) => Self::TYPE_NODE_SYNC_REPLY,
            Package::Broadcast(_) => Self::TYPE_BROADCAST,
            Package::Single(_) => Self::TYPE_SINGLE,
            Package::BridgeStatus(_) => Self::TYPE_BRIDGE_STATUS,
            Package::BridgeElection(_) => Self::TYPE_BRIDGE_ELECTION,
            Package::BridgeTakeover(_) => Self::TYPE_BRIDGE_TAKEOVER,
            Package::BridgeCoordination(_) => Self::TYPE_BRIDGE_COORDINATION,
            Package::NtpTimeSync(_) => Self::TYPE_NTP_TIME_SYNC,
            Package::GatewayData(_) => Self::TYPE_GATEWAY_DATA,
            Package::GatewayAck(_) => Self::TYPE_GATEWAY_ACK,
            Package::App(p) => p.type_code,
        }
    }

    /// Originating node
    pub fn from(&self) -> NodeId {
        match self {
            Package::TimeDelay(p) | Package::TimeSync(p) => p.from,
            Package::NodeSyncRequest(p) | Package::NodeSyncReply(p) => p.from,
            Package::Broadcast(p) | Package::Single(p) => p.from,
            Package::BridgeStatus(p) => p.from,
            Package::BridgeElection(p) => p.from,
            Package::BridgeTakeover(p) => p.from,
            Package::BridgeCoordination(p) => p.from,
            Package::NtpTimeSync(p) => p.from,
            Package::GatewayData(p) => p.from,
            Package::GatewayAck(p) => p.from,
            Package::App(p) => p.from,
        }
    }

    /// Routing discipline
    pub fn routing(&self) -> Routing {
        match self {
            Package::TimeDelay(p) | Package::TimeSync(p) => p.routing,
            Package::NodeSyncRequest(p) | Package::NodeSyncReply(p) => p.routing,
            Package::Broadcast(p) | Package::Single(p) => p.routing,
            Package::BridgeStatus(p) => p.routing,
            Package::BridgeElection(p) => p.routing,
            Package::BridgeTakeover(p) => p.routing,
            Package::BridgeCoordination(p) => p.routing,
            Package::NtpTimeSync(p) => p.routing,
            Package::GatewayData(p) => p.routing,
            Package::GatewayAck(p) => p.routing,
            Package::App(p) => p.routing,
        }
    }

    /// Destination, for single-routed packages
    pub fn dest(&self) -> Option<NodeId> {
        match self {
            Package::TimeDelay(p) | Package::TimeSync(p) => Some(p.dest),
            Package::NodeSyncRequest(p) | Package::NodeSyncReply(p) => Some(p.dest),
            Package::Broadcast(p) | Package::Single(p) => p.dest,
            Package::GatewayData(p) => Some(p.dest),
            Package::GatewayAck(p) => Some(p.dest),
            Package::App(p) => p.dest,
            _ => None,
        }
    }

    /// Whether this package jumps the egress queue
    ///
    /// Clock packages go to the head so queueing delay does not poison the
    /// timestamp exchange.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            Package::TimeDelay(_) | Package::TimeSync(_) | Package::NtpTimeSync(_)
        )
    }

    /// A broadcast wrapping an application payload
    pub fn broadcast(from: NodeId, msg: Value) -> Self {
        Package::Broadcast(DataPackage {
            from,
            routing: Routing::Broadcast,
            dest: None,
            msg,
        })
    }

    /// A unicast wrapping an application payload
    pub fn single(from: NodeId, dest: NodeId, msg: Value) -> Self {
        Package::Single(DataPackage {
            from,
            routing: Routing::Single,
            dest: Some(dest),
            msg,
        })
    }

    /// Serialize to the wire JSON object
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        let mut value = match self {
            Package::TimeDelay(p) | Package::TimeSync(p) => to_object(p),
            Package::NodeSyncRequest(p) | Package::NodeSyncReply(p) => to_object(p),
            Package::Broadcast(p) | Package::Single(p) => to_object(p),
            Package::BridgeStatus(p) => to_object(p),
            Package::BridgeElection(p) => to_object(p),
            Package::BridgeTakeover(p) => to_object(p),
            Package::BridgeCoordination(p) => to_object(p),
            Package::NtpTimeSync(p) => to_object(p),
            Package::GatewayData(p) => to_object(p),
            Package::GatewayAck(p) => to_object(p),
            Package::App(p) => return Ok(p.raw.clone()),
        }?;
        value.insert("type".into(), Value::from(self.type_code()));
        Ok(Value::Object(value))
    }

    /// Serialize to the wire text form (no terminator)
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let value = self.to_value()?;
        serde_json::to_string(&value).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
    }

    /// Parse one frame, enforcing the size limit before the parser runs
    pub fn parse(bytes: &[u8], max_len: usize) -> Result<Self, ProtocolError> {
        if bytes.len() > max_len {
            return Err(ProtocolError::Oversize {
                actual: bytes.len(),
                limit: max_len,
            });
        }
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Interpret a parsed JSON object as a package
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let type_code = value
            .get("type")
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MissingField("type"))?;

        match type_code {
            t if t == Self::TYPE_TIME_DELAY as i64 => Ok(Package::TimeDelay(from_object(value)?)),
            t if t == Self::TYPE_TIME_SYNC as i64 => Ok(Package::TimeSync(from_object(value)?)),
            t if t == Self::TYPE_NODE_SYNC_REQUEST as i64 => {
                Ok(Package::NodeSyncRequest(from_object(value)?))
            }
            t if t == Self::TYPE_NODE_SYNC_REPLY as i64 => {
                Ok(Package::NodeSyncReply(from_object(value)?))
            }
            t if t == Self::TYPE_CONTROL as i64 => {
                Err(ProtocolError::DeprecatedType(Self::TYPE_CONTROL))
            }
            t if t == Self::TYPE_BROADCAST as i64 => Ok(Package::Broadcast(from_object(value)?)),
            t if t == Self::TYPE_SINGLE as i64 => Ok(Package::Single(from_object(value)?)),
            t if t == Self::TYPE_BRIDGE_STATUS as i64 => {
                Ok(Package::BridgeStatus(from_object(value)?))
            }
            t if t == Self::TYPE_BRIDGE_ELECTION as i64 => {
                Ok(Package::BridgeElection(from_object(value)?))
            }
            t if t == Self::TYPE_BRIDGE_TAKEOVER as i64 => {
                Ok(Package::BridgeTakeover(from_object(value)?))
            }
            t if t == Self::TYPE_BRIDGE_COORDINATION as i64 => {
                Ok(Package::BridgeCoordination(from_object(value)?))
            }
            t if t == Self::TYPE_NTP_TIME_SYNC as i64 => {
                Ok(Package::NtpTimeSync(from_object(value)?))
            }
            t if t == Self::TYPE_GATEWAY_DATA as i64 => {
                Ok(Package::GatewayData(from_object(value)?))
            }
            t if t == Self::TYPE_GATEWAY_ACK as i64 => Ok(Package::GatewayAck(from_object(value)?)),
            t if (*APP_TYPE_RANGE.start() as i64..=*APP_TYPE_RANGE.end() as i64).contains(&t) => {
                Ok(Package::App(AppPackage::from_raw(t as u16, value)?))
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

impl AppPackage {
    fn from_raw(type_code: u16, raw: Value) -> Result<Self, ProtocolError> {
        let from = raw
            .get("from")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingField("from"))?;
        let routing = raw
            .get("routing")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingField("routing"))?;
        let routing =
            Routing::try_from(routing as u8).map_err(|reason| ProtocolError::InvalidField {
                field: "routing",
                reason,
            })?;
        let dest = raw.get("dest").and_then(Value::as_u64);
        if routing == Routing::Single && dest.is_none() {
            return Err(ProtocolError::MissingField("dest"));
        }
        Ok(Self {
            type_code,
            from: NodeId(from as u32),
            routing,
            dest: dest.map(|d| NodeId(d as u32)),
            raw,
        })
    }
}

fn to_object<T: Serialize>(p: &T) -> Result<serde_json::Map<String, Value>, ProtocolError> {
    match serde_json::to_value(p) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ProtocolError::MalformedJson(
            "package did not serialize to an object".into(),
        )),
        Err(e) => Err(ProtocolError::MalformedJson(e.to_string())),
    }
}

fn from_object<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedJson(e.to_string()))
}
