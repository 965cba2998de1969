//! Error types for the Canopy mesh

use thiserror::Error;

use crate::ident::NodeId;

/// Top-level error type for Canopy
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Node is not initialized")]
    NotInitialized,

    #[error("Node is already initialized")]
    AlreadyInitialized,
}

/// Errors related to node identity
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Invalid id length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Zero is not a valid node id")]
    ZeroId,
}

/// Errors related to the wire protocol
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Frame of {actual} bytes exceeds the {limit} byte limit")]
    Oversize { actual: usize, limit: usize },

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("Unknown package type: {0}")]
    UnknownType(i64),

    #[error("Package type {0} is deprecated")]
    DeprecatedType(u16),
}

/// Errors related to the TCP transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Listen failed on port {port}: {reason}")]
    ListenFailed { port: u16, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Egress queue full")]
    EgressFull,

    #[error("Unknown socket handle")]
    UnknownSocket,
}

/// Errors related to the WiFi radio
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Association failed: {0}")]
    AssociateFailed(String),

    #[error("Access point setup failed: {0}")]
    ApFailed(String),

    #[error("Not associated")]
    NotAssociated,
}

/// Errors related to routing
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("No route to node {0}")]
    UnreachablePeer(NodeId),

    #[error("Duplicate node id {0} advertised by two connections")]
    DuplicateNode(NodeId),

    #[error("Connection {0} not found")]
    UnknownConnection(u64),

    #[error("Sub-tree contains our own id {0}")]
    SelfInSubTree(NodeId),
}

/// Errors related to the internet gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No bridge available")]
    NoBridge,

    #[error("Request {0} not found")]
    UnknownRequest(u64),

    #[error("HTTP transport failed: {0}")]
    Http(String),

    #[error("Request timed out")]
    Timeout,
}

/// Errors related to the offline message queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is full and nothing could be evicted")]
    Full,
}

/// Result type alias for Canopy operations
pub type MeshResult<T> = Result<T, MeshError>;
