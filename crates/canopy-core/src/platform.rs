//! Platform seams
//!
//! The mesh core is platform-independent: the WiFi radio, the TCP stack,
//! the HTTP client, and the clock are traits implemented by the target
//! (ESP-style SDK, a desktop shim, or the simulation crate).
//!
//! Event sources are modelled as inboxes: the platform buffers whatever
//! its driver callbacks or interrupt handlers produce, and the mesh drains
//! them with `poll_events()` on its own cooperative tick. Any cross-thread
//! hand-off lives entirely inside the platform implementation; mesh state
//! is only ever touched from the mesh task.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{GatewayError, RadioError, TransportError};
use crate::ident::ApRecord;

/// Opaque handle to a platform socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("sock#{_0}")]
pub struct SocketHandle(pub u64);

/// Ticket for an in-flight connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectToken(pub u64);

/// Events produced by the WiFi radio
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// A scan completed with the visible access points
    ScanDone(Vec<ApRecord>),
    /// The station interface associated
    StaConnected,
    /// The station interface lost its association
    StaDisconnected,
    /// The soft AP came up
    ApStarted,
    /// The soft AP went down
    ApStopped,
}

/// WiFi radio driver
pub trait Radio {
    fn start_ap(
        &mut self,
        ssid: &str,
        password: &str,
        channel: u8,
        hidden: bool,
        max_conn: u8,
    ) -> Result<(), RadioError>;

    fn stop_ap(&mut self);

    fn enable_ap(&mut self, enabled: bool);

    /// Kick off an asynchronous scan; completion arrives as
    /// [`RadioEvent::ScanDone`].
    fn request_scan(&mut self, all_channels: bool) -> Result<(), RadioError>;

    fn associate(
        &mut self,
        ssid: &str,
        password: &str,
        channel: u8,
        bssid: Option<[u8; 6]>,
    ) -> Result<(), RadioError>;

    fn disassociate(&mut self);

    /// Signal strength of the current station association
    fn rssi(&self) -> Option<i16>;

    fn is_associated(&self) -> bool;

    /// IP assigned to the station interface, if associated
    fn local_ip(&self) -> Option<Ipv4Addr>;

    /// The radio's hardware address (node identity derives from it)
    fn mac(&self) -> [u8; 6];

    fn poll_events(&mut self) -> Vec<RadioEvent>;
}

/// Events produced by the TCP stack
#[derive(Debug, Clone)]
pub enum TcpEvent {
    /// An inbound connection was accepted on the listening port
    Accepted {
        socket: SocketHandle,
        remote_ip: Ipv4Addr,
    },
    /// An outbound connect attempt succeeded
    Connected {
        token: ConnectToken,
        socket: SocketHandle,
    },
    /// An outbound connect attempt failed
    ConnectFailed { token: ConnectToken, error: String },
    /// Bytes arrived on a socket
    Data { socket: SocketHandle, data: Bytes },
    /// The previously submitted write completed
    WriteDone { socket: SocketHandle },
    /// The socket errored
    Error { socket: SocketHandle, error: String },
    /// The remote end closed the socket
    Disconnected { socket: SocketHandle },
}

/// Raw TCP-like transport
///
/// Socket teardown is two-phased: `close` (or `abort` for a reset) ends
/// traffic, and `free` releases the handle. `free` is only ever called
/// from the deferred-release path, and `abort` is never called
/// synchronously before a deferred free.
pub trait TcpStack {
    fn listen(&mut self, port: u16) -> Result<(), TransportError>;

    fn connect(&mut self, ip: Ipv4Addr, port: u16) -> Result<ConnectToken, TransportError>;

    /// Submit one write; completion arrives as [`TcpEvent::WriteDone`].
    /// At most one write is outstanding per socket.
    fn write(&mut self, socket: SocketHandle, data: &[u8]) -> Result<(), TransportError>;

    fn close(&mut self, socket: SocketHandle, graceful: bool);

    fn abort(&mut self, socket: SocketHandle);

    /// Release the handle. Must be the last call for this socket.
    fn free(&mut self, socket: SocketHandle);

    fn poll_events(&mut self) -> Vec<TcpEvent>;
}

/// Response from the platform HTTP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Blocking HTTP(S) client, used only by bridge nodes
///
/// The call runs to completion inside the bridge's package handler; the
/// mesh suspends its link-idle timeouts for the duration (see the gateway
/// module), so the implementation may take up to `timeout`.
pub trait HttpClient {
    fn get(&mut self, url: &str, timeout: Duration) -> Result<HttpResponse, GatewayError>;

    fn post(
        &mut self,
        url: &str,
        body: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, GatewayError>;
}

/// Monotonic microsecond clock
///
/// `now_us` never goes backwards. All mesh timing (timeouts, scheduler,
/// time sync) is expressed against this clock.
pub trait MonotonicClock {
    fn now_us(&self) -> u64;
}

/// Real clock backed by [`Instant`]
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Hand-driven clock for deterministic tests
///
/// Clones share the same underlying time, so a test can hold one handle
/// while the mesh under test holds another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn set_us(&self, now_us: u64) {
        self.0.store(now_us, Ordering::Relaxed);
    }
}

impl MonotonicClock for ManualClock {
    fn now_us(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Optional battery-backed real-time clock
pub trait Rtc {
    fn read_epoch_ms(&mut self) -> Option<i64>;

    fn write_epoch_ms(&mut self, epoch_ms: i64);
}

/// Convert an epoch-milliseconds reading to a UTC datetime
pub fn epoch_ms_to_utc(epoch_ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms)
}
