//! BridgeLink Shared Types
//!
//! This crate provides the transport-agnostic connection types and the pure
//! connection state machine shared by the BridgeLink connectivity core.

pub mod state_machine;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters for the connectivity core
pub mod timing {
    /// Connection attempt timeout in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Bound on graceful disconnect before the state is forced to Idle
    pub const DISCONNECT_TIMEOUT_MS: u64 = 3000;

    /// Delay before a failed attempt re-arms discovery
    pub const RETRY_BACKOFF_MS: u64 = 2000;

    /// Longer delay used when the transport itself is unavailable
    pub const UNAVAILABLE_BACKOFF_MS: u64 = 10000;

    /// Initial delay before restarting a failed discovery session
    pub const DISCOVERY_RETRY_MS: u64 = 1000;

    /// Maximum delay between discovery restart attempts
    pub const DISCOVERY_MAX_RETRY_MS: u64 = 30000;
}

/// The two transports a bridge can be reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Local IP network (mDNS discovery, TCP connection)
    Network,
    /// Bluetooth Low Energy
    Ble,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Network => write!(f, "Network"),
            TransportKind::Ble => write!(f, "BLE"),
        }
    }
}

/// An addressable bridge target: a network host or a BLE peripheral.
///
/// Two endpoints are equal when transport and address match; the discovery
/// timestamp is metadata and does not participate in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Which transport this endpoint is reachable over
    pub transport: TransportKind,
    /// Host:port for network endpoints, MAC address for BLE peripherals
    pub address: String,
    /// When this endpoint was discovered (ms since Unix epoch)
    pub discovered_at_ms: u64,
}

impl Endpoint {
    /// Create an endpoint discovered now
    pub fn new(transport: TransportKind, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
            discovered_at_ms: now_ms(),
        }
    }

    /// Create a network endpoint
    pub fn network(address: impl Into<String>) -> Self {
        Self::new(TransportKind::Network, address)
    }

    /// Create a BLE endpoint
    pub fn ble(address: impl Into<String>) -> Self {
        Self::new(TransportKind::Ble, address)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.transport == other.transport && self.address == other.address
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.transport.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.transport, self.address)
    }
}

/// Why a connection attempt failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    /// The attempt did not complete within the connect timeout
    #[error("connection attempt timed out")]
    Timeout,
    /// The bridge actively refused the connection
    #[error("connection refused by bridge")]
    Refused,
    /// The transport itself is unusable (radio off, no network, no adapter)
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    /// The handshake failed for a reason other than the above
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl FailureReason {
    /// Whether this failure warrants the longer retry backoff
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(self, FailureReason::TransportUnavailable(_))
    }
}

/// Caller-facing error for rejected connection requests
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// A non-idle attempt is already in flight for this transport
    #[error("a connection attempt is already in flight for this transport")]
    AlreadyConnecting,
    /// The connection driver task is gone (only during shutdown)
    #[error("connection driver is no longer running")]
    DriverGone,
}

/// Connection status of one transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing in progress
    Idle,
    /// Discovery is running, no attempt in flight
    Discovering,
    /// A connection attempt to the endpoint is in flight
    Connecting(Endpoint),
    /// A live connection to the endpoint is established
    Connected(Endpoint),
    /// The last attempt failed; discovery re-arms after backoff
    Failed(FailureReason),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, ConnectionState::Idle)
    }

    /// The endpoint currently connected or being connected to, if any
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            ConnectionState::Connecting(e) | ConnectionState::Connected(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Discovering => write!(f, "discovering"),
            ConnectionState::Connecting(e) => write!(f, "connecting to {}", e),
            ConnectionState::Connected(e) => write!(f, "connected to {}", e),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A transient discovery notification; never persisted
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A bridge endpoint became reachable
    EndpointFound(Endpoint),
    /// A previously found endpoint is no longer reachable
    EndpointLost(Endpoint),
    /// The discovery backend is unusable and will be retried
    Degraded {
        transport: TransportKind,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_equality_ignores_timestamp() {
        let mut a = Endpoint::network("192.168.1.10:8080");
        let b = Endpoint::network("192.168.1.10:8080");
        a.discovered_at_ms = 0;
        assert_eq!(a, b);
    }

    #[test]
    fn test_endpoint_distinct_by_transport() {
        let a = Endpoint::network("aa:bb:cc:dd:ee:ff");
        let b = Endpoint::ble("aa:bb:cc:dd:ee:ff");
        assert_ne!(a, b);
    }

    #[test]
    fn test_endpoint_serde_roundtrip() {
        let e = Endpoint::network("bridge.local:8080");
        let json = serde_json::to_string(&e).unwrap();
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(e, back);
        assert_eq!(e.discovered_at_ms, back.discovered_at_ms);
    }

    #[test]
    fn test_failure_backoff_classification() {
        assert!(FailureReason::TransportUnavailable("radio off".into())
            .is_transport_unavailable());
        assert!(!FailureReason::Timeout.is_transport_unavailable());
        assert!(!FailureReason::Refused.is_transport_unavailable());
    }
}
