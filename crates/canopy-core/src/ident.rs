//! Node identity
//!
//! Every Canopy node is identified by a [`NodeId`]: an unsigned 32-bit
//! value derived from the chip's hardware MAC. Ids are globally unique by
//! assumption and `0` is never a valid node.
//!
//! The id also determines the node's access-point subnet: a node serving
//! the mesh SSID addresses itself as `10.(id>>8 & 0xFF).(id & 0xFF).1/24`,
//! which lets a joining station find its parent's TCP endpoint without any
//! discovery protocol beyond the WiFi scan.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// 32-bit mesh node identity
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Derive a node id from a hardware MAC address
    ///
    /// Uses the low four bytes, which carry the vendor serial and are
    /// unique across one vendor's chips.
    pub fn from_mac(mac: &[u8; 6]) -> Self {
        Self(u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]))
    }

    /// Parse an id from bytes (big-endian u32)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let arr: [u8; 4] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength {
                expected: 4,
                actual: bytes.len(),
            })?;
        Ok(Self(u32::from_be_bytes(arr)))
    }

    /// Whether this is a valid (nonzero) node id
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// The IP this node uses when serving the mesh access point
    pub fn ap_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(10, (self.0 >> 8 & 0xFF) as u8, (self.0 & 0xFF) as u8, 1)
    }

    /// Recover a node id from a mesh access-point IP
    ///
    /// Only addresses of the exact form `10.x.y.1` are mesh APs. The
    /// recovered id carries the low 16 bits; the full 32-bit id is learned
    /// once node sync completes on the TCP link.
    pub fn from_ap_ip(ip: Ipv4Addr) -> Option<Self> {
        let [a, x, y, d] = ip.octets();
        if a == 10 && d == 1 {
            Some(Self((x as u32) << 8 | y as u32))
        } else {
            None
        }
    }

    /// Whether `other` matches this id in the 16 bits an AP IP can carry
    pub fn matches_ap_id(&self, other: NodeId) -> bool {
        self.0 & 0xFFFF == other.0 & 0xFFFF
    }

    /// Short display form for logging
    pub fn short_id(&self) -> String {
        format!("{:08x}", self.0)
    }
}

/// Identity of one live peer connection within the mesh
///
/// Allocated by the connection set, never reused within a process run.
/// Distinct from [`NodeId`]: a connection exists before node sync reveals
/// who is on the other end.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display,
)]
#[display("conn#{_0}")]
pub struct ConnId(pub u64);

/// An AP record as seen by the radio during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApRecord {
    /// Network name
    pub ssid: String,
    /// Access point hardware address
    pub bssid: [u8; 6],
    /// WiFi channel (1..=14)
    pub channel: u8,
    /// Received signal strength in dBm
    pub rssi: i16,
}

impl ApRecord {
    /// The node id implied by the AP's hardware address
    ///
    /// A mesh AP beacons from the same radio whose MAC derives the node's
    /// id, so a scan result alone identifies the candidate parent.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_mac(&self.bssid)
    }

    /// BSSID in the conventional colon-separated hex form
    pub fn bssid_string(&self) -> String {
        self.bssid
            .iter()
            .map(|b| hex::encode([*b]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for ApRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] ch{} {}dBm",
            self.ssid,
            self.bssid_string(),
            self.channel,
            self.rssi
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_mac_uses_low_four_bytes() {
        let mac = [0xAC, 0x67, 0x12, 0x34, 0x56, 0x78];
        assert_eq!(NodeId::from_mac(&mac), NodeId(0x12345678));
    }

    #[test]
    fn test_ap_ip_round_trip_low_16_bits() {
        let id = NodeId(0x12345678);
        let ip = id.ap_ip();
        assert_eq!(ip, Ipv4Addr::new(10, 0x56, 0x78, 1));

        let recovered = NodeId::from_ap_ip(ip).unwrap();
        assert_eq!(recovered, NodeId(0x5678));
        assert!(id.matches_ap_id(recovered));
    }

    #[test]
    fn test_from_ap_ip_rejects_non_mesh_forms() {
        assert!(NodeId::from_ap_ip(Ipv4Addr::new(192, 168, 1, 1)).is_none());
        assert!(NodeId::from_ap_ip(Ipv4Addr::new(10, 0, 5, 2)).is_none());
        assert!(NodeId::from_ap_ip(Ipv4Addr::new(10, 0, 5, 1)).is_some());
    }

    #[test]
    fn test_zero_is_invalid() {
        assert!(!NodeId(0).is_valid());
        assert!(NodeId(1).is_valid());
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(
            NodeId::from_bytes(&[0x12, 0x34, 0x56, 0x78]).unwrap(),
            NodeId(0x12345678)
        );
        assert!(NodeId::from_bytes(&[1, 2]).is_err());
    }

    #[test]
    fn test_ap_record_node_id() {
        let record = ApRecord {
            ssid: "canopy".into(),
            bssid: [0xAC, 0x67, 0x00, 0x00, 0x01, 0x02],
            channel: 6,
            rssi: -60,
        };
        assert_eq!(record.node_id(), NodeId(0x0102));
        assert_eq!(record.bssid_string(), "ac:67:00:00:01:02");
    }
}
