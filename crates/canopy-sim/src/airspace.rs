//! Shared radio environment
//!
//! All simulated radios see the same airspace. Mesh APs register when a
//! node starts its soft AP; router APs are added by the test. Visibility
//! and signal strength can be shaped per (viewer, AP) link to build
//! line or star topologies.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use canopy_core::ApRecord;

/// Signal strength reported when no override is set
pub const DEFAULT_RSSI: i16 = -60;

#[derive(Default)]
struct AirInner {
    aps: HashMap<[u8; 6], ApRecord>,
    link_rssi: HashMap<([u8; 6], [u8; 6]), i16>,
    hidden: HashSet<([u8; 6], [u8; 6])>,
}

/// Shared airspace handle
#[derive(Clone, Default)]
pub struct Airspace {
    inner: Rc<RefCell<AirInner>>,
}

impl Airspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a (mesh) access point
    pub fn register_ap(&self, record: ApRecord) {
        self.inner.borrow_mut().aps.insert(record.bssid, record);
    }

    /// Add an external router AP
    pub fn add_router_ap(&self, ssid: &str, bssid: [u8; 6], channel: u8, rssi: i16) {
        self.register_ap(ApRecord {
            ssid: ssid.into(),
            bssid,
            channel,
            rssi,
        });
    }

    /// Take an AP off the air
    pub fn remove_ap(&self, bssid: [u8; 6]) {
        self.inner.borrow_mut().aps.remove(&bssid);
    }

    pub fn has_ap(&self, bssid: [u8; 6]) -> bool {
        self.inner.borrow().aps.contains_key(&bssid)
    }

    /// Shape the signal one viewer sees from one AP
    pub fn set_link_rssi(&self, viewer: [u8; 6], bssid: [u8; 6], rssi: i16) {
        self.inner.borrow_mut().link_rssi.insert((viewer, bssid), rssi);
    }

    /// Hide or reveal an AP for one viewer (out of radio range)
    pub fn set_link_visible(&self, viewer: [u8; 6], bssid: [u8; 6], visible: bool) {
        let mut inner = self.inner.borrow_mut();
        if visible {
            inner.hidden.remove(&(viewer, bssid));
        } else {
            inner.hidden.insert((viewer, bssid));
        }
    }

    /// What a scan from `viewer` returns
    pub fn visible_to(&self, viewer: [u8; 6]) -> Vec<ApRecord> {
        let inner = self.inner.borrow();
        let mut out: Vec<ApRecord> = inner
            .aps
            .values()
            .filter(|ap| ap.bssid != viewer)
            .filter(|ap| !inner.hidden.contains(&(viewer, ap.bssid)))
            .map(|ap| {
                let mut record = ap.clone();
                if let Some(rssi) = inner.link_rssi.get(&(viewer, ap.bssid)) {
                    record.rssi = *rssi;
                }
                record
            })
            .collect();
        out.sort_by_key(|ap| ap.bssid);
        out
    }
}
