//! Simulated WiFi radio
//!
//! A [`SimRadio`] is a handle over shared state, so tests can clone one
//! before handing it to a node and later inspect or manipulate it.
//! Events (scan results, association changes) queue up and are delivered
//! on the node's next `poll_events` drain, one tick later, like a real
//! driver callback funnelled through an inbox.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::rc::Rc;

use canopy_core::{ApRecord, NodeId, Radio, RadioError, RadioEvent};

use crate::airspace::{Airspace, DEFAULT_RSSI};

struct RadioInner {
    mac: [u8; 6],
    events: VecDeque<RadioEvent>,
    ap: Option<(String, u8)>,
    ap_enabled: bool,
    associated_to: Option<ApRecord>,
    local_ip: Option<Ipv4Addr>,
}

/// Simulated radio handle
#[derive(Clone)]
pub struct SimRadio {
    airspace: Airspace,
    inner: Rc<RefCell<RadioInner>>,
}

impl SimRadio {
    pub fn new(airspace: Airspace, mac: [u8; 6]) -> Self {
        Self {
            airspace,
            inner: Rc::new(RefCell::new(RadioInner {
                mac,
                events: VecDeque::new(),
                ap: None,
                ap_enabled: true,
                associated_to: None,
                local_ip: None,
            })),
        }
    }

    /// Force the association down, as if the AP kicked us
    pub fn drop_association(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.associated_to.take().is_some() {
            inner.local_ip = None;
            inner.events.push_back(RadioEvent::StaDisconnected);
        }
    }

    pub fn associated_bssid(&self) -> Option<[u8; 6]> {
        self.inner.borrow().associated_to.as_ref().map(|ap| ap.bssid)
    }

    // Station address inside the AP's /24 (the AP holds .1).
    fn ip_for(record: &ApRecord) -> Ipv4Addr {
        let [a, b, c, _] = NodeId::from_mac(&record.bssid).ap_ip().octets();
        Ipv4Addr::new(a, b, c, 2)
    }
}

impl Radio for SimRadio {
    fn start_ap(
        &mut self,
        ssid: &str,
        _password: &str,
        channel: u8,
        _hidden: bool,
        _max_conn: u8,
    ) -> Result<(), RadioError> {
        let mac = self.inner.borrow().mac;
        self.airspace.register_ap(ApRecord {
            ssid: ssid.into(),
            bssid: mac,
            channel,
            rssi: DEFAULT_RSSI,
        });
        let mut inner = self.inner.borrow_mut();
        inner.ap = Some((ssid.into(), channel));
        inner.ap_enabled = true;
        inner.events.push_back(RadioEvent::ApStarted);
        Ok(())
    }

    fn stop_ap(&mut self) {
        let mut inner = self.inner.borrow_mut();
        if inner.ap.take().is_some() {
            self.airspace.remove_ap(inner.mac);
            inner.events.push_back(RadioEvent::ApStopped);
        }
    }

    fn enable_ap(&mut self, enabled: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.ap_enabled = enabled;
        if let Some((ssid, channel)) = inner.ap.clone() {
            if enabled {
                self.airspace.register_ap(ApRecord {
                    ssid,
                    bssid: inner.mac,
                    channel,
                    rssi: DEFAULT_RSSI,
                });
            } else {
                self.airspace.remove_ap(inner.mac);
            }
        }
    }

    fn request_scan(&mut self, _all_channels: bool) -> Result<(), RadioError> {
        let mut inner = self.inner.borrow_mut();
        let visible = self.airspace.visible_to(inner.mac);
        inner.events.push_back(RadioEvent::ScanDone(visible));
        Ok(())
    }

    fn associate(
        &mut self,
        ssid: &str,
        _password: &str,
        _channel: u8,
        bssid: Option<[u8; 6]>,
    ) -> Result<(), RadioError> {
        let mut inner = self.inner.borrow_mut();
        let target = self
            .airspace
            .visible_to(inner.mac)
            .into_iter()
            .filter(|ap| ap.ssid == ssid)
            .find(|ap| bssid.is_none_or(|b| b == ap.bssid));
        match target {
            Some(record) => {
                inner.local_ip = Some(Self::ip_for(&record));
                inner.associated_to = Some(record);
                inner.events.push_back(RadioEvent::StaConnected);
            }
            None => {
                inner.associated_to = None;
                inner.local_ip = None;
                inner.events.push_back(RadioEvent::StaDisconnected);
            }
        }
        Ok(())
    }

    fn disassociate(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.associated_to = None;
        inner.local_ip = None;
    }

    fn rssi(&self) -> Option<i16> {
        self.inner.borrow().associated_to.as_ref().map(|ap| ap.rssi)
    }

    fn is_associated(&self) -> bool {
        self.inner.borrow().associated_to.is_some()
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.inner.borrow().local_ip
    }

    fn mac(&self) -> [u8; 6] {
        self.inner.borrow().mac
    }

    fn poll_events(&mut self) -> Vec<RadioEvent> {
        self.inner.borrow_mut().events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> [u8; 6] {
        [2, 0, 0, 0, 0, n]
    }

    #[test]
    fn test_scan_delivers_event() {
        let air = Airspace::new();
        air.add_router_ap("canopy", mac(5), 6, -40);
        let mut radio = SimRadio::new(air, mac(1));

        radio.request_scan(true).unwrap();
        let events = radio.poll_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            RadioEvent::ScanDone(aps) => {
                assert_eq!(aps.len(), 1);
                assert_eq!(aps[0].bssid, mac(5));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_associate_to_mesh_ap_assigns_subnet_ip() {
        let air = Airspace::new();
        air.add_router_ap("canopy", mac(5), 6, -40);
        let mut radio = SimRadio::new(air, mac(1));

        radio.associate("canopy", "pwd", 6, Some(mac(5))).unwrap();
        assert!(matches!(radio.poll_events()[0], RadioEvent::StaConnected));
        assert!(radio.is_associated());
        let expected = {
            let [a, b, c, _] = NodeId::from_mac(&mac(5)).ap_ip().octets();
            Ipv4Addr::new(a, b, c, 2)
        };
        assert_eq!(radio.local_ip(), Some(expected));
        assert_eq!(radio.rssi(), Some(-40));
    }

    #[test]
    fn test_associate_failure_when_invisible() {
        let air = Airspace::new();
        let mut radio = SimRadio::new(air, mac(1));
        radio.associate("nothing", "pwd", 1, None).unwrap();
        assert!(matches!(
            radio.poll_events()[0],
            RadioEvent::StaDisconnected
        ));
        assert!(!radio.is_associated());
    }

    #[test]
    fn test_start_stop_ap_registers_in_airspace() {
        let air = Airspace::new();
        let mut radio = SimRadio::new(air.clone(), mac(1));
        radio.start_ap("canopy", "pwd", 6, false, 10).unwrap();
        assert!(air.has_ap(mac(1)));
        radio.stop_ap();
        assert!(!air.has_ap(mac(1)));
    }

    #[test]
    fn test_drop_association_emits_event() {
        let air = Airspace::new();
        air.add_router_ap("canopy", mac(5), 6, -40);
        let mut radio = SimRadio::new(air, mac(1));
        radio.associate("canopy", "pwd", 6, None).unwrap();
        radio.poll_events();

        let handle = radio.clone();
        handle.drop_association();
        assert!(matches!(
            radio.poll_events()[0],
            RadioEvent::StaDisconnected
        ));
        assert!(!radio.is_associated());
    }
}
