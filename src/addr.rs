//! Interface address tracking for the engine's per-interface address slots.

use std::net::IpAddr;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use crate::hw::AddressFamily;
use crate::manager::OffloadManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEventKind {
    Up,
    Down,
}

/// An address was added to or removed from a host interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressEvent {
    pub kind: AddressEventKind,
    pub interface: u32,
    pub addr: IpAddr,
    pub vlan: Option<u16>,
    pub mac: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Assigned {
    addr: IpAddr,
    vlan: Option<u16>,
    mac: [u8; 6],
}

/// Addresses currently assigned to offload interfaces, oldest first.
#[derive(Debug, Default)]
pub(crate) struct AddressTable {
    interfaces: Mutex<FxHashMap<u32, Vec<Assigned>>>,
}

impl AddressTable {
    pub(crate) fn addresses(&self, interface: u32) -> Vec<IpAddr> {
        self.interfaces
            .lock()
            .get(&interface)
            .map(|v| v.iter().map(|a| a.addr).collect())
            .unwrap_or_default()
    }
}

impl OffloadManager {
    /// Reprograms the engine's address slot of the affected interface.
    /// Returns false if the interface is not attached to the engine.
    pub fn on_address_event(&self, event: AddressEvent) -> bool {
        if !self.hw.owns_interface(event.interface) {
            log::trace!(
                target: "inet-toe/addr",
                "ignoring address event on foreign interface {}",
                event.interface
            );
            return false;
        }

        let family = AddressFamily::of(&event.addr);
        let mut interfaces = self.addrs.interfaces.lock();
        let assigned = interfaces.entry(event.interface).or_default();

        match event.kind {
            AddressEventKind::Up => {
                assigned.retain(|a| a.addr != event.addr);
                assigned.push(Assigned {
                    addr: event.addr,
                    vlan: event.vlan,
                    mac: event.mac,
                });
                log::debug!(
                    target: "inet-toe/addr",
                    "interface {} address {} up",
                    event.interface,
                    event.addr
                );
                self.hw
                    .set_address(event.interface, event.addr, event.vlan, event.mac);
            }
            AddressEventKind::Down => {
                assigned.retain(|a| a.addr != event.addr);
                self.hw.clear_address(event.interface, family);

                match assigned
                    .iter()
                    .find(|a| AddressFamily::of(&a.addr) == family)
                {
                    Some(next) => {
                        log::debug!(
                            target: "inet-toe/addr",
                            "interface {} address {} down, falling back to {}",
                            event.interface,
                            event.addr,
                            next.addr
                        );
                        self.hw
                            .set_address(event.interface, next.addr, next.vlan, next.mac);
                    }
                    None => {
                        log::debug!(
                            target: "inet-toe/addr",
                            "interface {} lost its last {family:?} address",
                            event.interface
                        );
                    }
                }
            }
        }
        true
    }

    /// Addresses currently programmed for `interface`, oldest first.
    pub fn interface_addresses(&self, interface: u32) -> Vec<IpAddr> {
        self.addrs.addresses(interface)
    }
}
