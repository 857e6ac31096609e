use std::collections::BTreeMap;

use ipnet::IpNet;

use crate::rib::{Nexthop, RibEntry, RouteType};

pub const IFF_UP: u32 = 0x1;
pub const IFF_RUNNING: u32 = 0x40;

/// Link state as reported by the kernel.
#[derive(Debug, Clone)]
pub struct LinkUpdate {
    pub index: u32,
    pub name: String,
    pub flags: u32,
    pub mtu: u32,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub flags: u32,
    pub metric: u32,
    pub mtu: u32,
    /// Locally configured addresses, in configuration order.
    pub addrs: Vec<IpNet>,
}

impl Interface {
    fn from_update(update: LinkUpdate) -> Interface {
        Interface {
            index: update.index,
            name: update.name,
            flags: update.flags,
            metric: 1,
            mtu: update.mtu,
            addrs: Vec::new(),
        }
    }

    /// Administratively up and with a carrier.
    pub fn is_operative(&self) -> bool {
        self.flags & IFF_UP != 0 && self.flags & IFF_RUNNING != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    New,
    Up,
    Down,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct InterfaceTable {
    map: BTreeMap<u32, Interface>,
}

impl InterfaceTable {
    pub fn new() -> InterfaceTable {
        InterfaceTable::default()
    }

    pub fn get(&self, index: u32) -> Option<&Interface> {
        self.map.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.map.values()
    }

    /// Fold a kernel link report in, reporting the operative-state
    /// transition it caused.
    pub fn upsert(&mut self, update: LinkUpdate) -> LinkTransition {
        match self.map.get_mut(&update.index) {
            None => {
                self.map.insert(update.index, Interface::from_update(update));
                LinkTransition::New
            }
            Some(iface) => {
                let was = iface.is_operative();
                iface.name = update.name;
                iface.flags = update.flags;
                iface.mtu = update.mtu;
                match (was, iface.is_operative()) {
                    (false, true) => LinkTransition::Up,
                    (true, false) => LinkTransition::Down,
                    _ => LinkTransition::Unchanged,
                }
            }
        }
    }

    pub fn remove(&mut self, index: u32) -> Option<Interface> {
        self.map.remove(&index)
    }

    /// Record an address; false if it was already present.
    pub fn add_address(&mut self, index: u32, addr: IpNet) -> bool {
        let Some(iface) = self.map.get_mut(&index) else {
            return false;
        };
        if iface.addrs.contains(&addr) {
            return false;
        }
        iface.addrs.push(addr);
        true
    }

    pub fn remove_address(&mut self, index: u32, addr: IpNet) -> bool {
        let Some(iface) = self.map.get_mut(&index) else {
            return false;
        };
        let before = iface.addrs.len();
        iface.addrs.retain(|a| *a != addr);
        iface.addrs.len() != before
    }
}

/// The CONNECTED route an interface address implies. The unspecified
/// network is a tunnel placeholder: the address is tracked but no route is
/// generated for it.
pub fn connected_route(ifindex: u32, addr: IpNet, table: u32) -> Option<(IpNet, RibEntry)> {
    let network = addr.trunc();
    if network.addr().is_unspecified() {
        return None;
    }
    let entry = RibEntry::new(RouteType::Connected, table, Nexthop::ifindex(ifindex));
    Some((network, entry))
}
