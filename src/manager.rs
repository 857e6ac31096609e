use std::net::IpAddr;
use std::sync::Arc;

use foundations::telemetry::log;
use ipnet::IpNet;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::client::{ClientId, ClientRegistry};
use crate::fib::FibHandle;
use crate::interface::{self, InterfaceTable, LinkTransition, LinkUpdate};
use crate::message::{self, command};
use crate::redistribute;
use crate::rib::{Nexthop, RibEntry, RouteFlags, RouteType};
use crate::table::{RouteSelector, RouteTable};

/// Everything that mutates routing state arrives here; clients and the
/// netlink listener only produce messages.
#[derive(Debug)]
pub enum RibMessage {
    ClientConnect {
        id: ClientId,
    },
    ClientDisconnect {
        id: ClientId,
    },
    RouteAdd {
        prefix: IpNet,
        rtype: RouteType,
        flags: RouteFlags,
        gateway: Option<IpAddr>,
        ifindex: Option<u32>,
        table: u32,
    },
    RouteDelete {
        prefix: IpNet,
        rtype: RouteType,
        gateway: Option<IpAddr>,
        ifindex: Option<u32>,
        table: u32,
    },
    RedistributeAdd {
        id: ClientId,
        rtype: RouteType,
    },
    RedistributeDelete {
        id: ClientId,
        rtype: RouteType,
    },
    LinkUpdate(LinkUpdate),
    LinkDelete {
        ifindex: u32,
    },
    AddressAdd {
        ifindex: u32,
        addr: IpNet,
    },
    AddressDelete {
        ifindex: u32,
        addr: IpNet,
    },
}

/// The single owner of both route tables and the interface table. All
/// mutation is serialized through its channel, which is what keeps the
/// at-most-one-FIB-entry invariant without any locking around the RIB.
pub struct RoutingManager {
    table4: RouteTable<ipnet::Ipv4Net>,
    table6: RouteTable<ipnet::Ipv6Net>,
    interfaces: InterfaceTable,
    registry: Arc<ClientRegistry>,
    fib: FibHandle,
    rx: UnboundedReceiver<RibMessage>,
    default_table: u32,
}

impl RoutingManager {
    pub fn new(
        rx: UnboundedReceiver<RibMessage>,
        registry: Arc<ClientRegistry>,
        fib: FibHandle,
        default_table: u32,
    ) -> RoutingManager {
        RoutingManager {
            table4: RouteTable::new(),
            table6: RouteTable::new(),
            interfaces: InterfaceTable::new(),
            registry,
            fib,
            rx,
            default_table,
        }
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg).await;
        }
        log::info!("routing manager stopped");
    }

    async fn handle(&mut self, msg: RibMessage) {
        match msg {
            RibMessage::ClientConnect { id } => self.push_snapshot(id),
            RibMessage::ClientDisconnect { id } => {
                // Injected routes stay until explicitly deleted or
                // superseded; protocol daemons re-assert them on
                // reconnect.
                log::debug!("client gone, routes retained"; "client" => id);
            }
            RibMessage::RouteAdd {
                prefix,
                rtype,
                flags,
                gateway,
                ifindex,
                table,
            } => {
                let nexthop = Nexthop { gateway, ifindex };
                let entry = RibEntry::new(rtype, table, nexthop).with_flags(flags);
                self.route_add(prefix, entry).await;
            }
            RibMessage::RouteDelete {
                prefix,
                rtype,
                gateway,
                ifindex,
                table,
            } => {
                let sel = RouteSelector {
                    rtype,
                    table,
                    gateway,
                    ifindex,
                };
                self.route_delete(prefix, sel).await;
            }
            RibMessage::RedistributeAdd { id, rtype } => {
                if self.registry.set_redistribute(id, rtype, true) {
                    let v4: Vec<(IpNet, RibEntry)> = self
                        .table4
                        .fib_routes_of(rtype)
                        .into_iter()
                        .map(|(p, e)| (IpNet::V4(p), e))
                        .collect();
                    let v6: Vec<(IpNet, RibEntry)> = self
                        .table6
                        .fib_routes_of(rtype)
                        .into_iter()
                        .map(|(p, e)| (IpNet::V6(p), e))
                        .collect();
                    redistribute::replay(&self.registry, id, &v4);
                    redistribute::replay(&self.registry, id, &v6);
                }
            }
            RibMessage::RedistributeDelete { id, rtype } => {
                self.registry.set_redistribute(id, rtype, false);
            }
            RibMessage::LinkUpdate(update) => self.link_update(update).await,
            RibMessage::LinkDelete { ifindex } => self.link_delete(ifindex).await,
            RibMessage::AddressAdd { ifindex, addr } => self.address_add(ifindex, addr).await,
            RibMessage::AddressDelete { ifindex, addr } => {
                self.address_delete(ifindex, addr).await
            }
        }
    }

    async fn route_add(&mut self, prefix: IpNet, entry: RibEntry) {
        match prefix {
            IpNet::V4(p) => match self.table4.add_route(&self.fib, p.trunc(), entry).await {
                Ok(events) => redistribute::announce(&self.registry, &events),
                Err(e) => log::info!("route add rejected"; "prefix" => %prefix, "err" => %e),
            },
            IpNet::V6(p) => match self.table6.add_route(&self.fib, p.trunc(), entry).await {
                Ok(events) => redistribute::announce(&self.registry, &events),
                Err(e) => log::info!("route add rejected"; "prefix" => %prefix, "err" => %e),
            },
        }
    }

    async fn route_delete(&mut self, prefix: IpNet, sel: RouteSelector) {
        match prefix {
            IpNet::V4(p) => {
                match self.table4.delete_route(&self.fib, p.trunc(), &sel).await {
                    Ok(events) => redistribute::announce(&self.registry, &events),
                    Err(e) => {
                        log::info!("route delete rejected"; "prefix" => %prefix, "err" => %e)
                    }
                }
            }
            IpNet::V6(p) => {
                match self.table6.delete_route(&self.fib, p.trunc(), &sel).await {
                    Ok(events) => redistribute::announce(&self.registry, &events),
                    Err(e) => {
                        log::info!("route delete rejected"; "prefix" => %prefix, "err" => %e)
                    }
                }
            }
        }
    }

    fn push_snapshot(&self, id: ClientId) {
        for iface in self.interfaces.iter() {
            self.registry.send_to(
                id,
                message::encode_interface(
                    command::INTERFACE_ADD,
                    iface.index,
                    iface.flags,
                    iface.metric,
                    iface.mtu,
                    &iface.name,
                ),
            );
            for addr in &iface.addrs {
                self.registry.send_to(
                    id,
                    message::encode_address(command::INTERFACE_ADDRESS_ADD, iface.index, *addr),
                );
            }
        }
    }

    async fn link_update(&mut self, update: LinkUpdate) {
        let ifindex = update.index;
        let transition = self.interfaces.upsert(update);
        match transition {
            LinkTransition::New => {
                if let Some(iface) = self.interfaces.get(ifindex) {
                    self.registry.broadcast(&message::encode_interface(
                        command::INTERFACE_ADD,
                        iface.index,
                        iface.flags,
                        iface.metric,
                        iface.mtu,
                        &iface.name,
                    ));
                }
            }
            LinkTransition::Up => {
                log::info!("interface up"; "ifindex" => ifindex);
                self.registry
                    .broadcast(&message::encode_interface_state(
                        command::INTERFACE_UP,
                        ifindex,
                    ));
                self.link_up(ifindex).await;
            }
            LinkTransition::Down => {
                log::info!("interface down"; "ifindex" => ifindex);
                self.registry
                    .broadcast(&message::encode_interface_state(
                        command::INTERFACE_DOWN,
                        ifindex,
                    ));
                self.link_down(ifindex);
            }
            LinkTransition::Unchanged => {}
        }
    }

    /// Connected routes come back first so that gateway-reachability
    /// checks during re-election see them installed.
    async fn link_up(&mut self, ifindex: u32) {
        let addrs: Vec<IpNet> = self
            .interfaces
            .get(ifindex)
            .map(|iface| iface.addrs.clone())
            .unwrap_or_default();
        for addr in addrs {
            if let Some((prefix, entry)) =
                interface::connected_route(ifindex, addr, self.default_table)
            {
                self.route_add(prefix, entry).await;
            }
        }
        let events = self.table4.interface_up(&self.fib, ifindex).await;
        redistribute::announce(&self.registry, &events);
        let events = self.table6.interface_up(&self.fib, ifindex).await;
        redistribute::announce(&self.registry, &events);
    }

    fn link_down(&mut self, ifindex: u32) {
        let events = self.table4.interface_down(ifindex);
        redistribute::announce(&self.registry, &events);
        let events = self.table6.interface_down(ifindex);
        redistribute::announce(&self.registry, &events);
    }

    async fn link_delete(&mut self, ifindex: u32) {
        let Some(iface) = self.interfaces.remove(ifindex) else {
            return;
        };
        for addr in &iface.addrs {
            if let Some((prefix, _)) =
                interface::connected_route(ifindex, *addr, self.default_table)
            {
                let sel = RouteSelector {
                    rtype: RouteType::Connected,
                    table: self.default_table,
                    gateway: None,
                    ifindex: Some(ifindex),
                };
                self.route_delete(prefix, sel).await;
            }
        }
        let events = self.table4.interface_delete(ifindex);
        redistribute::announce(&self.registry, &events);
        let events = self.table6.interface_delete(ifindex);
        redistribute::announce(&self.registry, &events);
        self.registry.broadcast(&message::encode_interface(
            command::INTERFACE_DELETE,
            iface.index,
            iface.flags,
            iface.metric,
            iface.mtu,
            &iface.name,
        ));
    }

    async fn address_add(&mut self, ifindex: u32, addr: IpNet) {
        if self.interfaces.get(ifindex).is_none() {
            log::warn!("address for unknown interface"; "ifindex" => ifindex, "addr" => %addr);
            return;
        }
        if !self.interfaces.add_address(ifindex, addr) {
            return;
        }
        self.registry.broadcast(&message::encode_address(
            command::INTERFACE_ADDRESS_ADD,
            ifindex,
            addr,
        ));
        if let Some((prefix, entry)) =
            interface::connected_route(ifindex, addr, self.default_table)
        {
            self.route_add(prefix, entry).await;
        }
    }

    async fn address_delete(&mut self, ifindex: u32, addr: IpNet) {
        if !self.interfaces.remove_address(ifindex, addr) {
            return;
        }
        self.registry.broadcast(&message::encode_address(
            command::INTERFACE_ADDRESS_DELETE,
            ifindex,
            addr,
        ));
        if let Some((prefix, _)) = interface::connected_route(ifindex, addr, self.default_table)
        {
            let sel = RouteSelector {
                rtype: RouteType::Connected,
                table: self.default_table,
                gateway: None,
                ifindex: Some(ifindex),
            };
            self.route_delete(prefix, sel).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fib::testing::scripted_fib;
    use crate::interface::{IFF_RUNNING, IFF_UP};
    use crate::message::{Frame, RouteUpdate};
    use crate::rib::Afi;
    use ipnet::Ipv4Net;
    use tokio::sync::mpsc;

    fn manager_with_client() -> (RoutingManager, mpsc::UnboundedReceiver<Frame>) {
        let (fib, _) = scripted_fib(0);
        let (_tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ClientRegistry::new());
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        registry.register(1, out_tx, 254);
        (RoutingManager::new(rx, registry, fib, 254), out_rx)
    }

    fn static_add(prefix: &str, gw: &str) -> RibMessage {
        RibMessage::RouteAdd {
            prefix: prefix.parse().unwrap(),
            rtype: RouteType::Static,
            flags: RouteFlags::default(),
            gateway: Some(gw.parse().unwrap()),
            ifindex: None,
            table: 254,
        }
    }

    fn link(index: u32, flags: u32) -> RibMessage {
        RibMessage::LinkUpdate(LinkUpdate {
            index,
            name: format!("eth{index}"),
            flags,
            mtu: 1500,
        })
    }

    fn fib_count(manager: &RoutingManager, prefix: &str) -> usize {
        let prefix: Ipv4Net = prefix.parse().unwrap();
        manager
            .table4
            .get(&prefix)
            .map(|n| n.entries.iter().filter(|e| e.is_fib()).count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn catch_up_replays_before_live_events() {
        let (mut manager, mut out) = manager_with_client();
        manager.handle(static_add("10.1.0.0/24", "10.0.0.1")).await;
        manager.handle(static_add("10.2.0.0/24", "10.0.0.1")).await;
        // Nothing is delivered before the subscription exists.
        assert!(out.try_recv().is_err());

        manager
            .handle(RibMessage::RedistributeAdd {
                id: 1,
                rtype: RouteType::Static,
            })
            .await;
        manager.handle(static_add("10.3.0.0/24", "10.0.0.1")).await;

        let mut prefixes = Vec::new();
        while let Ok(frame) = out.try_recv() {
            assert_eq!(frame.command, command::IPV4_ROUTE_ADD);
            let update = RouteUpdate::decode(&frame.payload, Afi::Ip4).unwrap();
            prefixes.push(update.routes[0].1);
        }
        // Two replayed routes, then the live one.
        assert_eq!(
            prefixes,
            vec![
                "10.1.0.0/24".parse().unwrap(),
                "10.2.0.0/24".parse().unwrap(),
                "10.3.0.0/24".parse().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn repeated_catch_up_leaves_the_table_unchanged() {
        let (mut manager, mut out) = manager_with_client();
        manager.handle(static_add("10.1.0.0/24", "10.0.0.1")).await;

        for _ in 0..2 {
            manager
                .handle(RibMessage::RedistributeAdd {
                    id: 1,
                    rtype: RouteType::Static,
                })
                .await;
        }

        let mut frames = 0;
        while out.try_recv().is_ok() {
            frames += 1;
        }
        assert_eq!(frames, 2);

        let prefix: Ipv4Net = "10.1.0.0/24".parse().unwrap();
        let node = manager.table4.get(&prefix).unwrap();
        assert_eq!(node.entries.len(), 1);
        assert_eq!(fib_count(&manager, "10.1.0.0/24"), 1);
    }

    #[tokio::test]
    async fn new_client_receives_interface_snapshot() {
        let (mut manager, mut out) = manager_with_client();
        manager.handle(link(3, IFF_UP | IFF_RUNNING)).await;
        manager
            .handle(RibMessage::AddressAdd {
                ifindex: 3,
                addr: "10.0.0.5/24".parse().unwrap(),
            })
            .await;
        // Drop the live broadcasts the setup produced.
        while out.try_recv().is_ok() {}

        manager.handle(RibMessage::ClientConnect { id: 1 }).await;
        let frame = out.try_recv().unwrap();
        assert_eq!(frame.command, command::INTERFACE_ADD);
        let frame = out.try_recv().unwrap();
        assert_eq!(frame.command, command::INTERFACE_ADDRESS_ADD);
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn link_flap_reelects_connected_and_dependent_routes() {
        let (mut manager, _out) = manager_with_client();
        manager.handle(link(3, IFF_UP | IFF_RUNNING)).await;
        manager
            .handle(RibMessage::AddressAdd {
                ifindex: 3,
                addr: "10.0.0.5/24".parse().unwrap(),
            })
            .await;
        manager.handle(static_add("10.1.0.0/16", "10.0.0.1")).await;
        assert_eq!(fib_count(&manager, "10.0.0.0/24"), 1);
        assert_eq!(fib_count(&manager, "10.1.0.0/16"), 1);

        manager.handle(link(3, IFF_UP)).await;
        assert_eq!(fib_count(&manager, "10.0.0.0/24"), 0);
        assert_eq!(fib_count(&manager, "10.1.0.0/16"), 0);
        let conn: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        assert_eq!(manager.table4.get(&conn).unwrap().entries.len(), 1);

        manager.handle(link(3, IFF_UP | IFF_RUNNING)).await;
        assert_eq!(fib_count(&manager, "10.0.0.0/24"), 1);
        assert_eq!(fib_count(&manager, "10.1.0.0/16"), 1);
        // The connected route was replaced in place, not duplicated.
        assert_eq!(manager.table4.get(&conn).unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn address_delete_removes_the_connected_route() {
        let (mut manager, _out) = manager_with_client();
        manager.handle(link(3, IFF_UP | IFF_RUNNING)).await;
        manager
            .handle(RibMessage::AddressAdd {
                ifindex: 3,
                addr: "10.0.0.5/24".parse().unwrap(),
            })
            .await;
        let conn: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        assert!(manager.table4.get(&conn).is_some());

        manager
            .handle(RibMessage::AddressDelete {
                ifindex: 3,
                addr: "10.0.0.5/24".parse().unwrap(),
            })
            .await;
        assert!(manager.table4.get(&conn).is_none());
    }
}
