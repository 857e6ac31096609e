use std::net::IpAddr;

use foundations::telemetry::log;
use prefix_trie::PrefixMap;

use crate::error::{Result, RibError};
use crate::fib::{FibHandle, FibRoute};
use crate::rib::{RibEntry, RibEvent, RibPrefix, RouteFlags, RouteType};

/// Candidate list for one prefix, kept sorted by ascending administrative
/// distance. Equal distances keep insertion order.
#[derive(Debug, Default)]
pub struct RouteNode {
    pub entries: Vec<RibEntry>,
}

impl RouteNode {
    fn fib_index(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.is_fib())
    }

    fn insert_sorted(&mut self, entry: RibEntry) -> usize {
        let idx = self
            .entries
            .iter()
            .position(|e| e.distance > entry.distance)
            .unwrap_or(self.entries.len());
        self.entries.insert(idx, entry);
        idx
    }
}

/// Fields that identify the entry a delete refers to: type and table
/// always, plus the gateway for gateway routes or the ifindex for link
/// routes.
#[derive(Debug, Clone, Copy)]
pub struct RouteSelector {
    pub rtype: RouteType,
    pub table: u32,
    pub gateway: Option<IpAddr>,
    pub ifindex: Option<u32>,
}

impl RouteSelector {
    fn matches(&self, e: &RibEntry) -> bool {
        if e.rtype != self.rtype || e.table != self.table {
            return false;
        }
        match (self.gateway, self.ifindex) {
            // An internally resolved entry is addressed by the gateway its
            // owner originally requested.
            (Some(gw), _) => e.nexthop.gateway == Some(gw) || e.origin_gateway == Some(gw),
            (None, Some(ifindex)) => e.nexthop.ifindex == Some(ifindex),
            (None, None) => true,
        }
    }
}

/// One address family's RIB: per-prefix candidate lists plus the election
/// logic that keeps exactly one entry installed in the kernel.
pub struct RouteTable<P: RibPrefix> {
    map: PrefixMap<P, RouteNode>,
}

impl<P: RibPrefix> RouteTable<P> {
    pub fn new() -> RouteTable<P> {
        RouteTable {
            map: PrefixMap::new(),
        }
    }

    pub fn get(&self, prefix: &P) -> Option<&RouteNode> {
        self.map.get(prefix)
    }

    /// Insert a candidate and run FIB election. Duplicate-static and
    /// unresolvable-nexthop adds are rejected outright. A kernel install
    /// failure reports an error: with no previous FIB holder the candidate
    /// stays in the list unflagged, otherwise the incumbent keeps its
    /// kernel route and the failed candidate is dropped.
    pub async fn add_route(
        &mut self,
        fib: &FibHandle,
        prefix: P,
        mut entry: RibEntry,
    ) -> Result<Vec<RibEvent<P>>> {
        self.resolve_nexthop(&mut entry)?;

        if entry.rtype == RouteType::Static && self.has_static(&prefix, entry.table) {
            return Err(RibError::RouteExists);
        }

        let mut events = Vec::new();

        let node = self.map.entry(prefix).or_default();
        match node.fib_index() {
            None => {
                let result = if entry.is_system_origin() {
                    Ok(())
                } else {
                    fib.route_add(FibRoute::from_entry(prefix, &entry)).await
                };
                match result {
                    Ok(()) => {
                        entry.set_fib(true);
                        events.push(RibEvent::Installed {
                            prefix,
                            route: entry.clone(),
                        });
                    }
                    Err(e) => {
                        // Nothing was installed; the candidate still
                        // replaces its same-type predecessor in the list,
                        // without FIB status.
                        node.entries.retain(|old| !same_source(old, &entry));
                        node.insert_sorted(entry);
                        return Err(e);
                    }
                }
            }
            Some(cur) if entry.distance <= node.entries[cur].distance => {
                // Relabeling is enough when the kernel state would not
                // change: system-origin candidates, or an identical
                // concrete nexthop.
                let relabel =
                    entry.is_system_origin() || entry.nexthop == node.entries[cur].nexthop;
                let result = if relabel {
                    Ok(())
                } else {
                    fib.route_add(FibRoute::from_entry(prefix, &entry)).await
                };
                match result {
                    Ok(()) => {
                        if !relabel && !node.entries[cur].is_system_origin() {
                            if let Err(e) = fib
                                .route_del(FibRoute::from_entry(prefix, &node.entries[cur]))
                                .await
                            {
                                log::warn!("withdraw of superseded route failed";
                                    "prefix" => %prefix, "err" => %e);
                            }
                        }
                        node.entries[cur].set_fib(false);
                        events.push(RibEvent::Withdrawn {
                            prefix,
                            route: node.entries[cur].clone(),
                        });
                        entry.set_fib(true);
                        events.push(RibEvent::Installed {
                            prefix,
                            route: entry.clone(),
                        });
                    }
                    Err(e) => {
                        // The incumbent keeps its kernel route and FIB
                        // status; the failed candidate is not recorded.
                        return Err(e);
                    }
                }
            }
            Some(_) => {}
        }

        let new_idx = node.insert_sorted(entry);

        // An update replaces the previous entry of the same type.
        let prev_same = {
            let new_entry = &node.entries[new_idx];
            node.entries
                .iter()
                .enumerate()
                .find(|(i, e)| *i != new_idx && same_source(e, new_entry))
                .map(|(i, _)| i)
        };
        if let Some(old_idx) = prev_same {
            let old = node.entries.remove(old_idx);
            if old.is_fib() {
                if !old.is_system_origin() {
                    if let Err(e) = fib.route_del(FibRoute::from_entry(prefix, &old)).await {
                        log::warn!("withdraw of replaced route failed";
                            "prefix" => %prefix, "err" => %e);
                    }
                }
                events.push(RibEvent::Withdrawn { prefix, route: old });
                events.extend(Self::elect_head(fib, prefix, node).await);
            }
        }

        Ok(events)
    }

    /// Remove the entry the selector identifies. Deleting the FIB holder
    /// withdraws the kernel route and elects the next best candidate.
    pub async fn delete_route(
        &mut self,
        fib: &FibHandle,
        prefix: P,
        sel: &RouteSelector,
    ) -> Result<Vec<RibEvent<P>>> {
        let Some(node) = self.map.get_mut(&prefix) else {
            return Err(RibError::RouteNotFound);
        };
        let Some(idx) = node.entries.iter().position(|e| sel.matches(e)) else {
            return Err(RibError::RouteNotFound);
        };

        let removed = node.entries.remove(idx);
        let mut events = Vec::new();
        if removed.is_fib() {
            if !removed.is_system_origin() {
                if let Err(e) = fib.route_del(FibRoute::from_entry(prefix, &removed)).await {
                    log::warn!("withdraw of deleted route failed";
                        "prefix" => %prefix, "err" => %e);
                }
            }
            events.push(RibEvent::Withdrawn {
                prefix,
                route: removed,
            });
            events.extend(Self::elect_head(fib, prefix, node).await);
        }
        if node.entries.is_empty() {
            self.map.remove(&prefix);
        }
        Ok(events)
    }

    /// Re-elect routes that lost FIB status while the interface was down.
    /// Directly bound entries first, then entries reached through a
    /// gateway on the interface, so gateway reachability sees the restored
    /// connected routes.
    pub async fn interface_up(&mut self, fib: &FibHandle, ifindex: u32) -> Vec<RibEvent<P>> {
        let mut events = Vec::new();
        events.extend(self.reelect_pass(fib, ifindex, false).await);
        events.extend(self.reelect_pass(fib, ifindex, true).await);
        events
    }

    async fn reelect_pass(
        &mut self,
        fib: &FibHandle,
        ifindex: u32,
        via_gateway: bool,
    ) -> Vec<RibEvent<P>> {
        let mut events = Vec::new();
        let prefixes: Vec<P> = self.map.iter().map(|(p, _)| *p).collect();
        for prefix in prefixes {
            let pick = {
                let Some(node) = self.map.get(&prefix) else {
                    continue;
                };
                if node.fib_index().is_some() {
                    continue;
                }
                node.entries.iter().position(|e| {
                    if via_gateway {
                        e.nexthop.ifindex != Some(ifindex)
                            && e.nexthop
                                .gateway
                                .is_some_and(|gw| self.gateway_on_interface(gw, ifindex))
                    } else {
                        e.nexthop.ifindex == Some(ifindex)
                    }
                })
            };
            let Some(idx) = pick else { continue };

            let (route, system) = {
                let Some(node) = self.map.get(&prefix) else {
                    continue;
                };
                let Some(e) = node.entries.get(idx) else {
                    continue;
                };
                (FibRoute::from_entry(prefix, e), e.is_system_origin())
            };
            let result = if system { Ok(()) } else { fib.route_add(route).await };
            match result {
                Ok(()) => {
                    if let Some(e) = self
                        .map
                        .get_mut(&prefix)
                        .and_then(|node| node.entries.get_mut(idx))
                    {
                        e.set_fib(true);
                        events.push(RibEvent::Installed {
                            prefix,
                            route: e.clone(),
                        });
                    }
                }
                Err(e) => {
                    log::warn!("reinstall after interface up failed";
                        "prefix" => %prefix, "err" => %e);
                }
            }
        }
        events
    }

    /// Soft withdrawal: strip FIB status from every entry bound to the
    /// interface without touching the kernel (the link flap already
    /// flushed them there) and without removing the entries.
    pub fn interface_down(&mut self, ifindex: u32) -> Vec<RibEvent<P>> {
        let mut bound: Vec<(P, Vec<usize>)> = Vec::new();
        for (prefix, node) in self.map.iter() {
            let idxs: Vec<usize> = node
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_fib() && self.bound_to_interface(e, ifindex))
                .map(|(i, _)| i)
                .collect();
            if !idxs.is_empty() {
                bound.push((*prefix, idxs));
            }
        }

        let mut events = Vec::new();
        for (prefix, idxs) in bound {
            let Some(node) = self.map.get_mut(&prefix) else {
                continue;
            };
            for idx in idxs {
                if let Some(e) = node.entries.get_mut(idx) {
                    e.set_fib(false);
                    events.push(RibEvent::Withdrawn {
                        prefix,
                        route: e.clone(),
                    });
                }
            }
        }
        events
    }

    /// Interface removal: soft-withdraw as for down, then mark the bound
    /// ifindex unknown on the surviving entries.
    pub fn interface_delete(&mut self, ifindex: u32) -> Vec<RibEvent<P>> {
        let events = self.interface_down(ifindex);
        let prefixes: Vec<P> = self.map.iter().map(|(p, _)| *p).collect();
        for prefix in prefixes {
            let Some(node) = self.map.get_mut(&prefix) else {
                continue;
            };
            for e in node.entries.iter_mut() {
                if e.nexthop.ifindex == Some(ifindex) {
                    e.nexthop.ifindex = None;
                }
            }
        }
        events
    }

    /// Currently installed routes of one type, for catch-up replay.
    pub fn fib_routes_of(&self, rtype: RouteType) -> Vec<(P, RibEntry)> {
        self.map
            .iter()
            .filter_map(|(p, node)| {
                node.entries
                    .iter()
                    .find(|e| e.is_fib() && e.rtype == rtype)
                    .map(|e| (*p, e.clone()))
            })
            .collect()
    }

    async fn elect_head(fib: &FibHandle, prefix: P, node: &mut RouteNode) -> Vec<RibEvent<P>> {
        let mut events = Vec::new();
        if node.fib_index().is_some() {
            return events;
        }
        let Some(head) = node.entries.first_mut() else {
            return events;
        };
        let result = if head.is_system_origin() {
            Ok(())
        } else {
            fib.route_add(FibRoute::from_entry(prefix, &*head)).await
        };
        match result {
            Ok(()) => {
                head.set_fib(true);
                events.push(RibEvent::Installed {
                    prefix,
                    route: head.clone(),
                });
            }
            Err(e) => {
                log::warn!("install of next-best route failed";
                    "prefix" => %prefix, "err" => %e);
            }
        }
        events
    }

    /// Exactly one longest-prefix lookup: resolve an internal route's
    /// gateway through the currently installed table. A connected match
    /// keeps the requested gateway; any other installed match lends its
    /// concrete nexthop. No further recursion.
    fn resolve_nexthop(&self, entry: &mut RibEntry) -> Result<()> {
        if !entry.flags.contains(RouteFlags::INTERNAL) {
            return Ok(());
        }
        let Some(gw) = entry.nexthop.gateway else {
            return Ok(());
        };
        let Some(host) = P::from_host(gw) else {
            return Err(RibError::Unreachable);
        };
        match self.lookup_fib(&host) {
            Some(via) if via.rtype == RouteType::Connected => Ok(()),
            Some(via) => {
                entry.origin_gateway = Some(gw);
                entry.nexthop = via.nexthop;
                entry.set_internal(true);
                Ok(())
            }
            None => Err(RibError::Unreachable),
        }
    }

    fn lookup_fib(&self, host: &P) -> Option<&RibEntry> {
        let (_, node) = self.map.get_lpm(host)?;
        node.entries.iter().find(|e| e.is_fib())
    }

    fn gateway_on_interface(&self, gw: IpAddr, ifindex: u32) -> bool {
        let Some(host) = P::from_host(gw) else {
            return false;
        };
        matches!(self.lookup_fib(&host),
            Some(e) if e.rtype == RouteType::Connected && e.nexthop.ifindex == Some(ifindex))
    }

    fn bound_to_interface(&self, e: &RibEntry, ifindex: u32) -> bool {
        if e.nexthop.ifindex == Some(ifindex) {
            return true;
        }
        e.nexthop
            .gateway
            .is_some_and(|gw| self.gateway_on_interface(gw, ifindex))
    }

    fn has_static(&self, prefix: &P, table: u32) -> bool {
        self.map.get(prefix).is_some_and(|node| {
            node.entries
                .iter()
                .any(|e| e.rtype == RouteType::Static && e.table == table)
        })
    }
}

fn same_source(a: &RibEntry, b: &RibEntry) -> bool {
    a.rtype == b.rtype
        && a.table == b.table
        && (a.rtype != RouteType::Connected || a.nexthop.ifindex == b.nexthop.ifindex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fib::testing::{scripted_fib, scripted_fib_results};
    use crate::fib::FibOp;
    use crate::rib::Nexthop;
    use ipnet::Ipv4Net;
    use std::net::Ipv4Addr;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn gw(s: &str) -> IpAddr {
        IpAddr::V4(s.parse::<Ipv4Addr>().unwrap())
    }

    fn entry(rtype: RouteType, nexthop: Nexthop) -> RibEntry {
        RibEntry::new(rtype, 254, nexthop)
    }

    fn fib_count(table: &RouteTable<Ipv4Net>, prefix: &Ipv4Net) -> usize {
        table
            .get(prefix)
            .map(|n| n.entries.iter().filter(|e| e.is_fib()).count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn connected_keeps_fib_over_static() {
        let (fib, calls) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        table
            .add_route(&fib, p, entry(RouteType::Connected, Nexthop::ifindex(3)))
            .await
            .unwrap();
        table
            .add_route(&fib, p, entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1"))))
            .await
            .unwrap();

        let node = table.get(&p).unwrap();
        assert_eq!(node.entries.len(), 2);
        assert_eq!(fib_count(&table, &p), 1);
        let holder = node.entries.iter().find(|e| e.is_fib()).unwrap();
        assert_eq!(holder.rtype, RouteType::Connected);
        // Only the connected install ever reached the kernel.
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn install_failure_leaves_no_fib() {
        let (fib, calls) = scripted_fib(1);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        let res = table
            .add_route(&fib, p, entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1"))))
            .await;
        assert!(matches!(res, Err(RibError::Unreachable)));
        assert_eq!(calls.lock().len(), 1);
        // The candidate stays in the table but nothing is installed.
        assert_eq!(table.get(&p).unwrap().entries.len(), 1);
        assert_eq!(fib_count(&table, &p), 0);
    }

    #[tokio::test]
    async fn failed_update_keeps_the_incumbent_installed() {
        // First install succeeds, the same-type update's install fails.
        let (fib, calls) = scripted_fib_results(vec![true, false]);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        table
            .add_route(&fib, p, entry(RouteType::Rip, Nexthop::gateway(gw("10.0.0.1"))))
            .await
            .unwrap();

        let res = table
            .add_route(&fib, p, entry(RouteType::Rip, Nexthop::gateway(gw("10.0.0.2"))))
            .await;
        assert!(matches!(res, Err(RibError::Unreachable)));

        // The incumbent is untouched and the failed update left no trace.
        let node = table.get(&p).unwrap();
        assert_eq!(node.entries.len(), 1);
        assert_eq!(node.entries[0].nexthop.gateway, Some(gw("10.0.0.1")));
        assert!(node.entries[0].is_fib());
        let ops: Vec<FibOp> = calls.lock().iter().map(|(op, _)| *op).collect();
        assert_eq!(ops, vec![FibOp::Add, FibOp::Add]);
    }

    #[tokio::test]
    async fn duplicate_static_rejected() {
        let (fib, _) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        table
            .add_route(&fib, p, entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1"))))
            .await
            .unwrap();
        let res = table
            .add_route(&fib, p, entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.2"))))
            .await;
        assert!(matches!(res, Err(RibError::RouteExists)));

        let node = table.get(&p).unwrap();
        assert_eq!(node.entries.len(), 1);
        assert_eq!(node.entries[0].nexthop.gateway, Some(gw("10.0.0.1")));
    }

    #[tokio::test]
    async fn delete_reinstalls_next_best() {
        let (fib, calls) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        table
            .add_route(&fib, p, entry(RouteType::Rip, Nexthop::gateway(gw("10.0.0.9"))))
            .await
            .unwrap();
        // Static (40) preempts RIP (50).
        table
            .add_route(&fib, p, entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1"))))
            .await
            .unwrap();
        let node = table.get(&p).unwrap();
        assert!(node.entries.iter().find(|e| e.is_fib()).unwrap().rtype == RouteType::Static);

        let events = table
            .delete_route(
                &fib,
                p,
                &RouteSelector {
                    rtype: RouteType::Static,
                    table: 254,
                    gateway: Some(gw("10.0.0.1")),
                    ifindex: None,
                },
            )
            .await
            .unwrap();

        // Withdrawn static, reinstalled RIP.
        assert_eq!(events.len(), 2);
        let node = table.get(&p).unwrap();
        assert_eq!(node.entries.len(), 1);
        assert_eq!(node.entries[0].rtype, RouteType::Rip);
        assert!(node.entries[0].is_fib());
        // rip add, static add, rip del(old fib), static del, rip add
        let ops: Vec<FibOp> = calls.lock().iter().map(|(op, _)| *op).collect();
        assert_eq!(
            ops,
            vec![FibOp::Add, FibOp::Add, FibOp::Delete, FibOp::Delete, FibOp::Add]
        );
    }

    #[tokio::test]
    async fn delete_last_entry_drops_node() {
        let (fib, _) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        table
            .add_route(&fib, p, entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1"))))
            .await
            .unwrap();
        table
            .delete_route(
                &fib,
                p,
                &RouteSelector {
                    rtype: RouteType::Static,
                    table: 254,
                    gateway: Some(gw("10.0.0.1")),
                    ifindex: None,
                },
            )
            .await
            .unwrap();
        assert!(table.get(&p).is_none());
    }

    #[tokio::test]
    async fn delete_missing_route_is_an_error() {
        let (fib, _) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let res = table
            .delete_route(
                &fib,
                net("10.0.0.0/24"),
                &RouteSelector {
                    rtype: RouteType::Static,
                    table: 254,
                    gateway: Some(gw("10.0.0.1")),
                    ifindex: None,
                },
            )
            .await;
        assert!(matches!(res, Err(RibError::RouteNotFound)));
    }

    #[tokio::test]
    async fn identical_nexthop_relabels_without_kernel_call() {
        let (fib, calls) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        table
            .add_route(&fib, p, entry(RouteType::Rip, Nexthop::gateway(gw("10.0.0.9"))))
            .await
            .unwrap();
        assert_eq!(calls.lock().len(), 1);

        // Same distance, same concrete nexthop: FIB moves with no kernel
        // traffic.
        table
            .add_route(&fib, p, entry(RouteType::Ripng, Nexthop::gateway(gw("10.0.0.9"))))
            .await
            .unwrap();
        assert_eq!(calls.lock().len(), 1);

        let node = table.get(&p).unwrap();
        assert_eq!(fib_count(&table, &p), 1);
        assert_eq!(
            node.entries.iter().find(|e| e.is_fib()).unwrap().rtype,
            RouteType::Ripng
        );
    }

    #[tokio::test]
    async fn system_route_takes_fib_without_kernel_call() {
        let (fib, calls) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        table
            .add_route(&fib, p, entry(RouteType::Connected, Nexthop::ifindex(3)))
            .await
            .unwrap();
        table
            .add_route(&fib, p, entry(RouteType::System, Nexthop::ifindex(3)))
            .await
            .unwrap();

        assert_eq!(calls.lock().len(), 1);
        let node = table.get(&p).unwrap();
        assert_eq!(
            node.entries.iter().find(|e| e.is_fib()).unwrap().rtype,
            RouteType::System
        );
        assert_eq!(fib_count(&table, &p), 1);
    }

    #[tokio::test]
    async fn same_type_update_replaces_previous_entry() {
        let (fib, calls) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.0.0.0/24");

        table
            .add_route(&fib, p, entry(RouteType::Rip, Nexthop::gateway(gw("10.0.0.1"))))
            .await
            .unwrap();
        table
            .add_route(&fib, p, entry(RouteType::Rip, Nexthop::gateway(gw("10.0.0.2"))))
            .await
            .unwrap();

        let node = table.get(&p).unwrap();
        assert_eq!(node.entries.len(), 1);
        assert_eq!(node.entries[0].nexthop.gateway, Some(gw("10.0.0.2")));
        assert!(node.entries[0].is_fib());
        // add old, add new, del old
        assert_eq!(calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn internal_route_resolves_through_installed_route() {
        let (fib, _) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();

        table
            .add_route(
                &fib,
                net("10.0.0.0/24"),
                entry(RouteType::Connected, Nexthop::ifindex(3)),
            )
            .await
            .unwrap();
        table
            .add_route(
                &fib,
                net("192.168.1.0/24"),
                entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1"))),
            )
            .await
            .unwrap();

        // Gateway inside 192.168.1.0/24 resolves through the static route
        // and borrows its concrete nexthop.
        let mut bgp = entry(RouteType::Bgp, Nexthop::gateway(gw("192.168.1.5")));
        bgp.flags.insert(RouteFlags::INTERNAL);
        table.add_route(&fib, net("172.16.0.0/16"), bgp).await.unwrap();

        let node = table.get(&net("172.16.0.0/16")).unwrap();
        let e = &node.entries[0];
        assert!(e.is_internal());
        assert_eq!(e.nexthop.gateway, Some(gw("10.0.0.1")));
        assert_eq!(e.origin_gateway, Some(gw("192.168.1.5")));
    }

    #[tokio::test]
    async fn internal_route_over_connected_keeps_gateway() {
        let (fib, _) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();

        table
            .add_route(
                &fib,
                net("10.0.0.0/24"),
                entry(RouteType::Connected, Nexthop::ifindex(3)),
            )
            .await
            .unwrap();

        let mut bgp = entry(RouteType::Bgp, Nexthop::gateway(gw("10.0.0.7")));
        bgp.flags.insert(RouteFlags::INTERNAL);
        table.add_route(&fib, net("172.16.0.0/16"), bgp).await.unwrap();

        let e = &table.get(&net("172.16.0.0/16")).unwrap().entries[0];
        assert!(!e.is_internal());
        assert_eq!(e.nexthop.gateway, Some(gw("10.0.0.7")));
        assert_eq!(e.origin_gateway, None);
    }

    #[tokio::test]
    async fn internal_route_without_resolution_is_unreachable() {
        let (fib, calls) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();

        let mut bgp = entry(RouteType::Bgp, Nexthop::gateway(gw("192.168.1.5")));
        bgp.flags.insert(RouteFlags::INTERNAL);
        let res = table.add_route(&fib, net("172.16.0.0/16"), bgp).await;

        assert!(matches!(res, Err(RibError::Unreachable)));
        assert!(table.get(&net("172.16.0.0/16")).is_none());
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn interface_flap_soft_withdraws_and_reelects() {
        let (fib, _) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let conn = net("10.0.0.0/24");
        let stat = net("10.1.0.0/16");

        table
            .add_route(&fib, conn, entry(RouteType::Connected, Nexthop::ifindex(3)))
            .await
            .unwrap();
        table
            .add_route(&fib, stat, entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1"))))
            .await
            .unwrap();

        let events = table.interface_down(3);
        // Both the connected route and the static reached through it.
        assert_eq!(events.len(), 2);
        assert_eq!(fib_count(&table, &conn), 0);
        assert_eq!(fib_count(&table, &stat), 0);
        assert_eq!(table.get(&conn).unwrap().entries.len(), 1);
        assert_eq!(table.get(&stat).unwrap().entries.len(), 1);

        let events = table.interface_up(&fib, 3).await;
        assert_eq!(events.len(), 2);
        assert_eq!(fib_count(&table, &conn), 1);
        assert_eq!(fib_count(&table, &stat), 1);
    }

    #[tokio::test]
    async fn interface_delete_marks_ifindex_unknown() {
        let (fib, _) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();
        let p = net("10.1.0.0/16");

        let mut stat = entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1")));
        stat.nexthop.ifindex = Some(3);
        table.add_route(&fib, p, stat).await.unwrap();

        table.interface_delete(3);
        let e = &table.get(&p).unwrap().entries[0];
        assert!(!e.is_fib());
        assert_eq!(e.nexthop.ifindex, None);
        assert_eq!(e.nexthop.gateway, Some(gw("10.0.0.1")));
    }

    #[tokio::test]
    async fn fib_routes_of_skips_unselected_candidates() {
        let (fib, _) = scripted_fib(0);
        let mut table = RouteTable::<Ipv4Net>::new();

        table
            .add_route(
                &fib,
                net("10.0.0.0/24"),
                entry(RouteType::Static, Nexthop::gateway(gw("10.0.0.1"))),
            )
            .await
            .unwrap();
        table
            .add_route(
                &fib,
                net("10.1.0.0/24"),
                entry(RouteType::Static, Nexthop::gateway(gw("10.1.0.1"))),
            )
            .await
            .unwrap();
        // A RIP candidate shadowed by the first static.
        table
            .add_route(
                &fib,
                net("10.0.0.0/24"),
                entry(RouteType::Rip, Nexthop::gateway(gw("10.0.0.9"))),
            )
            .await
            .unwrap();

        assert_eq!(table.fib_routes_of(RouteType::Static).len(), 2);
        assert!(table.fib_routes_of(RouteType::Rip).is_empty());
    }
}
