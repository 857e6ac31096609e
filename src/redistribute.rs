use ipnet::IpNet;

use crate::client::{ClientId, ClientRegistry};
use crate::message;
use crate::rib::{RibEntry, RibEvent, RibPrefix};

/// Fan a batch of FIB transitions out to subscribed clients, preserving
/// the order the selection engine produced them in.
pub fn announce<P: RibPrefix>(registry: &ClientRegistry, events: &[RibEvent<P>]) {
    for event in events {
        let (prefix, route, add) = match event {
            RibEvent::Installed { prefix, route } => (prefix, route, true),
            RibEvent::Withdrawn { prefix, route } => (prefix, route, false),
        };
        let frame = message::encode_route(prefix.to_ipnet(), route, add);
        registry.broadcast_redistribute(route.rtype, &frame);
    }
}

/// Catch-up on subscription: replay every currently installed route of the
/// requested type to the one subscribing client, ahead of any later live
/// event.
pub fn replay(registry: &ClientRegistry, id: ClientId, routes: &[(IpNet, RibEntry)]) {
    for (prefix, route) in routes {
        registry.send_to(id, message::encode_route(*prefix, route, true));
    }
}
