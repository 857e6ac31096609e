use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use octets::Octets;

use crate::error::{Result, RibError};
use crate::rib::{Afi, RibEntry, RouteFlags, RouteType};

/*
    0                   1                   2
    0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |            Length             |    Command    |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
    |                 Payload (variable)            |
    +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+

    Length is big-endian and counts the whole frame, header included.
*/
pub const HEADER_LEN: usize = 3;
pub const MAX_FRAME_LEN: usize = 4096;

pub mod command {
    pub const INTERFACE_ADD: u8 = 1;
    pub const INTERFACE_DELETE: u8 = 2;
    pub const INTERFACE_ADDRESS_ADD: u8 = 3;
    pub const INTERFACE_ADDRESS_DELETE: u8 = 4;
    pub const INTERFACE_UP: u8 = 5;
    pub const INTERFACE_DOWN: u8 = 6;
    pub const IPV4_ROUTE_ADD: u8 = 7;
    pub const IPV4_ROUTE_DELETE: u8 = 8;
    pub const IPV6_ROUTE_ADD: u8 = 9;
    pub const IPV6_ROUTE_DELETE: u8 = 10;
    pub const REDISTRIBUTE_ADD: u8 = 11;
    pub const REDISTRIBUTE_DELETE: u8 = 12;
}

/// One decoded frame: the command byte plus its payload, header stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: u8, payload: Bytes) -> Frame {
        Frame { command, payload }
    }
}

/*
    Route add/delete payload. One nexthop, arbitrarily many prefixes.

    +---------------+---------------+
    |     Type      |     Flags     |
    +---------------+---------------+
    |    Nexthop (4 or 16 octets)   |
    +-------------------------------+
    |        Interface Index        |  \
    +---------------+---------------+  |
    | Prefix Length |    Prefix     |  |  repeated until the frame
    +---------------+  (variable)   |  |  length is exhausted
    +-------------------------------+  /
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdate {
    pub rtype: RouteType,
    pub flags: RouteFlags,
    pub nexthop: IpAddr,
    pub routes: Vec<(u32, IpNet)>,
}

impl RouteUpdate {
    pub fn decode(payload: &[u8], afi: Afi) -> Result<RouteUpdate> {
        let mut buf = Octets::with_slice(payload);

        let rtype = RouteType::from_wire(buf.get_u8()?)
            .ok_or_else(|| RibError::frame("unknown route type"))?;
        let flags = RouteFlags::from_bits(buf.get_u8()?);
        let nexthop = get_addr(&mut buf, afi)?;

        let mut routes = Vec::new();
        while buf.cap() > 0 {
            let ifindex = buf.get_u32()?;
            let plen = buf.get_u8()?;
            if plen > afi.max_prefix_len() {
                return Err(RibError::frame("prefix length out of range"));
            }
            let nbytes = (plen as usize + 7) / 8;
            let raw = buf.get_bytes(nbytes)?;
            routes.push((ifindex, prefix_from_wire(afi, plen, raw.buf())?));
        }
        if routes.is_empty() {
            return Err(RibError::frame("route update carries no prefixes"));
        }

        Ok(RouteUpdate {
            rtype,
            flags,
            nexthop,
            routes,
        })
    }
}

/// Redistribute subscribe/unsubscribe payload: a single route type octet.
pub fn decode_redistribute(payload: &[u8]) -> Result<RouteType> {
    let mut buf = Octets::with_slice(payload);
    RouteType::from_wire(buf.get_u8()?).ok_or_else(|| RibError::frame("unknown route type"))
}

/// Encode a FIB install or withdraw for fan-out to clients.
pub fn encode_route(prefix: IpNet, route: &RibEntry, add: bool) -> Frame {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_u8(route.rtype.to_wire());
    buf.put_u8(route.flags.bits());

    let gateway = route.origin_gateway.or(route.nexthop.gateway);
    match prefix {
        IpNet::V4(_) => {
            let gw = match gateway {
                Some(IpAddr::V4(gw)) => gw,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            buf.put_slice(&gw.octets());
        }
        IpNet::V6(_) => {
            let gw = match gateway {
                Some(IpAddr::V6(gw)) => gw,
                _ => Ipv6Addr::UNSPECIFIED,
            };
            buf.put_slice(&gw.octets());
        }
    }

    buf.put_u32(route.nexthop.ifindex.unwrap_or(0));
    buf.put_u8(prefix.prefix_len());
    let nbytes = (prefix.prefix_len() as usize + 7) / 8;
    match prefix {
        IpNet::V4(net) => buf.put_slice(&net.addr().octets()[..nbytes]),
        IpNet::V6(net) => buf.put_slice(&net.addr().octets()[..nbytes]),
    }

    let command = match (prefix, add) {
        (IpNet::V4(_), true) => command::IPV4_ROUTE_ADD,
        (IpNet::V4(_), false) => command::IPV4_ROUTE_DELETE,
        (IpNet::V6(_), true) => command::IPV6_ROUTE_ADD,
        (IpNet::V6(_), false) => command::IPV6_ROUTE_DELETE,
    };
    Frame::new(command, buf.freeze())
}

/*
    Interface add/delete payload, server to client only.

    +-------------------------------+
    |        Interface Index        |
    +-------------------------------+
    |             Flags             |
    +-------------------------------+
    |             Metric            |
    +-------------------------------+
    |              MTU              |
    +---------------+---------------+
    |  Name Length  |     Name      |
    +---------------+  (variable)   |
    +-------------------------------+
*/
pub fn encode_interface(
    cmd: u8,
    ifindex: u32,
    flags: u32,
    metric: u32,
    mtu: u32,
    name: &str,
) -> Frame {
    let name = name.as_bytes();
    let name_len = name.len().min(u8::MAX as usize);
    let mut buf = BytesMut::with_capacity(17 + name_len);
    buf.put_u32(ifindex);
    buf.put_u32(flags);
    buf.put_u32(metric);
    buf.put_u32(mtu);
    buf.put_u8(name_len as u8);
    buf.put_slice(&name[..name_len]);
    Frame::new(cmd, buf.freeze())
}

/// Interface up/down payload: the interface index alone.
pub fn encode_interface_state(cmd: u8, ifindex: u32) -> Frame {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(ifindex);
    Frame::new(cmd, buf.freeze())
}

/// Interface address add/delete payload: index, family, prefix length and
/// the full fixed-size address.
pub fn encode_address(cmd: u8, ifindex: u32, addr: IpNet) -> Frame {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u32(ifindex);
    match addr {
        IpNet::V4(net) => {
            buf.put_u8(libc::AF_INET as u8);
            buf.put_u8(net.prefix_len());
            buf.put_slice(&net.addr().octets());
        }
        IpNet::V6(net) => {
            buf.put_u8(libc::AF_INET6 as u8);
            buf.put_u8(net.prefix_len());
            buf.put_slice(&net.addr().octets());
        }
    }
    Frame::new(cmd, buf.freeze())
}

fn get_addr(buf: &mut Octets<'_>, afi: Afi) -> Result<IpAddr> {
    let raw = buf.get_bytes(afi.addr_len())?;
    match afi {
        Afi::Ip4 => {
            let mut octs = [0u8; 4];
            octs.copy_from_slice(raw.buf());
            Ok(IpAddr::V4(Ipv4Addr::from(octs)))
        }
        Afi::Ip6 => {
            let mut octs = [0u8; 16];
            octs.copy_from_slice(raw.buf());
            Ok(IpAddr::V6(Ipv6Addr::from(octs)))
        }
    }
}

fn prefix_from_wire(afi: Afi, plen: u8, bytes: &[u8]) -> Result<IpNet> {
    match afi {
        Afi::Ip4 => {
            let mut octs = [0u8; 4];
            octs[..bytes.len()].copy_from_slice(bytes);
            let net = Ipv4Net::new(Ipv4Addr::from(octs), plen)
                .map_err(|_| RibError::frame("prefix length out of range"))?;
            Ok(IpNet::V4(net.trunc()))
        }
        Afi::Ip6 => {
            let mut octs = [0u8; 16];
            octs[..bytes.len()].copy_from_slice(bytes);
            let net = Ipv6Net::new(Ipv6Addr::from(octs), plen)
                .map_err(|_| RibError::frame("prefix length out of range"))?;
            Ok(IpNet::V6(net.trunc()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::Nexthop;

    #[test]
    fn route_update_carries_many_prefixes_for_one_nexthop() {
        let mut payload = Vec::new();
        payload.push(RouteType::Static.to_wire());
        payload.push(0);
        payload.extend_from_slice(&[10, 0, 0, 1]); // nexthop
        // 10.1.0.0/16 on ifindex 3
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.push(16);
        payload.extend_from_slice(&[10, 1]);
        // 192.168.4.0/22, no interface
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.push(22);
        payload.extend_from_slice(&[192, 168, 4]);

        let update = RouteUpdate::decode(&payload, Afi::Ip4).unwrap();
        assert_eq!(update.rtype, RouteType::Static);
        assert_eq!(update.nexthop, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            update.routes,
            vec![
                (3, "10.1.0.0/16".parse().unwrap()),
                (0, "192.168.4.0/22".parse().unwrap()),
            ]
        );
    }

    #[test]
    fn truncated_route_update_is_rejected() {
        let mut payload = Vec::new();
        payload.push(RouteType::Static.to_wire());
        payload.push(0);
        payload.extend_from_slice(&[10, 0, 0, 1]);
        payload.extend_from_slice(&3u32.to_be_bytes());
        payload.push(24);
        payload.extend_from_slice(&[10, 0]); // one prefix octet short

        assert!(matches!(
            RouteUpdate::decode(&payload, Afi::Ip4),
            Err(RibError::Frame(_))
        ));
    }

    #[test]
    fn empty_prefix_list_is_rejected() {
        let payload = [RouteType::Static.to_wire(), 0, 10, 0, 0, 1];
        assert!(matches!(
            RouteUpdate::decode(&payload, Afi::Ip4),
            Err(RibError::Frame(_))
        ));
    }

    #[test]
    fn unknown_route_type_is_rejected() {
        let payload = [200u8, 0, 10, 0, 0, 1, 0, 0, 0, 0, 8, 10];
        assert!(matches!(
            RouteUpdate::decode(&payload, Afi::Ip4),
            Err(RibError::Frame(_))
        ));
    }

    #[test]
    fn oversized_prefix_length_is_rejected() {
        let mut payload = Vec::new();
        payload.push(RouteType::Static.to_wire());
        payload.push(0);
        payload.extend_from_slice(&[10, 0, 0, 1]);
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.push(33);
        payload.extend_from_slice(&[10, 0, 0, 0, 0]);

        assert!(matches!(
            RouteUpdate::decode(&payload, Afi::Ip4),
            Err(RibError::Frame(_))
        ));
    }

    #[test]
    fn encoded_fib_change_decodes_to_the_same_route() {
        let prefix: IpNet = "10.1.0.0/16".parse().unwrap();
        let mut route = RibEntry::new(
            RouteType::Static,
            254,
            Nexthop::gateway("10.0.0.1".parse::<Ipv4Addr>().unwrap().into()),
        );
        route.nexthop.ifindex = Some(3);

        let frame = encode_route(prefix, &route, true);
        assert_eq!(frame.command, command::IPV4_ROUTE_ADD);

        let update = RouteUpdate::decode(&frame.payload, Afi::Ip4).unwrap();
        assert_eq!(update.rtype, RouteType::Static);
        assert_eq!(update.nexthop, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(update.routes, vec![(3, prefix)]);
    }

    #[test]
    fn withdraw_of_internal_route_reports_the_requested_gateway() {
        let prefix: IpNet = "172.16.0.0/16".parse().unwrap();
        let mut route = RibEntry::new(
            RouteType::Bgp,
            254,
            Nexthop::gateway("10.0.0.1".parse::<Ipv4Addr>().unwrap().into()),
        );
        route.origin_gateway = Some("192.168.1.5".parse().unwrap());

        let frame = encode_route(prefix, &route, false);
        assert_eq!(frame.command, command::IPV4_ROUTE_DELETE);
        let update = RouteUpdate::decode(&frame.payload, Afi::Ip4).unwrap();
        assert_eq!(update.nexthop, "192.168.1.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn redistribute_payload_is_one_type_octet() {
        assert_eq!(
            decode_redistribute(&[RouteType::Rip.to_wire()]).unwrap(),
            RouteType::Rip
        );
        assert!(decode_redistribute(&[]).is_err());
        assert!(decode_redistribute(&[99]).is_err());
    }
}
