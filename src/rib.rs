use std::fmt;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::Prefix;

/// Route origin, ordered by the default administrative distance table.
/// The discriminants are the wire ids clients put in route messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteType {
    System = 0,
    Kernel = 1,
    Connected = 2,
    Static = 3,
    Rip = 4,
    Ripng = 5,
    Ospf = 6,
    Ospf6 = 7,
    Bgp = 8,
}

impl RouteType {
    pub fn from_wire(v: u8) -> Option<RouteType> {
        match v {
            0 => Some(RouteType::System),
            1 => Some(RouteType::Kernel),
            2 => Some(RouteType::Connected),
            3 => Some(RouteType::Static),
            4 => Some(RouteType::Rip),
            5 => Some(RouteType::Ripng),
            6 => Some(RouteType::Ospf),
            7 => Some(RouteType::Ospf6),
            8 => Some(RouteType::Bgp),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Default administrative distance; lower wins during election.
    pub fn distance(self) -> u8 {
        match self {
            RouteType::System => 10,
            RouteType::Kernel => 20,
            RouteType::Connected => 30,
            RouteType::Static => 40,
            RouteType::Rip => 50,
            RouteType::Ripng => 50,
            RouteType::Ospf => 60,
            RouteType::Ospf6 => 49,
            RouteType::Bgp => 70,
        }
    }

    /// Routes the kernel already forwards on its own; election never
    /// issues install or withdraw calls for these.
    pub fn is_system_origin(self) -> bool {
        matches!(self, RouteType::System | RouteType::Kernel)
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteType::System => "system",
            RouteType::Kernel => "kernel",
            RouteType::Connected => "connected",
            RouteType::Static => "static",
            RouteType::Rip => "rip",
            RouteType::Ripng => "ripng",
            RouteType::Ospf => "ospf",
            RouteType::Ospf6 => "ospf6",
            RouteType::Bgp => "bgp",
        };
        f.write_str(name)
    }
}

/// Per-route flag bits carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteFlags(u8);

impl RouteFlags {
    /// Gateway must be resolved through another installed route.
    pub const INTERNAL: RouteFlags = RouteFlags(0x01);
    /// Originated by this process.
    pub const SELFROUTE: RouteFlags = RouteFlags(0x02);
    /// Discard route, installed without a nexthop.
    pub const BLACKHOLE: RouteFlags = RouteFlags(0x04);

    pub fn from_bits(bits: u8) -> RouteFlags {
        RouteFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: RouteFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RouteFlags) {
        self.0 |= other.0;
    }
}

/// A gateway address, an output interface, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nexthop {
    pub gateway: Option<IpAddr>,
    pub ifindex: Option<u32>,
}

impl Nexthop {
    pub fn gateway(addr: IpAddr) -> Nexthop {
        Nexthop {
            gateway: Some(addr),
            ifindex: None,
        }
    }

    pub fn ifindex(ifindex: u32) -> Nexthop {
        Nexthop {
            gateway: None,
            ifindex: Some(ifindex),
        }
    }
}

impl fmt::Display for Nexthop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.gateway, self.ifindex) {
            (Some(gw), Some(ifindex)) => write!(f, "via {gw} dev {ifindex}"),
            (Some(gw), None) => write!(f, "via {gw}"),
            (None, Some(ifindex)) => write!(f, "dev {ifindex}"),
            (None, None) => f.write_str("unspecified"),
        }
    }
}

/// One candidate route inside a node's distance-ordered list.
#[derive(Debug, Clone)]
pub struct RibEntry {
    pub rtype: RouteType,
    pub flags: RouteFlags,
    pub distance: u8,
    pub table: u32,
    pub nexthop: Nexthop,
    /// The gateway as originally requested, kept only when recursive
    /// resolution replaced `nexthop` with a concrete one.
    pub origin_gateway: Option<IpAddr>,
    fib: bool,
    internal: bool,
}

impl RibEntry {
    pub fn new(rtype: RouteType, table: u32, nexthop: Nexthop) -> RibEntry {
        RibEntry {
            rtype,
            flags: RouteFlags::default(),
            distance: rtype.distance(),
            table,
            nexthop,
            origin_gateway: None,
            fib: false,
            internal: false,
        }
    }

    pub fn with_flags(mut self, flags: RouteFlags) -> RibEntry {
        self.flags = flags;
        self
    }

    /// Whether this entry is the one installed in the kernel FIB.
    pub fn is_fib(&self) -> bool {
        self.fib
    }

    pub fn set_fib(&mut self, fib: bool) {
        self.fib = fib;
    }

    /// Whether recursive nexthop resolution produced this entry's nexthop.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn set_internal(&mut self, internal: bool) {
        self.internal = internal;
    }

    pub fn is_system_origin(&self) -> bool {
        self.rtype.is_system_origin()
    }

    pub fn is_blackhole(&self) -> bool {
        self.flags.contains(RouteFlags::BLACKHOLE)
    }
}

/// FIB transitions produced by a RIB operation, in the order they must be
/// fanned out to subscribed clients.
#[derive(Debug, Clone)]
pub enum RibEvent<P> {
    Installed { prefix: P, route: RibEntry },
    Withdrawn { prefix: P, route: RibEntry },
}

/// Address family tag used by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Afi {
    Ip4,
    Ip6,
}

impl Afi {
    pub fn addr_len(self) -> usize {
        match self {
            Afi::Ip4 => 4,
            Afi::Ip6 => 16,
        }
    }

    pub fn max_prefix_len(self) -> u8 {
        match self {
            Afi::Ip4 => 32,
            Afi::Ip6 => 128,
        }
    }
}

/// The two concrete prefix families the route table is instantiated over.
pub trait RibPrefix: Prefix + Copy + Eq + fmt::Debug + fmt::Display {
    const AFI: Afi;

    /// Host-length prefix for a gateway address of this family.
    fn from_host(addr: IpAddr) -> Option<Self>;

    fn to_ipnet(self) -> IpNet;
}

impl RibPrefix for Ipv4Net {
    const AFI: Afi = Afi::Ip4;

    fn from_host(addr: IpAddr) -> Option<Ipv4Net> {
        match addr {
            IpAddr::V4(addr) => Some(Ipv4Net::from(addr)),
            IpAddr::V6(_) => None,
        }
    }

    fn to_ipnet(self) -> IpNet {
        IpNet::V4(self)
    }
}

impl RibPrefix for Ipv6Net {
    const AFI: Afi = Afi::Ip6;

    fn from_host(addr: IpAddr) -> Option<Ipv6Net> {
        match addr {
            IpAddr::V4(_) => None,
            IpAddr::V6(addr) => Some(Ipv6Net::from(addr)),
        }
    }

    fn to_ipnet(self) -> IpNet {
        IpNet::V6(self)
    }
}
