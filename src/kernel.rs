use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::AsRawFd;
use std::thread;
use std::time::Duration;

use foundations::telemetry::log;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use netlink_packet_core::{
    ErrorMessage, NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE,
    NLM_F_DUMP, NLM_F_REPLACE, NLM_F_REQUEST,
};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope,
    RouteType as KernelRouteType,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::protocols::NETLINK_ROUTE;
use netlink_sys::{Socket, SocketAddr};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::error::{Result, RibError};
use crate::fib::{FibHandle, FibOp, FibRequest, FibRoute};
use crate::interface::LinkUpdate;
use crate::manager::RibMessage;
use crate::rib::{RouteFlags, RouteType};
use crate::settings::KernelSettings;

const RTNLGRP_LINK: u32 = 1;
const RTNLGRP_IPV4_IFADDR: u32 = 5;
const RTNLGRP_IPV4_ROUTE: u32 = 7;
const RTNLGRP_IPV6_IFADDR: u32 = 9;
const RTNLGRP_IPV6_ROUTE: u32 = 11;

const RT_TABLE_UNSPEC: u8 = 0;

const RECV_BUF_LEN: usize = 65536;
/// Large receive buffer on the listen socket so notification bursts
/// survive a busy manager.
const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

fn multicast_groups() -> u32 {
    [
        RTNLGRP_LINK,
        RTNLGRP_IPV4_IFADDR,
        RTNLGRP_IPV4_ROUTE,
        RTNLGRP_IPV6_IFADDR,
        RTNLGRP_IPV6_ROUTE,
    ]
    .iter()
    .fold(0, |acc, group| acc | 1 << (group - 1))
}

/// Open both netlink sockets, run the startup dumps in fixed order, then
/// hand the command socket to its thread and start the listener. Socket
/// open or bind failure here is fatal to boot.
pub fn start(rib_tx: UnboundedSender<RibMessage>, settings: &KernelSettings) -> Result<FibHandle> {
    let mut cmd = Socket::new(NETLINK_ROUTE)?;
    cmd.bind_auto()?;
    set_recv_timeout(&cmd, Duration::from_millis(settings.receive_timeout_ms))?;

    let listen = open_listen_socket()?;

    initial_dump(&cmd, &rib_tx)?;

    let (fib_tx, fib_rx) = mpsc::unbounded_channel();
    let retry_limit = settings.retry_limit;
    thread::Builder::new()
        .name("netlink-cmd".to_string())
        .spawn(move || cmd_loop(cmd, fib_rx))?;
    thread::Builder::new()
        .name("netlink-listen".to_string())
        .spawn(move || listen_loop(listen, rib_tx, retry_limit))?;

    Ok(FibHandle::new(fib_tx))
}

fn open_listen_socket() -> Result<Socket> {
    let mut socket = Socket::new(NETLINK_ROUTE)?;
    socket.bind(&SocketAddr::new(0, multicast_groups()))?;
    tune_recv_buffer(&socket);
    Ok(socket)
}

fn set_recv_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

fn tune_recv_buffer(socket: &Socket) {
    let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        log::warn!("failed to grow netlink receive buffer, keeping default");
    }
}

/// Dump order matters: links before addresses before routes, each drained
/// to completion before the next request goes out.
fn initial_dump(socket: &Socket, rib_tx: &UnboundedSender<RibMessage>) -> Result<()> {
    let dumps = vec![
        RouteNetlinkMessage::GetLink(LinkMessage::default()),
        RouteNetlinkMessage::GetAddress(address_dump_request(AddressFamily::Inet)),
        RouteNetlinkMessage::GetAddress(address_dump_request(AddressFamily::Inet6)),
        RouteNetlinkMessage::GetRoute(route_dump_request(AddressFamily::Inet)),
        RouteNetlinkMessage::GetRoute(route_dump_request(AddressFamily::Inet6)),
    ];
    for (i, payload) in dumps.into_iter().enumerate() {
        dump(socket, i as u32 + 1, payload, rib_tx)?;
    }
    Ok(())
}

fn address_dump_request(family: AddressFamily) -> AddressMessage {
    let mut msg = AddressMessage::default();
    msg.header.family = family;
    msg
}

fn route_dump_request(family: AddressFamily) -> RouteMessage {
    let mut msg = RouteMessage::default();
    msg.header.address_family = family;
    msg
}

fn serialize_request(payload: RouteNetlinkMessage, flags: u16, seq: u32) -> Vec<u8> {
    let mut header = NetlinkHeader::default();
    header.flags = flags;
    header.sequence_number = seq;
    let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
    packet.finalize();
    let mut buf = vec![0u8; packet.buffer_len()];
    packet.serialize(&mut buf);
    buf
}

fn dump(
    socket: &Socket,
    seq: u32,
    payload: RouteNetlinkMessage,
    rib_tx: &UnboundedSender<RibMessage>,
) -> Result<()> {
    let buf = serialize_request(payload, NLM_F_REQUEST | NLM_F_DUMP, seq);
    socket.send(&buf, 0)?;

    let mut recv_buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let len = match socket.recv(&mut &mut recv_buf[..], 0) {
            Ok(len) => len,
            // Receive timeout: the kernel has nothing more for us.
            Err(e) if would_block(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut offset = 0;
        while offset < len {
            let msg =
                match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[offset..len]) {
                    Ok(msg) => msg,
                    Err(e) => {
                        // One malformed message costs the rest of this
                        // datagram, not the dump.
                        log::warn!("skipping malformed netlink message"; "err" => %e);
                        break;
                    }
                };
            let mlen = msg.header.length as usize;
            if mlen == 0 {
                break;
            }
            let matches_seq = msg.header.sequence_number == seq;
            match msg.payload {
                NetlinkPayload::Done(_) if matches_seq => return Ok(()),
                NetlinkPayload::Error(err) if matches_seq => return ack_result(err),
                NetlinkPayload::InnerMessage(inner) if matches_seq => {
                    if let Some(event) = convert(inner) {
                        let _ = rib_tx.send(event);
                    }
                }
                _ => {}
            }
            offset += nlmsg_align(mlen);
        }
    }
}

/// Serve route install/withdraw requests for the lifetime of the daemon.
/// Sequence numbers continue past the five the dumps used.
fn cmd_loop(socket: Socket, mut rx: mpsc::UnboundedReceiver<FibRequest>) {
    let mut seq: u32 = 5;
    while let Some(req) = rx.blocking_recv() {
        seq = seq.wrapping_add(1);
        let result = route_request(&socket, seq, req.op, &req.route);
        let _ = req.reply.send(result);
    }
}

fn route_request(socket: &Socket, seq: u32, op: FibOp, route: &FibRoute) -> Result<()> {
    let msg = build_route_message(route);
    let (payload, flags) = match op {
        FibOp::Add => (
            RouteNetlinkMessage::NewRoute(msg),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        ),
        FibOp::Delete => (RouteNetlinkMessage::DelRoute(msg), NLM_F_REQUEST | NLM_F_ACK),
    };
    let buf = serialize_request(payload, flags, seq);
    socket.send(&buf, 0)?;
    wait_ack(socket, seq)
}

fn wait_ack(socket: &Socket, seq: u32) -> Result<()> {
    let mut recv_buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let len = match socket.recv(&mut &mut recv_buf[..], 0) {
            Ok(len) => len,
            // No reply inside the receive timeout means no error to
            // report.
            Err(e) if would_block(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut offset = 0;
        while offset < len {
            let msg =
                match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[offset..len]) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("skipping malformed netlink reply"; "err" => %e);
                        break;
                    }
                };
            let mlen = msg.header.length as usize;
            if mlen == 0 {
                break;
            }
            // A reply with another sequence number is stale; skip it.
            if msg.header.sequence_number == seq {
                if let NetlinkPayload::Error(err) = msg.payload {
                    return ack_result(err);
                }
            }
            offset += nlmsg_align(mlen);
        }
    }
}

/// Success is an explicit ACK with code zero.
fn ack_result(err: ErrorMessage) -> Result<()> {
    match err.code {
        None => Ok(()),
        Some(code) => Err(RibError::from_errno(-code.get())),
    }
}

fn build_route_message(route: &FibRoute) -> RouteMessage {
    let mut msg = RouteMessage::default();
    msg.header.destination_prefix_length = route.dest.prefix_len();
    msg.header.protocol = RouteProtocol::Zebra;
    msg.header.kind = if route.blackhole {
        KernelRouteType::BlackHole
    } else {
        KernelRouteType::Unicast
    };
    msg.header.scope = if route.gateway.is_some() || route.blackhole {
        RouteScope::Universe
    } else {
        RouteScope::Link
    };
    msg.header.table = if route.table <= u8::MAX as u32 {
        route.table as u8
    } else {
        RT_TABLE_UNSPEC
    };

    match route.dest {
        IpNet::V4(net) => {
            msg.header.address_family = AddressFamily::Inet;
            if net.prefix_len() > 0 {
                msg.attributes
                    .push(RouteAttribute::Destination(RouteAddress::Inet(net.addr())));
            }
        }
        IpNet::V6(net) => {
            msg.header.address_family = AddressFamily::Inet6;
            if net.prefix_len() > 0 {
                msg.attributes
                    .push(RouteAttribute::Destination(RouteAddress::Inet6(net.addr())));
            }
        }
    }

    if !route.blackhole {
        match route.gateway {
            Some(IpAddr::V4(gw)) => msg
                .attributes
                .push(RouteAttribute::Gateway(RouteAddress::Inet(gw))),
            Some(IpAddr::V6(gw)) => msg
                .attributes
                .push(RouteAttribute::Gateway(RouteAddress::Inet6(gw))),
            None => {}
        }
        if let Some(ifindex) = route.ifindex {
            msg.attributes.push(RouteAttribute::Oif(ifindex));
        }
    }

    // Table ids past the header byte spill into an attribute.
    if route.table > u8::MAX as u32 {
        msg.attributes.push(RouteAttribute::Table(route.table));
    }

    msg
}

/// Convert asynchronous kernel notifications into manager messages until
/// the manager goes away. Receive failures get a bounded reopen-retry;
/// past the limit the process is not in a state worth saving.
fn listen_loop(mut socket: Socket, rib_tx: UnboundedSender<RibMessage>, retry_limit: u32) {
    let mut attempts = 0u32;
    let mut recv_buf = vec![0u8; RECV_BUF_LEN];
    loop {
        match socket.recv(&mut &mut recv_buf[..], 0) {
            Ok(len) => {
                attempts = 0;
                let mut offset = 0;
                while offset < len {
                    let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                        &recv_buf[offset..len],
                    ) {
                        Ok(msg) => msg,
                        Err(e) => {
                            log::warn!("skipping malformed netlink notification"; "err" => %e);
                            break;
                        }
                    };
                    let mlen = msg.header.length as usize;
                    if mlen == 0 {
                        break;
                    }
                    if let NetlinkPayload::InnerMessage(inner) = msg.payload {
                        if let Some(event) = convert(inner) {
                            if rib_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    offset += nlmsg_align(mlen);
                }
            }
            Err(e) => {
                attempts += 1;
                if attempts > retry_limit {
                    log::error!("netlink listener failed beyond retry limit"; "err" => %e);
                    std::process::exit(1);
                }
                log::warn!("reopening netlink listener"; "err" => %e, "attempt" => attempts);
                thread::sleep(Duration::from_secs(1));
                match open_listen_socket() {
                    Ok(reopened) => socket = reopened,
                    Err(e) => log::warn!("netlink listener reopen failed"; "err" => %e),
                }
            }
        }
    }
}

fn convert(msg: RouteNetlinkMessage) -> Option<RibMessage> {
    match msg {
        RouteNetlinkMessage::NewRoute(msg) => kernel_route(msg, true),
        RouteNetlinkMessage::DelRoute(msg) => kernel_route(msg, false),
        RouteNetlinkMessage::NewLink(msg) => Some(RibMessage::LinkUpdate(link_update(msg))),
        RouteNetlinkMessage::DelLink(msg) => Some(RibMessage::LinkDelete {
            ifindex: msg.header.index,
        }),
        RouteNetlinkMessage::NewAddress(msg) => address_event(msg, true),
        RouteNetlinkMessage::DelAddress(msg) => address_event(msg, false),
        _ => None,
    }
}

/// Kernel-internal, redirect-derived and self-originated routes are
/// filtered here; folding our own installs back in would loop.
fn kernel_route(msg: RouteMessage, add: bool) -> Option<RibMessage> {
    match msg.header.protocol {
        RouteProtocol::Kernel | RouteProtocol::IcmpRedirect | RouteProtocol::Zebra => return None,
        _ => {}
    }
    if !matches!(
        msg.header.kind,
        KernelRouteType::Unicast | KernelRouteType::BlackHole
    ) {
        return None;
    }
    let blackhole = matches!(msg.header.kind, KernelRouteType::BlackHole);

    let mut dst = None;
    let mut gateway = None;
    let mut oif = None;
    let mut table = msg.header.table as u32;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => dst = route_address(addr),
            RouteAttribute::Gateway(addr) => gateway = route_address(addr),
            RouteAttribute::Oif(ifindex) => oif = Some(*ifindex),
            RouteAttribute::Table(t) => table = *t,
            _ => {}
        }
    }

    let plen = msg.header.destination_prefix_length;
    let prefix = match msg.header.address_family {
        AddressFamily::Inet => {
            let addr = match dst {
                Some(IpAddr::V4(addr)) => addr,
                None => Ipv4Addr::UNSPECIFIED,
                Some(IpAddr::V6(_)) => return None,
            };
            IpNet::V4(Ipv4Net::new(addr, plen).ok()?.trunc())
        }
        AddressFamily::Inet6 => {
            let addr = match dst {
                Some(IpAddr::V6(addr)) => addr,
                None => Ipv6Addr::UNSPECIFIED,
                Some(IpAddr::V4(_)) => return None,
            };
            IpNet::V6(Ipv6Net::new(addr, plen).ok()?.trunc())
        }
        _ => return None,
    };

    let mut flags = RouteFlags::default();
    if blackhole {
        flags.insert(RouteFlags::BLACKHOLE);
    }
    Some(if add {
        RibMessage::RouteAdd {
            prefix,
            rtype: RouteType::Kernel,
            flags,
            gateway,
            ifindex: oif,
            table,
        }
    } else {
        RibMessage::RouteDelete {
            prefix,
            rtype: RouteType::Kernel,
            gateway,
            ifindex: oif,
            table,
        }
    })
}

fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(addr) => Some(IpAddr::V4(*addr)),
        RouteAddress::Inet6(addr) => Some(IpAddr::V6(*addr)),
        _ => None,
    }
}

fn link_update(msg: LinkMessage) -> LinkUpdate {
    let mut name = String::new();
    let mut mtu = 0;
    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(ifname) => name = ifname,
            LinkAttribute::Mtu(value) => mtu = value,
            _ => {}
        }
    }
    LinkUpdate {
        index: msg.header.index,
        name,
        flags: msg.header.flags.bits(),
        mtu,
    }
}

/// IFA_LOCAL is the interface's own address; IFA_ADDRESS can be the peer
/// on pointopoint links.
fn address_event(msg: AddressMessage, add: bool) -> Option<RibMessage> {
    let mut local = None;
    let mut address = None;
    for attr in msg.attributes {
        match attr {
            AddressAttribute::Local(addr) => local = Some(addr),
            AddressAttribute::Address(addr) => address = Some(addr),
            _ => {}
        }
    }
    let addr = local.or(address)?;
    let net = IpNet::new(addr, msg.header.prefix_len).ok()?;
    let ifindex = msg.header.index;
    Some(if add {
        RibMessage::AddressAdd { ifindex, addr: net }
    } else {
        RibMessage::AddressDelete { ifindex, addr: net }
    })
}

fn nlmsg_align(len: usize) -> usize {
    (len + 3) & !3
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
