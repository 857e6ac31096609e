use std::collections::HashMap;
use std::sync::Arc;

use foundations::telemetry::log;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::connection::ClientConn;
use crate::error::{Result, RibError};
use crate::manager::RibMessage;
use crate::message::{self, command, Frame, RouteUpdate};
use crate::rib::{Afi, RouteType};

pub type ClientId = u64;

/// Subscription bitset indexed by route type.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedistSet(u16);

impl RedistSet {
    pub fn set(&mut self, rtype: RouteType) {
        self.0 |= 1 << rtype.to_wire();
    }

    pub fn clear(&mut self, rtype: RouteType) {
        self.0 &= !(1 << rtype.to_wire());
    }

    pub fn contains(&self, rtype: RouteType) -> bool {
        self.0 & (1 << rtype.to_wire()) != 0
    }
}

struct ClientHandle {
    out: UnboundedSender<Frame>,
    redist: RedistSet,
    table: u32,
}

/// All connected clients. Writers are the accept path and the manager's
/// subscription handling; the lock is never held across an await.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry::default()
    }

    pub fn register(&self, id: ClientId, out: UnboundedSender<Frame>, table: u32) {
        self.clients.write().insert(
            id,
            ClientHandle {
                out,
                redist: RedistSet::default(),
                table,
            },
        );
    }

    pub fn remove(&self, id: ClientId) {
        self.clients.write().remove(&id);
    }

    /// The kernel table this client's routes land in.
    pub fn table_of(&self, id: ClientId) -> Option<u32> {
        self.clients.read().get(&id).map(|client| client.table)
    }

    /// Flip a subscription bit; false when the client is already gone.
    pub fn set_redistribute(&self, id: ClientId, rtype: RouteType, on: bool) -> bool {
        let mut clients = self.clients.write();
        let Some(client) = clients.get_mut(&id) else {
            return false;
        };
        if on {
            client.redist.set(rtype);
        } else {
            client.redist.clear(rtype);
        }
        true
    }

    pub fn send_to(&self, id: ClientId, frame: Frame) {
        if let Some(client) = self.clients.read().get(&id) {
            let _ = client.out.send(frame);
        }
    }

    /// Interface topology goes to every client.
    pub fn broadcast(&self, frame: &Frame) {
        for client in self.clients.read().values() {
            let _ = client.out.send(frame.clone());
        }
    }

    /// Route changes go to clients subscribed to the route's type.
    pub fn broadcast_redistribute(&self, rtype: RouteType, frame: &Frame) {
        for client in self.clients.read().values() {
            if client.redist.contains(rtype) {
                let _ = client.out.send(frame.clone());
            }
        }
    }
}

/// Accept loop: one task per client, ids handed out monotonically.
pub async fn run_server(
    listener: TcpListener,
    registry: Arc<ClientRegistry>,
    rib_tx: UnboundedSender<RibMessage>,
    default_table: u32,
) -> Result<()> {
    let mut next_id: ClientId = 0;
    loop {
        let (stream, peer) = listener.accept().await?;
        next_id += 1;
        let id = next_id;
        log::info!("client connected"; "client" => id, "peer" => %peer);
        tokio::spawn(serve_client(
            stream,
            id,
            registry.clone(),
            rib_tx.clone(),
            default_table,
        ));
    }
}

/// One client's lifetime: register, let the manager push the interface
/// snapshot, then multiplex inbound frames and the outbound queue until
/// EOF or a protocol error.
pub async fn serve_client(
    stream: TcpStream,
    id: ClientId,
    registry: Arc<ClientRegistry>,
    rib_tx: UnboundedSender<RibMessage>,
    default_table: u32,
) {
    let mut conn = ClientConn::new(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    registry.register(id, out_tx, default_table);
    if rib_tx.send(RibMessage::ClientConnect { id }).is_err() {
        registry.remove(id);
        return;
    }

    let table = registry.table_of(id).unwrap_or(default_table);
    loop {
        select! {
            frame = conn.read_frame() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = dispatch(&frame, id, table, &rib_tx) {
                        log::warn!("closing client on protocol error";
                            "client" => id, "err" => %e);
                        break;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("closing client on frame error"; "client" => id, "err" => %e);
                    break;
                }
                None => break,
            },
            out = out_rx.recv() => match out {
                Some(frame) => {
                    if conn.write_frame(&frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    registry.remove(id);
    let _ = rib_tx.send(RibMessage::ClientDisconnect { id });
    log::info!("client disconnected"; "client" => id);
}

fn dispatch(
    frame: &Frame,
    id: ClientId,
    table: u32,
    rib_tx: &UnboundedSender<RibMessage>,
) -> Result<()> {
    match frame.command {
        command::IPV4_ROUTE_ADD => route_update(frame, Afi::Ip4, true, table, rib_tx),
        command::IPV4_ROUTE_DELETE => route_update(frame, Afi::Ip4, false, table, rib_tx),
        command::IPV6_ROUTE_ADD => route_update(frame, Afi::Ip6, true, table, rib_tx),
        command::IPV6_ROUTE_DELETE => route_update(frame, Afi::Ip6, false, table, rib_tx),
        command::REDISTRIBUTE_ADD => {
            let rtype = message::decode_redistribute(&frame.payload)?;
            send(rib_tx, RibMessage::RedistributeAdd { id, rtype })
        }
        command::REDISTRIBUTE_DELETE => {
            let rtype = message::decode_redistribute(&frame.payload)?;
            send(rib_tx, RibMessage::RedistributeDelete { id, rtype })
        }
        command::INTERFACE_ADD
        | command::INTERFACE_DELETE
        | command::INTERFACE_ADDRESS_ADD
        | command::INTERFACE_ADDRESS_DELETE
        | command::INTERFACE_UP
        | command::INTERFACE_DOWN => {
            // Interface state flows server to client only.
            log::debug!("ignoring interface command from client";
                "client" => id, "command" => frame.command);
            Ok(())
        }
        other => Err(RibError::frame(format!("unknown command {other}"))),
    }
}

fn route_update(
    frame: &Frame,
    afi: Afi,
    add: bool,
    table: u32,
    rib_tx: &UnboundedSender<RibMessage>,
) -> Result<()> {
    let update = RouteUpdate::decode(&frame.payload, afi)?;
    let gateway = if update.nexthop.is_unspecified() {
        None
    } else {
        Some(update.nexthop)
    };
    for (ifindex, prefix) in update.routes {
        let ifindex = (ifindex != 0).then_some(ifindex);
        let msg = if add {
            RibMessage::RouteAdd {
                prefix,
                rtype: update.rtype,
                flags: update.flags,
                gateway,
                ifindex,
                table,
            }
        } else {
            RibMessage::RouteDelete {
                prefix,
                rtype: update.rtype,
                gateway,
                ifindex,
                table,
            }
        };
        send(rib_tx, msg)?;
    }
    Ok(())
}

fn send(rib_tx: &UnboundedSender<RibMessage>, msg: RibMessage) -> Result<()> {
    rib_tx
        .send(msg)
        .map_err(|_| RibError::Channel("routing manager"))
}
