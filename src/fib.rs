use core::time::Duration;
use std::net::IpAddr;

use ipnet::IpNet;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::error::{Result, RibError};
use crate::rib::{RibEntry, RibPrefix};

/// Bound on one kernel request/reply exchange as seen by the route table.
/// The exchange itself rides a channel to the netlink command thread, so a
/// stalled kernel cannot wedge the routing manager past this.
pub const TALK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibOp {
    Add,
    Delete,
}

/// Everything the kernel needs to install or withdraw one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibRoute {
    pub dest: IpNet,
    pub gateway: Option<IpAddr>,
    pub ifindex: Option<u32>,
    pub table: u32,
    pub blackhole: bool,
}

impl FibRoute {
    pub fn from_entry<P: RibPrefix>(prefix: P, entry: &RibEntry) -> FibRoute {
        FibRoute {
            dest: prefix.to_ipnet(),
            gateway: entry.nexthop.gateway,
            ifindex: entry.nexthop.ifindex,
            table: entry.table,
            blackhole: entry.is_blackhole(),
        }
    }
}

#[derive(Debug)]
pub struct FibRequest {
    pub op: FibOp,
    pub route: FibRoute,
    pub reply: oneshot::Sender<Result<()>>,
}

/// Cloneable handle to the kernel forwarding table. Requests are answered
/// over a oneshot; the await is bounded by [`TALK_TIMEOUT`].
#[derive(Debug, Clone)]
pub struct FibHandle {
    tx: mpsc::UnboundedSender<FibRequest>,
}

impl FibHandle {
    pub fn new(tx: mpsc::UnboundedSender<FibRequest>) -> FibHandle {
        FibHandle { tx }
    }

    pub async fn route_add(&self, route: FibRoute) -> Result<()> {
        self.talk(FibOp::Add, route).await
    }

    pub async fn route_del(&self, route: FibRoute) -> Result<()> {
        self.talk(FibOp::Delete, route).await
    }

    async fn talk(&self, op: FibOp, route: FibRoute) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FibRequest { op, route, reply })
            .map_err(|_| RibError::Channel("kernel command thread"))?;
        match timeout(TALK_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RibError::Channel("kernel reply")),
            Err(_) => Err(RibError::Netlink("kernel request timed out".to_string())),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    pub type Calls = Arc<Mutex<Vec<(FibOp, FibRoute)>>>;

    /// A FibHandle answered by a task that fails the first `failures`
    /// requests with `Unreachable` and records every call.
    pub fn scripted_fib(failures: usize) -> (FibHandle, Calls) {
        scripted_fib_results(vec![false; failures])
    }

    /// A FibHandle answered from a script: one bool per request, true for
    /// success and false for `Unreachable`. Requests past the end of the
    /// script succeed. Every call is recorded.
    pub fn scripted_fib_results(script: Vec<bool>) -> (FibHandle, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<FibRequest>();
        tokio::spawn(async move {
            let mut script = script.into_iter();
            while let Some(req) = rx.recv().await {
                recorded.lock().push((req.op, req.route.clone()));
                let result = match script.next() {
                    Some(false) => Err(RibError::Unreachable),
                    _ => Ok(()),
                };
                let _ = req.reply.send(result);
            }
        });
        (FibHandle::new(tx), calls)
    }
}
