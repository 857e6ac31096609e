use thiserror::Error;

pub type Result<T> = std::result::Result<T, RibError>;

/// Route operation and transport failures. Every RIB operation reports
/// through this type; nothing in the daemon panics on a bad route.
#[derive(Debug, Error)]
pub enum RibError {
    /// A second static route for the same prefix was offered.
    #[error("route already exists")]
    RouteExists,

    /// Delete did not match any entry by type, table and nexthop.
    #[error("no matching route")]
    RouteNotFound,

    /// A recursive nexthop did not resolve, or the kernel reported the
    /// destination unreachable.
    #[error("nexthop unreachable")]
    Unreachable,

    /// The kernel refused the route change (EPERM).
    #[error("operation not permitted")]
    PermissionDenied,

    /// A client frame violated the wire protocol. Closes that client only.
    #[error("malformed frame: {0}")]
    Frame(String),

    /// Netlink transport failure.
    #[error("netlink: {0}")]
    Netlink(String),

    /// An internal channel to the routing manager or a kernel thread
    /// closed underneath us.
    #[error("internal channel closed: {0}")]
    Channel(&'static str),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl RibError {
    /// Map a kernel NLMSG_ERROR errno onto the route taxonomy.
    pub fn from_errno(errno: i32) -> RibError {
        match errno {
            libc::EPERM => RibError::PermissionDenied,
            libc::EEXIST => RibError::RouteExists,
            libc::ESRCH => RibError::RouteNotFound,
            libc::ENETUNREACH | libc::EHOSTUNREACH => RibError::Unreachable,
            errno => RibError::Netlink(format!("kernel rejected request: errno {errno}")),
        }
    }

    pub fn frame(msg: impl Into<String>) -> RibError {
        RibError::Frame(msg.into())
    }
}

impl From<octets::BufferTooShortError> for RibError {
    fn from(_: octets::BufferTooShortError) -> Self {
        RibError::Frame("truncated payload".to_string())
    }
}
