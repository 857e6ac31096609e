use foundations::settings::settings;
use foundations::telemetry::settings::TelemetrySettings;

/// Daemon settings, loadable from YAML via `--config`.
#[settings(impl_default = false)]
pub struct RibdSettings {
    /// Telemetry settings.
    pub telemetry: TelemetrySettings,
    /// Client protocol server settings.
    pub server: ServerSettings,
    /// Kernel synchronization settings.
    pub kernel: KernelSettings,
}

impl Default for RibdSettings {
    fn default() -> Self {
        RibdSettings {
            telemetry: Default::default(),
            server: Default::default(),
            kernel: Default::default(),
        }
    }
}

#[settings(impl_default = false)]
pub struct ServerSettings {
    /// Address the client protocol listener binds.
    pub listen_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            listen_addr: "127.0.0.1:2600".to_string(),
        }
    }
}

#[settings(impl_default = false)]
pub struct KernelSettings {
    /// Kernel routing table routes land in unless a message overrides it.
    pub default_table: u32,
    /// Receive timeout on the netlink command socket, in milliseconds.
    pub receive_timeout_ms: u64,
    /// Reopen attempts for the netlink listener before giving up.
    pub retry_limit: u32,
}

impl Default for KernelSettings {
    fn default() -> Self {
        KernelSettings {
            default_table: 254,
            receive_timeout_ms: 1000,
            retry_limit: 5,
        }
    }
}
