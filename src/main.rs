use std::sync::Arc;

use foundations::cli::Cli;
use foundations::telemetry::{self, log};
use foundations::BootstrapResult;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

mod client;
mod connection;
mod error;
mod fib;
mod interface;
mod kernel;
mod manager;
mod message;
mod redistribute;
mod rib;
mod settings;
mod table;

use client::ClientRegistry;
use manager::RoutingManager;
use settings::RibdSettings;

#[tokio::main]
async fn main() -> BootstrapResult<()> {
    let service_info = foundations::service_info!();
    let cli = Cli::<RibdSettings>::new(&service_info, vec![])?;
    let settings = cli.settings;

    let telemetry_server =
        telemetry::init_with_server(&service_info, &settings.telemetry, vec![])?;
    tokio::spawn(telemetry_server);

    let (rib_tx, rib_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(ClientRegistry::new());

    // Fatal if the netlink sockets cannot be opened. The initial dumps
    // seed the manager's channel before anything else is running, so the
    // RIB starts from the kernel's view of the world.
    let fib = kernel::start(rib_tx.clone(), &settings.kernel)?;
    let manager = RoutingManager::new(
        rib_rx,
        registry.clone(),
        fib,
        settings.kernel.default_table,
    );
    tokio::spawn(manager.run());

    let listener = TcpListener::bind(&settings.server.listen_addr).await?;
    log::info!("listening for protocol clients"; "addr" => %settings.server.listen_addr);

    tokio::select! {
        result = client::run_server(listener, registry, rib_tx, settings.kernel.default_table) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutdown requested");
        }
    }
    Ok(())
}
