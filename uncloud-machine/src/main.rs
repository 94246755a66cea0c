//! The uncloud machine daemon: joins machines into an encrypted overlay
//! network and serves the cluster membership API on every member.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use uncloud_machine::{Daemon, DaemonOptions, DEFAULT_CONFIG_PATH, DEFAULT_SOCKET_PATH};

#[derive(Debug, Parser)]
#[command(name = "uncloudd", about = "Uncloud machine daemon")]
struct Opts {
    /// Path of the persisted machine state document.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Path of the local API socket.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Name of the cluster tunnel interface.
    #[arg(long, default_value = uncloud_net::INTERFACE_NAME)]
    interface: String,

    /// WireGuard listen port.
    #[arg(long, default_value_t = uncloud_net::LISTEN_PORT)]
    listen_port: u16,

    /// Port the management API is served on over the overlay.
    #[arg(long, default_value_t = uncloud_machine::MACHINE_API_PORT)]
    api_port: u16,

    /// Address to advertise for control-plane RPC instead of the management
    /// IP.
    #[arg(long)]
    advertise_address: Option<IpAddr>,

    /// Do not touch the kernel tunnel interface. Useful for development on
    /// machines without WireGuard.
    #[arg(long)]
    no_network: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .env()
        .init()?;

    let opts = Opts::parse();
    let daemon = Arc::new(Daemon::new(DaemonOptions {
        config_path: opts.config,
        socket_path: opts.socket,
        interface: opts.interface,
        listen_port: opts.listen_port,
        api_port: opts.api_port,
        advertise_address: opts.advertise_address,
        manage_network: !opts.no_network,
    })?);

    daemon.clone().start().await;

    let server = tokio::spawn(daemon.clone().serve());

    tokio::signal::ctrl_c().await?;
    log::info!("received shutdown signal");
    daemon.stop();

    server.await??;
    Ok(())
}
