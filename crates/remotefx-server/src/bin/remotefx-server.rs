//! Remote plugin server binary. Listens for clients and hosts their processor chains.

use clap::Parser;
use remotefx_server::{
    BuiltinHost, HeadlessWindowSystem, PluginHost, Result, Server, ServerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "remotefx-server", version)]
struct Args {
    /// JSON config file; missing keys use defaults.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    /// Base port; the server listens on `port + id`.
    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    id: Option<u16>,

    /// Print the available plugins and exit.
    #[arg(long, default_value_t = false)]
    list_plugins: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.base_port = port;
    }
    if let Some(id) = args.id {
        config.server_id = id;
    }

    let host: Arc<dyn PluginHost> = Arc::new(BuiltinHost::new());
    if args.list_plugins {
        for plugin in host.available_plugins() {
            println!("{}", plugin.to_line());
        }
        return Ok(());
    }

    let server = Server::new(config, host, Arc::new(HeadlessWindowSystem::new()))?;
    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            handle.shutdown();
        }
    });

    server.run().await
}
