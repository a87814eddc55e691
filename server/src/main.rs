use clap::Parser;
use log::{error, info, warn};
use server::config::RelayConfig;
use server::network::Server;
use server::storage::{JsonFileStorage, MemoryStorage, StorageHandle};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Transparent relay in front of a game server", long_about = None)]
struct Args {
    /// JSON config file; defaults are used when it does not exist
    #[arg(short = 'c', long, default_value = "relay.json")]
    config: PathBuf,

    /// Interface to listen on
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Backend server as host:port
    #[arg(short, long)]
    backend: Option<String>,

    /// Tick rate (updates per second)
    #[arg(short, long)]
    tick_rate: Option<u32>,

    /// Storage file; pass an empty string to keep data in memory
    #[arg(short, long)]
    data: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    let mut config = if args.config.exists() {
        RelayConfig::load(&args.config)?
    } else {
        warn!("Config {} not found, using defaults", args.config.display());
        RelayConfig::default()
    };

    if let Some(host) = &args.host {
        config.network_interface = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(backend) = &args.backend {
        config.set_backend(backend)?;
    }
    if let Some(tick_rate) = args.tick_rate {
        config.update_fps = tick_rate;
    }
    if let Some(data) = &args.data {
        config.data_path = (!data.as_os_str().is_empty()).then(|| data.clone());
    }
    Ok(config.normalized()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = load_config(&args)?;

    let storage = match &config.data_path {
        Some(path) => {
            info!("Storing data in {}", path.display());
            StorageHandle::spawn(JsonFileStorage::open(path)?)
        }
        None => {
            info!("Storing data in memory only");
            StorageHandle::spawn(MemoryStorage::new())
        }
    };

    info!("Starting relay {:?}...", config.server_name);
    info!("Tick rate: {} Hz", config.update_fps);

    let mut server = Server::new(config, storage).await?;

    let handle = server.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down gracefully...");
                handle.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    server.run().await?;

    Ok(())
}
