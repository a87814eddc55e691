use clap::Parser;
use client::game::LocalPlayer;
use client::network::Connection;
use log::{info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless scripted game client", long_about = None)]
struct Args {
    /// Relay or game server to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:12345")]
    server: String,

    /// Player name sent in the joining update
    #[arg(short, long, default_value = "Bot")]
    name: String,

    /// Entity id to announce; random when omitted
    #[arg(short, long)]
    entity_id: Option<u64>,

    /// Chat line to send after joining; may be repeated
    #[arg(short = 'c', long = "chat")]
    chat: Vec<String>,

    /// Number of random steps to take
    #[arg(short = 'w', long, default_value = "0")]
    wander: u32,

    /// Milliseconds between scripted actions
    #[arg(short = 'i', long, default_value = "500")]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let mut rng = rand::thread_rng();
    let entity_id = args.entity_id.unwrap_or_else(|| rng.gen_range(1..1_000_000));

    info!("Connecting to {} as {} #{}", args.server, args.name, entity_id);
    let mut connection = Connection::connect(&args.server).await?;
    let mut player = LocalPlayer::new(entity_id, &args.name);
    connection.send(&player.join_packet()).await?;

    let mut script = args.chat.into_iter();
    let mut steps_left = args.wander;
    let mut ticker = interval(Duration::from_millis(args.interval_ms.max(1)));

    loop {
        tokio::select! {
            received = connection.recv() => {
                match received? {
                    Some(packet) => {
                        if let Some(line) = player.apply(&packet) {
                            println!("{line}");
                        }
                    }
                    None => {
                        info!("Server closed the connection");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if let Some(line) = script.next() {
                    connection.send(&LocalPlayer::chat(&line)).await?;
                } else if steps_left > 0 {
                    steps_left -= 1;
                    connection.send(&player.wander(&mut rng)).await?;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, disconnecting...");
                if let Err(e) = connection.shutdown().await {
                    warn!("Shutdown failed: {}", e);
                }
                break;
            }
        }
    }

    Ok(())
}
