use clap::Parser;
use log::{error, info};
use server::config::{load_packs, ServerConfig};
use server::network::{Server, ServerHandle};
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,
    /// Tick rate (updates per second)
    #[clap(short, long, default_value = "60")]
    tick_rate: u32,
    /// Maximum number of transport connections
    #[clap(short, long, default_value = "64")]
    max_connections: usize,
    /// Seconds between respawn waves
    #[clap(long, default_value = "5")]
    respawn_time: u32,
    #[clap(long, default_value = "512")]
    map_width: i32,
    #[clap(long, default_value = "512")]
    map_length: i32,
    #[clap(long, default_value = "64")]
    map_depth: i32,
    /// Height of the flat ground, counted down from the sky
    #[clap(long, default_value = "32")]
    ground: i32,
    /// Content pack offered to clients; may be given several times
    #[clap(long = "pack")]
    packs: Vec<PathBuf>,
    /// Seconds to wait for a client to answer a pack offer
    #[clap(long, default_value = "10")]
    handshake_timeout: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            host: args.host,
            port: args.port,
            tick_rate: args.tick_rate,
            max_connections: args.max_connections,
            max_respawn_time: args.respawn_time,
            map_width: args.map_width,
            map_length: args.map_length,
            map_depth: args.map_depth,
            ground_height: args.ground,
            packs: args.packs,
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            ..ServerConfig::default()
        }
    }
}

/// Requests a graceful shutdown on Ctrl+C or SIGTERM.
fn spawn_signal_listener(handle: ServerHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(e) => {
                    error!("Cannot listen for SIGTERM: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        handle.shutdown();
                    }
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down gracefully..."),
                _ = terminate.recv() => info!("Received SIGTERM, shutting down gracefully..."),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down gracefully...");
            }
        }
        handle.shutdown();
    });
}

/// Main-method of the application.
/// Parses command-line arguments, loads content packs and runs the server
/// until it is asked to stop.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Args::parse());
    let packs = load_packs(&config.packs)?;
    info!(
        "Loaded {} content pack(s), {} bytes total",
        packs.len(),
        packs.iter().map(|pack| pack.data.len()).sum::<usize>()
    );

    let mut server = Server::new(config, packs).await?;
    spawn_signal_listener(server.handle());
    server.run().await?;

    info!("Server stopped");
    Ok(())
}
