//! Hubwire - Minimal bidirectional message bus
//!
//! Demo binary: a hub that echoes "message" envelopes back as "reply",
//! and a client that sends stdin lines to it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hubwire::config::{self, Config};
use hubwire::{Client, ClientError, Server, TransportKind};

/// Hubwire - typed messages between a hub and its peers
#[derive(Parser)]
#[command(name = "hubwire")]
#[command(author = "Hubwire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Exchange typed messages between a hub and its peers", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Listen on a Unix socket at this path instead of TCP
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Connect to a hub and send stdin lines as messages
    Client {
        /// Server address (host:port, or socket path with --transport unix)
        #[arg(short, long)]
        server: Option<String>,

        /// Transport to connect with (tcp or unix)
        #[arg(short, long)]
        transport: Option<TransportKind>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port, socket } => {
            run_server(config, port, socket).await?;
        }
        Commands::Client { server, transport } => {
            run_client(config, server, transport).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run the hub
async fn run_server(config: Config, port: Option<u16>, socket: Option<PathBuf>) -> anyhow::Result<()> {
    let mut server = Server::new(config.network_config());

    server.on_accept(|conn, id| {
        tracing::info!("Client {} connected from {}", id, conn.remote_addr());

        let reply_to = conn.clone();
        conn.on::<String, _>("message", move |text| {
            tracing::info!("{}: {}", id, text);
            reply_to.send("reply", &format!("echo: {}", text))?;
            Ok(())
        });

        conn.on_disconnect(move |reason| {
            tracing::info!("Client {} disconnected: {}", id, reason);
            Ok(())
        });
    });

    let socket = socket.or(config.server.socket_path.clone());
    let local_addr = match (socket, config.server.transport) {
        #[cfg(unix)]
        (Some(path), _) => {
            server
                .listen_on(TransportKind::Unix, &path.display().to_string())
                .await?
        }
        #[cfg(unix)]
        (None, TransportKind::Unix) => {
            anyhow::bail!("Unix transport requires a socket path (--socket or server.socket_path)")
        }
        #[cfg(not(unix))]
        (Some(_), _) => anyhow::bail!("Unix sockets are not supported on this platform"),
        (None, TransportKind::Tcp) => server.listen(port.unwrap_or(config.server.port)).await?,
    };

    println!("Hubwire server listening on {}", local_addr);
    println!("Press Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    server.shutdown().await?;
    tracing::info!("Server stopped");

    Ok(())
}

/// Run the demo client
async fn run_client(
    config: Config,
    server_addr: Option<String>,
    transport: Option<TransportKind>,
) -> anyhow::Result<()> {
    let Some(server_addr) = server_addr.or(config.client.server.clone()) else {
        anyhow::bail!("Please specify --server address or set client.server in the config");
    };
    let transport = transport.unwrap_or(config.client.transport);

    let client = Arc::new(Client::new(config.network_config()));

    client.on::<String, _>("reply", |text| {
        println!("<< {}", text);
        Ok(())
    });

    client.connect(&server_addr, transport).await?;
    println!("Connected to {}. Type a line and press Enter.", server_addr);

    let sender = client.clone();
    let input = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if let Err(e) = sender.send("message", &line).await {
                tracing::error!("send: {}", e);
                break;
            }
        }
        sender.close().await;
    });

    let result = tokio::select! {
        result = client.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nDisconnecting...");
            client.close().await;
            Ok(())
        }
    };
    input.abort();

    match result {
        Ok(()) | Err(ClientError::ServerClosed) => {
            tracing::info!("Client disconnected");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
