//! SockRelay - Minimal TCP event relay
//!
//! Runs either the relay server or an interactive chat client.

use std::io::BufRead;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sockrelay::config::{self, Config};
use sockrelay::network::{ClientEvent, RelayClient, Server, ServerEvent};

/// Event key used by the interactive client
const MESSAGE_EVENT: &str = "message";

/// SockRelay - relay events between connected peers
#[derive(Parser)]
#[command(name = "sockrelay")]
#[command(version)]
#[command(about = "Relay named events between connected peers", long_about = None)]
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
    /// Run the relay server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to
        #[arg(short, long)]
        bind: Option<String>,

        /// Only accept peers connecting from loopback
        #[arg(long)]
        loopback_only: bool,
    },

    /// Connect to a relay and chat from the console
    Client {
        /// Relay host
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Relay port
        #[arg(short, long)]
        port: Option<u16>,
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
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Server {
            port,
            bind,
            loopback_only,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            config.server.restrict_to_loopback |= loopback_only;
            run_server(config).await?;
        }
        Commands::Client { host, port } => {
            if let Some(host) = host {
                config.client.host = host;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            run_client(config).await?;
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

/// Run the relay until Ctrl+C
async fn run_server(config: Config) -> anyhow::Result<()> {
    let mut server = Server::new(config.server.clone());
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    // A bind failure is the only error that ends the relay.
    server.start().await?;

    if config.server.restrict_to_loopback {
        tracing::info!("Accepting loopback peers only");
    }

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::Started { bind_addr } => {
                        tracing::info!("Serving on {}", bind_addr);
                    }
                    ServerEvent::ClientConnected { id, addr } => {
                        tracing::debug!("Accepted {} ({})", addr, id);
                    }
                    ServerEvent::ClientRejected { addr } => {
                        tracing::debug!("Rejected {}", addr);
                    }
                    ServerEvent::ClientDisconnected { id, addr, reason } => {
                        tracing::debug!("{} ({}) left: {}", addr, id, reason);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Stopped => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    if server.is_running().await {
        server.stop().await?;
    }
    tracing::info!("Server stopped");

    Ok(())
}

/// Interactive console client: prints received messages, sends typed lines
async fn run_client(config: Config) -> anyhow::Result<()> {
    let mut client = RelayClient::new(config.client.clone());
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;

    client.on(MESSAGE_EVENT, |data| {
        let text = data
            .get("message")
            .and_then(|m| m.as_str())
            .ok_or_else(|| anyhow::anyhow!("message event without text: {}", data))?;
        println!("Received message: {}", text);
        Ok(())
    });

    client.connect_configured().await?;

    let mut lines = spawn_stdin_reader();
    prompt().await?;

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                let text = line.trim_end();
                if text == "quit" {
                    break;
                }
                if let Err(e) = client.send(MESSAGE_EVENT, &json!({ "message": text })).await {
                    tracing::error!("Failed to send event: {}", e);
                }
                prompt().await?;
            }
            Some(event) = event_rx.recv() => {
                if let ClientEvent::Disconnected { reason } = event {
                    println!("Disconnected: {}", reason);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await;
    Ok(())
}

/// Forward stdin lines from a plain OS thread.
///
/// A blocked stdin read there does not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || forward_lines(std::io::stdin().lock(), &tx));
    rx
}

/// Send each line of `reader` until it ends or the receiver goes away
fn forward_lines<R: BufRead>(reader: R, tx: &mpsc::UnboundedSender<String>) {
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
}

async fn prompt() -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(b"Enter message to send (or 'quit' to exit): ")
        .await?;
    stdout.flush().await
}
