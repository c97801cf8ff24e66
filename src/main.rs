//! AgentLink - Agent Session Protocol Server
//!
//! Negotiates configuration, license status, heartbeat and feature toggles with
//! browser agents over a persistent WebSocket connection.

mod config;
mod network;
mod protocol;
mod session;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::{Client, NetworkConfig as NetConfig, Server, ServerEvent};
use protocol::{CodecKind, HandshakeInfo, Message};
use session::SessionEngine;

/// AgentLink - agent session protocol server
#[derive(Parser)]
#[command(name = "agentlink")]
#[command(author = "AgentLink Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Session protocol server for browser agents", long_about = None)]
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
    /// Run the session server
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind to (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        /// Wire encoding (overrides the config file)
        #[arg(long, value_enum)]
        codec: Option<CodecKind>,
    },

    /// Connect to a running server, handshake and print the replies
    Probe {
        /// Server URL
        #[arg(short, long, default_value_t = format!("ws://127.0.0.1:{}", protocol::DEFAULT_PORT))]
        url: String,

        /// Wire encoding
        #[arg(long, value_enum, default_value_t = CodecKind::Json)]
        codec: CodecKind,

        /// Domain to report in the handshake
        #[arg(short, long)]
        domain: Option<String>,

        /// Agent version to report in the handshake
        #[arg(long)]
        agent_version: Option<String>,

        /// How long to wait for each reply (seconds)
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
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

    /// Show protocol information
    Info,
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
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port, bind, codec } => {
            run_server(config, port, bind, codec).await?;
        }
        Commands::Probe {
            url,
            codec,
            domain,
            agent_version,
            timeout,
        } => {
            run_probe(&url, codec, domain, agent_version, Duration::from_secs(timeout)).await?;
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
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// Run the session server until Ctrl+C
async fn run_server(
    config: Config,
    port: Option<u16>,
    bind: Option<String>,
    codec: Option<CodecKind>,
) -> anyhow::Result<()> {
    let mut net_config = NetConfig::new(port.unwrap_or(config.network.port))
        .with_codec(codec.unwrap_or(config.network.codec));
    if let Some(bind) = bind.or_else(|| config.network.bind_address.clone()) {
        net_config = net_config.with_bind_address(bind);
    }
    net_config.channel_capacity = config.network.channel_capacity;
    net_config.connect_timeout_ms = config.network.connect_timeout_ms;

    let engine = SessionEngine::new(config.license.build_policy(), config.engine_options());

    tracing::info!(
        "Starting AgentLink server '{}' on {}",
        config.general.name,
        net_config.listen_addr()
    );

    let mut server = Server::new(net_config, engine);
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    let local_addr = server.start().await?;

    println!("\n========================================");
    println!("  AgentLink Server Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Address: ws://{}", local_addr);
    println!("  License policy: {:?}", config.license.policy);
    println!("========================================");
    println!("\nPress Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::SessionOpened { session_id, addr } => {
                        println!("+ Agent connected: {} ({})", addr, session_id);
                    }
                    ServerEvent::SessionClosed { session_id, addr, reason } => {
                        println!("- Agent disconnected: {} ({}) - {}", addr, session_id, reason);
                    }
                    ServerEvent::Error { message } => {
                        tracing::error!("Server error: {}", message);
                    }
                    ServerEvent::Started { bind_addr } => {
                        tracing::debug!("Accepting agents on {}", bind_addr);
                    }
                    ServerEvent::Stopped => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    // Give live sessions a moment to flush their shutdown message
    tokio::time::sleep(Duration::from_millis(200)).await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Handshake with a running server and print what it answers
async fn run_probe(
    url: &str,
    codec: CodecKind,
    domain: Option<String>,
    agent_version: Option<String>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut client = Client::connect(url, codec, timeout).await?;

    client
        .send(&Message::Handshake(HandshakeInfo {
            version: agent_version,
            domain,
            tab_id: None,
        }))
        .await?;
    client.send(&Message::Ping).await?;

    // license, config or shutdown, pong
    for _ in 0..3 {
        match client.recv_timeout(timeout).await? {
            Some(Message::License(status)) => {
                println!("license: {}", serde_json::to_string(&status)?);
            }
            Some(Message::Config(snapshot)) => {
                println!("config:  {}", serde_json::to_string_pretty(&snapshot)?);
            }
            Some(Message::Pong { time }) => {
                println!("pong:    {}", time);
            }
            Some(Message::Shutdown) => {
                println!("shutdown requested by server");
            }
            Some(other) => {
                println!("{}: {:?}", other.action(), other);
            }
            None => {
                println!("server closed the connection");
                break;
            }
        }
    }

    client.close().await?;
    Ok(())
}

/// Print protocol information
fn print_protocol_info() {
    println!("AgentLink Protocol Information");
    println!("==============================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Codecs: {}, {}", CodecKind::Json, CodecKind::Cbor);

    println!("\nAgent actions:");
    for action in [
        protocol::actions::HANDSHAKE,
        protocol::actions::PING,
        protocol::actions::REQUEST_CONFIG,
        protocol::actions::TOGGLE_FEATURE,
        protocol::actions::MESSAGE,
    ] {
        println!("  - {}", action);
    }

    println!("\nDefault features:");
    for (name, enabled) in session::DEFAULT_FEATURES {
        println!("  - {} = {}", name, enabled);
    }
}
