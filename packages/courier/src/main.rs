use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use courier::config::CourierConfig;
use courier::echo::{ECHO_PROTOCOL, EchoHandler};
use courier::identity::NodeIdentity;
use courier::transport::iroh_transport::IrohTransport;
use courier::{Handler, PeerId, Service};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Signed peer-to-peer messaging over iroh")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.courier)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print this node's peer id
    Id,

    /// Run the echo service until interrupted
    Serve,

    /// Check whether a peer is reachable
    Ping {
        /// Peer id of the remote node
        peer: PeerId,
    },

    /// Ask a peer to echo some text
    Echo {
        /// Peer id of the remote node
        peer: PeerId,
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "courier=debug,warn"
    } else {
        "courier=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config = CourierConfig::new(cli.data_dir)?;
    let identity = NodeIdentity::load_or_generate(&config.data_dir)?;

    if let Commands::Id = cli.command {
        println!("{}", identity.peer_id());
        return Ok(());
    }

    let transport = Arc::new(
        IrohTransport::bind(&identity, ECHO_PROTOCOL, &config.transport).await?,
    );
    let service = Service::new(
        identity.codec(),
        transport.clone(),
        Arc::new(EchoHandler),
        config.service.clone(),
    );
    service.start().await?;

    let result = match cli.command {
        Commands::Id => Ok(()),
        Commands::Serve => serve(&service, &config).await,
        Commands::Ping { peer } => {
            let status = service.handler().ping(&service, &peer).await?;
            println!("{status}");
            Ok(())
        }
        Commands::Echo { peer, text } => {
            let reply = EchoHandler::echo(&service, &peer, &text)
                .await
                .with_context(|| format!("echo to {} failed", peer.short()))?;
            println!("{reply}");
            Ok(())
        }
    };

    service.shutdown().await;
    transport.shutdown().await;
    result
}

async fn serve(service: &Service, config: &CourierConfig) -> Result<()> {
    info!(peer = %service.peer_id(), protocol = %service.protocol(), "serving");

    if let Some(addr) = config.http_bind {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind http endpoint on {addr}"))?;
        info!("streaming endpoint listening on http://{}", listener.local_addr()?);
        let router = service.http_router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!("http endpoint stopped: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    let snapshot = service.metrics().snapshot();
    info!(
        requests = snapshot.outbound.requests,
        inbound = snapshot.inbound.messages,
        dropped = snapshot.inbound.dropped,
        "final counters"
    );
    Ok(())
}
