use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};

use koneko_relay::auth::HttpIdentityVerifier;
use koneko_relay::config::RelayConfig;
use koneko_relay::relay::server::RelayServer;
use koneko_relay::transport::endpoint::RelayEndpoint;

#[derive(Parser)]
#[command(name = "koneko-relay", about = "UDP relay server for koneko presence sessions")]
struct Args {
    /// UDP port to bind on all interfaces
    #[arg(default_value_t = 31130)]
    port: u16,

    /// base URL of the identity service that join tokens are checked against
    #[arg(long, default_value = "https://api.koneko.cat/")]
    identity_url: String,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[arg(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let mut config = RelayConfig::new(bind_addr);
    config.identity_base_url = args.identity_url;
    let config = Arc::new(config);

    let (endpoint, events) = RelayEndpoint::bind(config.clone()).await?;
    info!("relay listening on {}", endpoint.local_addr()?);

    let verifier = Arc::new(HttpIdentityVerifier::new(&config.identity_base_url)?);
    let mut server = RelayServer::new(endpoint.clone(), events, verifier, config);

    // the receiver runs as its own task so that inbound bursts and the tick
    // loop cannot stall each other
    let recv_endpoint = endpoint.clone();
    tokio::spawn(async move { recv_endpoint.recv_loop().await });

    server.run().await;
    Ok(())
}
