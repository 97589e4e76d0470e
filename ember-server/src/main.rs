use anyhow::Result;
use clap::Parser;
use ember_server::config::ServerConfig;
use ember_server::replication::parse_host_port;
use ember_server::Server;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ember-server", version, about = "Redis-compatible store with durability and replication")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address as host:port, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Start as a replica of host:port
    #[arg(long)]
    replicaof: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = &args.listen {
        let (host, port) = parse_host_port(listen).map_err(anyhow::Error::msg)?;
        config.server.host = host;
        config.server.port = port;
    }
    if let Some(target) = &args.replicaof {
        parse_host_port(target).map_err(anyhow::Error::msg)?;
        config.replication.replica_of = Some(target.clone());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("Starting Ember Server v{}", env!("CARGO_PKG_VERSION"));
    let server = Server::new(config).await?;
    server.run().await
}
