use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::sync::mpsc;

use blockchain_node::blockchain::{Ledger, SledStore, Wallet};
use blockchain_node::config::NodeConfig;
use blockchain_node::node::{Node, UdpTransport};

#[derive(Parser, Debug)]
#[command(name = "blockchain-node", about = "A peer-to-peer proof-of-work blockchain node")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:3020
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer to gossip with; repeat for several peers
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,

    /// Data directory for sled
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn load_config(args: Args) -> anyhow::Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.node.listen = listen;
    }
    if !args.peers.is_empty() {
        config.node.peers = args.peers;
    }
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }

    config.validate()?;
    Ok(config)
}

fn load_wallet(config: &NodeConfig) -> anyhow::Result<Wallet> {
    match &config.node.secret_key {
        Some(secret_key) => {
            Wallet::from_secret_key_hex(secret_key).context("Invalid secret_key in configuration")
        }
        None => {
            warn!("No secret_key configured, this node runs with a fresh wallet");
            Ok(Wallet::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = load_config(Args::parse())?;
    let wallet = load_wallet(&config)?;
    info!("Node wallet address: {}", wallet.address());

    std::fs::create_dir_all(&config.node.data_dir).with_context(|| {
        format!("Failed to create data directory {}", config.node.data_dir.display())
    })?;
    let store = SledStore::open(&config.node.data_dir)
        .with_context(|| format!("Failed to open storage at {}", config.node.data_dir.display()))?;
    let ledger = Arc::new(Ledger::open(Arc::new(store))?);
    info!("Loaded blockchain with tip at index {}", ledger.tip_index());

    let transport = UdpTransport::bind(
        config.node.listen,
        config.node.peers.clone(),
        config.node.heartbeat_interval(),
    )
    .await
    .with_context(|| format!("Failed to bind {}", config.node.listen))?;
    info!(
        "Listening on {} with {} configured peers",
        config.node.listen,
        config.node.peers.len()
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let _transport_tasks = transport.spawn(inbound_tx);

    let node = Arc::new(Node::new(
        ledger.clone(),
        transport,
        wallet,
        config.proof_of_work(),
        config.sync_settings(),
    ));
    node.start();

    tokio::select! {
        _ = node.clone().run(inbound_rx) => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    ledger.flush()?;
    Ok(())
}
