//! Cairn daemon: runs the peer exchange service of a node.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use cairn_network::{Peerlist, Pex};
use cairn_utils::{format_duration, LogFormat, ShutdownController, Timestamp};
use clap::Parser;

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "cairn-daemon", about = "Cairn node daemon")]
struct Cli {
    /// Data directory holding the peer list.
    #[arg(long, env = "CAIRN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Maximum number of known peers (0 = unbounded).
    #[arg(long, env = "CAIRN_MAX_PEERS")]
    max_peers: Option<usize>,

    /// Bootstrap peer addresses (comma-separated: "1.2.3.4:6000,5.6.7.8:6000").
    #[arg(long, env = "CAIRN_DEFAULT_CONNECTIONS", value_delimiter = ',')]
    default_connections: Vec<String>,

    /// Accept loopback peer addresses.
    #[arg(long, env = "CAIRN_ALLOW_LOCALHOST")]
    allow_localhost: bool,

    /// Run without networking; peer maintenance is skipped.
    #[arg(long, env = "CAIRN_NETWORK_DISABLED")]
    network_disabled: bool,

    /// Download bootstrap peers from this URL at startup.
    #[arg(long, env = "CAIRN_PEER_LIST_URL")]
    peer_list_url: Option<String>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "CAIRN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: "human" or "json".
    #[arg(long, env = "CAIRN_LOG_FORMAT")]
    log_format: Option<String>,

    /// Path to a TOML configuration file. If provided, file settings
    /// are used as the base; CLI flags and env vars override them.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the peer exchange service until SIGINT/SIGTERM.
    Run,
    /// Print the stored peer list.
    Peers,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(DaemonConfig, Command)> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_toml_file(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(dir) = self.data_dir {
            config.pex.data_dir = dir;
        }
        if let Some(max) = self.max_peers {
            config.pex.max_peers = max;
        }
        if !self.default_connections.is_empty() {
            config.default_connections = self.default_connections;
        }
        config.pex.allow_localhost |= self.allow_localhost;
        config.pex.network_disabled |= self.network_disabled;
        if let Some(url) = self.peer_list_url {
            config.pex.download_peer_list = true;
            config.pex.peer_list_url = Some(url);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config.pex.validate()?;

        Ok((config, self.command))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, command) = Cli::parse().into_config()?;

    let format: LogFormat = config.log_format.parse().map_err(anyhow::Error::msg)?;
    cairn_utils::init_logging(format, &config.log_level);

    match command {
        Command::Run => run(config).await,
        Command::Peers => print_peers(&config),
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    tracing::info!(
        data_dir = %config.pex.data_dir.display(),
        max_peers = config.pex.max_peers,
        network_disabled = config.pex.network_disabled,
        "starting cairn peer exchange"
    );
    if !config.default_connections.is_empty() {
        tracing::info!("default connections: {}", config.default_connections.join(", "));
    }

    let pex = Arc::new(Pex::new(config.pex, &config.default_connections)?);
    let runner = {
        let pex = pex.clone();
        tokio::spawn(async move { pex.run().await })
    };

    let signals = ShutdownController::new();
    signals.wait_for_signal().await;

    tracing::info!("shutdown signal received, stopping peer exchange");
    pex.shutdown();
    runner.await??;

    tracing::info!("cairn daemon exited cleanly");
    Ok(())
}

fn print_peers(config: &DaemonConfig) -> anyhow::Result<()> {
    let peerlist = Peerlist::with_policy(0, config.pex.retry_policy());
    peerlist.load(&config.pex.data_dir)?;

    let now = Timestamp::now();
    let mut peers = peerlist.all();
    peers.sort_by(|a, b| a.addr.cmp(&b.addr));
    for peer in &peers {
        let mut flags = Vec::new();
        if peer.trusted {
            flags.push("trusted");
        }
        if peer.private {
            flags.push("private");
        }
        if peer.valid {
            flags.push("valid");
        }
        println!(
            "{:<24} seen {:>8} ago  {}",
            peer.addr,
            format_duration(peer.last_seen.elapsed_since(now)),
            flags.join(",")
        );
    }
    println!("{} peers", peers.len());
    Ok(())
}
