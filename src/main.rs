//! duomux: a dual-protocol (SOCKS5 + HTTP) client-side proxy front-end.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use duomux::config::ProxyConfig;
use duomux::host_match::SuffixHostMatcher;
use duomux::listener::ListenerMultiplexer;
use duomux::tunnel::FramedTcpTunnel;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "duomux")]
#[command(version = VERSION)]
#[command(about = "Dual-protocol (SOCKS5 + HTTP) client-side proxy front-end", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output below warnings.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dual-protocol listener and connect to the tunnel peer.
    Run {
        /// Configuration file path.
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Load and validate a configuration file without starting the listener.
    CheckConfig {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = ProxyConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;
    println!("{} is valid", path.display());
    Ok(())
}

async fn run(path: PathBuf) -> Result<()> {
    let config = ProxyConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?;
    config.validate().map_err(anyhow::Error::msg)?;

    info!("connecting to tunnel peer at {}", config.tunnel_addr);
    let tunnel_stream = tokio::net::TcpStream::connect(config.tunnel_addr)
        .await
        .with_context(|| format!("connecting to tunnel peer {}", config.tunnel_addr))?;
    let (tunnel, tunnel_reader) = FramedTcpTunnel::new(tunnel_stream);

    let host_match = Arc::new(SuffixHostMatcher::new(config.host_match.tunnel_suffixes.clone()));
    let listener = ListenerMultiplexer::new(config, Arc::new(tunnel), host_match);
    let tcp_listener = listener.bind().await.context("binding listen address")?;

    info!("listening on {}", tcp_listener.local_addr()?);
    listener.run(tcp_listener, tunnel_reader).await.context("listener exited")
}
