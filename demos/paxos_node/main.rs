//! Standalone view-manager node: bootstraps or joins a Paxos-replicated
//! membership, then idles while its heartbeat loop keeps the view
//! current.

use std::path::PathBuf;

use clap::Parser;
use distlock::connection::LossyConfig;
use distlock::node_config::{lossy_from_env, NodeConfig};
use distlock::rpc::RpcServer;

#[derive(Parser, Debug)]
#[command(about = "Runs one node of a Paxos-replicated view")]
struct Args {
    /// This node's own listen address (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Address of the node that bootstraps view 1. Pass the same value
    /// as --listen on exactly one node.
    #[arg(long)]
    first: Option<String>,

    /// Load listen/first/lossy settings from a TOML file instead of
    /// flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Percent chance (0-100) of simulated frame loss, overriding
    /// RPC_LOSSY.
    #[arg(long)]
    lossy: Option<u8>,

    /// Number of RPC worker tasks.
    #[arg(long, default_value_t = 6)]
    workers: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let (listen, first, lossy_percent) = match (&args.config, &args.listen, &args.first) {
        (Some(path), _, _) => {
            let cfg = NodeConfig::load(path).expect("failed to read --config file");
            (cfg.listen, cfg.first, cfg.lossy_percent)
        }
        (None, Some(listen), Some(first)) => (listen.clone(), first.clone(), lossy_from_env(0)),
        _ => {
            eprintln!("either --config or both --listen and --first are required");
            std::process::exit(2);
        }
    };
    let lossy = LossyConfig { percent: args.lossy.unwrap_or(lossy_percent) };

    tracing::info!(listen, first, lossy_percent = lossy.percent, "starting paxos node");

    let config = distlock::config::Config::new(&first, &listen, lossy);
    let server = RpcServer::new(args.workers, lossy);
    config.start(&server);

    server.serve(&listen).await.expect("rpc server failed");
}
