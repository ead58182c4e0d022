//! Standalone replicated lock server node: joins or bootstraps an RSM
//! group and serves the caching lock protocol on top of it.

use std::path::PathBuf;

use clap::Parser;
use distlock::connection::LossyConfig;
use distlock::lock::LockServer;
use distlock::node_config::{lossy_from_env, NodeConfig};
use distlock::rpc::RpcServer;
use distlock::rsm::protocol::{Status, PROC_CLIENT_INVOKE};
use distlock::rsm::Rsm;

const PROC_LOCK_ACQUIRE: u32 = distlock::lock::protocol::PROC_ACQUIRE;
const PROC_LOCK_RELEASE: u32 = distlock::lock::protocol::PROC_RELEASE;
const PROC_LOCK_STAT: u32 = distlock::lock::protocol::PROC_STAT;

#[derive(Parser, Debug)]
#[command(about = "Runs one replica of the replicated caching lock service")]
struct Args {
    /// This node's own listen address (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Address of the node that bootstraps the RSM group.
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

    tracing::info!(listen, first, lossy_percent = lossy.percent, "starting lock node");

    let rsm = Rsm::new(&first, &listen, lossy);
    let lock_server = LockServer::new(lossy);

    {
        let lock_server = lock_server.clone();
        rsm.register(PROC_LOCK_ACQUIRE, move |body| {
            let lock_server = lock_server.clone();
            async move {
                let Ok(arg) = distlock::lock::protocol::LockOpArg::decode(&body) else {
                    return (Status::Err.code(), Vec::new());
                };
                let ret = lock_server.acquire(arg.lid, arg.id, arg.xid).await;
                (Status::Ok.code(), vec![ret.code() as u8])
            }
        });
    }
    {
        let lock_server = lock_server.clone();
        rsm.register(PROC_LOCK_RELEASE, move |body| {
            let lock_server = lock_server.clone();
            async move {
                let Ok(arg) = distlock::lock::protocol::LockOpArg::decode(&body) else {
                    return (Status::Err.code(), Vec::new());
                };
                let ret = lock_server.release(arg.lid, arg.id, arg.xid).await;
                (Status::Ok.code(), vec![ret.code() as u8])
            }
        });
    }
    {
        let lock_server = lock_server.clone();
        rsm.register(PROC_LOCK_STAT, move |body| {
            let lock_server = lock_server.clone();
            async move {
                let Ok(lid) = distlock::lock::protocol::decode_stat_arg(&body) else {
                    return (Status::Err.code(), Vec::new());
                };
                let count = lock_server.stat(lid).await;
                (Status::Ok.code(), distlock::lock::protocol::encode_stat_reply(count))
            }
        });
    }

    let server = RpcServer::new(args.workers, lossy);
    rsm.start(&server);

    tracing::info!(proc = PROC_CLIENT_INVOKE, "rsm client-invoke entry point registered");
    server.serve(&listen).await.expect("rpc server failed");
}
