//! Single-decree Paxos, used by [`crate::config`] to agree on
//! successive group views.

pub mod acceptor;
pub mod log;
pub mod proposer;
pub mod protocol;

use std::sync::Arc;

use crate::codec::primitive::{read_bool, write_bool};
use crate::connection::LossyConfig;
use crate::rpc::RpcServer;

pub use acceptor::{Acceptor, CommitHook};
pub use proposer::Proposer;
pub use protocol::{PrepareArg, Proposal, PropT};

/// One node's Paxos participation: its acceptor (answers other
/// proposers) and proposer (drives its own rounds).
pub struct Paxos {
    pub acceptor: Arc<Acceptor>,
    pub proposer: Arc<Proposer>,
}

impl Paxos {
    pub fn new(me: &str, first: bool, initial_value: Vec<u8>, lossy: LossyConfig) -> Self {
        let acceptor = Acceptor::new(me, first, initial_value);
        let proposer = Proposer::new(me, acceptor.clone(), lossy);
        Self { acceptor, proposer }
    }

    /// Wires this node's acceptor RPCs onto `server`. The server must
    /// be listening at `me`, the address this node advertises to
    /// peers.
    pub fn register(&self, server: &RpcServer) {
        let acc = self.acceptor.clone();
        server.register(protocol::PROC_PREPARE, move |body| {
            let acc = acc.clone();
            async move {
                let arg = match protocol::PrepareArg::decode(&body) {
                    Ok(a) => a,
                    Err(_) => return (-2, Vec::new()),
                };
                let res = acc.prepare_handler(arg).await;
                (0, res.encode())
            }
        });

        let acc = self.acceptor.clone();
        server.register(protocol::PROC_ACCEPT, move |body| {
            let acc = acc.clone();
            async move {
                let arg = match protocol::AcceptArg::decode(&body) {
                    Ok(a) => a,
                    Err(_) => return (-2, Vec::new()),
                };
                let accepted = acc.accept_handler(arg).await;
                let mut reply = Vec::new();
                let _ = write_bool(&mut reply, accepted);
                (0, reply)
            }
        });

        let acc = self.acceptor.clone();
        server.register(protocol::PROC_DECIDE, move |body| {
            let acc = acc.clone();
            async move {
                let arg = match protocol::DecideArg::decode(&body) {
                    Ok(a) => a,
                    Err(_) => return (-2, Vec::new()),
                };
                acc.decide_handler(arg).await;
                (0, Vec::new())
            }
        });
    }
}

/// Decodes the single-byte boolean reply body produced by the accept
/// handler above (used by tests that exercise the handler through a
/// live [`RpcServer`] rather than calling [`Acceptor::accept_handler`]
/// directly).
pub fn decode_accept_reply(body: &[u8]) -> bool {
    let mut c = std::io::Cursor::new(body);
    read_bool(&mut c).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_node_bootstraps_instance_one() {
        let paxos = Paxos::new("10.0.0.1:9000", true, b"10.0.0.1:9000".to_vec(), LossyConfig::none());
        assert_eq!(paxos.acceptor.instance().await, 1);
        assert_eq!(paxos.acceptor.value(1).await.unwrap(), b"10.0.0.1:9000");
    }

    #[tokio::test]
    async fn three_node_round_reaches_agreement() {
        let addrs = vec!["127.0.0.1:27001".to_string(), "127.0.0.1:27002".to_string(), "127.0.0.1:27003".to_string()];
        let mut nodes = Vec::new();
        for (i, addr) in addrs.iter().enumerate() {
            let paxos = Paxos::new(addr, i == 0, addrs[..1].join(" ").into_bytes(), LossyConfig::none());
            let server = RpcServer::new(2, LossyConfig::none());
            paxos.register(&server);
            let srv = server.clone();
            let bind_addr = addr.clone();
            tokio::spawn(async move {
                let _ = srv.serve(&bind_addr).await;
            });
            nodes.push((paxos, server));
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let decided = nodes[0].0.proposer.run(2, addrs.clone(), addrs.join(" ").into_bytes()).await;
        assert!(decided);
        for (paxos, _) in &nodes {
            assert_eq!(paxos.acceptor.instance().await, 2);
        }
        for (_, server) in &nodes {
            server.shutdown();
        }
    }
}
