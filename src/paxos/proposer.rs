//! The proposer half of single-decree Paxos. `stable`
//! gates concurrent rounds: only one [`Proposer::run`] executes at a
//! time per node, matching the original's single scoped lock held for
//! the whole round.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::connection::LossyConfig;
use crate::rpc::RpcClient;

use super::acceptor::Acceptor;
use super::protocol::{AcceptArg, DecideArg, PrepareArg, PrepareRes, Proposal, PROC_ACCEPT, PROC_DECIDE, PROC_PREPARE};

/// Per-RPC bound for the prepare/accept phases, so one dead peer stalls
/// a round by at most this long rather than `RpcClient`'s much longer
/// final deadline.
const PEER_RPC_TIMEOUT: Duration = Duration::from_secs(1);

struct State {
    stable: bool,
    my_n: Proposal,
}

pub struct Proposer {
    me: String,
    acceptor: Arc<Acceptor>,
    state: Mutex<State>,
    clients: Mutex<HashMap<String, RpcClient>>,
    lossy: LossyConfig,
}

impl Proposer {
    pub fn new(me: &str, acceptor: Arc<Acceptor>, lossy: LossyConfig) -> Arc<Self> {
        Arc::new(Self {
            me: me.to_string(),
            acceptor,
            state: Mutex::new(State { stable: true, my_n: Proposal::zero(me) }),
            clients: Mutex::new(HashMap::new()),
            lossy,
        })
    }

    pub async fn is_running(&self) -> bool {
        !self.state.lock().await.stable
    }

    async fn client_for(&self, addr: &str) -> RpcClient {
        let mut clients = self.clients.lock().await;
        clients
            .entry(addr.to_string())
            .or_insert_with(|| RpcClient::new(addr, 0, self.lossy))
            .clone()
    }

    /// Drives one round of Paxos for `instance`, proposing `new_value`
    /// to the members in `cur_nodes`. Returns whether a value was
    /// decided — not necessarily `new_value`, since a prior proposer's
    /// value may win instead.
    pub async fn run(&self, instance: u32, cur_nodes: Vec<String>, new_value: Vec<u8>) -> bool {
        let mut guard = self.state.lock().await;
        if !guard.stable {
            return false;
        }
        guard.stable = false;
        let n_h = self.acceptor.n_h().await;
        guard.my_n = Proposal { n: crate::paxos::protocol::PropT { n: n_h.n.n.max(guard.my_n.n.n) + 1 }, from: self.me.clone() };
        let my_n = guard.my_n.clone();
        drop(guard);

        let result = self.run_inner(instance, &cur_nodes, new_value, my_n).await;

        self.state.lock().await.stable = true;
        result
    }

    async fn run_inner(&self, instance: u32, cur_nodes: &[String], new_value: Vec<u8>, my_n: Proposal) -> bool {
        let Some((accepts, v_from_peers)) = self.prepare(instance, cur_nodes, &my_n).await else {
            return false;
        };
        if !majority(cur_nodes, &accepts) {
            return false;
        }
        let v = v_from_peers.unwrap_or(new_value);

        let accepted_by = self.accept(instance, &accepts, &my_n, &v).await;
        if !majority(cur_nodes, &accepted_by) {
            return false;
        }

        self.decide(instance, &accepted_by, &v).await;
        true
    }

    /// Sends `preparereq` to every node, returning the set that
    /// accepted and the highest-`n_a` value among their replies (if
    /// any). `None` means a peer reported it has already decided a
    /// later instance; the caller should give up this round.
    async fn prepare(&self, instance: u32, nodes: &[String], my_n: &Proposal) -> Option<(Vec<String>, Option<Vec<u8>>)> {
        let mut accepts = Vec::new();
        let mut best: Option<(Proposal, Vec<u8>)> = None;
        for addr in nodes {
            let arg = PrepareArg { instance, n: my_n.clone() };
            let client = self.client_for(addr).await;
            let Ok(Ok((ret, body))) = tokio::time::timeout(PEER_RPC_TIMEOUT, client.call_raw(PROC_PREPARE, arg.encode())).await else { continue };
            if ret != 0 {
                continue;
            }
            let Ok(res) = PrepareRes::decode(&body) else { continue };
            if res.oldinstance {
                self.acceptor.commit(instance, res.v_a).await;
                return None;
            }
            if res.accept {
                accepts.push(addr.clone());
                if !res.v_a.is_empty() && best.as_ref().map(|(n, _)| res.n_a > *n).unwrap_or(true) {
                    best = Some((res.n_a.clone(), res.v_a));
                }
            }
        }
        Some((accepts, best.map(|(_, v)| v)))
    }

    async fn accept(&self, instance: u32, nodes: &[String], my_n: &Proposal, v: &[u8]) -> Vec<String> {
        let mut accepted_by = Vec::new();
        for addr in nodes {
            let arg = AcceptArg { instance, n: my_n.clone(), v: v.to_vec() };
            let client = self.client_for(addr).await;
            let Ok(Ok((ret, body))) = tokio::time::timeout(PEER_RPC_TIMEOUT, client.call_raw(PROC_ACCEPT, arg.encode())).await else { continue };
            if ret != 0 {
                continue;
            }
            if super::decode_accept_reply(&body) {
                accepted_by.push(addr.clone());
            }
        }
        accepted_by
    }

    async fn decide(&self, instance: u32, nodes: &[String], v: &[u8]) {
        self.acceptor.commit(instance, v.to_vec()).await;
        for addr in nodes {
            if *addr == self.me {
                continue;
            }
            let arg = DecideArg { instance, v: v.to_vec() };
            let _ = self.client_for(addr).await.call_raw(PROC_DECIDE, arg.encode()).await;
        }
    }
}

/// Whether `present` contains a majority of `all`.
pub fn majority(all: &[String], present: &[String]) -> bool {
    let n = all.iter().filter(|m| present.contains(m)).count();
    n >= all.len() / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_requires_more_than_half() {
        let all = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(!majority(&all, &["a".to_string()]));
        assert!(majority(&all, &["a".to_string(), "b".to_string()]));
        assert!(majority(&all, &all));
    }
}
