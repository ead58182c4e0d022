//! View configuration, built on top of [`crate::paxos`].
//!
//! A view is an ordered membership list agreed on by Paxos instance
//! number = view id. Joining or leaving proposes the next instance with
//! the current membership plus/minus one node. A heartbeat loop elects
//! the lowest-addressed member as pinger: it pings everyone else (or,
//! if it isn't the lowest, pings only the lowest) and proposes removal
//! of whichever member stops answering.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::connection::LossyConfig;
use crate::paxos::protocol::{decode_heartbeat_arg, encode_heartbeat_arg, PROC_HEARTBEAT};
use crate::paxos::Paxos;
use crate::rpc::{RpcClient, RpcServer};

/// Upcall fired once a new view is committed.
pub type ViewChangeHook = Arc<dyn Fn(u32) + Send + Sync>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
const HEARTBEAT_RPC_TIMEOUT: Duration = Duration::from_secs(1);

struct State {
    vid: u32,
    members: Vec<String>,
}

/// The view manager for one node.
pub struct Config {
    me: String,
    paxos: Paxos,
    state: Mutex<State>,
    on_change: Mutex<Option<ViewChangeHook>>,
    stop: Notify,
    lossy: LossyConfig,
}

fn encode_members(members: &[String]) -> Vec<u8> {
    members.join(" ").into_bytes()
}

fn decode_members(v: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(v).split_whitespace().map(str::to_string).collect()
}

impl Config {
    /// Creates the view manager for `me`. `first` must be true on
    /// exactly the one node that bootstraps view 1 containing only
    /// itself; every other node learns the view by joining.
    pub fn new(first_addr: &str, me: &str, lossy: LossyConfig) -> Arc<Self> {
        let first = me == first_addr;
        let initial = encode_members(&[first_addr.to_string()]);
        let paxos = Paxos::new(me, first, initial, lossy);
        let state = if first { State { vid: 1, members: vec![first_addr.to_string()] } } else { State { vid: 0, members: Vec::new() } };
        Arc::new(Self { me: me.to_string(), paxos, state: Mutex::new(state), on_change: Mutex::new(None), stop: Notify::new(), lossy })
    }

    pub async fn set_view_change_hook(&self, hook: ViewChangeHook) {
        *self.on_change.lock().await = Some(hook);
    }

    pub fn myaddr(&self) -> &str {
        &self.me
    }

    pub async fn vid(&self) -> u32 {
        self.state.lock().await.vid
    }

    pub async fn get_view(&self, instance: u32) -> Vec<String> {
        self.paxos.acceptor.value(instance).await.map(|v| decode_members(&v)).unwrap_or_default()
    }

    pub async fn is_member(&self, m: &str, vid: u32) -> bool {
        self.get_view(vid).await.iter().any(|x| x == m)
    }

    /// Serializes this node's Paxos log, for transfer to a node
    /// catching up on past views.
    pub async fn dump(&self) -> Vec<u8> {
        self.paxos.acceptor.snapshot().await
    }

    pub async fn restore(&self, bytes: &[u8]) -> crate::codec::Result<()> {
        self.paxos.acceptor.restore(bytes).await?;
        let instance = self.paxos.acceptor.instance().await;
        if instance > 0 {
            let members = self.get_view(instance).await;
            let mut state = self.state.lock().await;
            state.vid = instance;
            state.members = members;
        }
        Ok(())
    }

    /// Registers Paxos and heartbeat RPCs on `server`, and wires this
    /// config's commit hook so freshly decided views update local
    /// state. Spawns the heartbeat loop. Must be called once, after the
    /// server is constructed but before [`RpcServer::serve`] runs.
    pub fn start(self: &Arc<Self>, server: &RpcServer) {
        self.paxos.register(server);

        let this = self.clone();
        self.paxos.acceptor.set_commit_hook(Arc::new(move |instance, value| {
            let this = this.clone();
            tokio::spawn(async move {
                this.on_commit(instance, value).await;
            });
        }));

        register_heartbeat(server, self.clone());

        let this = self.clone();
        tokio::spawn(async move {
            this.heartbeat_loop().await;
        });
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    async fn on_commit(&self, instance: u32, value: Vec<u8>) {
        let members = decode_members(&value);
        {
            let mut state = self.state.lock().await;
            state.vid = instance;
            state.members = members;
        }
        if let Some(hook) = self.on_change.lock().await.clone() {
            hook(instance);
        }
    }

    /// Proposes adding `new_member` to the view, provided the caller's
    /// view of `vid` is still current.
    pub async fn add(&self, new_member: String, vid: u32) -> bool {
        let (cur_members, next_vid) = {
            let state = self.state.lock().await;
            if state.vid != vid {
                return false;
            }
            (state.members.clone(), state.vid + 1)
        };
        let mut proposed = cur_members.clone();
        proposed.push(new_member);
        self.paxos.proposer.run(next_vid, cur_members, encode_members(&proposed)).await
    }

    async fn remove(&self, dead: &str) -> bool {
        let (cur_members, next_vid) = {
            let state = self.state.lock().await;
            (state.members.clone(), state.vid + 1)
        };
        let proposed: Vec<String> = cur_members.iter().filter(|m| *m != dead).cloned().collect();
        self.paxos.proposer.run(next_vid, cur_members, encode_members(&proposed)).await
    }

    async fn heartbeat_loop(&self) {
        loop {
            tokio::select! {
                _ = self.stop.notified() => return,
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            }

            let (vid, members) = {
                let state = self.state.lock().await;
                (state.vid, state.members.clone())
            };
            if !members.iter().any(|m| m == &self.me) {
                continue;
            }

            let pinger = members.iter().min().cloned().unwrap_or_default();
            let mut failed = None;
            if pinger == self.me {
                for m in &members {
                    if m == &self.me {
                        continue;
                    }
                    if !self.ping(m, vid).await {
                        failed = Some(m.clone());
                        break;
                    }
                }
            } else if !self.ping(&pinger, vid).await {
                failed = Some(pinger.clone());
            }

            if let Some(dead) = failed {
                if self.vid().await == vid {
                    self.remove(&dead).await;
                }
            }
        }
    }

    async fn ping(&self, addr: &str, vid: u32) -> bool {
        let client = RpcClient::new(addr, 0, self.lossy);
        let arg = encode_heartbeat_arg(&self.me, vid);
        match tokio::time::timeout(HEARTBEAT_RPC_TIMEOUT, client.call_raw(PROC_HEARTBEAT, arg)).await {
            Ok(Ok((ret, _))) => ret == 0,
            _ => false,
        }
    }
}

fn register_heartbeat(server: &RpcServer, config: Arc<Config>) {
    server.register(PROC_HEARTBEAT, move |body| {
        let config = config.clone();
        async move {
            let Ok((from, their_vid)) = decode_heartbeat_arg(&body) else { return (-2, Vec::new()) };
            let my_vid = config.vid().await;
            tracing::trace!(from, their_vid, my_vid, "heartbeat");
            if their_vid == my_vid || config.paxos.proposer.is_running().await {
                (0, Vec::new())
            } else {
                (1, Vec::new())
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_encoding_round_trips() {
        let members = vec!["10.0.0.1:1".to_string(), "10.0.0.2:1".to_string()];
        let encoded = encode_members(&members);
        assert_eq!(decode_members(&encoded), members);
    }

    #[tokio::test]
    async fn first_node_bootstraps_view_one() {
        let cfg = Config::new("10.0.0.1:9100", "10.0.0.1:9100", LossyConfig::none());
        assert_eq!(cfg.vid().await, 1);
        assert_eq!(cfg.get_view(1).await, vec!["10.0.0.1:9100".to_string()]);
    }
}
