//! Primary/backup replicated state machine, built on top
//! of [`crate::config`]'s Paxos-ordered views.
//!
//! The primary stamps every client request with a [`protocol::Viewstamp`]
//! and fans it out to every backup before executing and replying.
//! Backups execute in viewstamp order and reply with a bare ack. When
//! the view changes, a background recovery task joins (for a brand-new
//! node) or re-synchronizes state with the new primary before the
//! service accepts requests again.

pub mod client;
pub mod protocol;
pub mod state_transfer;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::config::Config;
use crate::connection::LossyConfig;
use crate::rpc::{RpcClient, RpcServer};

pub use protocol::{Status, Viewstamp};
pub use state_transfer::StateTransfer;

pub type HandlerFuture = Pin<Box<dyn Future<Output = (i32, Vec<u8>)> + Send>>;
type HandlerFn = dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync;

const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(200);
const PEER_RPC_TIMEOUT: Duration = Duration::from_secs(5);

struct RsmState {
    myvs: Viewstamp,
    last_myvs: Viewstamp,
    primary: String,
    insync: bool,
    inviewchange: bool,
    vid_commit: u32,
    vid_insync: u32,
    backups: Vec<String>,
}

/// One node's participation in a replicated state machine group.
pub struct Rsm {
    me: String,
    config: Arc<Config>,
    stf: Mutex<Option<Arc<dyn StateTransfer>>>,
    handlers: RwLock<HashMap<u32, Arc<HandlerFn>>>,
    state: Mutex<RsmState>,
    invoke_mutex: Mutex<()>,
    recovery_notify: Notify,
    sync_notify: Notify,
    lossy: LossyConfig,
}

impl Rsm {
    /// Creates the RSM node for `me`. Exactly one node in the group
    /// must pass `me == first_addr`, bootstrapping view 1.
    pub fn new(first_addr: &str, me: &str, lossy: LossyConfig) -> Arc<Self> {
        let config = Config::new(first_addr, me, lossy);
        let first = me == first_addr;
        let rsm = Arc::new(Self {
            me: me.to_string(),
            config,
            stf: Mutex::new(None),
            handlers: RwLock::new(HashMap::new()),
            state: Mutex::new(RsmState {
                myvs: Viewstamp { vid: 0, seqno: 1 },
                last_myvs: Viewstamp { vid: 0, seqno: 0 },
                primary: first_addr.to_string(),
                insync: false,
                inviewchange: true,
                vid_commit: 0,
                vid_insync: 0,
                backups: Vec::new(),
            }),
            invoke_mutex: Mutex::new(()),
            recovery_notify: Notify::new(),
            sync_notify: Notify::new(),
            lossy,
        });

        let setup = rsm.clone();
        tokio::spawn(async move {
            let hook_target = setup.clone();
            setup
                .config
                .set_view_change_hook(Arc::new(move |vid| {
                    let rsm = hook_target.clone();
                    tokio::spawn(async move {
                        rsm.commit_change(vid).await;
                    });
                }))
                .await;

            if first {
                setup.commit_change(1).await;
            }

            setup.recovery_loop().await;
        });

        rsm
    }

    pub async fn set_state_transfer(&self, stf: Arc<dyn StateTransfer>) {
        *self.stf.lock().await = Some(stf);
    }

    /// Registers an application procedure, executed in viewstamp order
    /// on every replica (primary and backups alike).
    pub fn register<F, Fut>(&self, proc: u32, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (i32, Vec<u8>)> + Send + 'static,
    {
        let boxed: Arc<HandlerFn> = Arc::new(move |bytes| Box::pin(handler(bytes)));
        self.handlers.write().unwrap().insert(proc, boxed);
    }

    /// Wires the RSM's own RPCs (client invoke/members, internal
    /// invoke, transfer, join) plus the view manager underneath it onto
    /// `server`.
    pub fn start(self: &Arc<Self>, server: &RpcServer) {
        self.config.start(server);

        let this = self.clone();
        server.register(protocol::PROC_CLIENT_INVOKE, move |body| {
            let this = this.clone();
            async move {
                let Ok((procno, req)) = protocol::decode_client_invoke_arg(&body) else { return (Status::Err.code(), Vec::new()) };
                this.client_invoke(procno, req).await
            }
        });

        let this = self.clone();
        server.register(protocol::PROC_CLIENT_MEMBERS, move |_body| {
            let this = this.clone();
            async move {
                let members = this.client_members().await;
                (Status::Ok.code(), protocol::encode_members(&members))
            }
        });

        let this = self.clone();
        server.register(protocol::PROC_INVOKE, move |body| {
            let this = this.clone();
            async move {
                let Ok((vs, procno, req)) = protocol::decode_invoke_arg(&body) else { return (Status::Err.code(), Vec::new()) };
                (this.backup_invoke(vs, procno, req).await.code(), Vec::new())
            }
        });

        let this = self.clone();
        server.register(protocol::PROC_TRANSFERREQ, move |body| {
            let this = this.clone();
            async move {
                let Ok((src, last, vid)) = protocol::decode_transferreq_arg(&body) else { return (Status::Err.code(), Vec::new()) };
                let (status, res) = this.transferreq(&src, last, vid).await;
                (status.code(), res.map(|r| r.encode()).unwrap_or_default())
            }
        });

        let this = self.clone();
        server.register(protocol::PROC_TRANSFERDONEREQ, move |body| {
            let this = this.clone();
            async move {
                let Ok((m, vid)) = protocol::decode_transferdonereq_arg(&body) else { return (Status::Err.code(), Vec::new()) };
                (this.transferdonereq(&m, vid).await.code(), Vec::new())
            }
        });

        let this = self.clone();
        server.register(protocol::PROC_JOINREQ, move |body| {
            let this = this.clone();
            async move {
                let Ok((m, last)) = protocol::decode_joinreq_arg(&body) else { return (Status::Err.code(), Vec::new()) };
                let (status, log) = this.joinreq(&m, last).await;
                (status.code(), log.unwrap_or_default())
            }
        });
    }

    pub async fn am_i_primary(&self) -> bool {
        let state = self.state.lock().await;
        state.primary == self.me && !state.inviewchange
    }

    async fn client_for(&self, addr: &str) -> RpcClient {
        RpcClient::new(addr, 0, self.lossy)
    }

    async fn call_peer(&self, addr: &str, proc: u32, arg: Vec<u8>) -> Option<(i32, Vec<u8>)> {
        let client = self.client_for(addr).await;
        tokio::time::timeout(PEER_RPC_TIMEOUT, client.call_raw(proc, arg)).await.ok()?.ok()
    }

    async fn client_invoke(&self, procno: u32, req: Vec<u8>) -> (i32, Vec<u8>) {
        let _guard = self.invoke_mutex.lock().await;

        let (vs, backups) = {
            let mut state = self.state.lock().await;
            if state.inviewchange || state.primary != self.me {
                return (Status::NotPrimary.code(), Vec::new());
            }
            let vs = state.myvs;
            state.myvs.seqno += 1;
            let backups = self.config.get_view(state.vid_commit).await.into_iter().filter(|m| *m != self.me).collect::<Vec<_>>();
            (vs, backups)
        };

        let invoke_arg = protocol::encode_invoke_arg(vs, procno, &req);
        for backup in &backups {
            match self.call_peer(backup, protocol::PROC_INVOKE, invoke_arg.clone()).await {
                Some((ret, _)) if ret == Status::Ok.code() => {}
                _ => return (Status::Busy.code(), Vec::new()),
            }
        }

        let result = self.execute(procno, req).await;
        self.state.lock().await.last_myvs = vs;
        result
    }

    async fn backup_invoke(&self, vs: Viewstamp, procno: u32, req: Vec<u8>) -> Status {
        {
            let state = self.state.lock().await;
            if state.inviewchange {
                return Status::Busy;
            }
            if vs != state.myvs {
                return Status::Err;
            }
        }
        self.execute(procno, req).await;
        let mut state = self.state.lock().await;
        state.last_myvs = vs;
        state.myvs.seqno += 1;
        Status::Ok
    }

    async fn execute(&self, procno: u32, req: Vec<u8>) -> (i32, Vec<u8>) {
        let handler = self.handlers.read().unwrap().get(&procno).cloned();
        match handler {
            Some(h) => h(req).await,
            None => (Status::Err.code(), Vec::new()),
        }
    }

    async fn client_members(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut members = self.config.get_view(state.vid_commit).await;
        members.push(state.primary.clone());
        members
    }

    async fn transferreq(&self, _src: &str, last: Viewstamp, vid: u32) -> (Status, Option<protocol::TransferRes>) {
        let state = self.state.lock().await;
        if !state.insync || vid != state.vid_insync {
            return (Status::Busy, None);
        }
        let state_bytes = if last != state.last_myvs {
            match &*self.stf.lock().await {
                Some(stf) => stf.marshal_state(),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };
        (Status::Ok, Some(protocol::TransferRes { state: state_bytes, last: state.last_myvs }))
    }

    async fn transferdonereq(&self, m: &str, vid: u32) -> Status {
        let mut state = self.state.lock().await;
        if !state.insync || vid != state.vid_insync {
            return Status::Busy;
        }
        state.backups.retain(|b| b != m);
        if state.backups.is_empty() {
            self.sync_notify.notify_waiters();
        }
        Status::Ok
    }

    async fn joinreq(&self, m: &str, _last: Viewstamp) -> (Status, Option<Vec<u8>>) {
        let vid_commit = self.state.lock().await.vid_commit;
        if self.config.is_member(m, vid_commit).await {
            return (Status::Ok, Some(self.config.dump().await));
        }
        let am_primary = { self.state.lock().await.primary == self.me };
        if !am_primary {
            return (Status::Busy, None);
        }
        let _ = self.config.add(m.to_string(), vid_commit).await;
        let new_vid = self.config.vid().await;
        if self.config.is_member(m, new_vid).await {
            (Status::Ok, Some(self.config.dump().await))
        } else {
            (Status::Busy, None)
        }
    }

    async fn commit_change(&self, vid: u32) {
        let should_wake = {
            let mut state = self.state.lock().await;
            if vid <= state.vid_commit {
                return;
            }
            state.vid_commit = vid;
            state.inviewchange = true;
            self.set_primary(&mut state, vid).await;
            true
        };
        if should_wake {
            self.recovery_notify.notify_waiters();
        }
    }

    async fn set_primary(&self, state: &mut RsmState, vid: u32) {
        let current = self.config.get_view(vid).await;
        if current.iter().any(|m| m == &state.primary) {
            return;
        }
        let previous = self.config.get_view(vid.saturating_sub(1)).await;
        for m in previous {
            if current.contains(&m) {
                state.primary = m;
                return;
            }
        }
    }

    async fn recovery_loop(self: Arc<Self>) {
        loop {
            loop {
                let vid_commit = self.state.lock().await.vid_commit;
                if self.config.is_member(&self.me, vid_commit).await {
                    break;
                }
                let primary = self.state.lock().await.primary.clone();
                if self.join(&primary).await {
                    let new_vid = self.config.vid().await;
                    self.commit_change(new_vid).await;
                } else {
                    tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
                }
            }

            let (vid_insync, am_primary, primary) = {
                let mut state = self.state.lock().await;
                state.vid_insync = state.vid_commit;
                (state.vid_insync, state.primary == self.me, state.primary.clone())
            };

            let synced = if am_primary {
                self.sync_with_backups(vid_insync).await
            } else {
                self.sync_with_primary(&primary, vid_insync).await
            };

            let mut state = self.state.lock().await;
            if state.vid_insync == state.vid_commit && synced {
                state.myvs = Viewstamp { vid: state.vid_commit, seqno: 1 };
                state.inviewchange = false;
            }
            drop(state);

            self.recovery_notify.notified().await;
        }
    }

    async fn sync_with_backups(&self, vid_insync: u32) -> bool {
        let _barrier = self.invoke_mutex.lock().await;
        let backups = self.config.get_view(vid_insync).await.into_iter().filter(|m| *m != self.me).collect::<Vec<_>>();
        {
            let mut state = self.state.lock().await;
            state.insync = true;
            state.backups = backups;
        }
        drop(_barrier);

        loop {
            let (done, still_current) = {
                let state = self.state.lock().await;
                (state.backups.is_empty(), state.vid_insync == vid_insync)
            };
            if done || !still_current {
                break;
            }
            tokio::select! {
                _ = self.sync_notify.notified() => {}
                _ = tokio::time::sleep(SYNC_POLL_INTERVAL) => {}
            }
        }
        self.state.lock().await.insync = false;
        true
    }

    async fn sync_with_primary(&self, primary: &str, vid_insync: u32) -> bool {
        loop {
            if self.state.lock().await.vid_insync != vid_insync {
                return false;
            }
            if self.statetransfer(primary, vid_insync).await {
                self.statetransferdone(primary, vid_insync).await;
                return true;
            }
            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
    }

    async fn statetransfer(&self, m: &str, vid_insync: u32) -> bool {
        let last = self.state.lock().await.last_myvs;
        let arg = protocol::encode_transferreq_arg(&self.me, last, vid_insync);
        let Some((ret, body)) = self.call_peer(m, protocol::PROC_TRANSFERREQ, arg).await else { return false };
        if ret != Status::Ok.code() {
            return false;
        }
        let Ok(res) = protocol::TransferRes::decode(&body) else { return false };
        if res.last != last {
            if let Some(stf) = &*self.stf.lock().await {
                stf.unmarshal_state(&res.state);
            }
        }
        self.state.lock().await.last_myvs = res.last;
        true
    }

    async fn statetransferdone(&self, m: &str, vid_insync: u32) -> bool {
        let arg = protocol::encode_transferdonereq_arg(&self.me, vid_insync);
        matches!(self.call_peer(m, protocol::PROC_TRANSFERDONEREQ, arg).await, Some((ret, _)) if ret == Status::Ok.code())
    }

    async fn join(&self, m: &str) -> bool {
        let last = self.state.lock().await.last_myvs;
        let arg = protocol::encode_joinreq_arg(&self.me, last);
        let Some((ret, log)) = self.call_peer(m, protocol::PROC_JOINREQ, arg).await else { return false };
        if ret != Status::Ok.code() {
            return false;
        }
        self.config.restore(&log).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_node_becomes_primary_immediately() {
        let rsm = Rsm::new("10.0.0.1:9500", "10.0.0.1:9500", LossyConfig::none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rsm.am_i_primary().await);
    }
}
