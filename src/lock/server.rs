//! The caching lock server, grounded on
//! `lab7/lock_server_cache_rsm.cc`. Per-lock state machine with
//! per-client xid dedup; revoke/retry callbacks are dispatched by two
//! background tasks draining FIFOs so the RPC handlers never block on
//! network I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::connection::LossyConfig;
use crate::rpc::{RpcClient, RpcServer};
use crate::rsm::StateTransfer;

use super::protocol::{decode_stat_arg, encode_stat_reply, CallbackArg, LockId, LockOpArg, Status, Xid, PROC_ACQUIRE, PROC_RELEASE, PROC_RETRY, PROC_REVOKE, PROC_STAT};

#[derive(Clone, Copy, PartialEq, Eq)]
enum LockState {
    Free,
    Locked,
    LockedAndWait,
    Retrying,
}

struct LockEntry {
    state: LockState,
    owner: String,
    waiters: Vec<String>,
    highest_xid_from_client: HashMap<String, Xid>,
    highest_acquire_reply: HashMap<String, Status>,
    highest_release_reply: HashMap<String, Status>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            state: LockState::Free,
            owner: String::new(),
            waiters: Vec::new(),
            highest_xid_from_client: HashMap::new(),
            highest_acquire_reply: HashMap::new(),
            highest_release_reply: HashMap::new(),
        }
    }
}

struct CallbackJob {
    addr: String,
    lid: LockId,
    xid: Xid,
}

/// Per-lock authority. One instance is shared by every replica of a
/// replicated lock service and driven through RSM's viewstamp-ordered
/// `invoke`, so its own state transitions are deterministic given the
/// same sequence of `acquire`/`release` calls.
pub struct LockServer {
    locks: Mutex<HashMap<LockId, LockEntry>>,
    nacquire: AtomicU64,
    revoke_tx: mpsc::UnboundedSender<CallbackJob>,
    retry_tx: mpsc::UnboundedSender<CallbackJob>,
    lossy: LossyConfig,
}

impl LockServer {
    pub fn new(lossy: LossyConfig) -> Arc<Self> {
        let (revoke_tx, revoke_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self { locks: Mutex::new(HashMap::new()), nacquire: AtomicU64::new(0), revoke_tx, retry_tx, lossy });

        tokio::spawn(dispatch_loop(revoke_rx, PROC_REVOKE, lossy));
        tokio::spawn(dispatch_loop(retry_rx, PROC_RETRY, lossy));

        server
    }

    /// Registers `acquire`/`release`/`stat` on `server`. These are
    /// meant to be invoked through [`crate::rsm::Rsm::register`]'s
    /// application handler map, not exposed directly to clients.
    pub fn register(self: &Arc<Self>, server: &RpcServer) {
        let this = self.clone();
        server.register(PROC_ACQUIRE, move |body| {
            let this = this.clone();
            async move {
                let Ok(arg) = LockOpArg::decode(&body) else { return (Status::RpcErr.code(), Vec::new()) };
                (this.acquire(arg.lid, arg.id, arg.xid).await.code(), Vec::new())
            }
        });

        let this = self.clone();
        server.register(PROC_RELEASE, move |body| {
            let this = this.clone();
            async move {
                let Ok(arg) = LockOpArg::decode(&body) else { return (Status::RpcErr.code(), Vec::new()) };
                (this.release(arg.lid, arg.id, arg.xid).await.code(), Vec::new())
            }
        });

        let this = self.clone();
        server.register(PROC_STAT, move |body| {
            let this = this.clone();
            async move {
                let Ok(lid) = decode_stat_arg(&body) else { return (Status::RpcErr.code(), Vec::new()) };
                (Status::Ok.code(), encode_stat_reply(this.stat(lid).await))
            }
        });
    }

    pub async fn stat(&self, _lid: LockId) -> u64 {
        self.nacquire.load(Ordering::Relaxed)
    }

    pub async fn acquire(&self, lid: LockId, id: String, xid: Xid) -> Status {
        let mut locks = self.locks.lock().await;
        let entry = locks.entry(lid).or_insert_with(LockEntry::new);

        let already = entry.highest_xid_from_client.get(&id).copied();
        if let Some(prior) = already {
            if prior == xid {
                return *entry.highest_acquire_reply.get(&id).unwrap_or(&Status::Ok);
            }
            if prior > xid {
                return *entry.highest_acquire_reply.get(&id).unwrap_or(&Status::IoErr);
            }
        }

        entry.highest_xid_from_client.insert(id.clone(), xid);
        entry.highest_release_reply.remove(&id);

        let ret = match entry.state {
            LockState::Free => {
                entry.state = LockState::Locked;
                entry.owner = id.clone();
                self.nacquire.fetch_add(1, Ordering::Relaxed);
                Status::Ok
            }
            LockState::Locked => {
                entry.state = LockState::LockedAndWait;
                entry.waiters.push(id.clone());
                self.enqueue_revoke(&entry.owner, lid, entry.highest_xid_from_client[&entry.owner]);
                Status::Retry
            }
            LockState::LockedAndWait => {
                entry.waiters.push(id.clone());
                self.enqueue_revoke(&entry.owner, lid, entry.highest_xid_from_client[&entry.owner]);
                Status::Retry
            }
            LockState::Retrying => {
                if let Some(pos) = entry.waiters.iter().position(|w| w == &id) {
                    entry.waiters.remove(pos);
                    entry.owner = id.clone();
                    self.nacquire.fetch_add(1, Ordering::Relaxed);
                    if !entry.waiters.is_empty() {
                        entry.state = LockState::LockedAndWait;
                        self.enqueue_revoke(&entry.owner, lid, entry.highest_xid_from_client[&entry.owner]);
                    } else {
                        entry.state = LockState::Locked;
                    }
                    Status::Ok
                } else {
                    entry.waiters.push(id.clone());
                    Status::Retry
                }
            }
        };

        entry.highest_acquire_reply.insert(id, ret);
        ret
    }

    pub async fn release(&self, lid: LockId, id: String, xid: Xid) -> Status {
        let mut locks = self.locks.lock().await;
        let Some(entry) = locks.get_mut(&lid) else { return Status::NoEnt };

        let Some(&prior) = entry.highest_xid_from_client.get(&id) else { return Status::RpcErr };
        if prior > xid {
            // Stale retransmit of an already-superseded release: replay
            // whatever this client's most recent release got back.
            return *entry.highest_release_reply.get(&id).unwrap_or(&Status::IoErr);
        }
        if prior != xid {
            return Status::RpcErr;
        }
        if let Some(&cached) = entry.highest_release_reply.get(&id) {
            return cached;
        }

        let ret = if entry.owner != id {
            Status::IoErr
        } else {
            match entry.state {
                LockState::Free => Status::IoErr,
                LockState::Locked => {
                    entry.state = LockState::Free;
                    entry.owner.clear();
                    Status::Ok
                }
                LockState::LockedAndWait => {
                    entry.state = LockState::Retrying;
                    entry.owner.clear();
                    let next = entry.waiters[0].clone();
                    self.enqueue_retry(&next, lid, entry.highest_xid_from_client[&next]);
                    Status::Ok
                }
                LockState::Retrying => Status::IoErr,
            }
        };

        entry.highest_release_reply.insert(id, ret);
        ret
    }

    fn enqueue_revoke(&self, addr: &str, lid: LockId, xid: Xid) {
        let _ = self.revoke_tx.send(CallbackJob { addr: addr.to_string(), lid, xid });
    }

    fn enqueue_retry(&self, addr: &str, lid: LockId, xid: Xid) {
        let _ = self.retry_tx.send(CallbackJob { addr: addr.to_string(), lid, xid });
    }
}

impl StateTransfer for LockServer {
    fn marshal_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn unmarshal_state(&self, _state: &[u8]) {}
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<CallbackJob>, proc: u32, lossy: LossyConfig) {
    while let Some(job) = rx.recv().await {
        let client = RpcClient::new(&job.addr, 0, lossy);
        let arg = CallbackArg { lid: job.lid, xid: job.xid };
        let _ = client.call_raw(proc, arg.encode()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_acquire_grants_immediately() {
        let server = LockServer::new(LossyConfig::none());
        let status = server.acquire(1, "a".to_string(), 1).await;
        assert_eq!(status, Status::Ok);
    }

    #[tokio::test]
    async fn second_acquire_retries_and_queues_revoke() {
        let server = LockServer::new(LossyConfig::none());
        assert_eq!(server.acquire(1, "a".to_string(), 1).await, Status::Ok);
        assert_eq!(server.acquire(1, "b".to_string(), 1).await, Status::Retry);
    }

    #[tokio::test]
    async fn release_grants_next_retrying_waiter_on_retry() {
        let server = LockServer::new(LossyConfig::none());
        assert_eq!(server.acquire(1, "a".to_string(), 1).await, Status::Ok);
        assert_eq!(server.acquire(1, "b".to_string(), 1).await, Status::Retry);
        assert_eq!(server.release(1, "a".to_string(), 1).await, Status::Ok);
        assert_eq!(server.acquire(1, "b".to_string(), 1).await, Status::Ok);
    }

    #[tokio::test]
    async fn duplicate_xid_replays_cached_reply() {
        let server = LockServer::new(LossyConfig::none());
        assert_eq!(server.acquire(1, "a".to_string(), 1).await, Status::Ok);
        assert_eq!(server.acquire(1, "a".to_string(), 1).await, Status::Ok);
    }
}
