//! The caching lock client, grounded on
//! `lab7/lock_client_cache_rsm.cc`, with [`Client`] as the thin
//! uncached base interface from `lab5/lock_client.h` that the caching
//! variant extends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::connection::LossyConfig;
use crate::rpc::RpcClient;
use crate::rsm::client::RsmClient;

use super::protocol::{CallbackArg, LockId, LockOpArg, Status, Xid, PROC_ACQUIRE, PROC_RELEASE, PROC_REVOKE, PROC_RETRY};

/// The transport a lock client issues `acquire`/`release` calls
/// through. Implemented directly for [`RpcClient`] (talking to a single
/// lock server) and for [`RsmClient`] (talking to a replicated one).
#[async_trait]
pub trait LockTransport: Send + Sync {
    async fn call(&self, proc: u32, args: Vec<u8>) -> Status;
}

#[async_trait]
impl LockTransport for RpcClient {
    async fn call(&self, proc: u32, args: Vec<u8>) -> Status {
        match self.call_raw(proc, args).await {
            Ok((ret, _)) => Status::from_code(ret),
            Err(_) => Status::RpcErr,
        }
    }
}

#[async_trait]
impl LockTransport for RsmClient {
    async fn call(&self, proc: u32, args: Vec<u8>) -> Status {
        let (ret, _) = self.invoke(proc, args).await;
        Status::from_code(ret)
    }
}

/// The uncached base lock client: every `acquire`/`release` is a fresh
/// round trip, with no local state or callback handling.
#[async_trait]
pub trait Client: Send + Sync {
    async fn acquire(&self, lid: LockId) -> Status;
    async fn release(&self, lid: LockId) -> Status;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CacheState {
    None,
    Free,
    Locked,
    Acquiring,
    Releasing,
}

struct CacheEntry {
    state: CacheState,
    revoked: bool,
    retry: bool,
    xid: Xid,
    /// Per-lock condition variable. Kept separate per `LockId` so a
    /// wakeup for one lock never spuriously wakes a caller parked on an
    /// unrelated one.
    notify: Arc<Notify>,
}

impl CacheEntry {
    fn new() -> Self {
        Self { state: CacheState::None, revoked: false, retry: false, xid: 0, notify: Arc::new(Notify::new()) }
    }
}

struct ReleaseJob {
    lid: LockId,
    xid: Xid,
}

struct Shared {
    transport: Arc<dyn LockTransport>,
    id: String,
    next_xid: AtomicU64,
    locks: Mutex<HashMap<LockId, CacheEntry>>,
    release_tx: mpsc::UnboundedSender<ReleaseJob>,
    /// Flushes any derived state the caller has cached under a lock
    /// before a RELEASE is sent to the server, on every path that sends
    /// one.
    dorelease: Option<Arc<dyn Fn(LockId) + Send + Sync>>,
}

/// A caching lock client: holds locks across calls until the server
/// revokes them, and hands them to a waiting local caller without a
/// server round trip when possible.
pub struct CachingClient {
    shared: Arc<Shared>,
}

impl CachingClient {
    /// Starts a caching client using `transport` to reach the lock
    /// server, and a local RPC server (registered on `callback_server`)
    /// to receive revoke/retry callbacks at `my_addr`. `dorelease`, if
    /// given, is invoked with the lock id synchronously before every
    /// RELEASE the client sends, so the caller can flush derived state
    /// while it still holds the lock.
    pub fn new(
        transport: Arc<dyn LockTransport>,
        my_addr: impl Into<String>,
        callback_server: &crate::rpc::RpcServer,
        _lossy: LossyConfig,
        dorelease: Option<Arc<dyn Fn(LockId) + Send + Sync>>,
    ) -> Arc<Self> {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            transport,
            id: my_addr.into(),
            next_xid: AtomicU64::new(0),
            locks: Mutex::new(HashMap::new()),
            release_tx,
            dorelease,
        });

        let client = Arc::new(Self { shared: shared.clone() });

        let releaser_shared = shared.clone();
        tokio::spawn(async move { releaser_loop(releaser_shared, release_rx).await });

        register_callbacks(callback_server, shared);
        client
    }

    async fn do_acquire(&self, lid: LockId) -> Status {
        loop {
            let mut locks = self.shared.locks.lock().await;
            let entry = locks.entry(lid).or_insert_with(CacheEntry::new);
            match entry.state {
                CacheState::Free => {
                    entry.state = CacheState::Locked;
                    return Status::Ok;
                }
                CacheState::Locked | CacheState::Releasing => {
                    let notify = entry.notify.clone();
                    drop(locks);
                    notify.notified().await;
                }
                CacheState::None => {
                    // Nobody is acquiring yet: mint a fresh xid and become
                    // the single caller issuing the ACQUIRE RPC.
                    let xid = self.shared.next_xid.fetch_add(1, Ordering::Relaxed);
                    entry.state = CacheState::Acquiring;
                    entry.retry = false;
                    entry.xid = xid;
                    drop(locks);
                    if let Some(status) = self.send_acquire(lid, xid).await {
                        return status;
                    }
                }
                CacheState::Acquiring => {
                    if entry.retry {
                        // The server asked us to resend this exact
                        // outstanding acquire; reuse its xid so the
                        // server's dedup recognizes the retransmission.
                        entry.retry = false;
                        let xid = entry.xid;
                        drop(locks);
                        if let Some(status) = self.send_acquire(lid, xid).await {
                            return status;
                        }
                    } else {
                        let notify = entry.notify.clone();
                        drop(locks);
                        notify.notified().await;
                    }
                }
            }
        }
    }

    /// Issues one ACQUIRE RPC for an already-`Acquiring` entry and
    /// applies the reply. Returns `Some(status)` when `do_acquire`
    /// should return immediately, `None` when it should loop and
    /// re-examine the entry's state (parking if still not our turn).
    async fn send_acquire(&self, lid: LockId, xid: Xid) -> Option<Status> {
        let arg = LockOpArg { lid, id: self.shared.id.clone(), xid };
        let ret = self.shared.transport.call(PROC_ACQUIRE, arg.encode()).await;

        let mut locks = self.shared.locks.lock().await;
        let entry = locks.get_mut(&lid).unwrap();
        match ret {
            Status::Ok => {
                entry.state = CacheState::Locked;
                Some(Status::Ok)
            }
            Status::Retry => None,
            other => {
                entry.state = CacheState::None;
                let notify = entry.notify.clone();
                drop(locks);
                notify.notify_waiters();
                Some(other)
            }
        }
    }

    async fn do_release(&self, lid: LockId) -> Status {
        let mut locks = self.shared.locks.lock().await;
        let Some(entry) = locks.get_mut(&lid) else { return Status::NoEnt };

        if entry.revoked {
            entry.state = CacheState::Releasing;
            entry.revoked = false;
            let xid = entry.xid;
            let notify = entry.notify.clone();
            drop(locks);

            if let Some(hook) = &self.shared.dorelease {
                hook(lid);
            }

            let arg = LockOpArg { lid, id: self.shared.id.clone(), xid };
            let ret = self.shared.transport.call(PROC_RELEASE, arg.encode()).await;
            let mut locks = self.shared.locks.lock().await;
            if let Some(entry) = locks.get_mut(&lid) {
                entry.state = CacheState::None;
            }
            drop(locks);
            notify.notify_waiters();
            ret
        } else {
            entry.state = CacheState::Free;
            let notify = entry.notify.clone();
            drop(locks);
            notify.notify_one();
            Status::Ok
        }
    }
}

#[async_trait]
impl Client for CachingClient {
    async fn acquire(&self, lid: LockId) -> Status {
        self.do_acquire(lid).await
    }

    async fn release(&self, lid: LockId) -> Status {
        self.do_release(lid).await
    }
}

async fn releaser_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<ReleaseJob>) {
    while let Some(job) = rx.recv().await {
        if let Some(hook) = &shared.dorelease {
            hook(job.lid);
        }
        let arg = LockOpArg { lid: job.lid, id: shared.id.clone(), xid: job.xid };
        let _ = shared.transport.call(PROC_RELEASE, arg.encode()).await;
        let mut locks = shared.locks.lock().await;
        let notify = locks.get_mut(&job.lid).map(|entry| {
            entry.state = CacheState::None;
            entry.notify.clone()
        });
        drop(locks);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }
}

fn register_callbacks(server: &crate::rpc::RpcServer, shared: Arc<Shared>) {
    let this = shared.clone();
    server.register(PROC_REVOKE, move |body| {
        let this = this.clone();
        async move {
            let Ok(arg) = CallbackArg::decode(&body) else { return (Status::RpcErr.code(), Vec::new()) };
            let mut locks = this.locks.lock().await;
            let Some(entry) = locks.get_mut(&arg.lid) else { return (Status::NoEnt.code(), Vec::new()) };
            if entry.xid != arg.xid {
                return (Status::Ok.code(), Vec::new());
            }
            if entry.state == CacheState::Free {
                entry.state = CacheState::Releasing;
                let _ = this.release_tx.send(ReleaseJob { lid: arg.lid, xid: arg.xid });
            } else {
                entry.revoked = true;
            }
            (Status::Ok.code(), Vec::new())
        }
    });

    let this = shared;
    server.register(PROC_RETRY, move |body| {
        let this = this.clone();
        async move {
            let Ok(arg) = CallbackArg::decode(&body) else { return (Status::RpcErr.code(), Vec::new()) };
            let mut locks = this.locks.lock().await;
            let Some(entry) = locks.get_mut(&arg.lid) else { return (Status::NoEnt.code(), Vec::new()) };
            let notify = if entry.xid == arg.xid {
                entry.retry = true;
                Some(entry.notify.clone())
            } else {
                None
            };
            drop(locks);
            if let Some(notify) = notify {
                notify.notify_waiters();
            }
            (Status::Ok.code(), Vec::new())
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcServer;

    #[tokio::test]
    async fn uncached_call_translates_reply_to_status() {
        let server = RpcServer::new(2, LossyConfig::none());
        server.register(PROC_ACQUIRE, move |_body| async move { (Status::Ok.code(), Vec::new()) });
        let addr = "127.0.0.1:27710";
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(addr).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let rpc = RpcClient::new(addr, 1, LossyConfig::none());
        let arg = LockOpArg { lid: 1, id: "me".to_string(), xid: 0 };
        let status = LockTransport::call(&rpc, PROC_ACQUIRE, arg.encode()).await;
        assert_eq!(status, Status::Ok);

        server.shutdown();
        server_task.abort();
    }
}
