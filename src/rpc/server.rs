//! `rpcs`: the at-most-once RPC server.
//!
//! Requests land on a per-connection read task (spawned by
//! [`crate::connection::Connection`]) and are handed to a fixed-size
//! worker pool over a bounded [`async_channel`] — chosen over
//! `tokio::mpsc` here because its `Receiver` is `Clone`, letting every
//! worker pull from the same queue without a distributor task. The
//! queue holds at most [`JOB_QUEUE_CAPACITY`] jobs; `on_packet` already
//! hands each packet to its own spawned task before enqueuing it, so a
//! full queue just makes that task wait in `send` rather than blocking
//! the connection's read loop or dropping the request.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};

use crate::codec::{self, RequestHeader};
use crate::connection::{Connection, ConnectionObserver, LossyConfig};

use super::reply_window::{Lookup, ReplyWindow};
use super::{ClientNonce, Error, Result, ServerNonce, PROC_BIND};

/// A registered procedure takes the decoded request body and returns a
/// status plus an encoded reply body.
pub type HandlerFuture = Pin<Box<dyn Future<Output = (i32, Vec<u8>)> + Send>>;
type HandlerFn = dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync;

/// A server-side reply status for a procedure number nobody registered.
/// Not one of [`Error`]'s sentinels because it never reaches a caller
/// through [`super::client::RpcClient`] as a client-local error — it is
/// a status the server itself manufactures.
const UNKNOWN_PROC: i32 = -8;

/// Maximum number of decoded requests awaiting a free worker. Bounds
/// memory under a burst of concurrent callers instead of growing the
/// queue without limit.
const JOB_QUEUE_CAPACITY: usize = 1024;

struct Job {
    conn: Connection,
    payload: Vec<u8>,
}

struct Inner {
    srv_nonce: ServerNonce,
    handlers: RwLock<HashMap<u32, Arc<HandlerFn>>>,
    reply_windows: Mutex<HashMap<ClientNonce, Arc<Mutex<ReplyWindow>>>>,
    jobs_tx: async_channel::Sender<Job>,
    shutdown: Arc<Notify>,
    lossy: LossyConfig,
}

/// An at-most-once RPC server. Register handlers with [`RpcServer::register`]
/// before calling [`RpcServer::serve`].
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct ConnHandler {
    inner: Arc<Inner>,
    conn: OnceLock<Connection>,
}

impl ConnectionObserver for ConnHandler {
    fn on_packet(&self, payload: Vec<u8>) {
        let conn = match self.conn.get() {
            Some(c) => c.clone(),
            None => return,
        };
        let tx = self.inner.jobs_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Job { conn, payload }).await;
        });
    }

    fn on_dead(&self) {
        let peer = self.conn.get().map(|c| c.peer().to_string()).unwrap_or_default();
        tracing::debug!(peer, "rpc connection closed");
    }
}

impl RpcServer {
    /// Creates a server with a freshly chosen incarnation nonce and
    /// `worker_count` background tasks draining the request queue.
    pub fn new(worker_count: usize, lossy: LossyConfig) -> Self {
        let (tx, rx) = async_channel::bounded(JOB_QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            srv_nonce: rand::thread_rng().gen(),
            handlers: RwLock::new(HashMap::new()),
            reply_windows: Mutex::new(HashMap::new()),
            jobs_tx: tx,
            shutdown: Arc::new(Notify::new()),
            lossy,
        });
        for _ in 0..worker_count.max(1) {
            spawn_worker(inner.clone(), rx.clone());
        }
        Self { inner }
    }

    /// The nonce this server incarnation hands out during bind.
    pub fn srv_nonce(&self) -> ServerNonce {
        self.inner.srv_nonce
    }

    /// Registers `proc` to be served by `handler`. Re-registering a
    /// procedure number replaces its handler.
    pub fn register<F, Fut>(&self, proc: u32, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (i32, Vec<u8>)> + Send + 'static,
    {
        let boxed: Arc<HandlerFn> = Arc::new(move |bytes| Box::pin(handler(bytes)));
        self.inner.handlers.write().unwrap().insert(proc, boxed);
    }

    /// Accepts connections on `addr` until [`RpcServer::shutdown`] is
    /// called, spawning one read task per connection.
    pub async fn serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(|_| Error::Bind)?;
        let shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.notified() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, _) = accepted.map_err(|_| Error::Bind)?;
                    let _ = stream.set_nodelay(true);
                    let handler = Arc::new(ConnHandler { inner: self.inner.clone(), conn: OnceLock::new() });
                    let observer: Arc<dyn ConnectionObserver> = handler.clone();
                    let conn = Connection::new(stream, self.inner.lossy, observer);
                    let _ = handler.conn.set(conn);
                }
            }
        }
    }

    /// Stops accepting new connections and drains in-flight workers.
    pub fn shutdown(&self) {
        self.inner.shutdown.notify_waiters();
    }
}

fn spawn_worker(inner: Arc<Inner>, rx: async_channel::Receiver<Job>) {
    let shutdown = inner.shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                job = rx.recv() => match job {
                    Ok(job) => handle_job(&inner, job).await,
                    Err(_) => break,
                },
            }
        }
    });
}

async fn handle_job(inner: &Arc<Inner>, job: Job) {
    let mut cursor = std::io::Cursor::new(job.payload);
    let header = match RequestHeader::decode(&mut cursor) {
        Ok(h) => h,
        Err(_) => return,
    };
    let body = cursor.into_inner()[RequestHeader::ENCODED_LEN..].to_vec();

    if header.proc != PROC_BIND && header.srv_nonce != 0 && header.srv_nonce != inner.srv_nonce {
        send_reply(&job.conn, header.xid, Error::OldSrv.sentinel(), &[]).await;
        return;
    }

    if header.proc == PROC_BIND {
        let mut reply_body = Vec::new();
        let _ = codec::primitive::write_u32(&mut reply_body, inner.srv_nonce);
        send_reply(&job.conn, header.xid, 0, &reply_body).await;
        return;
    }

    if header.clt_nonce == 0 {
        let (ret, reply_body) = dispatch(inner, header.proc, body).await;
        send_reply(&job.conn, header.xid, ret, &reply_body).await;
        return;
    }

    let window = window_for(inner, header.clt_nonce).await;
    let lookup = {
        let mut w = window.lock().await;
        w.advance(header.xid_rep);
        w.begin(header.xid)
    };
    match lookup {
        Lookup::InProgress => {}
        Lookup::Forgotten => {
            send_reply(&job.conn, header.xid, Error::AtMostOnce.sentinel(), &[]).await;
        }
        Lookup::Done(cached) => {
            let (ret, reply_body) = split_cached(&cached);
            send_reply(&job.conn, header.xid, ret, reply_body).await;
        }
        Lookup::New => {
            let (ret, reply_body) = dispatch(inner, header.proc, body).await;
            {
                let mut w = window.lock().await;
                w.complete(header.xid, join_cached(ret, &reply_body));
            }
            send_reply(&job.conn, header.xid, ret, &reply_body).await;
        }
    }
}

async fn dispatch(inner: &Arc<Inner>, proc: u32, body: Vec<u8>) -> (i32, Vec<u8>) {
    let handler = inner.handlers.read().unwrap().get(&proc).cloned();
    match handler {
        Some(h) => h(body).await,
        None => (UNKNOWN_PROC, Vec::new()),
    }
}

async fn window_for(inner: &Arc<Inner>, clt_nonce: ClientNonce) -> Arc<Mutex<ReplyWindow>> {
    let mut windows = inner.reply_windows.lock().await;
    windows
        .entry(clt_nonce)
        .or_insert_with(|| Arc::new(Mutex::new(ReplyWindow::new())))
        .clone()
}

fn join_cached(ret: i32, body: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(4 + body.len());
    v.extend_from_slice(&ret.to_be_bytes());
    v.extend_from_slice(body);
    v
}

fn split_cached(cached: &[u8]) -> (i32, &[u8]) {
    let ret = i32::from_be_bytes(cached[..4].try_into().unwrap());
    (ret, &cached[4..])
}

async fn send_reply(conn: &Connection, xid: u32, ret: i32, body: &[u8]) {
    let header = codec::ReplyHeader { xid, ret };
    let mut payload = Vec::with_capacity(codec::ReplyHeader::ENCODED_LEN + body.len());
    if header.encode(&mut payload).is_err() {
        return;
    }
    payload.extend_from_slice(body);
    let _ = conn.send(&payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::RpcClient;

    #[tokio::test]
    async fn round_trips_a_registered_procedure() {
        let server = RpcServer::new(2, LossyConfig::none());
        server.register(0x7001, |body| async move {
            let n = u32::from_be_bytes(body.try_into().unwrap());
            let mut reply = Vec::new();
            let _ = codec::primitive::write_u32(&mut reply, n + 1);
            (0, reply)
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let srv = server.clone();
        let srv_addr = addr.clone();
        tokio::spawn(async move {
            let _ = srv.serve(&srv_addr).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = RpcClient::new(&addr, 1, LossyConfig::none());
        let mut args = Vec::new();
        let _ = codec::primitive::write_u32(&mut args, 41);
        let (ret, reply) = client.call_raw(0x7001, args).await.unwrap();
        assert_eq!(ret, 0);
        let mut cursor = std::io::Cursor::new(reply);
        assert_eq!(codec::primitive::read_u32(&mut cursor).unwrap(), 42);
        server.shutdown();
    }

    #[test]
    fn cached_reply_round_trips_through_join_split() {
        let joined = join_cached(7, b"hello");
        let (ret, body) = split_cached(&joined);
        assert_eq!(ret, 7);
        assert_eq!(body, b"hello");
    }
}
