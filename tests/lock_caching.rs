//! Single-client lock hygiene and two-client contention ordering,
//! exercised end to end through real sockets (lock server + two caching
//! clients, each with their own revoke/retry callback listener).

use std::sync::Arc;
use std::time::Duration;

use distlock::connection::LossyConfig;
use distlock::lock::{CachingClient, Client, LockServer, Status};
use distlock::rpc::{RpcClient, RpcServer};

async fn spawn_lock_server(addr: &str) -> Arc<LockServer> {
    let lock_server = LockServer::new(LossyConfig::none());
    let rpc = RpcServer::new(4, LossyConfig::none());
    lock_server.register(&rpc);
    let addr = addr.to_string();
    tokio::spawn(async move { rpc.serve(&addr).await });
    lock_server
}

async fn spawn_caching_client(server_addr: &str, my_addr: &str, nonce: u32) -> Arc<CachingClient> {
    let rpc_client = RpcClient::new(server_addr, nonce, LossyConfig::none());
    let transport: Arc<dyn distlock::lock::LockTransport> = Arc::new(rpc_client);
    let callback_server = RpcServer::new(2, LossyConfig::none());
    let client = CachingClient::new(transport, my_addr, &callback_server, LossyConfig::none(), None);
    let my_addr = my_addr.to_string();
    tokio::spawn(async move { callback_server.serve(&my_addr).await });
    client
}

#[tokio::test]
async fn single_client_sequential_acquires_and_releases_succeed() {
    let server_addr = "127.0.0.1:27801";
    spawn_lock_server(server_addr).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = spawn_caching_client(server_addr, "127.0.0.1:27901", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.acquire(1).await, Status::Ok);
    assert_eq!(client.release(1).await, Status::Ok);
    assert_eq!(client.acquire(1).await, Status::Ok);
    assert_eq!(client.acquire(2).await, Status::Ok);
    assert_eq!(client.release(2).await, Status::Ok);
    assert_eq!(client.release(1).await, Status::Ok);
}

#[tokio::test]
async fn contending_client_waits_for_holder_release() {
    let server_addr = "127.0.0.1:27802";
    spawn_lock_server(server_addr).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let a = spawn_caching_client(server_addr, "127.0.0.1:27902", 1).await;
    let b = spawn_caching_client(server_addr, "127.0.0.1:27903", 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(a.acquire(1).await, Status::Ok);

    let releaser = {
        let a = a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            a.release(1).await;
        })
    };

    let before = tokio::time::Instant::now();
    let status = b.acquire(1).await;
    let elapsed = before.elapsed();

    assert_eq!(status, Status::Ok);
    assert!(elapsed >= Duration::from_millis(250), "B's acquire returned before A's release completed: {elapsed:?}");

    releaser.await.unwrap();
}
