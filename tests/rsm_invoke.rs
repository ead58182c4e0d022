//! A single-node replicated state machine becomes primary immediately
//! and serves client invocations end to end through
//! [`distlock::rsm::client::RsmClient`].

use std::time::Duration;

use distlock::connection::LossyConfig;
use distlock::rpc::RpcServer;
use distlock::rsm::client::RsmClient;
use distlock::rsm::Rsm;

const PROC_ECHO: u32 = 0x20001;

#[tokio::test]
async fn single_node_group_serves_client_invocations() {
    let addr = "127.0.0.1:27901";
    let rsm = Rsm::new(addr, addr, LossyConfig::none());
    rsm.register(PROC_ECHO, |req: Vec<u8>| async move { (0, req) });

    let server = RpcServer::new(4, LossyConfig::none());
    rsm.start(&server);
    let bind_addr = addr.to_string();
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(&bind_addr).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rsm.am_i_primary().await);

    let client = RsmClient::connect(addr, LossyConfig::none()).await;
    let (ret, reply) = client.invoke(PROC_ECHO, b"hello world".to_vec()).await;
    assert_eq!(ret, 0);
    assert_eq!(reply, b"hello world");

    server.shutdown();
    server_task.abort();
}
