//! Concurrent proposers must converge on a single agreed value for the
//! same instance.

use std::time::Duration;

use distlock::connection::LossyConfig;
use distlock::paxos::Paxos;
use distlock::rpc::RpcServer;

#[tokio::test]
async fn concurrent_proposers_converge_on_one_value() {
    let addrs = vec![
        "127.0.0.1:27811".to_string(),
        "127.0.0.1:27812".to_string(),
        "127.0.0.1:27813".to_string(),
        "127.0.0.1:27814".to_string(),
        "127.0.0.1:27815".to_string(),
    ];

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
    tokio::time::sleep(Duration::from_millis(50)).await;

    let addrs_a = addrs.clone();
    let proposer_a = nodes[0].0.proposer.clone();
    let run_a = tokio::spawn(async move { proposer_a.run(2, addrs_a, b"A".to_vec()).await });

    let addrs_b = addrs.clone();
    let proposer_b = nodes[1].0.proposer.clone();
    let run_b = tokio::spawn(async move { proposer_b.run(2, addrs_b, b"B".to_vec()).await });

    let (decided_a, decided_b) = tokio::join!(run_a, run_b);
    assert!(decided_a.unwrap() || decided_b.unwrap(), "at least one concurrent proposal should succeed");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut agreed_values = std::collections::HashSet::new();
    for (paxos, _) in &nodes {
        if let Some(v) = paxos.acceptor.value(2).await {
            agreed_values.insert(v);
        }
    }
    assert_eq!(agreed_values.len(), 1, "every acceptor that decided instance 2 must agree on the same value");
    let value = agreed_values.into_iter().next().unwrap();
    assert!(value == b"A" || value == b"B");

    for (_, server) in &nodes {
        server.shutdown();
    }
}
