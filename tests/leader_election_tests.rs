use cluster_txn::transaction::{CleanupHandler, LEADER_KEY};
use cluster_txn::{NodeId, Store};
use futures::future::join_all;
use std::sync::Arc;

mod common;
use common::*;

async fn candidates(cluster: &TestCluster) -> Vec<Arc<CleanupHandler>> {
    cluster
        .nodes
        .iter()
        .map(|n| CleanupHandler::new(n.runtime.clone()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_leader_under_concurrent_election() {
    let cluster = TestCluster::idle(5).await;
    let handlers = candidates(&cluster).await;

    let results = join_all(handlers.iter().map(|h| {
        let h = h.clone();
        tokio::spawn(async move { h.is_node_elected().await })
    }))
    .await;

    let elected: Vec<bool> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();
    assert_eq!(elected.iter().filter(|e| **e).count(), 1);
    assert_eq!(handlers.iter().filter(|h| h.is_leader()).count(), 1);

    let leader = handlers.iter().position(|h| h.is_leader()).unwrap();
    let holder = cluster.store.get(LEADER_KEY).await.unwrap();
    let holder: NodeId = holder.first().unwrap().value_str().unwrap().parse().unwrap();
    assert_eq!(holder, cluster.node(leader).id());

    for h in &handlers {
        h.stop().await;
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leadership_passes_on_after_resign() {
    let cluster = TestCluster::idle(3).await;
    let mut handlers = candidates(&cluster).await;

    for _round in 0..3 {
        let results = join_all(handlers.iter().map(|h| h.is_node_elected())).await;
        let winners: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r, Ok(true)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(winners.len(), 1, "one leader per round");

        let leader = handlers.remove(winners[0]);
        leader.stop().await;
        assert!(cluster.store.get(LEADER_KEY).await.unwrap().kvs.is_empty());
    }
    assert!(handlers.is_empty());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dead_leader_key_expires_with_session() {
    let cluster = TestCluster::idle(2).await;
    let handlers = candidates(&cluster).await;

    assert!(handlers[0].is_node_elected().await.unwrap());
    assert!(!handlers[1].is_node_elected().await.unwrap());

    // the leader's process dies without resigning
    cluster.node(0).runtime.session().close().await.unwrap();
    assert!(handlers[1].is_node_elected().await.unwrap());

    handlers[1].stop().await;
    cluster.shutdown().await;
}
