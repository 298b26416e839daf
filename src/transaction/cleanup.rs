//! Cluster-singleton janitor for the pending-transaction namespace.
//!
//! One node wins the `cleanup-leader` key and from then on periodically
//! fails transactions that outlived `txn_max_age` and purges failed ones
//! that every participant has finished rolling back. The leader key is bound
//! to the winner's session lease, so it disappears if the leader dies and
//! the remaining candidates can take over.

use crate::error::Result;
use crate::lock::DistributedMutex;
use crate::runtime::TxnRuntime;
use crate::store::{Compare, StoreTxn, TxnOp};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const LEADER_KEY: &str = "cleanup-leader";
const ELECTION_LOCK: &str = "cleanup-election";

pub struct CleanupHandler {
    runtime: Arc<TxnRuntime>,
    is_leader: Mutex<bool>,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CleanupHandler {
    pub fn new(runtime: Arc<TxnRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            is_leader: Mutex::new(false),
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_leader(&self) -> bool {
        *self.is_leader.lock()
    }

    /// One election attempt. Returns true if this node holds leadership
    /// afterwards.
    pub async fn is_node_elected(&self) -> Result<bool> {
        if self.is_leader() {
            return Ok(true);
        }

        let election = DistributedMutex::new(
            self.runtime.store().clone(),
            self.runtime.session().clone(),
            ELECTION_LOCK,
        );
        election.lock(self.runtime.config().lock_timeout).await?;

        let claim = StoreTxn::new()
            .when(Compare::KeyMissing(LEADER_KEY.to_string()))
            .and_then(TxnOp::put_with_lease(
                LEADER_KEY,
                self.runtime.node_id().to_string(),
                self.runtime.session().lease(),
            ));
        let result = self.runtime.store().txn(claim).await;

        if let Err(e) = election.unlock().await {
            warn!(error = %e, "failed to release election lock");
        }

        let elected = result?.succeeded;
        if elected {
            *self.is_leader.lock() = true;
            info!(node = %self.runtime.node_id(), "node got elected as cleanup leader");
        }
        Ok(elected)
    }

    /// Campaign until elected or stopped, then start the cleanup loops.
    pub fn start_electing(self: &Arc<Self>) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            info!(node = %handler.runtime.node_id(), "node started to contest for leader election");
            let retry = handler.runtime.config().election_retry_interval;
            loop {
                if handler.stop.is_cancelled() {
                    return;
                }
                match handler.is_node_elected().await {
                    Ok(true) => break,
                    Ok(false) => debug!("leader election lost, retrying"),
                    Err(e) => warn!(error = %e, "failed in campaign for cleanup leader election"),
                }
                tokio::select! {
                    _ = handler.stop.cancelled() => return,
                    _ = tokio::time::sleep(retry) => {}
                }
            }
            handler.spawn_cleanup_loops();
        })
    }

    fn spawn_cleanup_loops(self: &Arc<Self>) {
        let interval = self.runtime.config().cleanup_interval;
        let stale = self.spawn_periodic(interval, |handler| async move {
            if let Err(e) = handler.handle_stale_txn().await {
                error!(error = %e, "stale txn sweep failed");
            }
        });
        let failed = self.spawn_periodic(interval, |handler| async move {
            if let Err(e) = handler.clean_failed_txn().await {
                error!(error = %e, "failed txn purge failed");
            }
        });
        self.tasks.lock().extend([stale, failed]);
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, period: Duration, sweep: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = handler.stop.cancelled() => return,
                    _ = ticker.tick() => sweep(handler.clone()).await,
                }
            }
        })
    }

    /// Fail transactions older than `txn_max_age`. A no-op unless leader.
    pub async fn handle_stale_txn(&self) -> Result<usize> {
        if !self.is_leader() {
            return Ok(0);
        }
        self.runtime
            .txn_manager()
            .txn_gc(self.runtime.config().txn_max_age)
            .await
    }

    /// Purge fully rolled back failed transactions. A no-op unless leader.
    pub async fn clean_failed_txn(&self) -> Result<usize> {
        if !self.is_leader() {
            return Ok(0);
        }
        self.runtime.txn_manager().remove_failed_txns().await
    }

    /// Stop the loops and give up leadership.
    pub async fn stop(&self) {
        info!("attempting to stop cleanup handler");
        self.stop.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let was_leader = std::mem::replace(&mut *self.is_leader.lock(), false);
        if !was_leader {
            return;
        }
        let resign = StoreTxn::new()
            .when(Compare::ValueEquals(
                LEADER_KEY.to_string(),
                self.runtime.node_id().to_string().into_bytes(),
            ))
            .and_then(TxnOp::delete(LEADER_KEY));
        match self.runtime.store().txn(resign).await {
            Ok(resp) if resp.succeeded => debug!("resigned cleanup leadership"),
            Ok(_) => debug!("leader key already gone"),
            Err(e) => warn!(error = %e, "failed to release leader key"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxnConfig;
    use crate::store::{MemoryStore, Store};
    use crate::transaction::StepRegistry;
    use crate::types::NodeId;

    async fn candidate(store: Arc<dyn Store>) -> Arc<CleanupHandler> {
        let config = TxnConfig {
            election_retry_interval: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(50),
            ..TxnConfig::default()
        };
        let runtime = TxnRuntime::new(NodeId::new(), store, StepRegistry::new(), config)
            .await
            .unwrap();
        CleanupHandler::new(runtime)
    }

    #[tokio::test]
    async fn test_second_candidate_loses_until_leader_resigns() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = candidate(store.clone()).await;
        let second = candidate(store.clone()).await;

        assert!(first.is_node_elected().await.unwrap());
        assert!(!second.is_node_elected().await.unwrap());
        // already leader
        assert!(first.is_node_elected().await.unwrap());

        first.stop().await;
        assert!(!first.is_leader());
        assert!(store.get(LEADER_KEY).await.unwrap().kvs.is_empty());
        assert!(second.is_node_elected().await.unwrap());
    }

    #[tokio::test]
    async fn test_leader_key_follows_session() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = candidate(store.clone()).await;
        let second = candidate(store.clone()).await;

        assert!(first.is_node_elected().await.unwrap());
        first.runtime.session().close().await.unwrap();
        assert!(second.is_node_elected().await.unwrap());
    }

    #[tokio::test]
    async fn test_sweeps_are_noops_for_followers() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let follower = candidate(store).await;
        assert_eq!(follower.handle_stale_txn().await.unwrap(), 0);
        assert_eq!(follower.clean_failed_txn().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_electing_eventually_wins() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = candidate(store.clone()).await;
        let second = candidate(store.clone()).await;
        assert!(first.is_node_elected().await.unwrap());

        let campaign = second.start_electing();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!second.is_leader());

        first.stop().await;
        tokio::time::timeout(Duration::from_secs(5), campaign)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_leader());
        second.stop().await;
    }
}
