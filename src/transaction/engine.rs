use super::executor::Executor;
use super::record::{TxnRecord, TxnState};
use crate::error::Result;
use crate::runtime::TxnRuntime;
use crate::types::TxnId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
enum Feed {
    /// Newly published transactions.
    Published,
    /// Transactions failed on this node.
    Failed,
}

/// Per-node daemon that picks up transactions addressed to this node,
/// executes them, and rolls back the ones that fail.
pub struct Engine {
    runtime: Arc<TxnRuntime>,
    executor: Executor,
    /// Transactions with a task executing or rolling back. The flag asks
    /// the owning task for another failure check before it lets go.
    in_flight: DashMap<TxnId, bool>,
    stop: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(runtime: Arc<TxnRuntime>) -> Arc<Self> {
        let executor = Executor::new(runtime.clone());
        Self::with_executor(runtime, executor)
    }

    pub fn with_executor(runtime: Arc<TxnRuntime>, executor: Executor) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            executor,
            in_flight: DashMap::new(),
            stop: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Subscribe to the transaction namespace, replay what is already
    /// pending or running here, and start the watch loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(node = %self.runtime.node_id(), "running txn engine");

        let published = self.subscribe(Feed::Published).await?;
        let failed = self.subscribe(Feed::Failed).await?;

        for txn in self.runtime.txn_manager().get_txns().await? {
            self.dispatch(Feed::Published, txn);
        }

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_loop(Feed::Published, published));
        tasks.push(self.spawn_loop(Feed::Failed, failed));
        Ok(())
    }

    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(node = %self.runtime.node_id(), "stopping txn engine");
            self.stop.cancel();
        }
    }

    /// Stop and wait for the watch loops to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "txn engine loop panicked");
            }
        }
        info!(node = %self.runtime.node_id(), "txn engine stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn subscribe(&self, feed: Feed) -> Result<mpsc::Receiver<TxnRecord>> {
        let tm = self.runtime.txn_manager();
        match feed {
            Feed::Published => tm.watch_txn(self.stop.child_token()).await,
            Feed::Failed => {
                tm.watch_failed_txn(self.stop.child_token(), self.runtime.node_id())
                    .await
            }
        }
    }

    /// Drain `rx`, subscribing again whenever it closes, until stopped.
    fn spawn_loop(self: &Arc<Self>, feed: Feed, mut rx: mpsc::Receiver<TxnRecord>) -> JoinHandle<()> {
        let engine = self.clone();
        let retry = self.runtime.config().watch_retry_interval;
        tokio::spawn(async move {
            loop {
                loop {
                    let txn = tokio::select! {
                        _ = engine.stop.cancelled() => return,
                        txn = rx.recv() => txn,
                    };
                    match txn {
                        Some(txn) => engine.dispatch(feed, txn),
                        None => break,
                    }
                }

                debug!(feed = ?feed, "txn watch closed, subscribing again");
                tokio::select! {
                    _ = engine.stop.cancelled() => return,
                    _ = tokio::time::sleep(retry) => {}
                }
                match engine.subscribe(feed).await {
                    Ok(fresh) => rx = fresh,
                    Err(e) => warn!(feed = ?feed, error = %e, "failed to subscribe to txn watch"),
                }
            }
        })
    }

    fn dispatch(self: &Arc<Self>, feed: Feed, txn: TxnRecord) {
        if self.stop.is_cancelled() {
            return;
        }
        let node = self.runtime.node_id();
        if !txn.is_participant(&node) {
            debug!(txn_id = %txn.id, node = %node, "peer is not involved in this txn");
            return;
        }

        match self.in_flight.entry(txn.id) {
            Entry::Occupied(mut busy) => {
                // the owner checks for failure again before it lets go
                if matches!(feed, Feed::Failed) {
                    *busy.get_mut() = true;
                }
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
            }
        }

        let engine = self.clone();
        tokio::spawn(async move {
            match feed {
                Feed::Published => {
                    if let Err(e) = engine.execute(&txn).await {
                        warn!(txn_id = %txn.id, error = %e, "txn execution ended with error");
                    }
                }
                Feed::Failed => engine.rollback(&txn).await,
            }
            engine.release(&txn).await;
        });
    }

    /// Run `txn` forward according to the local status: `Pending` starts
    /// from the first step, `Running` resumes after the last completed one.
    pub async fn execute(&self, txn: &TxnRecord) -> Result<()> {
        let status = self
            .runtime
            .txn_manager()
            .get_txn_status(txn.id, self.runtime.node_id())
            .await?;

        match status.state {
            TxnState::Pending => {
                info!(txn_id = %txn.id, reqid = %txn.req_id, "executing txn on peer");
                self.executor.execute(&self.stop, txn).await
            }
            TxnState::Running => {
                info!(txn_id = %txn.id, reqid = %txn.req_id, "resuming txn on peer");
                self.executor.resume(&self.stop, txn).await
            }
            _ => Ok(()),
        }
    }

    async fn rollback(&self, txn: &TxnRecord) {
        if let Err(e) = self.executor.rollback(txn).await {
            error!(txn_id = %txn.id, error = %e, "failed to roll back txn");
        }
    }

    async fn rollback_if_failed(&self, txn: &TxnRecord) {
        match self
            .runtime
            .txn_manager()
            .get_txn_status(txn.id, self.runtime.node_id())
            .await
        {
            Ok(status) if status.state == TxnState::Failed => self.rollback(txn).await,
            Ok(_) => {}
            Err(e) => warn!(txn_id = %txn.id, error = %e, "failed to read txn status"),
        }
    }

    /// Give up the claim on `txn`, rolling back first if it failed. Loops
    /// while failure notices keep arriving during the check.
    async fn release(&self, txn: &TxnRecord) {
        loop {
            if self.stop.is_cancelled() {
                self.in_flight.remove(&txn.id);
                return;
            }
            self.rollback_if_failed(txn).await;
            if self
                .in_flight
                .remove_if(&txn.id, |_, requested| !*requested)
                .is_some()
            {
                return;
            }
            if let Some(mut requested) = self.in_flight.get_mut(&txn.id) {
                *requested = false;
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
