use super::keys::{self, PENDING_TXN_PREFIX};
use super::record::{TxnRecord, TxnState, TxnStatus};
use crate::config::TxnConfig;
use crate::error::{Error, Result};
use crate::lock::Locks;
use crate::metrics;
use crate::store::{
    with_timeout, GetResponse, KeyValue, Revision, Session, Store, StoreTxn, TxnOp, WatchOptions,
};
use crate::types::{NodeId, TxnId};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Repository over the `pending-transaction/` namespace.
pub struct TxnManager {
    store: Arc<dyn Store>,
    session: Arc<Session>,
    config: TxnConfig,
    gc_lock: tokio::sync::Mutex<()>,
}

struct WatchSpec {
    key: String,
    prefix: bool,
    /// Deliver what the store holds before streaming changes.
    initial: bool,
}

impl TxnManager {
    pub fn new(store: Arc<dyn Store>, session: Arc<Session>, config: TxnConfig) -> Self {
        Self {
            store,
            session,
            config,
            gc_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        with_timeout(self.config.store_op_timeout, op, fut).await
    }

    pub async fn add_txn(&self, txn: &TxnRecord) -> Result<()> {
        let data = serde_json::to_vec(txn)?;
        self.bounded("add txn", self.store.put(&keys::txn_key(&txn.id), data, None))
            .await?;
        Ok(())
    }

    /// Delete the record and everything under its namespace in one batch.
    pub async fn remove_transaction(&self, id: TxnId) -> Result<()> {
        let txn = StoreTxn::new()
            .and_then(TxnOp::delete(keys::txn_key(&id)))
            .and_then(TxnOp::delete_prefix(keys::txn_namespace(&id)));
        self.bounded("remove txn", self.store.txn(txn)).await?;
        Ok(())
    }

    pub async fn get_txn_by_uuid(&self, id: TxnId) -> Result<TxnRecord> {
        let resp = self
            .bounded("get txn", self.store.get(&keys::txn_key(&id)))
            .await?;
        match resp.first() {
            Some(kv) => Ok(serde_json::from_slice(&kv.value)?),
            None => Err(Error::TxnNotFound(id.to_string())),
        }
    }

    pub async fn get_txns(&self) -> Result<Vec<TxnRecord>> {
        let resp = self
            .bounded("list txns", self.store.get_prefix(PENDING_TXN_PREFIX))
            .await?;
        Ok(resp.kvs.iter().filter_map(decode_txn).collect())
    }

    /// Mark every node `Pending` with no completed step, atomically.
    pub async fn init_node_records(&self, id: TxnId, nodes: &[NodeId]) -> Result<()> {
        let status = serde_json::to_vec(&TxnStatus::new(TxnState::Pending, id))?;
        let txn = nodes.iter().fold(StoreTxn::new(), |txn, node| {
            txn.and_then(TxnOp::put(keys::status_key(&id, node), status.clone()))
                .and_then(TxnOp::put(keys::last_step_key(&id, node), "-1"))
        });
        self.bounded("init node records", self.store.txn(txn)).await?;
        Ok(())
    }

    /// Write `status` for each node under per-key locks. A node already
    /// `Failed` keeps its record.
    pub async fn update_txn_status(
        &self,
        status: &TxnStatus,
        id: TxnId,
        nodes: &[NodeId],
    ) -> Result<()> {
        let mut targets: Vec<(String, NodeId)> = nodes
            .iter()
            .map(|node| (keys::status_key(&id, node), *node))
            .collect();
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return Ok(());
        }

        let locks = Locks::new(self.store.clone(), self.session.clone(), self.config.lock_timeout);
        let result = self.locked_status_write(&locks, status, id, &targets).await;
        locks.unlock_all().await;
        result
    }

    async fn locked_status_write(
        &self,
        locks: &Locks,
        status: &TxnStatus,
        id: TxnId,
        targets: &[(String, NodeId)],
    ) -> Result<()> {
        for (key, _) in targets {
            locks.lock(key).await?;
        }

        let data = serde_json::to_vec(status)?;
        let mut txn = StoreTxn::new();
        let mut writes = 0;
        for (key, node) in targets {
            let current = self.get_txn_status(id, *node).await?;
            if current.state == TxnState::Failed {
                if status.state != TxnState::Failed {
                    debug!(txn_id = %id, node = %node, new_state = %status.state, "Status already failed, not overwriting");
                }
                continue;
            }
            txn = txn.and_then(TxnOp::put(key.clone(), data.clone()));
            writes += 1;
        }

        if writes > 0 {
            self.bounded("update status", self.store.txn(txn)).await?;
        }
        Ok(())
    }

    /// Absent or unreadable records read as `Unknown`.
    pub async fn get_txn_status(&self, id: TxnId, node: NodeId) -> Result<TxnStatus> {
        let key = keys::status_key(&id, &node);
        let resp = self.bounded("get status", self.store.get(&key)).await?;
        let Some(kv) = resp.first() else {
            return Ok(TxnStatus::unknown(id));
        };
        match serde_json::from_slice::<TxnStatus>(&kv.value) {
            Ok(status) if status.state.is_valid() => Ok(status),
            Ok(_) => Ok(TxnStatus::unknown(id)),
            Err(e) => {
                warn!(key = %key, error = %e, "Malformed txn status");
                Ok(TxnStatus::unknown(id))
            }
        }
    }

    pub async fn update_last_executed_step(&self, id: TxnId, node: NodeId, index: i64) -> Result<()> {
        self.bounded(
            "update laststep",
            self.store
                .put(&keys::last_step_key(&id, &node), index.to_string().into_bytes(), None),
        )
        .await?;
        Ok(())
    }

    /// A missing record reads as -1.
    pub async fn get_last_executed_step(&self, id: TxnId, node: NodeId) -> Result<i64> {
        let resp = self
            .bounded("get laststep", self.store.get(&keys::last_step_key(&id, &node)))
            .await?;
        match resp.first() {
            Some(kv) => Ok(kv.value_str()?.trim().parse::<i64>()?),
            None => Ok(-1),
        }
    }

    /// Newly published transactions.
    pub async fn watch_txn(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<TxnRecord>> {
        self.spawn_watch(
            cancel,
            WatchSpec {
                key: PENDING_TXN_PREFIX.to_string(),
                prefix: true,
                initial: false,
            },
            decode_txn,
        )
        .await
    }

    /// Status changes of one node, starting with its current status.
    pub async fn watch_txn_status(
        &self,
        cancel: CancellationToken,
        id: TxnId,
        node: NodeId,
    ) -> Result<mpsc::Receiver<TxnStatus>> {
        self.spawn_watch(
            cancel,
            WatchSpec {
                key: keys::status_key(&id, &node),
                prefix: false,
                initial: true,
            },
            |kv| {
                serde_json::from_slice::<TxnStatus>(&kv.value)
                    .ok()
                    .filter(|s| s.state.is_valid())
            },
        )
        .await
    }

    /// Transactions whose status on `node` is `Failed`, including ones that
    /// failed before the call.
    pub async fn watch_failed_txn(
        &self,
        cancel: CancellationToken,
        node: NodeId,
    ) -> Result<mpsc::Receiver<TxnRecord>> {
        let mut failed_ids = self
            .spawn_watch(
                cancel.clone(),
                WatchSpec {
                    key: PENDING_TXN_PREFIX.to_string(),
                    prefix: true,
                    initial: true,
                },
                move |kv| {
                    let (txn_id, status_node) = keys::parse_status_key(&kv.key)?;
                    if status_node != node {
                        return None;
                    }
                    let status: TxnStatus = serde_json::from_slice(&kv.value).ok()?;
                    (status.state == TxnState::Failed).then_some(txn_id)
                },
            )
            .await?;

        let (tx, rx) = mpsc::channel(self.config.watch_buffer);
        let store = self.store.clone();
        let timeout = self.config.store_op_timeout;
        tokio::spawn(async move {
            loop {
                let id = tokio::select! {
                    _ = cancel.cancelled() => return,
                    id = failed_ids.recv() => match id {
                        Some(id) => id,
                        None => return,
                    },
                };
                let resp = match with_timeout(timeout, "get txn", store.get(&keys::txn_key(&id))).await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!(txn_id = %id, error = %e, "Failed to load failed txn");
                        continue;
                    }
                };
                let Some(record) = resp.first().and_then(decode_txn) else {
                    continue;
                };
                if !send(&cancel, &tx, record).await {
                    return;
                }
            }
        });
        Ok(rx)
    }

    /// `laststep` values of one node, starting with its current value.
    pub async fn watch_last_executed_step(
        &self,
        cancel: CancellationToken,
        id: TxnId,
        node: NodeId,
    ) -> Result<mpsc::Receiver<i64>> {
        self.spawn_watch(
            cancel,
            WatchSpec {
                key: keys::last_step_key(&id, &node),
                prefix: false,
                initial: true,
            },
            |kv| kv.value_str().ok()?.trim().parse::<i64>().ok(),
        )
        .await
    }

    async fn snapshot(&self, spec: &WatchSpec) -> Result<GetResponse> {
        if spec.prefix {
            self.bounded("watch snapshot", self.store.get_prefix(&spec.key)).await
        } else {
            self.bounded("watch snapshot", self.store.get(&spec.key)).await
        }
    }

    /// Subscribe to `spec`. The snapshot revision is fixed before this
    /// returns, so nothing committed after the call can be missed. The
    /// background loop re-subscribes whenever the store ends the stream.
    async fn spawn_watch<T, F>(
        &self,
        cancel: CancellationToken,
        spec: WatchSpec,
        decode: F,
    ) -> Result<mpsc::Receiver<T>>
    where
        T: Send + 'static,
        F: Fn(&KeyValue) -> Option<T> + Send + Sync + 'static,
    {
        let snapshot = self.snapshot(&spec).await?;
        let initial: Vec<T> = if spec.initial {
            snapshot.kvs.iter().filter_map(&decode).collect()
        } else {
            Vec::new()
        };

        let (tx, rx) = mpsc::channel(self.config.watch_buffer);
        let store = self.store.clone();
        let retry = self.config.watch_retry_interval;
        let op_timeout = self.config.store_op_timeout;

        tokio::spawn(async move {
            for item in initial {
                if !send(&cancel, &tx, item).await {
                    return;
                }
            }

            let mut next_rev: Option<Revision> = Some(snapshot.revision + 1);

            loop {
                if cancel.is_cancelled() || tx.is_closed() {
                    return;
                }

                let start = match next_rev {
                    Some(rev) => rev,
                    None => {
                        // history was compacted past us; resync from a fresh read
                        let resp = if spec.prefix {
                            with_timeout(op_timeout, "watch snapshot", store.get_prefix(&spec.key)).await
                        } else {
                            with_timeout(op_timeout, "watch snapshot", store.get(&spec.key)).await
                        };
                        match resp {
                            Ok(resp) => {
                                for kv in &resp.kvs {
                                    if let Some(item) = decode(kv) {
                                        if !send(&cancel, &tx, item).await {
                                            return;
                                        }
                                    }
                                }
                                resp.revision + 1
                            }
                            Err(e) => {
                                warn!(key = %spec.key, error = %e, "Watch snapshot failed");
                                if !pause(&cancel, retry).await {
                                    return;
                                }
                                continue;
                            }
                        }
                    }
                };

                let options = if spec.prefix {
                    WatchOptions::prefix()
                } else {
                    WatchOptions::key()
                };
                let options = options.filter_delete().from_revision(start);

                let mut stream = match store.watch(&spec.key, options).await {
                    Ok(stream) => stream,
                    Err(Error::Compacted { .. }) => {
                        next_rev = None;
                        continue;
                    }
                    Err(e) => {
                        warn!(key = %spec.key, error = %e, "Watch failed");
                        if !pause(&cancel, retry).await {
                            return;
                        }
                        continue;
                    }
                };
                next_rev = Some(start);

                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tx.closed() => return,
                        event = stream.next() => event,
                    };
                    let Some(event) = event else {
                        break;
                    };
                    next_rev = Some(event.kv.mod_revision + 1);
                    if let Some(item) = decode(&event.kv) {
                        if !send(&cancel, &tx, item).await {
                            return;
                        }
                    }
                }

                debug!(key = %spec.key, "Watch stream ended, restarting");
                if !pause(&cancel, retry).await {
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Fail every non-failed node of transactions older than `max_age`.
    /// Returns the number of transactions expired.
    pub async fn txn_gc(&self, max_age: Duration) -> Result<usize> {
        let _guard = self.gc_lock.lock().await;
        let now = SystemTime::now();
        let mut expired = 0;

        for txn in self.get_txns().await? {
            if !txn.is_expired(max_age, now) {
                continue;
            }

            let mut non_failed = Vec::new();
            for node in &txn.nodes {
                match self.get_txn_status(txn.id, *node).await {
                    Ok(status) if status.state != TxnState::Failed => non_failed.push(*node),
                    Ok(_) => {}
                    Err(e) => warn!(txn_id = %txn.id, node = %node, error = %e, "Failed to read status"),
                }
            }
            if non_failed.is_empty() {
                continue;
            }

            info!(txn_id = %txn.id, reqid = %txn.req_id, "txn got expired marking as failure");
            let status = TxnStatus::failed(txn.id, "txn expired");
            match self.update_txn_status(&status, txn.id, &non_failed).await {
                Ok(()) => expired += 1,
                Err(e) => warn!(txn_id = %txn.id, error = %e, "Failed to expire txn"),
            }
        }

        metrics::record_gc("expired", expired);
        Ok(expired)
    }

    /// Purge transactions that failed and finished rolling back everywhere.
    /// Returns the number purged.
    pub async fn remove_failed_txns(&self) -> Result<usize> {
        let mut removed = 0;

        for txn in self.get_txns().await? {
            let mut rolled_back = 0;
            for node in &txn.nodes {
                let failed = matches!(
                    self.get_txn_status(txn.id, *node).await,
                    Ok(status) if status.state == TxnState::Failed
                );
                if failed && matches!(self.get_last_executed_step(txn.id, *node).await, Ok(-1)) {
                    rolled_back += 1;
                }
            }

            if rolled_back == txn.nodes.len() {
                info!(txn_id = %txn.id, reqid = %txn.req_id, "txn rolled back on all nodes, cleaning from store");
                match self.remove_transaction(txn.id).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(txn_id = %txn.id, error = %e, "Failed to remove txn"),
                }
            }
        }

        metrics::record_gc("purged", removed);
        Ok(removed)
    }
}

fn decode_txn(kv: &KeyValue) -> Option<TxnRecord> {
    keys::parse_txn_key(&kv.key)?;
    match serde_json::from_slice(&kv.value) {
        Ok(txn) => Some(txn),
        Err(e) => {
            warn!(key = %kv.key, error = %e, "Malformed txn record");
            None
        }
    }
}

async fn send<T>(cancel: &CancellationToken, tx: &mpsc::Sender<T>, item: T) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Sleep for `dur` unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(dur) => true,
    }
}
