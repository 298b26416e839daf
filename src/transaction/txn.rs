use super::context::{TxnCtx, TxnCtxConfig};
use super::record::{TxnRecord, TxnState, TxnStatus};
use super::step::Step;
use crate::error::{Error, Result};
use crate::lock::Locks;
use crate::metrics;
use crate::runtime::TxnRuntime;
use crate::types::{NodeId, TxnId};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// A cluster-wide operation, driven from the node that initiates it.
///
/// Build it, add steps and context input, then call [`Txn::run`] and always
/// follow up with [`Txn::done`]:
///
/// ```ignore
/// let mut txn = Txn::new_with_locks(runtime.clone(), req_id, &[volname]).await?
///     .with_steps(vec![
///         Step::new("vol-create.Stage", nodes.clone()).with_undo("vol-create.Undo"),
///         Step::new("vol-create.Commit", nodes).synchronized(),
///     ]);
/// txn.ctx().set("volinfo", &volinfo)?;
/// let result = txn.run().await;
/// txn.done().await?;
/// result?;
/// ```
pub struct Txn {
    runtime: Arc<TxnRuntime>,
    id: TxnId,
    req_id: String,
    ctx: TxnCtx,
    steps: Vec<Step>,
    nodes: Vec<NodeId>,
    dont_check_alive: bool,
    disable_rollback: bool,
    start_time: SystemTime,
    locks: Locks,
    started: bool,
    succeeded: bool,
    done: bool,
}

impl Txn {
    pub fn new(runtime: Arc<TxnRuntime>, req_id: impl Into<String>) -> Self {
        let id = TxnId::new();
        let req_id = req_id.into();
        let ctx = runtime.new_ctx(TxnCtxConfig::new(id, req_id.clone()));
        let locks = Locks::new(
            runtime.store().clone(),
            runtime.session().clone(),
            runtime.config().lock_timeout,
        );
        Self {
            runtime,
            id,
            req_id,
            ctx,
            steps: Vec::new(),
            nodes: Vec::new(),
            dont_check_alive: false,
            disable_rollback: false,
            start_time: SystemTime::now(),
            locks,
            started: false,
            succeeded: false,
            done: false,
        }
    }

    /// Create a transaction holding the named cluster locks. Nothing stays
    /// locked if any one of them cannot be obtained.
    pub async fn new_with_locks(
        runtime: Arc<TxnRuntime>,
        req_id: impl Into<String>,
        lock_ids: &[&str],
    ) -> Result<Self> {
        let txn = Self::new(runtime, req_id);
        for id in lock_ids {
            if let Err(e) = txn.locks.lock(id).await {
                warn!(lock = id, txn_id = %txn.id, error = %e, "failed to obtain lock");
                txn.locks.unlock_all().await;
                return Err(e);
            }
        }
        Ok(txn)
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Override the participant set. By default it is the union of all
    /// step nodes.
    pub fn with_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn dont_check_alive(mut self) -> Self {
        self.dont_check_alive = true;
        self
    }

    pub fn disable_rollback(mut self) -> Self {
        self.disable_rollback = true;
        self
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    pub fn ctx(&self) -> &TxnCtx {
        &self.ctx
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Lock an extra id after construction.
    pub async fn lock(&self, id: &str) -> Result<()> {
        self.locks.lock(id).await
    }

    /// Publish the transaction and block until every participant succeeds,
    /// any participant fails, or the transaction timeout elapses.
    pub async fn run(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::InvalidState(format!("txn {} already started", self.id)));
        }
        self.started = true;

        let started = Instant::now();
        let span = self.ctx.span();
        let result = self.run_inner().instrument(span).await;

        let outcome = match &result {
            Ok(()) => "succeeded",
            Err(Error::TxnTimeout) => "timeout",
            Err(_) => "failed",
        };
        metrics::record_txn_outcome(outcome, started.elapsed());
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        if self.nodes.is_empty() {
            self.nodes = union_of_step_nodes(&self.steps);
        } else {
            dedup_in_order(&mut self.nodes);
            check_step_nodes(&self.steps, &self.nodes)?;
        }
        if self.nodes.is_empty() {
            return Err(Error::InvalidInput("txn has no participant nodes".into()));
        }
        self.runtime.registry().validate(&self.steps)?;

        if !self.dont_check_alive {
            self.runtime.liveness().are_nodes_alive(&self.nodes).await?;
        }

        let tm = self.runtime.txn_manager().clone();
        tm.init_node_records(self.id, &self.nodes).await?;

        let watchers = CancellationToken::new();
        let _watchers_guard = watchers.clone().drop_guard();
        let rx = match self.publish(&watchers).await {
            Ok(rx) => rx,
            Err(e) => {
                // no record was published, so nothing else would ever purge these keys
                watchers.cancel();
                if let Err(re) = tm.remove_transaction(self.id).await {
                    warn!(error = %re, "failed to remove unpublished txn keys");
                }
                return Err(e);
            }
        };
        info!(nodes = self.nodes.len(), steps = self.steps.len(), "txn published");

        let timeout = self.runtime.config().txn_timeout;
        match tokio::time::timeout(timeout, wait_for_completion(rx, self.nodes.len())).await {
            Ok(Ok(())) => {
                self.succeeded = true;
                info!("txn succeeded on all nodes");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "txn failed");
                self.fail_everywhere(&e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                error!(timeout_ms = timeout.as_millis() as u64, "txn timed out");
                self.fail_everywhere(&Error::TxnTimeout.to_string()).await;
                Err(Error::TxnTimeout)
            }
        }
    }

    /// Commit the ctx input, subscribe to every node's status, then publish
    /// the record. Returns the fan-in of per-node outcomes.
    async fn publish(&self, watchers: &CancellationToken) -> Result<mpsc::Receiver<Result<NodeId>>> {
        let tm = self.runtime.txn_manager();
        self.ctx.commit().await?;

        let (tx, rx) = mpsc::channel(self.nodes.len());
        for node in &self.nodes {
            let statuses = tm.watch_txn_status(watchers.child_token(), self.id, *node).await?;
            tokio::spawn(notify_state(*node, statuses, tx.clone()));
        }
        drop(tx);

        tm.add_txn(&self.record()).await?;
        Ok(rx)
    }

    /// Mark every node `Failed` so all participants roll back.
    async fn fail_everywhere(&self, reason: &str) {
        let status = TxnStatus::failed(self.id, reason);
        if let Err(e) = self
            .runtime
            .txn_manager()
            .update_txn_status(&status, self.id, &self.nodes)
            .await
        {
            error!(error = %e, "failed to mark txn as failed");
        }
    }

    fn record(&self) -> TxnRecord {
        TxnRecord {
            id: self.id,
            req_id: self.req_id.clone(),
            initiator: self.runtime.node_id(),
            nodes: self.nodes.clone(),
            steps: self.steps.clone(),
            locks: self.locks.held_ids(),
            dont_check_alive: self.dont_check_alive,
            disable_rollback: self.disable_rollback,
            start_time: self.start_time,
            ctx: self.ctx.config().clone(),
        }
    }

    /// Results stored by steps under `key` via `set_node_result`, per node.
    /// Nodes that stored nothing are left out. Call before [`Txn::done`].
    pub async fn node_results<T: DeserializeOwned>(&self, key: &str) -> Result<HashMap<NodeId, T>> {
        self.ctx.sync_cache().await?;
        let mut results = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            match self.ctx.get_node_result(*node, key).await {
                Ok(value) => {
                    results.insert(*node, value);
                }
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Release locks and, after a successful run, delete the transaction
    /// from the store. Safe to call more than once.
    pub async fn done(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        self.locks.unlock_all().await;
        if self.succeeded {
            self.runtime.txn_manager().remove_transaction(self.id).await?;
            debug!(txn_id = %self.id, "txn removed from store");
        }
        Ok(())
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.done && !self.locks.is_empty() {
            warn!(
                txn_id = %self.id,
                locks = ?self.locks.held_ids(),
                "txn dropped without done(), locks held until session expiry"
            );
        }
    }
}

fn dedup_in_order(nodes: &mut Vec<NodeId>) {
    let mut seen = std::collections::HashSet::with_capacity(nodes.len());
    nodes.retain(|n| seen.insert(*n));
}

fn union_of_step_nodes(steps: &[Step]) -> Vec<NodeId> {
    let mut nodes: Vec<NodeId> = steps.iter().flat_map(|s| s.nodes.iter().copied()).collect();
    dedup_in_order(&mut nodes);
    nodes
}

/// Every step node must be a participant, or its share is never executed.
fn check_step_nodes(steps: &[Step], nodes: &[NodeId]) -> Result<()> {
    for step in steps {
        if let Some(missing) = step.nodes.iter().find(|n| !nodes.contains(n)) {
            return Err(Error::InvalidInput(format!(
                "step {} targets node {} which is not a txn participant",
                step.do_func, missing
            )));
        }
    }
    Ok(())
}

/// Forward the first terminal status of `node`.
async fn notify_state(
    node: NodeId,
    mut statuses: mpsc::Receiver<TxnStatus>,
    tx: mpsc::Sender<Result<NodeId>>,
) {
    while let Some(status) = statuses.recv().await {
        match status.state {
            TxnState::Succeeded => {
                let _ = tx.send(Ok(node)).await;
                return;
            }
            TxnState::Failed => {
                let _ = tx.send(Err(Error::TxnFailed(status.reason))).await;
                return;
            }
            _ => {}
        }
    }
}

async fn wait_for_completion(mut rx: mpsc::Receiver<Result<NodeId>>, nodes: usize) -> Result<()> {
    let mut succeeded = 0;
    while succeeded < nodes {
        match rx.recv().await {
            Some(Ok(node)) => {
                debug!(node = %node, "txn succeeded on node");
                succeeded += 1;
            }
            Some(Err(e)) => return Err(e),
            None => return Err(Error::Cancelled),
        }
    }
    Ok(())
}
