use super::context::TxnCtx;
use super::manager::TxnManager;
use super::record::TxnRecord;
use super::step::{Step, StepRegistry};
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::NodeId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

/// Runs steps on the local node only.
#[async_trait]
pub trait StepManager: Send + Sync {
    /// Run `step.do_func`. A no-op when the local node does not take part in
    /// the step or the step is skipped.
    async fn run_step(&self, cancel: &CancellationToken, step: &Step, ctx: &TxnCtx) -> Result<()>;

    /// Run `step.undo_func`, if any.
    async fn rollback_step(&self, step: &Step, ctx: &TxnCtx) -> Result<()>;

    /// Block until every node of `txn` has completed step `step_index - 1`.
    async fn sync_step(
        &self,
        cancel: &CancellationToken,
        step_index: usize,
        txn: &TxnRecord,
    ) -> Result<()>;
}

pub struct LocalStepManager {
    node_id: NodeId,
    registry: StepRegistry,
    txn_manager: Arc<TxnManager>,
    sync_timeout: Duration,
}

impl LocalStepManager {
    pub fn new(
        node_id: NodeId,
        registry: StepRegistry,
        txn_manager: Arc<TxnManager>,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            registry,
            txn_manager,
            sync_timeout,
        }
    }

    async fn wait_for_nodes(
        &self,
        barrier: CancellationToken,
        step_index: usize,
        txn: &TxnRecord,
    ) -> Result<()> {
        let required = step_index as i64 - 1;
        let (done_tx, mut done_rx) = mpsc::channel::<NodeId>(txn.nodes.len().max(1));

        for node in &txn.nodes {
            let mut last_steps = self
                .txn_manager
                .watch_last_executed_step(barrier.clone(), txn.id, *node)
                .await?;
            let done_tx = done_tx.clone();
            let node = *node;
            tokio::spawn(async move {
                while let Some(last) = last_steps.recv().await {
                    if last >= required {
                        let _ = done_tx.send(node).await;
                        return;
                    }
                }
            });
        }
        drop(done_tx);

        let mut remaining = txn.nodes.len();
        while remaining > 0 {
            match done_rx.recv().await {
                Some(node) => {
                    debug!(txn_id = %txn.id, node = %node, step_index, "Node reached barrier");
                    remaining -= 1;
                }
                None => return Err(Error::Cancelled),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StepManager for LocalStepManager {
    async fn run_step(&self, cancel: &CancellationToken, step: &Step, ctx: &TxnCtx) -> Result<()> {
        if !step.runs_on(&self.node_id) {
            return Ok(());
        }

        ctx.sync_cache().await?;
        let func = self.registry.get(&step.do_func)?;

        // biased: a step that was attempted has always been polled
        let result = tokio::select! {
            biased;
            result = func(ctx.clone()) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        metrics::record_step("do", result.is_ok());

        // writes of a step that did not complete never leave this node
        if result.is_err() {
            ctx.discard_pending();
        }

        match result {
            Ok(()) => {
                let committed = ctx.commit().await;
                if committed.is_err() {
                    ctx.discard_pending();
                }
                committed
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                error!(step = %step.do_func, error = %e, "Step failed");
                Err(Error::StepFailed {
                    step: step.do_func.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn rollback_step(&self, step: &Step, ctx: &TxnCtx) -> Result<()> {
        let Some(undo) = step.undo_func.as_deref() else {
            return Ok(());
        };
        if !step.runs_on(&self.node_id) {
            return Ok(());
        }

        ctx.sync_cache().await?;
        let func = self.registry.get(undo)?;
        let result = func(ctx.clone()).await;
        metrics::record_step("undo", result.is_ok());

        match result {
            Ok(()) => ctx.commit().await,
            Err(e) => {
                ctx.discard_pending();
                Err(Error::StepFailed {
                    step: undo.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn sync_step(
        &self,
        cancel: &CancellationToken,
        step_index: usize,
        txn: &TxnRecord,
    ) -> Result<()> {
        if step_index == 0 {
            return Ok(());
        }

        let barrier = cancel.child_token();
        let result = tokio::select! {
            waited = tokio::time::timeout(
                self.sync_timeout,
                self.wait_for_nodes(barrier.clone(), step_index, txn),
            ) => match waited {
                Ok(result) => result,
                Err(_) => Err(Error::SyncTimeout { step_index }),
            },
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };
        barrier.cancel();
        result
    }
}

/// Wraps a [`StepManager`] with one tracing span per call.
pub struct TracingStepManager<M> {
    inner: M,
}

impl<M: StepManager> TracingStepManager<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<M: StepManager> StepManager for TracingStepManager<M> {
    async fn run_step(&self, cancel: &CancellationToken, step: &Step, ctx: &TxnCtx) -> Result<()> {
        let span = info_span!(
            "run_step",
            step = %step.do_func,
            txn_id = %ctx.txn_id(),
            reqid = %ctx.req_id()
        );
        self.inner.run_step(cancel, step, ctx).instrument(span).await
    }

    async fn rollback_step(&self, step: &Step, ctx: &TxnCtx) -> Result<()> {
        let span = info_span!(
            "rollback_step",
            step = step.undo_func.as_deref().unwrap_or(""),
            txn_id = %ctx.txn_id(),
            reqid = %ctx.req_id()
        );
        self.inner.rollback_step(step, ctx).instrument(span).await
    }

    async fn sync_step(
        &self,
        cancel: &CancellationToken,
        step_index: usize,
        txn: &TxnRecord,
    ) -> Result<()> {
        let span = info_span!(
            "sync_step",
            step_index,
            txn_id = %txn.id,
            reqid = %txn.req_id
        );
        self.inner.sync_step(cancel, step_index, txn).instrument(span).await
    }
}
