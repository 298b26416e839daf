use super::context::TxnCtx;
use super::record::{TxnRecord, TxnState, TxnStatus};
use super::step::Step;
use super::step_manager::StepManager;
use crate::error::{Error, Result};
use crate::metrics;
use crate::runtime::TxnRuntime;
use crate::types::{NodeId, TxnId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Drives one transaction's steps on the local node.
pub struct Executor {
    runtime: Arc<TxnRuntime>,
    step_manager: Arc<dyn StepManager>,
}

impl Executor {
    pub fn new(runtime: Arc<TxnRuntime>) -> Self {
        let step_manager = runtime.step_manager();
        Self::with_step_manager(runtime, step_manager)
    }

    pub fn with_step_manager(runtime: Arc<TxnRuntime>, step_manager: Arc<dyn StepManager>) -> Self {
        Self {
            runtime,
            step_manager,
        }
    }

    fn node_id(&self) -> NodeId {
        self.runtime.node_id()
    }

    /// True when the local status of `id` is `Pending`. Read errors count as
    /// not pending.
    pub async fn is_txn_pending(&self, id: TxnId) -> bool {
        matches!(
            self.runtime.txn_manager().get_txn_status(id, self.node_id()).await,
            Ok(status) if status.state == TxnState::Pending
        )
    }

    /// Mark the local node `Running` and run every step from index 0.
    pub async fn execute(&self, cancel: &CancellationToken, txn: &TxnRecord) -> Result<()> {
        if !self.should_run(txn) {
            return Ok(());
        }
        let ctx = self.runtime.new_ctx(txn.ctx.clone());
        async {
            info!("transaction started on node");
            self.update_status(TxnStatus::new(TxnState::Running, txn.id), txn.id)
                .await?;
            self.run_from(cancel, txn, &ctx, 0).await
        }
        .instrument(ctx.span())
        .await
    }

    /// Continue a `Running` transaction after the last recorded step.
    pub async fn resume(&self, cancel: &CancellationToken, txn: &TxnRecord) -> Result<()> {
        if !self.should_run(txn) {
            return Ok(());
        }
        let ctx = self.runtime.new_ctx(txn.ctx.clone());
        async {
            let last = self
                .runtime
                .txn_manager()
                .get_last_executed_step(txn.id, self.node_id())
                .await?;
            let start = usize::try_from(last + 1).unwrap_or(0);
            info!(from_step = start, "resuming transaction on node");
            self.run_from(cancel, txn, &ctx, start).await
        }
        .instrument(ctx.span())
        .await
    }

    /// Undo completed steps from `laststep` down to 0, then reset `laststep`
    /// to -1. Undo errors are logged and skipped.
    pub async fn rollback(&self, txn: &TxnRecord) -> Result<()> {
        if !txn.is_participant(&self.node_id()) {
            return Ok(());
        }
        let tm = self.runtime.txn_manager();
        let last = tm.get_last_executed_step(txn.id, self.node_id()).await?;
        if last < 0 {
            return Ok(());
        }

        let ctx = self.runtime.new_ctx(txn.ctx.clone());
        async {
            if txn.disable_rollback {
                info!(last_step = last, "rollback disabled for txn, skipping undo");
            } else {
                debug!(last_step = last, "received a failed txn, rolling back changes");
                for index in (0..=last as usize).rev() {
                    let Some(step) = txn.steps.get(index) else {
                        continue;
                    };
                    if let Err(e) = self.step_manager.rollback_step(step, &ctx).await {
                        error!(step = %step.do_func, error = %e, "failed in rolling back step");
                    }
                }
                metrics::record_rollback("failed_txn");
            }
            tm.update_last_executed_step(txn.id, self.node_id(), -1).await?;
            crate::log_txn_event!(tracing::Level::INFO, txn.id, self.node_id(), "rolled_back");
            Ok::<(), Error>(())
        }
        .instrument(ctx.span())
        .await
    }

    fn should_run(&self, txn: &TxnRecord) -> bool {
        if txn.is_participant(&self.node_id()) {
            return true;
        }
        debug!(txn_id = %txn.id, "skipping txn on this node");
        false
    }

    async fn update_status(&self, status: TxnStatus, id: TxnId) -> Result<()> {
        self.runtime
            .txn_manager()
            .update_txn_status(&status, id, &[self.node_id()])
            .await
    }

    async fn run_from(
        &self,
        cancel: &CancellationToken,
        txn: &TxnRecord,
        ctx: &TxnCtx,
        start: usize,
    ) -> Result<()> {
        let scope = cancel.child_token();
        let _scope_guard = scope.clone().drop_guard();
        let remote_failure = self.watch_for_failure(&scope, txn).await?;

        for (index, step) in txn.steps.iter().enumerate().skip(start) {
            let result = if scope.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                self.run_txn_step(&scope, index, step, txn, ctx).await
            };

            if let Err(e) = result {
                let remote = remote_failure.lock().take();
                if let Some(reason) = remote {
                    warn!(reason = %reason, "transaction got failed on some other node, cancelling ongoing txn on this node");
                    return Err(Error::TxnFailed(reason));
                }
                if matches!(e, Error::Cancelled) {
                    return Err(e);
                }
                let status = TxnStatus::failed(txn.id, e.to_string());
                if let Err(update_err) = self.update_status(status, txn.id).await {
                    error!(error = %update_err, "failed to report txn failure");
                }
                crate::log_txn_event!(tracing::Level::ERROR, txn.id, self.node_id(), "failed");
                return Err(e);
            }
        }

        self.update_status(TxnStatus::new(TxnState::Succeeded, txn.id), txn.id)
            .await?;
        crate::log_txn_event!(tracing::Level::INFO, txn.id, self.node_id(), "succeeded");
        Ok(())
    }

    /// Run one step. A failed attempt is undone before the error is
    /// returned; a failed barrier leaves nothing to undo.
    async fn run_txn_step(
        &self,
        scope: &CancellationToken,
        index: usize,
        step: &Step,
        txn: &TxnRecord,
        ctx: &TxnCtx,
    ) -> Result<()> {
        if step.sync {
            debug!(step = %step.do_func, "synchronizing txn step");
            if let Err(e) = self.step_manager.sync_step(scope, index, txn).await {
                error!(step = %step.do_func, error = %e, "encounter an error in synchronizing txn step");
                return Err(e);
            }
            debug!(step = %step.do_func, "transaction got synchronized");
        }

        let recorded = match self.step_manager.run_step(scope, step, ctx).await {
            Ok(()) => {
                self.runtime
                    .txn_manager()
                    .update_last_executed_step(txn.id, self.node_id(), index as i64)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = recorded {
            error!(step = %step.do_func, error = %e, "failed in executing txn step");
            if !txn.disable_rollback {
                if let Err(undo_err) = self.step_manager.rollback_step(step, ctx).await {
                    error!(step = %step.do_func, error = %undo_err, "failed in rolling back step");
                }
            }
            return Err(e);
        }

        debug!(step = %step.do_func, index, "step func executed successfully on node");
        Ok(())
    }

    /// Cancel `scope` once the local status turns `Failed`. The failure
    /// reason is left in the returned slot before cancelling.
    async fn watch_for_failure(
        &self,
        scope: &CancellationToken,
        txn: &TxnRecord,
    ) -> Result<Arc<Mutex<Option<String>>>> {
        let mut statuses = self
            .runtime
            .txn_manager()
            .watch_txn_status(scope.clone(), txn.id, self.node_id())
            .await?;
        let slot = Arc::new(Mutex::new(None));
        let failure = slot.clone();
        let scope = scope.clone();

        tokio::spawn(async move {
            while let Some(status) = statuses.recv().await {
                if status.state == TxnState::Failed {
                    *failure.lock() = Some(status.reason);
                    scope.cancel();
                    return;
                }
            }
        });
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TxnConfig;
    use crate::store::{MemoryStore, Store};
    use crate::transaction::context::TxnCtxConfig;
    use crate::transaction::step::StepRegistry;
    use std::time::{Duration, SystemTime};

    type Journal = Arc<Mutex<Vec<String>>>;

    fn journaled(registry: &StepRegistry, journal: &Journal, name: &str) {
        let journal = journal.clone();
        let entry = name.to_string();
        registry
            .register(name, move |_ctx| {
                let journal = journal.clone();
                let entry = entry.clone();
                async move {
                    journal.lock().push(entry);
                    Ok(())
                }
            })
            .unwrap();
    }

    async fn setup(registry: StepRegistry) -> (Arc<TxnRuntime>, Executor) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let runtime = TxnRuntime::new(NodeId::new(), store, registry, TxnConfig::default())
            .await
            .unwrap();
        let executor = Executor::new(runtime.clone());
        (runtime, executor)
    }

    fn record(runtime: &TxnRuntime, steps: Vec<Step>) -> TxnRecord {
        let id = TxnId::new();
        TxnRecord {
            id,
            req_id: "req".into(),
            initiator: runtime.node_id(),
            nodes: vec![runtime.node_id()],
            steps,
            locks: vec![],
            dont_check_alive: true,
            disable_rollback: false,
            start_time: SystemTime::now(),
            ctx: TxnCtxConfig::new(id, "req"),
        }
    }

    #[tokio::test]
    async fn test_execute_runs_all_steps() {
        let registry = StepRegistry::new();
        let journal: Journal = Arc::default();
        journaled(&registry, &journal, "a");
        journaled(&registry, &journal, "b");
        let (runtime, executor) = setup(registry).await;
        let node = runtime.node_id();
        let txn = record(&runtime, vec![Step::new("a", vec![node]), Step::new("b", vec![node])]);
        let tm = runtime.txn_manager();
        tm.init_node_records(txn.id, &txn.nodes).await.unwrap();

        assert!(executor.is_txn_pending(txn.id).await);
        executor.execute(&CancellationToken::new(), &txn).await.unwrap();

        assert_eq!(*journal.lock(), vec!["a", "b"]);
        assert_eq!(tm.get_txn_status(txn.id, node).await.unwrap().state, TxnState::Succeeded);
        assert_eq!(tm.get_last_executed_step(txn.id, node).await.unwrap(), 1);
        assert!(!executor.is_txn_pending(txn.id).await);
    }

    #[tokio::test]
    async fn test_failure_undoes_attempted_step_and_reports() {
        let registry = StepRegistry::new();
        let journal: Journal = Arc::default();
        journaled(&registry, &journal, "a");
        journaled(&registry, &journal, "undo-b");
        registry
            .register("b", |_ctx| async { Err::<(), _>(Error::Generic("no space".into())) })
            .unwrap();
        let (runtime, executor) = setup(registry).await;
        let node = runtime.node_id();
        let txn = record(
            &runtime,
            vec![Step::new("a", vec![node]), Step::new("b", vec![node]).with_undo("undo-b")],
        );
        let tm = runtime.txn_manager();
        tm.init_node_records(txn.id, &txn.nodes).await.unwrap();

        let err = executor.execute(&CancellationToken::new(), &txn).await.unwrap_err();
        assert!(matches!(err, Error::StepFailed { ref step, .. } if step == "b"));

        assert_eq!(*journal.lock(), vec!["a", "undo-b"]);
        let status = tm.get_txn_status(txn.id, node).await.unwrap();
        assert_eq!(status.state, TxnState::Failed);
        assert_eq!(status.reason, err.to_string());
        assert_eq!(tm.get_last_executed_step(txn.id, node).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_step_writes_never_reach_store() {
        let registry = StepRegistry::new();
        registry
            .register("good", |ctx| async move { ctx.set("volname", "gv0") })
            .unwrap();
        registry
            .register("bad", |ctx| async move {
                ctx.set("half-done", "garbage")?;
                ctx.set("volname", "clobbered")?;
                Err::<(), _>(Error::Generic("mkfs failed".into()))
            })
            .unwrap();
        registry
            .register("undo-bad", |_ctx| async { Ok(()) })
            .unwrap();
        let (runtime, executor) = setup(registry).await;
        let node = runtime.node_id();
        let txn = record(
            &runtime,
            vec![
                Step::new("good", vec![node]),
                Step::new("bad", vec![node]).with_undo("undo-bad"),
            ],
        );
        runtime
            .txn_manager()
            .init_node_records(txn.id, &txn.nodes)
            .await
            .unwrap();

        executor.execute(&CancellationToken::new(), &txn).await.unwrap_err();

        let kvs = runtime
            .store()
            .get_prefix(&txn.ctx.store_prefix)
            .await
            .unwrap()
            .kvs;
        let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec![format!("{}volname", txn.ctx.store_prefix).as_str()]);
        assert_eq!(kvs[0].value, serde_json::to_vec("gv0").unwrap());
    }

    #[tokio::test]
    async fn test_resume_starts_after_last_step() {
        let registry = StepRegistry::new();
        let journal: Journal = Arc::default();
        for name in ["a", "b", "c"] {
            journaled(&registry, &journal, name);
        }
        let (runtime, executor) = setup(registry).await;
        let node = runtime.node_id();
        let txn = record(
            &runtime,
            vec![
                Step::new("a", vec![node]),
                Step::new("b", vec![node]),
                Step::new("c", vec![node]),
            ],
        );
        let tm = runtime.txn_manager();
        tm.init_node_records(txn.id, &txn.nodes).await.unwrap();
        tm.update_txn_status(&TxnStatus::new(TxnState::Running, txn.id), txn.id, &[node])
            .await
            .unwrap();
        tm.update_last_executed_step(txn.id, node, 0).await.unwrap();

        executor.resume(&CancellationToken::new(), &txn).await.unwrap();
        assert_eq!(*journal.lock(), vec!["b", "c"]);
        assert_eq!(tm.get_txn_status(txn.id, node).await.unwrap().state, TxnState::Succeeded);
    }

    #[tokio::test]
    async fn test_rollback_runs_in_reverse_and_resets() {
        let registry = StepRegistry::new();
        let journal: Journal = Arc::default();
        for name in ["a", "b", "undo-a", "undo-b"] {
            journaled(&registry, &journal, name);
        }
        let (runtime, executor) = setup(registry).await;
        let node = runtime.node_id();
        let txn = record(
            &runtime,
            vec![
                Step::new("a", vec![node]).with_undo("undo-a"),
                Step::new("b", vec![node]).with_undo("undo-b"),
            ],
        );
        let tm = runtime.txn_manager();
        tm.init_node_records(txn.id, &txn.nodes).await.unwrap();
        tm.update_last_executed_step(txn.id, node, 1).await.unwrap();

        executor.rollback(&txn).await.unwrap();
        assert_eq!(*journal.lock(), vec!["undo-b", "undo-a"]);
        assert_eq!(tm.get_last_executed_step(txn.id, node).await.unwrap(), -1);

        // nothing left to undo
        executor.rollback(&txn).await.unwrap();
        assert_eq!(journal.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_rollback_only_resets_laststep() {
        let registry = StepRegistry::new();
        let journal: Journal = Arc::default();
        journaled(&registry, &journal, "a");
        journaled(&registry, &journal, "undo-a");
        let (runtime, executor) = setup(registry).await;
        let node = runtime.node_id();
        let mut txn = record(&runtime, vec![Step::new("a", vec![node]).with_undo("undo-a")]);
        txn.disable_rollback = true;
        let tm = runtime.txn_manager();
        tm.init_node_records(txn.id, &txn.nodes).await.unwrap();
        tm.update_last_executed_step(txn.id, node, 0).await.unwrap();

        executor.rollback(&txn).await.unwrap();
        assert!(journal.lock().is_empty());
        assert_eq!(tm.get_last_executed_step(txn.id, node).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_remote_failure_cancels_in_flight_step() {
        let registry = StepRegistry::new();
        let journal: Journal = Arc::default();
        journaled(&registry, &journal, "undo-slow");
        registry
            .register("slow", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap();
        let (runtime, executor) = setup(registry).await;
        let node = runtime.node_id();
        let txn = record(&runtime, vec![Step::new("slow", vec![node]).with_undo("undo-slow")]);
        let tm = runtime.txn_manager().clone();
        tm.init_node_records(txn.id, &txn.nodes).await.unwrap();

        let id = txn.id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            tm.update_txn_status(&TxnStatus::failed(id, "peer exploded"), id, &[node])
                .await
                .unwrap();
        });

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(&CancellationToken::new(), &txn),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err, Error::TxnFailed("peer exploded".into()));
        assert_eq!(*journal.lock(), vec!["undo-slow"]);

        let status = runtime.txn_manager().get_txn_status(id, node).await.unwrap();
        assert_eq!(status.reason, "peer exploded");
    }

    #[tokio::test]
    async fn test_non_participant_is_skipped() {
        let registry = StepRegistry::new();
        let (runtime, executor) = setup(registry).await;
        let other = NodeId::new();
        let mut txn = record(&runtime, vec![Step::new("missing", vec![other])]);
        txn.nodes = vec![other];
        executor.execute(&CancellationToken::new(), &txn).await.unwrap();
        assert_eq!(
            runtime.txn_manager().get_txn_status(txn.id, runtime.node_id()).await.unwrap().state,
            TxnState::Unknown
        );
    }
}
