use crate::config::TxnConfig;
use crate::error::Result;
use crate::store::{LivenessRegistry, Session, Store};
use crate::transaction::{
    LocalStepManager, StepManager, StepRegistry, TracingStepManager, TxnCtx, TxnCtxConfig,
    TxnManager,
};
use crate::types::NodeId;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything one node needs to take part in transactions.
///
/// Built once at start-up after all step functions are registered, then
/// shared by the engine, the cleanup handler and every `Txn` the node
/// initiates.
pub struct TxnRuntime {
    node_id: NodeId,
    store: Arc<dyn Store>,
    session: Arc<Session>,
    registry: StepRegistry,
    config: TxnConfig,
    liveness: LivenessRegistry,
    txn_manager: Arc<TxnManager>,
}

impl TxnRuntime {
    /// Open a session on `store` and assemble the runtime.
    pub async fn new(
        node_id: NodeId,
        store: Arc<dyn Store>,
        registry: StepRegistry,
        config: TxnConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let session = Session::new(store.clone(), config.session_ttl).await?;
        Ok(Self::with_session(node_id, store, session, registry, config))
    }

    pub fn with_session(
        node_id: NodeId,
        store: Arc<dyn Store>,
        session: Arc<Session>,
        registry: StepRegistry,
        config: TxnConfig,
    ) -> Arc<Self> {
        let txn_manager = Arc::new(TxnManager::new(
            store.clone(),
            session.clone(),
            config.clone(),
        ));
        Arc::new(Self {
            node_id,
            liveness: LivenessRegistry::new(store.clone()),
            store,
            session,
            registry,
            config,
            txn_manager,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn liveness(&self) -> &LivenessRegistry {
        &self.liveness
    }

    pub fn txn_manager(&self) -> &Arc<TxnManager> {
        &self.txn_manager
    }

    /// Rebuild a context for `config` bound to this node.
    pub fn new_ctx(&self, config: TxnCtxConfig) -> TxnCtx {
        TxnCtx::new(
            config,
            self.store.clone(),
            self.node_id,
            self.config.store_op_timeout,
        )
    }

    /// The default step manager stack: local execution with a span per call.
    pub fn step_manager(&self) -> Arc<dyn StepManager> {
        Arc::new(TracingStepManager::new(LocalStepManager::new(
            self.node_id,
            self.registry.clone(),
            self.txn_manager.clone(),
            self.config.sync_timeout,
        )))
    }

    /// Announce this node in the liveness registry.
    pub async fn start(&self) -> Result<()> {
        self.liveness.publish(self.node_id, &self.session).await?;
        info!(node = %self.node_id, "Transaction runtime started");
        Ok(())
    }

    /// Withdraw from the liveness registry and close the session. Keys bound
    /// to the session, held locks included, vanish with it.
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.liveness.revoke(self.node_id).await {
            warn!(node = %self.node_id, error = %e, "Failed to revoke liveness");
        }
        self.session.close().await?;
        info!(node = %self.node_id, "Transaction runtime stopped");
        Ok(())
    }
}
