#![allow(dead_code)]

use cluster_txn::store::MemoryStore;
use cluster_txn::transaction::{Engine, StepRegistry, TxnCtx};
use cluster_txn::{Error, NodeId, Store, TxnConfig, TxnRuntime};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub node: NodeId,
    pub func: String,
    pub phase: Phase,
    pub at: Instant,
}

/// Every step function call made anywhere in the cluster, in call order.
#[derive(Clone, Default)]
pub struct Journal {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Journal {
    pub fn record(&self, node: NodeId, func: &str, phase: Phase) {
        self.calls.lock().push(Call {
            node,
            func: func.to_string(),
            phase,
            at: Instant::now(),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Functions started on `node`, in order.
    pub fn started_on(&self, node: NodeId) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.node == node && c.phase == Phase::Start)
            .map(|c| c.func.clone())
            .collect()
    }

    pub fn at(&self, node: NodeId, func: &str, phase: Phase) -> Option<Instant> {
        self.calls
            .lock()
            .iter()
            .find(|c| c.node == node && c.func == func && c.phase == phase)
            .map(|c| c.at)
    }
}

/// Timings short enough for tests.
pub fn test_config() -> TxnConfig {
    TxnConfig {
        txn_timeout: Duration::from_secs(10),
        sync_timeout: Duration::from_secs(5),
        lock_timeout: Duration::from_millis(500),
        store_op_timeout: Duration::from_secs(2),
        session_ttl: Duration::from_secs(5),
        cleanup_interval: Duration::from_millis(100),
        election_retry_interval: Duration::from_millis(50),
        watch_retry_interval: Duration::from_millis(20),
        ..TxnConfig::default()
    }
}

pub struct TestNode {
    pub runtime: Arc<TxnRuntime>,
    pub engine: Arc<Engine>,
}

impl TestNode {
    pub fn id(&self) -> NodeId {
        self.runtime.node_id()
    }
}

/// N nodes sharing one in-memory store and one step registry.
pub struct TestCluster {
    pub store: Arc<MemoryStore>,
    pub registry: StepRegistry,
    pub journal: Journal,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Nodes with running engines.
    pub async fn new(size: usize) -> Self {
        let cluster = Self::idle(size).await;
        for node in &cluster.nodes {
            node.engine.start().await.unwrap();
        }
        cluster
    }

    /// Nodes that are alive but whose engines are not started.
    pub async fn idle(size: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn Store> = store.clone();
        let registry = StepRegistry::new();

        let mut nodes = Vec::with_capacity(size);
        for _ in 0..size {
            let runtime = TxnRuntime::new(NodeId::new(), shared.clone(), registry.clone(), test_config())
                .await
                .unwrap();
            runtime.start().await.unwrap();
            let engine = Engine::new(runtime.clone());
            nodes.push(TestNode { runtime, engine });
        }

        Self {
            store,
            registry,
            journal: Journal::default(),
            nodes,
        }
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(TestNode::id).collect()
    }

    /// A step function that journals its call and succeeds.
    pub fn register_recorded(&self, name: &str) {
        self.register_with(name, HashMap::new(), None);
    }

    /// A step function that fails on `failing_node` and succeeds elsewhere.
    pub fn register_failing(&self, name: &str, failing_node: NodeId) {
        self.register_with(name, HashMap::new(), Some(failing_node));
    }

    /// A step function that sleeps for a per-node delay before succeeding.
    pub fn register_delayed(&self, name: &str, delays: HashMap<NodeId, Duration>) {
        self.register_with(name, delays, None);
    }

    fn register_with(&self, name: &str, delays: HashMap<NodeId, Duration>, failing_node: Option<NodeId>) {
        let journal = self.journal.clone();
        let func = name.to_string();
        let delays = Arc::new(delays);
        self.registry
            .register(name, move |ctx: TxnCtx| {
                let journal = journal.clone();
                let func = func.clone();
                let delays = delays.clone();
                async move {
                    let node = ctx.local_node();
                    journal.record(node, &func, Phase::Start);
                    if let Some(delay) = delays.get(&node) {
                        tokio::time::sleep(*delay).await;
                    }
                    if failing_node == Some(node) {
                        return Err(Error::Generic("disk on fire".into()));
                    }
                    journal.record(node, &func, Phase::End);
                    Ok(())
                }
            })
            .unwrap();
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.engine.shutdown().await;
            let _ = node.runtime.shutdown().await;
        }
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
