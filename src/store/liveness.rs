use super::{Session, Store};
use crate::error::{Error, Result};
use crate::types::NodeId;
use std::sync::Arc;
use tracing::{debug, warn};

pub const LIVENESS_PREFIX: &str = "alive/";

/// Registry of live peers, one session-bound key per node.
#[derive(Clone)]
pub struct LivenessRegistry {
    store: Arc<dyn Store>,
}

impl LivenessRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(node: &NodeId) -> String {
        format!("{}{}", LIVENESS_PREFIX, node)
    }

    /// Announce `node` as alive for as long as `session` lives.
    pub async fn publish(&self, node: NodeId, session: &Session) -> Result<()> {
        let pid = std::process::id().to_string();
        self.store
            .put(&Self::key(&node), pid.into_bytes(), Some(session.lease()))
            .await?;
        debug!(node = %node, "Published liveness");
        Ok(())
    }

    pub async fn revoke(&self, node: NodeId) -> Result<()> {
        self.store.delete(&Self::key(&node)).await?;
        Ok(())
    }

    pub async fn is_node_alive(&self, node: NodeId) -> Result<bool> {
        Ok(self.store.get(&Self::key(&node)).await?.first().is_some())
    }

    pub async fn alive_nodes(&self) -> Result<Vec<NodeId>> {
        let resp = self.store.get_prefix(LIVENESS_PREFIX).await?;
        let mut nodes = Vec::with_capacity(resp.kvs.len());
        for kv in resp.kvs {
            match NodeId::parse(&kv.key[LIVENESS_PREFIX.len()..]) {
                Ok(id) => nodes.push(id),
                Err(e) => warn!(key = %kv.key, error = %e, "Malformed liveness key"),
            }
        }
        Ok(nodes)
    }

    /// Fails with `NodeDown` naming the first node that is not alive.
    pub async fn are_nodes_alive(&self, nodes: &[NodeId]) -> Result<()> {
        for node in nodes {
            if !self.is_node_alive(*node).await? {
                return Err(Error::NodeDown(node.to_string()));
            }
        }
        Ok(())
    }
}
