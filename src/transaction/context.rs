use super::keys;
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::{with_timeout, Store, StoreTxn, TxnOp};
use crate::types::{NodeId, TxnId};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info_span, Span};

/// The part of a context that travels with the transaction record and is
/// enough to rebuild the context on any node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnCtxConfig {
    pub txn_id: TxnId,
    pub req_id: String,
    pub store_prefix: String,
}

impl TxnCtxConfig {
    pub fn new(txn_id: TxnId, req_id: impl Into<String>) -> Self {
        Self {
            txn_id,
            req_id: req_id.into(),
            store_prefix: keys::ctx_prefix(&txn_id),
        }
    }
}

#[derive(Default)]
struct CtxCache {
    read: HashMap<String, Vec<u8>>,
    write: BTreeMap<String, Vec<u8>>,
    dirty: bool,
}

struct CtxInner {
    config: TxnCtxConfig,
    store: Arc<dyn Store>,
    local_node: NodeId,
    op_timeout: Duration,
    cache: Mutex<CtxCache>,
}

/// Key/value scratchpad scoped to one transaction.
///
/// `set` only buffers; buffered writes become visible to other nodes after
/// `commit`, which the engine calls after every successful step. Cloning is
/// cheap and clones share the same cache.
#[derive(Clone)]
pub struct TxnCtx {
    inner: Arc<CtxInner>,
}

impl fmt::Debug for TxnCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnCtx")
            .field("txn_id", &self.inner.config.txn_id)
            .field("req_id", &self.inner.config.req_id)
            .finish()
    }
}

impl TxnCtx {
    pub fn new(
        config: TxnCtxConfig,
        store: Arc<dyn Store>,
        local_node: NodeId,
        op_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CtxInner {
                config,
                store,
                local_node,
                op_timeout,
                cache: Mutex::new(CtxCache {
                    dirty: true,
                    ..CtxCache::default()
                }),
            }),
        }
    }

    pub fn config(&self) -> &TxnCtxConfig {
        &self.inner.config
    }

    pub fn txn_id(&self) -> TxnId {
        self.inner.config.txn_id
    }

    pub fn req_id(&self) -> &str {
        &self.inner.config.req_id
    }

    /// The node this context instance runs on.
    pub fn local_node(&self) -> NodeId {
        self.inner.local_node
    }

    pub fn span(&self) -> Span {
        info_span!(
            "txn",
            txn_id = %self.inner.config.txn_id,
            reqid = %self.inner.config.req_id,
            node = %self.inner.local_node
        )
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.store_prefix, key)
    }

    fn node_key(node: &NodeId, key: &str) -> String {
        format!("{}/{}", node, key)
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value).map_err(|e| {
            error!(key, error = %e, "failed to marshal value");
            Error::from(e)
        })?;
        let store_key = self.store_key(key);
        let mut cache = self.inner.cache.lock();
        cache.read.insert(store_key.clone(), data.clone());
        cache.write.insert(store_key, data);
        Ok(())
    }

    pub fn set_node_result<T: Serialize + ?Sized>(
        &self,
        node: NodeId,
        key: &str,
        value: &T,
    ) -> Result<()> {
        self.set(&Self::node_key(&node, key), value)
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let dirty = self.inner.cache.lock().dirty;
        if dirty {
            self.sync_cache().await?;
        }

        let store_key = self.store_key(key);
        let data = self.inner.cache.lock().read.get(&store_key).cloned();
        match data {
            Some(data) => serde_json::from_slice(&data).map_err(|e| {
                error!(key = %store_key, error = %e, "failed to unmarshal value");
                Error::from(e)
            }),
            None => Err(Error::KeyNotFound),
        }
    }

    pub async fn get_node_result<T: DeserializeOwned>(&self, node: NodeId, key: &str) -> Result<T> {
        self.get(&Self::node_key(&node, key)).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let store_key = self.store_key(key);
        {
            let mut cache = self.inner.cache.lock();
            cache.read.remove(&store_key);
            cache.write.remove(&store_key);
        }
        with_timeout(
            self.inner.op_timeout,
            "ctx delete",
            self.inner.store.delete(&store_key),
        )
        .await
        .map_err(|e| {
            error!(key = %store_key, error = %e, "failed to delete key");
            e
        })?;
        metrics::record_ctx_op("delete");
        Ok(())
    }

    /// Write all buffered keys in one atomic store transaction.
    pub async fn commit(&self) -> Result<()> {
        let pending = std::mem::take(&mut self.inner.cache.lock().write);
        if pending.is_empty() {
            return Ok(());
        }

        let txn = pending
            .iter()
            .fold(StoreTxn::new(), |txn, (k, v)| txn.and_then(TxnOp::put(k.clone(), v.clone())));

        let result = with_timeout(self.inner.op_timeout, "ctx commit", self.inner.store.txn(txn)).await;
        match result {
            Ok(_) => {
                metrics::record_ctx_op("commit");
                self.inner.cache.lock().dirty = true;
                Ok(())
            }
            Err(e) => {
                error!(keys = ?pending.keys().collect::<Vec<_>>(), error = %e, "failed to store txn context keys");
                let mut cache = self.inner.cache.lock();
                for (k, v) in pending {
                    cache.write.entry(k).or_insert(v);
                }
                Err(e)
            }
        }
    }

    /// Reload every key from the store. Uncommitted local writes stay
    /// visible on top of what the store returns.
    pub async fn sync_cache(&self) -> Result<()> {
        let resp = with_timeout(
            self.inner.op_timeout,
            "ctx sync",
            self.inner.store.get_prefix(&self.inner.config.store_prefix),
        )
        .await?;
        metrics::record_ctx_op("get");

        let mut cache = self.inner.cache.lock();
        let mut read: HashMap<String, Vec<u8>> =
            resp.kvs.into_iter().map(|kv| (kv.key, kv.value)).collect();
        for (k, v) in &cache.write {
            read.insert(k.clone(), v.clone());
        }
        cache.read = read;
        cache.dirty = false;
        Ok(())
    }

    /// Remove the whole context namespace from the store.
    pub async fn remove_all(&self) -> Result<()> {
        {
            let mut cache = self.inner.cache.lock();
            cache.read.clear();
            cache.write.clear();
        }
        with_timeout(
            self.inner.op_timeout,
            "ctx remove",
            self.inner.store.delete_prefix(&self.inner.config.store_prefix),
        )
        .await?;
        Ok(())
    }

    /// Drop every buffered write. The next read reloads from the store, so
    /// values shadowed by the dropped writes come back.
    pub fn discard_pending(&self) {
        let mut cache = self.inner.cache.lock();
        let dropped = std::mem::take(&mut cache.write);
        if dropped.is_empty() {
            return;
        }
        for key in dropped.keys() {
            cache.read.remove(key);
        }
        cache.dirty = true;
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.inner.cache.lock().write.is_empty()
    }
}
