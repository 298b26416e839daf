//! Linearizable in-process store.
//!
//! All operations are serialized by one mutex and every mutating batch bumps
//! the revision once, so watchers observe the same total order of changes as
//! readers. Leases expire lazily on the next operation, or through the
//! optional reaper task.

use super::{
    Compare, EventType, GetResponse, KeyValue, LeaseId, Revision, Store, StoreTxn, TxnOp,
    TxnResponse, WatchEvent, WatchOptions, WatchStream,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

const DEFAULT_HISTORY_LIMIT: usize = 10_000;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    key: String,
    prefix: bool,
    filter_delete: bool,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Watcher {
    fn matches(&self, event: &WatchEvent) -> bool {
        if self.filter_delete && event.kind == EventType::Delete {
            return false;
        }
        if self.prefix {
            event.kv.key.starts_with(&self.key)
        } else {
            event.kv.key == self.key
        }
    }
}

struct Inner {
    data: BTreeMap<String, KeyValue>,
    revision: Revision,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    compacted: Revision,
    watchers: Vec<Watcher>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
}

impl Inner {
    fn new(history_limit: usize) -> Self {
        Self {
            data: BTreeMap::new(),
            revision: 0,
            history: VecDeque::new(),
            history_limit,
            compacted: 0,
            watchers: Vec::new(),
            leases: HashMap::new(),
            next_lease: 1,
        }
    }

    fn prefix_keys(&self, prefix: &str) -> Vec<String> {
        self.data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn detach_lease(&mut self, kv: &KeyValue) {
        if let Some(id) = kv.lease {
            if let Some(lease) = self.leases.get_mut(&id) {
                lease.keys.remove(&kv.key);
            }
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            debug!(lease = id, "Lease expired");
            self.revoke(id);
        }
    }

    fn revoke(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let ops: Vec<TxnOp> = lease.keys.into_iter().map(TxnOp::delete).collect();
        // deletes never fail
        let _ = self.apply(ops);
        true
    }

    fn evaluate(&self, compare: &Compare) -> bool {
        match compare {
            Compare::KeyMissing(key) => !self.data.contains_key(key),
            Compare::KeyExists(key) => self.data.contains_key(key),
            Compare::ValueEquals(key, value) => {
                self.data.get(key).map(|kv| &kv.value == value).unwrap_or(false)
            }
        }
    }

    /// Apply a batch at one new revision. Returns the revision and the number
    /// of keys deleted.
    fn apply(&mut self, ops: Vec<TxnOp>) -> Result<(Revision, u64)> {
        for op in &ops {
            if let TxnOp::Put { lease: Some(id), .. } = op {
                if !self.leases.contains_key(id) {
                    return Err(Error::LeaseNotFound(*id));
                }
            }
        }

        let rev = self.revision + 1;
        let mut events = Vec::new();
        let mut deleted = 0;

        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    let create_revision = match self.data.get(&key).cloned() {
                        Some(old) => {
                            self.detach_lease(&old);
                            old.create_revision
                        }
                        None => rev,
                    };
                    if let Some(id) = lease {
                        if let Some(l) = self.leases.get_mut(&id) {
                            l.keys.insert(key.clone());
                        }
                    }
                    let kv = KeyValue {
                        key: key.clone(),
                        value,
                        create_revision,
                        mod_revision: rev,
                        lease,
                    };
                    self.data.insert(key, kv.clone());
                    events.push(WatchEvent {
                        kind: EventType::Put,
                        kv,
                    });
                }
                TxnOp::Delete { key } => {
                    if let Some(old) = self.data.remove(&key) {
                        self.detach_lease(&old);
                        deleted += 1;
                        events.push(delete_event(key, rev));
                    }
                }
                TxnOp::DeletePrefix { prefix } => {
                    for key in self.prefix_keys(&prefix) {
                        if let Some(old) = self.data.remove(&key) {
                            self.detach_lease(&old);
                            deleted += 1;
                            events.push(delete_event(key, rev));
                        }
                    }
                }
            }
        }

        if events.is_empty() {
            return Ok((self.revision, 0));
        }

        self.revision = rev;
        self.publish(events);
        Ok((rev, deleted))
    }

    fn publish(&mut self, events: Vec<WatchEvent>) {
        for event in &events {
            trace!(key = %event.kv.key, kind = ?event.kind, revision = event.kv.mod_revision, "Store event");
        }

        self.watchers.retain(|watcher| {
            for event in events.iter().filter(|e| watcher.matches(e)) {
                if watcher.tx.send(event.clone()).is_err() {
                    return false;
                }
            }
            !watcher.tx.is_closed()
        });

        self.history.extend(events);
        while self.history.len() > self.history_limit {
            if let Some(old) = self.history.pop_front() {
                self.compacted = self.compacted.max(old.kv.mod_revision);
            }
        }
    }

    fn compact(&mut self, revision: Revision) {
        while let Some(front) = self.history.front() {
            if front.kv.mod_revision > revision {
                break;
            }
            self.history.pop_front();
        }
        self.compacted = self.compacted.max(revision.min(self.revision));
    }
}

fn delete_event(key: String, revision: Revision) -> WatchEvent {
    WatchEvent {
        kind: EventType::Delete,
        kv: KeyValue {
            key,
            value: Vec::new(),
            create_revision: 0,
            mod_revision: revision,
            lease: None,
        },
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new(history_limit.max(1))),
        }
    }

    pub fn revision(&self) -> Revision {
        self.inner.lock().revision
    }

    /// Drop history up to and including `revision`.
    pub fn compact(&self, revision: Revision) {
        self.inner.lock().compact(revision);
    }

    /// Close every open watch stream, as a store reconnect would.
    pub fn drop_watchers(&self) {
        self.inner.lock().watchers.clear();
    }

    pub fn watcher_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }

    pub fn expire_leases(&self) {
        self.inner.lock().expire_leases(Instant::now());
    }

    /// Periodically expire leases even when nobody touches the store.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => store.expire_leases(),
                    None => break,
                }
            }
        })
    }

    fn locked(&self) -> parking_lot::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        inner.expire_leases(Instant::now());
        inner
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<GetResponse> {
        let inner = self.locked();
        Ok(GetResponse {
            kvs: inner.data.get(key).cloned().into_iter().collect(),
            revision: inner.revision,
        })
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        let inner = self.locked();
        let kvs = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(GetResponse {
            kvs,
            revision: inner.revision,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        let mut inner = self.locked();
        let op = TxnOp::Put {
            key: key.to_string(),
            value,
            lease,
        };
        inner.apply(vec![op]).map(|(rev, _)| rev)
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut inner = self.locked();
        inner.apply(vec![TxnOp::delete(key)]).map(|(_, n)| n)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut inner = self.locked();
        inner
            .apply(vec![TxnOp::delete_prefix(prefix)])
            .map(|(_, n)| n)
    }

    async fn txn(&self, txn: StoreTxn) -> Result<TxnResponse> {
        let mut inner = self.locked();
        let succeeded = txn.compares.iter().all(|c| inner.evaluate(c));
        let ops = if succeeded { txn.success } else { txn.failure };
        let (revision, _) = inner.apply(ops)?;
        Ok(TxnResponse {
            succeeded,
            revision,
        })
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let mut inner = self.locked();
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            key: key.to_string(),
            prefix: options.prefix,
            filter_delete: options.filter_delete,
            tx,
        };

        if let Some(start) = options.start_revision {
            if start <= inner.compacted {
                return Err(Error::Compacted {
                    requested: start,
                    compacted: inner.compacted,
                });
            }
            for event in inner
                .history
                .iter()
                .filter(|e| e.kv.mod_revision >= start && watcher.matches(e))
            {
                // receiver is alive; it was created above
                let _ = watcher.tx.send(event.clone());
            }
        }

        inner.watchers.push(watcher);
        Ok(WatchStream::new(rx))
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(Error::InvalidInput("lease ttl must be positive".into()));
        }
        let mut inner = self.locked();
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.locked();
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(Error::LeaseNotFound(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.locked();
        if inner.revoke(lease) {
            Ok(())
        } else {
            Err(Error::LeaseNotFound(lease))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        let rev = store.put("a/1", b"x".to_vec(), None).await.unwrap();
        assert_eq!(rev, 1);
        store.put("a/2", b"y".to_vec(), None).await.unwrap();
        store.put("b/1", b"z".to_vec(), None).await.unwrap();

        let resp = store.get("a/1").await.unwrap();
        assert_eq!(resp.first().unwrap().value, b"x");
        assert_eq!(resp.revision, 3);

        let resp = store.get_prefix("a/").await.unwrap();
        assert_eq!(resp.kvs.len(), 2);

        assert_eq!(store.delete_prefix("a/").await.unwrap(), 2);
        assert!(store.get("a/1").await.unwrap().kvs.is_empty());
        assert_eq!(store.delete("missing").await.unwrap(), 0);
        // deleting nothing does not bump the revision
        assert_eq!(store.revision(), 4);
    }

    #[tokio::test]
    async fn test_txn_compare_and_set() {
        let store = MemoryStore::new();
        let txn = || {
            StoreTxn::new()
                .when(Compare::KeyMissing("leader".into()))
                .and_then(TxnOp::put("leader", "n1"))
        };

        assert!(store.txn(txn()).await.unwrap().succeeded);
        assert!(!store.txn(txn()).await.unwrap().succeeded);

        let swap = StoreTxn::new()
            .when(Compare::ValueEquals("leader".into(), b"n1".to_vec()))
            .and_then(TxnOp::delete("leader"));
        assert!(store.txn(swap).await.unwrap().succeeded);
        assert!(store.get("leader").await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_multi_key_txn_single_revision() {
        let store = MemoryStore::new();
        let txn = StoreTxn::new()
            .and_then(TxnOp::put("k1", "1"))
            .and_then(TxnOp::put("k2", "2"));
        let resp = store.txn(txn).await.unwrap();
        assert_eq!(resp.revision, 1);
        let kv1 = store.get("k1").await.unwrap().kvs[0].clone();
        let kv2 = store.get("k2").await.unwrap().kvs[0].clone();
        assert_eq!(kv1.mod_revision, kv2.mod_revision);
    }

    #[tokio::test]
    async fn test_watch_prefix_and_filter_delete() {
        let store = MemoryStore::new();
        let mut all = store.watch("p/", WatchOptions::prefix()).await.unwrap();
        let mut puts = store
            .watch("p/", WatchOptions::prefix().filter_delete())
            .await
            .unwrap();

        store.put("p/a", b"1".to_vec(), None).await.unwrap();
        store.put("q/a", b"1".to_vec(), None).await.unwrap();
        store.delete("p/a").await.unwrap();
        store.put("p/b", b"2".to_vec(), None).await.unwrap();

        let e1 = all.next().await.unwrap();
        let e2 = all.next().await.unwrap();
        let e3 = all.next().await.unwrap();
        assert_eq!((e1.kind, e1.kv.key.as_str()), (EventType::Put, "p/a"));
        assert_eq!((e2.kind, e2.kv.key.as_str()), (EventType::Delete, "p/a"));
        assert_eq!(e3.kv.key, "p/b");

        assert_eq!(puts.next().await.unwrap().kv.key, "p/a");
        assert_eq!(puts.next().await.unwrap().kv.key, "p/b");
    }

    #[tokio::test]
    async fn test_watch_from_revision_replays_history() {
        let store = MemoryStore::new();
        store.put("k", b"1".to_vec(), None).await.unwrap();
        let rev = store.put("k", b"2".to_vec(), None).await.unwrap();

        let mut w = store
            .watch("k", WatchOptions::key().from_revision(rev))
            .await
            .unwrap();
        store.put("k", b"3".to_vec(), None).await.unwrap();

        assert_eq!(w.next().await.unwrap().kv.value, b"2");
        assert_eq!(w.next().await.unwrap().kv.value, b"3");
    }

    #[tokio::test]
    async fn test_watch_compacted_revision() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.put("k", vec![i], None).await.unwrap();
        }
        store.compact(3);
        let err = store
            .watch("k", WatchOptions::key().from_revision(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Compacted { .. }));
        assert!(store
            .watch("k", WatchOptions::key().from_revision(4))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_lease_revoke_deletes_keys() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(Duration::from_secs(30)).await.unwrap();
        store.put("alive/n1", b"1".to_vec(), Some(lease)).await.unwrap();
        store.put("other", b"1".to_vec(), None).await.unwrap();

        let mut w = store.watch("alive/", WatchOptions::prefix()).await.unwrap();
        store.revoke_lease(lease).await.unwrap();

        let event = w.next().await.unwrap();
        assert_eq!(event.kind, EventType::Delete);
        assert!(store.get("alive/n1").await.unwrap().kvs.is_empty());
        assert_eq!(store.get("other").await.unwrap().kvs.len(), 1);
        assert!(matches!(
            store.revoke_lease(lease).await,
            Err(Error::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_expiry() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(Duration::from_millis(20)).await.unwrap();
        store.put("k", b"v".to_vec(), Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.get("k").await.unwrap().kvs.is_empty());
        assert!(store.keep_alive(lease).await.is_err());
        assert!(matches!(
            store.put("k", b"v".to_vec(), Some(lease)).await,
            Err(Error::LeaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reaper_expires_idle_leases() {
        let store = Arc::new(MemoryStore::new());
        let lease = store.grant_lease(Duration::from_millis(20)).await.unwrap();
        store.put("k", b"v".to_vec(), Some(lease)).await.unwrap();
        let mut w = store.watch("k", WatchOptions::key()).await.unwrap();

        let reaper = store.spawn_reaper(Duration::from_millis(10));
        let event = tokio::time::timeout(Duration::from_secs(1), w.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventType::Delete);
        reaper.abort();
    }

    #[tokio::test]
    async fn test_overwrite_moves_lease() {
        let store = MemoryStore::new();
        let lease = store.grant_lease(Duration::from_secs(30)).await.unwrap();
        store.put("k", b"1".to_vec(), Some(lease)).await.unwrap();
        store.put("k", b"2".to_vec(), None).await.unwrap();
        store.revoke_lease(lease).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().kvs[0].value, b"2");
    }

    #[tokio::test]
    async fn test_dropped_watchers_are_pruned() {
        let store = MemoryStore::new();
        let w = store.watch("k", WatchOptions::key()).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
        drop(w);
        store.put("k", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.watcher_count(), 0);
    }
}
